// =============================================================================
// Snapshot Engine — atomic write + integrity-checked load of versioned blobs
// =============================================================================
//
// Every persisted subsystem state is wrapped in the same envelope:
//
//   {"payload": {...}, "sha256": "<hex of canonical payload>", "version": N}
//
// Files are canonical JSON: sorted keys, compact separators, ASCII only.
// Writes go through tmp + fsync + rename so a crash mid-write leaves the
// previous file intact.  Loads re-verify the checksum and reject anything
// oversized, non-ASCII or structurally off before a single byte reaches the
// in-memory target.
// =============================================================================

use std::io::Write;
use std::path::Path;

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Hard cap on snapshot file size accepted by the loader.
pub const MAX_SNAPSHOT_BYTES: u64 = 1024 * 1024;

// =============================================================================
// Errors
// =============================================================================

/// Closed set of integrity failures. Each variant maps 1:1 onto the wire
/// error code and the `snapshot_integrity_fail_total{kind}` counter label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotError {
    FileTooLarge,
    NonAscii,
    InvalidStructure,
    BadChecksum,
    InvalidPayload,
}

impl SnapshotError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FileTooLarge => "file_too_large",
            Self::NonAscii => "non_ascii",
            Self::InvalidStructure => "invalid_structure",
            Self::BadChecksum => "bad_checksum",
            Self::InvalidPayload => "invalid_payload",
        }
    }
}

impl std::fmt::Display for SnapshotError {
    // Display is exactly the wire code so the HTTP layer can embed it as-is.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

impl std::error::Error for SnapshotError {}

// =============================================================================
// Canonical JSON
// =============================================================================

/// Serialise a JSON value canonically: sorted keys (serde_json maps are
/// BTree-ordered), compact separators, and every non-ASCII character escaped
/// as `\uXXXX` so the on-disk bytes are pure ASCII.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let compact = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
    let mut out = String::with_capacity(compact.len());
    for ch in compact.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            let mut buf = [0u16; 2];
            for unit in ch.encode_utf16(&mut buf) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

/// Lowercase hex SHA-256 of the canonical serialisation of `value`.
pub fn sha256_canonical(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

// =============================================================================
// Atomic write
// =============================================================================

/// Wrap `payload` in the integrity envelope and write it atomically:
/// serialise → `path.tmp` → fsync(file) → rename → fsync(parent, best-effort).
pub fn atomic_write(
    path: impl AsRef<Path>,
    payload: &serde_json::Value,
    version: u64,
) -> anyhow::Result<()> {
    use anyhow::Context;

    let path = path.as_ref();
    let envelope = serde_json::json!({
        "version": version,
        "sha256": sha256_canonical(payload),
        "payload": payload,
    });
    let body = canonical_json(&envelope);

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut f = std::fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create tmp snapshot {}", tmp_path.display()))?;
        f.write_all(body.as_bytes())
            .with_context(|| format!("failed to write tmp snapshot {}", tmp_path.display()))?;
        f.sync_all()
            .with_context(|| format!("failed to fsync tmp snapshot {}", tmp_path.display()))?;
    }

    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename snapshot into {}", path.display()))?;

    // Directory fsync is best-effort; not all platforms allow opening a dir.
    if let Some(parent) = path.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

// =============================================================================
// Integrity-checked load
// =============================================================================

/// Read an envelope from disk, run every integrity check in order, and return
/// the verified payload. No check may mutate any in-memory target.
pub fn load(path: impl AsRef<Path>) -> Result<serde_json::Value, SnapshotError> {
    let path = path.as_ref();

    let meta = std::fs::metadata(path).map_err(|_| SnapshotError::InvalidStructure)?;
    if meta.len() > MAX_SNAPSHOT_BYTES {
        return Err(SnapshotError::FileTooLarge);
    }

    let raw = std::fs::read(path).map_err(|_| SnapshotError::InvalidStructure)?;
    if raw.iter().any(|&b| b > 0x7F) {
        return Err(SnapshotError::NonAscii);
    }

    let value: serde_json::Value =
        serde_json::from_slice(&raw).map_err(|_| SnapshotError::InvalidStructure)?;
    let obj = value.as_object().ok_or(SnapshotError::InvalidStructure)?;

    if obj.len() != 3 {
        return Err(SnapshotError::InvalidStructure);
    }
    let version = obj.get("version").ok_or(SnapshotError::InvalidStructure)?;
    let sha = obj.get("sha256").ok_or(SnapshotError::InvalidStructure)?;
    let payload = obj.get("payload").ok_or(SnapshotError::InvalidStructure)?;
    if !version.is_u64() || !sha.is_string() || !payload.is_object() {
        return Err(SnapshotError::InvalidStructure);
    }

    let expected = sha.as_str().unwrap_or_default();
    if sha256_canonical(payload) != expected {
        return Err(SnapshotError::BadChecksum);
    }

    Ok(payload.clone())
}

/// Envelope version of a file that already passed [`load`]. Used by callers
/// that accept more than one payload schema version.
pub fn peek_version(path: impl AsRef<Path>) -> Option<u64> {
    let raw = std::fs::read(path).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    value.get("version")?.as_u64()
}

// =============================================================================
// Deterministic jitter
// =============================================================================

/// Deterministic ±10 % jitter for periodic writers, keyed on the snapshot
/// path and a per-kind tag. Independent processes therefore never
/// synchronise, and a given deployment's cadence is reproducible:
///
///   j   = (u32(hex[..8] of HMAC-SHA1(key=seed, msg=tag)) % 2001) - 1000
///   eps = j / 10000                       // in [-0.10, +0.10]
///   out = max(1.0, base * (1 + eps))
pub fn jittered_interval(seed: &str, tag: &str, base_secs: f64) -> f64 {
    let mut mac = match Hmac::<Sha1>::new_from_slice(seed.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return base_secs.max(1.0),
    };
    mac.update(tag.as_bytes());
    let digest = hex::encode(mac.finalize().into_bytes());
    let word = u32::from_str_radix(&digest[..8], 16).unwrap_or(0);
    let j = (word % 2001) as i64 - 1000;
    let eps = j as f64 / 10_000.0;
    (base_secs * (1.0 + eps)).max(1.0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_json_sorts_keys_and_compacts() {
        let v = serde_json::json!({"b": 1, "a": {"z": 2, "y": [1, 2]}});
        assert_eq!(canonical_json(&v), r#"{"a":{"y":[1,2],"z":2},"b":1}"#);
    }

    #[test]
    fn canonical_json_escapes_non_ascii() {
        let v = serde_json::json!({"k": "münchen"});
        let s = canonical_json(&v);
        assert!(s.is_ascii());
        assert!(s.contains("\\u00fc"));
    }

    #[test]
    fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allocator_hwm.json");
        let payload = serde_json::json!({"hwm_equity_usd": 123.0});
        atomic_write(&path, &payload, 1).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let keys: Vec<&String> = raw.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["payload", "sha256", "version"]);

        let loaded = load(&path).unwrap();
        assert_eq!(loaded, payload);
    }

    #[test]
    fn tampered_payload_is_bad_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        atomic_write(&path, &serde_json::json!({"hwm_equity_usd": 1.0}), 1).unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        // Flip a digit inside the payload, away from the sha256 field.
        let pos = raw.windows(3).position(|w| w == b"1.0").unwrap();
        raw[pos] = b'9';
        std::fs::write(&path, &raw).unwrap();

        assert_eq!(load(&path), Err(SnapshotError::BadChecksum));
    }

    #[test]
    fn non_ascii_byte_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        atomic_write(&path, &serde_json::json!({"k": 1}), 1).unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 2;
        raw[last] = 0xC3;
        std::fs::write(&path, &raw).unwrap();

        assert_eq!(load(&path), Err(SnapshotError::NonAscii));
    }

    #[test]
    fn extra_top_level_key_is_invalid_structure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let payload = serde_json::json!({"k": 1});
        let envelope = serde_json::json!({
            "version": 1,
            "sha256": sha256_canonical(&payload),
            "payload": payload,
            "extra": true,
        });
        std::fs::write(&path, canonical_json(&envelope)).unwrap();

        assert_eq!(load(&path), Err(SnapshotError::InvalidStructure));
    }

    #[test]
    fn oversized_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let blob = vec![b' '; (MAX_SNAPSHOT_BYTES + 1) as usize];
        std::fs::write(&path, blob).unwrap();
        assert_eq!(load(&path), Err(SnapshotError::FileTooLarge));
    }

    #[test]
    fn atomic_write_preserves_previous_on_bad_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        atomic_write(&path, &serde_json::json!({"v": 1}), 1).unwrap();

        // Writing to an unwritable directory must not touch the original.
        let bad = dir.path().join("missing").join("s.json");
        assert!(atomic_write(&bad, &serde_json::json!({"v": 2}), 1).is_err());
        assert_eq!(load(&path).unwrap(), serde_json::json!({"v": 1}));
    }

    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let d1 = jittered_interval("/art/hwm.json", "alloc", 60.0);
        let d2 = jittered_interval("/art/hwm.json", "alloc", 60.0);
        assert!((d1 - d2).abs() < 1e-12);
        assert!(d1 >= 54.0 && d1 <= 66.0);

        // Different tags must not synchronise.
        let d3 = jittered_interval("/art/hwm.json", "throttle", 60.0);
        assert!((d1 - d3).abs() > 1e-9);
    }
}
