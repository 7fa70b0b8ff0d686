// =============================================================================
// Alerts Log & Artifact Retention — append-only JSONL with pruning
// =============================================================================
//
// `alerts.log` receives one JSON line per alert.  Each append is its own
// open/write/flush/fsync/close so concurrent writers interleave whole lines
// and a crash can lose at most the line being written.
//
// The prune pass caps the alerts file to its last N lines and deletes canary
// snapshot artifacts beyond a count or age limit.
// =============================================================================

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::snapshot::canonical_json;

/// One parsed alert line.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AlertRecord {
    pub ts: String,
    pub kind: String,
    pub payload: serde_json::Value,
}

/// Append-only JSONL alerts file.
pub struct AlertsLog {
    path: PathBuf,
    /// Serialises appends within this process; cross-process atomicity comes
    /// from single-write line appends.
    write_lock: Mutex<()>,
}

impl AlertsLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one `{ts, kind, payload}` line. Failures are logged, never
    /// propagated; alerting must not take down the control loop.
    pub fn append(&self, kind: &str, payload: serde_json::Value) {
        let record = serde_json::json!({
            "ts": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "kind": kind,
            "payload": payload,
        });
        let line = format!("{}\n", canonical_json(&record));

        let _guard = self.write_lock.lock();
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| {
                f.write_all(line.as_bytes())?;
                f.flush()?;
                f.sync_all()
            });
        if let Err(e) = result {
            warn!(error = %e, path = %self.path.display(), "failed to append alert");
        }
    }

    /// All parseable records currently on disk.
    pub fn read_all(&self) -> Vec<AlertRecord> {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock();
        std::fs::write(&self.path, b"")?;
        Ok(())
    }

    /// Keep only the last `max_lines` lines.
    pub fn truncate_to(&self, max_lines: usize) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock();
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return Ok(());
        };
        let lines: Vec<&str> = content.lines().collect();
        if lines.len() <= max_lines {
            return Ok(());
        }
        let keep = &lines[lines.len() - max_lines..];
        let mut body = keep.join("\n");
        body.push('\n');
        std::fs::write(&self.path, body)?;
        info!(dropped = lines.len() - max_lines, "alerts log pruned");
        Ok(())
    }
}

impl std::fmt::Debug for AlertsLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertsLog").field("path", &self.path).finish()
    }
}

// =============================================================================
// Canary artifact pruning
// =============================================================================

/// Delete `canary_*.json` artifacts beyond `max_count` (newest kept, by name:
/// the embedded timestamp makes names sort chronologically) or older than
/// `max_days`.
pub fn prune_canary_artifacts(
    dir: &Path,
    max_count: usize,
    max_days: i64,
    now: chrono::DateTime<Utc>,
) -> anyhow::Result<usize> {
    let mut canaries: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("canary_") && name.ends_with(".json") {
            canaries.push(entry.path());
        }
    }
    canaries.sort();

    let mut removed = 0usize;

    // Count cap: drop oldest first.
    if canaries.len() > max_count {
        let excess = canaries.len() - max_count;
        for path in canaries.drain(..excess) {
            if std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
    }

    // Age cap from the `canary_YYYYMMDD_HHMMSS.json` name.
    let cutoff = now - chrono::Duration::days(max_days);
    for path in canaries {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(ts_part) = stem.strip_prefix("canary_") else {
            continue;
        };
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(ts_part, "%Y%m%d_%H%M%S") {
            if naive.and_utc() < cutoff && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
    }

    Ok(removed)
}
