// =============================================================================
// Admin Gate — per-actor rate limiting + signed audit trail
// =============================================================================
//
// Admission: a 60-second sliding window of 60 requests per
// `(actor, endpoint)` pair; the actor is derived from the presented token as
// `"token:" + first 8 hex of sha1(token)` so audit lines never carry the
// token itself.
//
// Every successful admin call appends an audit record.  When an HMAC key is
// configured (`ADMIN_AUDIT_HMAC_KEY`, hex; non-hex values fall back to the
// raw UTF-8 bytes) the record carries an HMAC-SHA256 signature over the
// canonical JSON of the payload; the signature is independent of how the
// stored `payload_hash` is presented.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::Serialize;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::snapshot::canonical_json;

/// Sliding-window length.
pub const RATE_WINDOW_SEC: f64 = 60.0;
/// Admissions per window per (actor, endpoint).
pub const RATE_LIMIT: usize = 60;
/// Audit ring capacity.
pub const AUDIT_CAPACITY: usize = 1_000;

/// One audit trail entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub ts: String,
    pub endpoint: String,
    pub actor: String,
    pub payload_hash: String,
    pub sig: String,
}

/// Rate limiter and audit log for the admin surface.
pub struct AdminGate {
    windows: Mutex<HashMap<(String, String), VecDeque<f64>>>,
    audit: Mutex<VecDeque<AuditRecord>>,
    hmac_key: Option<Vec<u8>>,
    /// Test hook: override window capacity without changing the constant.
    limit: usize,
}

impl AdminGate {
    pub fn new(hmac_key: Option<Vec<u8>>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            audit: Mutex::new(VecDeque::new()),
            hmac_key,
            limit: RATE_LIMIT,
        }
    }

    /// Read the HMAC key from `ADMIN_AUDIT_HMAC_KEY`: hex-decoded when it
    /// parses as hex, raw UTF-8 bytes otherwise, absent when unset/empty.
    pub fn from_env() -> Self {
        let key = std::env::var("ADMIN_AUDIT_HMAC_KEY")
            .ok()
            .filter(|v| !v.is_empty())
            .map(|v| hex::decode(&v).unwrap_or_else(|_| v.into_bytes()));
        Self::new(key)
    }

    #[cfg(test)]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Actor label for a presented token.
    pub fn actor_for_token(token: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(token.as_bytes());
        format!("token:{}", &hex::encode(hasher.finalize())[..8])
    }

    /// Admit or reject one request. Accepted requests append their timestamp
    /// to the `(actor, endpoint)` window.
    pub fn check_rate(&self, actor: &str, endpoint: &str, now: f64) -> bool {
        let mut windows = self.windows.lock();
        let window = windows
            .entry((actor.to_string(), endpoint.to_string()))
            .or_default();
        let cutoff = now - RATE_WINDOW_SEC;
        while window.front().is_some_and(|&ts| ts < cutoff) {
            window.pop_front();
        }
        if window.len() >= self.limit {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Append one audit record for a successful admin call.
    pub fn record(&self, endpoint: &str, actor: &str, payload: &serde_json::Value) {
        let canonical = canonical_json(payload);
        let mut hasher = Sha1::new();
        hasher.update(canonical.as_bytes());
        let payload_hash = hex::encode(hasher.finalize());

        let record = AuditRecord {
            ts: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            endpoint: endpoint.to_string(),
            actor: actor.to_string(),
            payload_hash,
            sig: self.sign(payload),
        };

        let mut audit = self.audit.lock();
        audit.push_back(record);
        while audit.len() > AUDIT_CAPACITY {
            audit.pop_front();
        }
    }

    /// HMAC-SHA256 over the canonical payload in lowercase hex; empty string
    /// when no key is configured.
    pub fn sign(&self, payload: &serde_json::Value) -> String {
        let Some(key) = &self.hmac_key else {
            return String::new();
        };
        let mut mac = match Hmac::<Sha256>::new_from_slice(key) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(canonical_json(payload).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.audit.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.audit.lock().clear();
    }
}

impl std::fmt::Debug for AdminGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminGate")
            .field("audit_len", &self.audit.lock().len())
            .field("signed", &self.hmac_key.is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_hash_is_short_and_token_free() {
        let actor = AdminGate::actor_for_token("secret-token");
        assert!(actor.starts_with("token:"));
        assert_eq!(actor.len(), "token:".len() + 8);
        assert!(!actor.contains("secret"));
        assert_eq!(actor, AdminGate::actor_for_token("secret-token"));
    }

    #[test]
    fn window_rejects_beyond_limit() {
        let gate = AdminGate::new(None);
        let mut rejected = 0;
        for i in 0..70 {
            if !gate.check_rate("a", "/admin/rollout", 100.0 + i as f64 * 0.1) {
                rejected += 1;
            }
        }
        assert_eq!(rejected, 10);
    }

    #[test]
    fn window_slides_with_time() {
        let gate = AdminGate::new(None).with_limit(2);
        assert!(gate.check_rate("a", "/e", 100.0));
        assert!(gate.check_rate("a", "/e", 101.0));
        assert!(!gate.check_rate("a", "/e", 102.0));
        // The first admission expires out of the window.
        assert!(gate.check_rate("a", "/e", 161.0));
    }

    #[test]
    fn limits_are_per_actor_and_endpoint() {
        let gate = AdminGate::new(None).with_limit(1);
        assert!(gate.check_rate("a", "/e1", 100.0));
        assert!(gate.check_rate("a", "/e2", 100.0));
        assert!(gate.check_rate("b", "/e1", 100.0));
        assert!(!gate.check_rate("a", "/e1", 100.5));
    }

    #[test]
    fn audit_ring_is_bounded() {
        let gate = AdminGate::new(None);
        for i in 0..1_100 {
            gate.record("/e", "a", &serde_json::json!({"i": i}));
        }
        let records = gate.records();
        assert_eq!(records.len(), AUDIT_CAPACITY);
        // Oldest entries were evicted.
        assert!(records[0].payload_hash != records[1].payload_hash);
    }

    #[test]
    fn signature_matches_hmac_over_canonical_payload() {
        // Hex key "616263" is the bytes of "abc".
        let gate = AdminGate::new(Some(hex::decode("616263").unwrap()));
        let payload = serde_json::json!({"y": 2, "x": 1});
        gate.record("/admin/test", "token:deadbeef", &payload);

        let record = gate.records().pop().unwrap();
        let mut mac = Hmac::<Sha256>::new_from_slice(b"abc").unwrap();
        mac.update(br#"{"x":1,"y":2}"#);
        let expect = hex::encode(mac.finalize().into_bytes());
        assert_eq!(record.sig, expect);

        // Signature is over the payload, not the displayed hash.
        let mut tampered = record.clone();
        tampered.payload_hash = "deadbeef".to_string();
        assert_eq!(tampered.sig, record.sig);

        // A different payload signs differently.
        assert_ne!(gate.sign(&serde_json::json!({"x": 9})), record.sig);
    }

    #[test]
    fn no_key_means_empty_signature() {
        let gate = AdminGate::new(None);
        gate.record("/e", "a", &serde_json::json!({}));
        assert_eq!(gate.records()[0].sig, "");
    }

    #[test]
    fn non_hex_env_key_falls_back_to_utf8() {
        // Mirrors from_env's decoding rule without touching the process env.
        let raw = "not-hex!".to_string();
        let key = hex::decode(&raw).unwrap_or_else(|_| raw.clone().into_bytes());
        assert_eq!(key, b"not-hex!");
    }
}
