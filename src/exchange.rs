// =============================================================================
// Exchange REST seam + execution recorder
// =============================================================================
//
// The control plane never talks to an exchange directly: it consumes the
// `RestExchange` interface, and every call outcome is reported to the
// circuit breaker by the caller.  `HttpRestExchange` is the thin production
// implementation (HMAC-SHA256 signed requests); `NoopExchange` backs paper
// and dry-run modes and the tests.
//
// The execution recorder is an append-only JSONL journal with rotation; the
// admin surface exposes its status and a replay that summarises a recorded
// file without touching live state.
// =============================================================================

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

/// Outcome of one REST call as consumed by the circuit breaker.
#[derive(Debug, Clone, Copy)]
pub struct RestOutcome {
    pub ok: bool,
    pub http_code: u16,
}

/// Boxed future so the interface stays object-safe behind `Arc<dyn ...>`.
pub type RestFuture<'a> = Pin<Box<dyn Future<Output = Result<RestOutcome>> + Send + 'a>>;

/// The only exchange surface the control plane consumes.
pub trait RestExchange: Send + Sync {
    /// Cancel all open orders for `symbol`.
    fn cancel_all<'a>(&'a self, symbol: &'a str) -> RestFuture<'a>;
}

// =============================================================================
// No-op implementation (paper / dry-run / tests)
// =============================================================================

/// Accepts every call without touching a network. Counts invocations so
/// tests and paper runs can observe the traffic.
#[derive(Debug, Default)]
pub struct NoopExchange {
    cancel_all_calls: AtomicU64,
}

impl NoopExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_all_calls(&self) -> u64 {
        self.cancel_all_calls.load(Ordering::Relaxed)
    }
}

impl RestExchange for NoopExchange {
    fn cancel_all<'a>(&'a self, symbol: &'a str) -> RestFuture<'a> {
        self.cancel_all_calls.fetch_add(1, Ordering::Relaxed);
        debug!(symbol, "noop cancel-all");
        Box::pin(async {
            Ok(RestOutcome {
                ok: true,
                http_code: 200,
            })
        })
    }
}

// =============================================================================
// HTTP implementation
// =============================================================================

/// Signed REST client for the live exchange. The secret is used only for
/// HMAC signing and never logged or serialised.
pub struct HttpRestExchange {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpRestExchange {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let mut default_headers = reqwest::header::HeaderMap::new();
        if let Ok(val) = reqwest::header::HeaderValue::from_str(&api_key) {
            default_headers.insert("X-API-KEY", val);
        }
        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            secret: secret.into(),
            base_url: base_url.into(),
            client,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = match HmacSha256::new_from_slice(self.secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let base = format!("{params}&timestamp={ts}");
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }
}

impl RestExchange for HttpRestExchange {
    fn cancel_all<'a>(&'a self, symbol: &'a str) -> RestFuture<'a> {
        Box::pin(async move {
            let qs = self.signed_query(&format!("symbol={symbol}"));
            let url = format!("{}/api/v3/openOrders?{}", self.base_url, qs);
            let resp = self
                .client
                .delete(&url)
                .send()
                .await
                .context("DELETE /api/v3/openOrders request failed")?;
            let code = resp.status().as_u16();
            Ok(RestOutcome {
                ok: resp.status().is_success(),
                http_code: code,
            })
        })
    }
}

impl std::fmt::Debug for HttpRestExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRestExchange")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Execution recorder
// =============================================================================

/// Append-only JSONL journal of execution events with admin-driven rotation.
pub struct ExecutionRecorder {
    path: Mutex<PathBuf>,
    rotations: AtomicU64,
}

impl ExecutionRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Mutex::new(path.into()),
            rotations: AtomicU64::new(0),
        }
    }

    pub fn append(&self, record: &serde_json::Value) -> Result<()> {
        use std::io::Write;
        let path = self.path.lock().clone();
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open recorder file {}", path.display()))?;
        let line = format!("{}\n", crate::snapshot::canonical_json(record));
        f.write_all(line.as_bytes())?;
        f.flush()?;
        Ok(())
    }

    /// Current file, line count and rotation counter.
    pub fn status(&self) -> serde_json::Value {
        let path = self.path.lock().clone();
        let (lines, bytes) = match std::fs::read_to_string(&path) {
            Ok(content) => (content.lines().count(), content.len()),
            Err(_) => (0, 0),
        };
        serde_json::json!({
            "path": path.display().to_string(),
            "lines": lines,
            "bytes": bytes,
            "rotations_total": self.rotations.load(Ordering::Relaxed),
        })
    }

    /// Rename the current file aside (`<name>.<n>.bak`) and start fresh.
    pub fn rotate(&self) -> Result<serde_json::Value> {
        let path = self.path.lock().clone();
        let n = self.rotations.fetch_add(1, Ordering::Relaxed) + 1;
        let rotated = path.with_extension(format!("{n}.bak"));
        if path.exists() {
            std::fs::rename(&path, &rotated)
                .with_context(|| format!("failed to rotate {}", path.display()))?;
        }
        info!(from = %path.display(), to = %rotated.display(), "recorder rotated");
        Ok(serde_json::json!({
            "rotated_to": rotated.display().to_string(),
            "rotations_total": n,
        }))
    }

    /// Summarise a recorded JSONL file without touching live state: line
    /// counts per `kind`, total lines, parse failures.
    pub fn replay_summary(path: &Path) -> Result<serde_json::Value> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read replay file {}", path.display()))?;
        let mut per_kind: std::collections::BTreeMap<String, u64> = std::collections::BTreeMap::new();
        let mut parse_errors = 0u64;
        let mut total = 0u64;
        for line in content.lines() {
            total += 1;
            match serde_json::from_str::<serde_json::Value>(line) {
                Ok(v) => {
                    let kind = v
                        .get("kind")
                        .and_then(|k| k.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    *per_kind.entry(kind).or_insert(0) += 1;
                }
                Err(_) => parse_errors += 1,
            }
        }
        Ok(serde_json::json!({
            "lines_total": total,
            "parse_errors": parse_errors,
            "per_kind": per_kind,
        }))
    }
}

impl std::fmt::Debug for ExecutionRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRecorder")
            .field("path", &*self.path.lock())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_counts_calls() {
        let ex = NoopExchange::new();
        let out = ex.cancel_all("BTCUSDT").await.unwrap();
        assert!(out.ok);
        assert_eq!(out.http_code, 200);
        ex.cancel_all("ETHUSDT").await.unwrap();
        assert_eq!(ex.cancel_all_calls(), 2);
    }

    #[test]
    fn http_signing_is_deterministic() {
        let ex = HttpRestExchange::new("key", "secret", "https://example.invalid");
        let a = ex.sign("symbol=BTCUSDT&timestamp=1");
        let b = ex.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, ex.sign("symbol=ETHUSDT&timestamp=1"));
    }

    #[test]
    fn recorder_status_and_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let rec = ExecutionRecorder::new(dir.path().join("exec.jsonl"));
        rec.append(&serde_json::json!({"kind": "fill", "px": 1.0})).unwrap();
        rec.append(&serde_json::json!({"kind": "reject"})).unwrap();

        let status = rec.status();
        assert_eq!(status["lines"], 2);
        assert_eq!(status["rotations_total"], 0);

        let rotated = rec.rotate().unwrap();
        assert_eq!(rotated["rotations_total"], 1);
        assert_eq!(rec.status()["lines"], 0);

        rec.append(&serde_json::json!({"kind": "fill"})).unwrap();
        assert_eq!(rec.status()["lines"], 1);
    }

    #[test]
    fn replay_summary_counts_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.jsonl");
        std::fs::write(
            &path,
            "{\"kind\":\"fill\"}\n{\"kind\":\"fill\"}\n{\"kind\":\"cancel\"}\nnot-json\n",
        )
        .unwrap();

        let summary = ExecutionRecorder::replay_summary(&path).unwrap();
        assert_eq!(summary["lines_total"], 4);
        assert_eq!(summary["parse_errors"], 1);
        assert_eq!(summary["per_kind"]["fill"], 2);
        assert_eq!(summary["per_kind"]["cancel"], 1);
    }
}
