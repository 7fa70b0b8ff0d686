// =============================================================================
// Throttle Guard — per-symbol sliding windows + exponential backoff
// =============================================================================
//
// Counts create/amend/cancel events per symbol in fixed-length sliding
// windows.  Exceeding a per-kind cap doubles the symbol's backoff up to a
// configured ceiling; admissions at or under cap decay it multiplicatively
// toward zero.  The snapshot persists counters only, never wall-clock
// deadlines.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::ThrottleConfig;
use crate::types::OrderOp;

const BACKOFF_DECAY: f64 = 0.5;
const BACKOFF_FLOOR_MS: f64 = 1.0;

#[derive(Debug, Default)]
struct SymbolWindows {
    creates: VecDeque<f64>,
    amends: VecDeque<f64>,
    cancels: VecDeque<f64>,
    backoff_ms: f64,
}

impl SymbolWindows {
    fn deque_mut(&mut self, kind: OrderOp) -> &mut VecDeque<f64> {
        match kind {
            OrderOp::Create => &mut self.creates,
            OrderOp::Amend => &mut self.amends,
            OrderOp::Cancel => &mut self.cancels,
        }
    }

    fn evict(&mut self, cutoff: f64) {
        for q in [&mut self.creates, &mut self.amends, &mut self.cancels] {
            while q.front().is_some_and(|&ts| ts < cutoff) {
                q.pop_front();
            }
        }
    }
}

struct Inner {
    per_symbol: HashMap<String, SymbolWindows>,
    window_since: String,
    events_total: u64,
    last_event_ts: f64,
}

/// Per-kind window counts for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct WindowCounts {
    pub create: usize,
    pub amend: usize,
    pub cancel: usize,
}

/// Per-symbol sliding-window throttle with exponential backoff.
pub struct ThrottleGuard {
    cfg: ThrottleConfig,
    inner: RwLock<Inner>,
}

impl ThrottleGuard {
    pub fn new(cfg: ThrottleConfig) -> Self {
        Self {
            cfg,
            inner: RwLock::new(Inner {
                per_symbol: HashMap::new(),
                window_since: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                events_total: 0,
                last_event_ts: 0.0,
            }),
        }
    }

    fn cap(&self, kind: OrderOp) -> u32 {
        match kind {
            OrderOp::Create => self.cfg.max_creates_per_window,
            OrderOp::Amend => self.cfg.max_amends_per_window,
            OrderOp::Cancel => self.cfg.max_cancels_per_window,
        }
    }

    /// Record one order event. Returns the symbol's backoff in ms after the
    /// event (zero when calm).
    pub fn on_event(&self, symbol: &str, kind: OrderOp, now: f64) -> f64 {
        let cap = self.cap(kind) as usize;
        let mut inner = self.inner.write();
        inner.events_total += 1;
        inner.last_event_ts = now;

        let win = inner.per_symbol.entry(symbol.to_string()).or_default();
        win.evict(now - self.cfg.window_sec);
        win.deque_mut(kind).push_back(now);

        let count = win.deque_mut(kind).len();
        if count > cap {
            let doubled = if win.backoff_ms <= 0.0 {
                self.cfg.backoff_base_ms
            } else {
                win.backoff_ms * 2.0
            };
            win.backoff_ms = doubled.min(self.cfg.backoff_max_ms);
            warn!(
                symbol,
                kind = %kind,
                count,
                cap,
                backoff_ms = win.backoff_ms,
                "throttle cap exceeded, backoff increased"
            );
        } else if win.backoff_ms > 0.0 {
            win.backoff_ms *= BACKOFF_DECAY;
            if win.backoff_ms < BACKOFF_FLOOR_MS {
                win.backoff_ms = 0.0;
            }
            debug!(symbol, backoff_ms = win.backoff_ms, "throttle backoff decayed");
        }
        win.backoff_ms
    }

    /// Evict stale entries then return the per-kind counts for `symbol`.
    pub fn get_window_counts(&self, symbol: &str, now: f64) -> WindowCounts {
        let mut inner = self.inner.write();
        match inner.per_symbol.get_mut(symbol) {
            Some(win) => {
                win.evict(now - self.cfg.window_sec);
                WindowCounts {
                    create: win.creates.len(),
                    amend: win.amends.len(),
                    cancel: win.cancels.len(),
                }
            }
            None => WindowCounts {
                create: 0,
                amend: 0,
                cancel: 0,
            },
        }
    }

    pub fn backoff_ms(&self, symbol: &str) -> f64 {
        self.inner
            .read()
            .per_symbol
            .get(symbol)
            .map(|w| w.backoff_ms)
            .unwrap_or(0.0)
    }

    /// Largest backoff across all symbols; the autopolicy trigger input.
    pub fn backoff_ms_max(&self) -> f64 {
        self.inner
            .read()
            .per_symbol
            .values()
            .map(|w| w.backoff_ms)
            .fold(0.0, f64::max)
    }

    pub fn events_total(&self) -> u64 {
        self.inner.read().events_total
    }

    /// Cancel events per second over the current window, summed across
    /// symbols. Feeds the runtime guard.
    pub fn cancel_rate_per_sec(&self, now: f64) -> f64 {
        let mut inner = self.inner.write();
        let cutoff = now - self.cfg.window_sec;
        let mut cancels = 0usize;
        for win in inner.per_symbol.values_mut() {
            win.evict(cutoff);
            cancels += win.cancels.len();
        }
        cancels as f64 / self.cfg.window_sec.max(1.0)
    }

    /// Zero every window and counter; `window_since` restarts at `now_iso`.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.per_symbol.clear();
        inner.events_total = 0;
        inner.last_event_ts = 0.0;
        inner.window_since = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    }

    // ── Snapshot ────────────────────────────────────────────────────────

    /// Version-2 snapshot payload: counters only, no deadlines.
    pub fn to_snapshot(&self) -> serde_json::Value {
        let inner = self.inner.read();
        serde_json::json!({
            "window_since": inner.window_since,
            "events_total": inner.events_total,
            "backoff_ms_max": inner
                .per_symbol
                .values()
                .map(|w| w.backoff_ms)
                .fold(0.0, f64::max),
            "last_event_ts": inner.last_event_ts,
        })
    }

    /// Restore counters from a verified snapshot payload. Unknown or
    /// malformed fields fall back to zero values; per-symbol deques are
    /// intentionally not restored.
    pub fn load_snapshot(&self, payload: &serde_json::Value) -> Result<(), &'static str> {
        let obj = payload.as_object().ok_or("invalid_payload")?;
        let mut inner = self.inner.write();
        inner.window_since = obj
            .get("window_since")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        inner.events_total = obj
            .get("events_total")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        inner.last_event_ts = obj
            .get("last_event_ts")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        Ok(())
    }
}

impl std::fmt::Debug for ThrottleGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ThrottleGuard")
            .field("symbols", &inner.per_symbol.len())
            .field("events_total", &inner.events_total)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ThrottleConfig {
        ThrottleConfig {
            window_sec: 60.0,
            max_creates_per_window: 3,
            max_amends_per_window: 3,
            max_cancels_per_window: 3,
            backoff_base_ms: 200.0,
            backoff_max_ms: 1_000.0,
        }
    }

    #[test]
    fn counts_evict_stale_entries() {
        let t = ThrottleGuard::new(cfg());
        t.on_event("BTCUSDT", OrderOp::Create, 100.0);
        t.on_event("BTCUSDT", OrderOp::Create, 110.0);
        assert_eq!(t.get_window_counts("BTCUSDT", 120.0).create, 2);
        // First event falls out of the 60 s window.
        assert_eq!(t.get_window_counts("BTCUSDT", 161.0).create, 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let t = ThrottleGuard::new(cfg());
        for i in 0..4 {
            t.on_event("BTCUSDT", OrderOp::Cancel, 100.0 + i as f64);
        }
        // Fourth event breached cap=3.
        assert!((t.backoff_ms("BTCUSDT") - 200.0).abs() < 1e-9);

        t.on_event("BTCUSDT", OrderOp::Cancel, 105.0);
        assert!((t.backoff_ms("BTCUSDT") - 400.0).abs() < 1e-9);

        for i in 0..10 {
            t.on_event("BTCUSDT", OrderOp::Cancel, 106.0 + i as f64);
        }
        assert!((t.backoff_ms("BTCUSDT") - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn backoff_decays_when_calm() {
        let t = ThrottleGuard::new(cfg());
        for i in 0..4 {
            t.on_event("BTCUSDT", OrderOp::Create, 100.0 + i as f64);
        }
        assert!(t.backoff_ms("BTCUSDT") > 0.0);

        // A calm event far in the future sees an empty window and decays.
        t.on_event("BTCUSDT", OrderOp::Create, 500.0);
        assert!((t.backoff_ms("BTCUSDT") - 100.0).abs() < 1e-9);

        // Repeated calm admissions drive it to zero through the floor.
        for i in 1..12 {
            t.on_event("BTCUSDT", OrderOp::Create, 500.0 + i as f64 * 70.0);
        }
        assert_eq!(t.backoff_ms("BTCUSDT"), 0.0);
    }

    #[test]
    fn backoff_is_per_symbol() {
        let t = ThrottleGuard::new(cfg());
        for i in 0..5 {
            t.on_event("BTCUSDT", OrderOp::Create, 100.0 + i as f64);
        }
        assert!(t.backoff_ms("BTCUSDT") > 0.0);
        assert_eq!(t.backoff_ms("ETHUSDT"), 0.0);
        assert!(t.backoff_ms_max() > 0.0);
    }

    #[test]
    fn snapshot_restores_counters_only() {
        let t = ThrottleGuard::new(cfg());
        for i in 0..5 {
            t.on_event("BTCUSDT", OrderOp::Create, 100.0 + i as f64);
        }
        let snap = t.to_snapshot();
        assert_eq!(snap["events_total"], 5);
        assert!(snap["backoff_ms_max"].as_f64().unwrap() > 0.0);

        let t2 = ThrottleGuard::new(cfg());
        t2.load_snapshot(&snap).unwrap();
        assert_eq!(t2.events_total(), 5);
        // Windows and backoffs are runtime-only.
        assert_eq!(t2.get_window_counts("BTCUSDT", 200.0).create, 0);
        assert_eq!(t2.backoff_ms_max(), 0.0);
    }

    #[test]
    fn cancel_rate_over_window() {
        let t = ThrottleGuard::new(cfg());
        for i in 0..3 {
            t.on_event("BTCUSDT", OrderOp::Cancel, 100.0 + i as f64);
        }
        let rate = t.cancel_rate_per_sec(103.0);
        assert!((rate - 3.0 / 60.0).abs() < 1e-9);
    }
}
