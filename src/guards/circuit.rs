// =============================================================================
// Circuit Breaker — three-state breaker over REST call outcomes
// =============================================================================
//
// States: closed → open → half_open → {closed | open}.
//
//   - closed:    all operations admitted; error rates tracked over a sliding
//                window of (ts, ok, http_code) outcomes.
//   - open:      only `cancel` admitted; entered when any configured rate
//                threshold is reached.
//   - half_open: a bounded number of probe operations admitted; closes when
//                the probes are spent and the window is calm, re-opens
//                otherwise.
//
// Rates are fractions over `window_sec` with a denominator of at least 1,
// so an empty window always reads as calm.
// =============================================================================

use std::collections::VecDeque;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::CircuitConfig;
use crate::types::OrderOp;

/// Breaker state as exported to the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

struct Inner {
    state: CircuitState,
    opened_ts: f64,
    half_open_remaining: u32,
    /// Sliding window of (ts, ok, http_code).
    events: VecDeque<(f64, bool, u16)>,
    last_tick: f64,
}

/// Three-state circuit breaker. All mutation goes through `on_result` and
/// `tick`; `allowed` is a pure read.
pub struct CircuitBreaker {
    cfg: CircuitConfig,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitConfig) -> Self {
        let probes = cfg.half_open_probes;
        Self {
            cfg,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                opened_ts: 0.0,
                half_open_remaining: probes,
                events: VecDeque::new(),
                last_tick: 0.0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    /// Whether `op` may be sent to the exchange right now.
    pub fn allowed(&self, op: OrderOp) -> bool {
        let inner = self.inner.read();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => op == OrderOp::Cancel,
            CircuitState::HalfOpen => inner.half_open_remaining > 0 || op == OrderOp::Cancel,
        }
    }

    /// Record one REST outcome. In half-open this consumes a probe.
    pub fn on_result(&self, ok: bool, http_code: u16, now: f64) {
        let mut inner = self.inner.write();
        inner.events.push_back((now, ok, http_code));
        Self::evict(&mut inner, self.cfg.window_sec, now);
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_remaining = inner.half_open_remaining.saturating_sub(1);
        }
    }

    /// Drive state transitions. Called periodically by the loop supervisor.
    pub fn tick(&self, now: f64) {
        let mut inner = self.inner.write();
        inner.last_tick = now;
        let (err, r5xx, r429) = Self::rates(&mut inner, self.cfg.window_sec, now);

        match inner.state {
            CircuitState::Closed => {
                if err >= self.cfg.err_rate_open
                    || r5xx >= self.cfg.http_5xx_rate_open
                    || r429 >= self.cfg.http_429_rate_open
                {
                    inner.state = CircuitState::Open;
                    inner.opened_ts = now;
                    inner.half_open_remaining = self.cfg.half_open_probes;
                    warn!(
                        err_rate = err,
                        rate_5xx = r5xx,
                        rate_429 = r429,
                        "circuit opened"
                    );
                }
            }
            CircuitState::Open => {
                if now - inner.opened_ts >= self.cfg.open_duration_sec {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_remaining = self.cfg.half_open_probes;
                    info!("circuit half-open, admitting probes");
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_remaining == 0 {
                    if err < self.cfg.err_rate_open
                        && r5xx < self.cfg.http_5xx_rate_open
                        && r429 < self.cfg.http_429_rate_open
                    {
                        inner.state = CircuitState::Closed;
                        info!("circuit closed after healthy probes");
                    } else {
                        inner.state = CircuitState::Open;
                        inner.opened_ts = now;
                        warn!("circuit re-opened, probes unhealthy");
                    }
                    inner.half_open_remaining = self.cfg.half_open_probes;
                }
            }
        }
    }

    /// Current (err, 5xx, 429) rates over the window.
    pub fn current_rates(&self, now: f64) -> (f64, f64, f64) {
        let mut inner = self.inner.write();
        Self::rates(&mut inner, self.cfg.window_sec, now)
    }

    pub fn status(&self) -> serde_json::Value {
        let inner = self.inner.read();
        serde_json::json!({
            "state": inner.state.as_str(),
            "opened_ts": inner.opened_ts,
            "half_open_probes_remaining": inner.half_open_remaining,
            "window_events": inner.events.len(),
        })
    }

    fn evict(inner: &mut Inner, window_sec: f64, now: f64) {
        let cutoff = now - window_sec;
        while inner.events.front().is_some_and(|&(ts, _, _)| ts < cutoff) {
            inner.events.pop_front();
        }
    }

    fn rates(inner: &mut Inner, window_sec: f64, now: f64) -> (f64, f64, f64) {
        Self::evict(inner, window_sec, now);
        let total = inner.events.len().max(1) as f64;
        let errors = inner.events.iter().filter(|&&(_, ok, _)| !ok).count() as f64;
        let r5xx = inner
            .events
            .iter()
            .filter(|&&(_, ok, code)| !ok && (500..600).contains(&code))
            .count() as f64;
        let r429 = inner
            .events
            .iter()
            .filter(|&&(_, ok, code)| !ok && code == 429)
            .count() as f64;
        (errors / total, r5xx / total, r429 / total)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("CircuitBreaker")
            .field("state", &inner.state)
            .field("events", &inner.events.len())
            .finish()
    }
}
