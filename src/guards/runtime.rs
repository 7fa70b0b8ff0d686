// =============================================================================
// Runtime Guard — single pause decision from live signals
// =============================================================================
//
// Each tick the guard receives four live signals (cancel rate, REST error
// rate, PnL slope, WS lag) and compares them against configured thresholds.
// Breaches OR a bit into the reason mask and advance a breach streak; the
// guard pauses after `hysteresis_bad` consecutive bad ticks and resumes
// after `hysteresis_good` consecutive calm ticks.
//
// `dry_run` keeps computing signals and exporting reasons without ever
// pausing order flow; `manual_override_pause` forces the pause regardless of
// signals.  Effective pause = manual OR (paused AND NOT dry_run).
// =============================================================================

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RuntimeGuardConfig;

/// Reason mask bits, one per input signal.
pub const REASON_CANCEL_RATE: u32 = 1;
pub const REASON_REST_ERRORS: u32 = 2;
pub const REASON_PNL_SLOPE: u32 = 4;
pub const REASON_WS_LAG: u32 = 8;
pub const REASON_MANUAL: u32 = 16;

/// Live signals sampled once per guard tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardSignals {
    pub cancel_rate_per_sec: f64,
    pub rest_error_rate: f64,
    pub pnl_slope_per_min: f64,
    pub ws_lag_ms: f64,
}

/// Anti-stale market-data gate folded into the WS-lag signal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AntiStaleConfig {
    pub enabled: bool,
    pub max_ws_lag_ms: f64,
}

impl Default for AntiStaleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_ws_lag_ms: 5_000.0,
        }
    }
}

/// Serialisable guard state; doubles as the version-1 snapshot payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardState {
    pub paused: bool,
    pub manual_override: bool,
    pub dry_run: bool,
    pub last_reason_mask: u32,
    pub last_change_ts: f64,
    pub breach_streak: u32,
    pub calm_streak: u32,
    pub pauses_total: u64,
    pub ws_lag_ms: f64,
}

impl Default for GuardState {
    fn default() -> Self {
        Self {
            paused: false,
            manual_override: false,
            dry_run: false,
            last_reason_mask: 0,
            last_change_ts: 0.0,
            breach_streak: 0,
            calm_streak: 0,
            pauses_total: 0,
            ws_lag_ms: 0.0,
        }
    }
}

/// Boolean pause decision with hysteresis over live anomaly signals.
pub struct RuntimeGuard {
    cfg: RwLock<RuntimeGuardConfig>,
    anti_stale: RwLock<AntiStaleConfig>,
    state: RwLock<GuardState>,
}

impl RuntimeGuard {
    pub fn new(cfg: RuntimeGuardConfig) -> Self {
        let state = GuardState {
            dry_run: cfg.dry_run,
            manual_override: cfg.manual_override_pause,
            ..GuardState::default()
        };
        Self {
            cfg: RwLock::new(cfg),
            anti_stale: RwLock::new(AntiStaleConfig::default()),
            state: RwLock::new(state),
        }
    }

    /// Evaluate one tick of signals. Returns the new reason mask.
    pub fn evaluate(&self, signals: GuardSignals, now: f64) -> u32 {
        let cfg = self.cfg.read().clone();
        let anti_stale = *self.anti_stale.read();
        let mut state = self.state.write();

        state.ws_lag_ms = signals.ws_lag_ms;

        if !cfg.enabled {
            state.last_reason_mask = if state.manual_override { REASON_MANUAL } else { 0 };
            return state.last_reason_mask;
        }

        let mut mask = 0u32;
        if signals.cancel_rate_per_sec > cfg.cancel_rate_per_sec_max {
            mask |= REASON_CANCEL_RATE;
        }
        if signals.rest_error_rate > cfg.rest_error_rate_max {
            mask |= REASON_REST_ERRORS;
        }
        if signals.pnl_slope_per_min < cfg.pnl_slope_min_per_min {
            mask |= REASON_PNL_SLOPE;
        }
        let ws_cap = if anti_stale.enabled {
            cfg.ws_lag_ms_max.min(anti_stale.max_ws_lag_ms)
        } else {
            cfg.ws_lag_ms_max
        };
        if signals.ws_lag_ms > ws_cap {
            mask |= REASON_WS_LAG;
        }
        if state.manual_override {
            mask |= REASON_MANUAL;
        }

        let signal_breach = mask & !REASON_MANUAL != 0;
        if signal_breach {
            state.breach_streak += 1;
            state.calm_streak = 0;
        } else {
            state.calm_streak += 1;
            state.breach_streak = 0;
        }

        if !state.paused && signal_breach && state.breach_streak >= cfg.hysteresis_bad {
            state.paused = true;
            state.pauses_total += 1;
            state.last_change_ts = now;
            warn!(mask, streak = state.breach_streak, "runtime guard paused");
        } else if state.paused && !signal_breach && state.calm_streak >= cfg.hysteresis_good {
            state.paused = false;
            state.last_change_ts = now;
            info!(streak = state.calm_streak, "runtime guard resumed");
        }

        state.last_reason_mask = mask;
        mask
    }

    /// The pause as seen by order submission.
    pub fn effective_pause(&self) -> bool {
        let state = self.state.read();
        state.manual_override || (state.paused && !state.dry_run)
    }

    pub fn state(&self) -> GuardState {
        self.state.read().clone()
    }

    pub fn set_manual_override(&self, on: bool) {
        let mut state = self.state.write();
        if state.manual_override != on {
            state.manual_override = on;
            info!(manual_override = on, "runtime guard manual override changed");
        }
    }

    pub fn set_dry_run(&self, on: bool) {
        self.state.write().dry_run = on;
    }

    pub fn update_config(&self, cfg: RuntimeGuardConfig) {
        let mut state = self.state.write();
        state.dry_run = cfg.dry_run;
        state.manual_override = cfg.manual_override_pause;
        *self.cfg.write() = cfg;
    }

    pub fn config(&self) -> RuntimeGuardConfig {
        self.cfg.read().clone()
    }

    pub fn anti_stale(&self) -> AntiStaleConfig {
        *self.anti_stale.read()
    }

    pub fn set_anti_stale(&self, cfg: AntiStaleConfig) {
        *self.anti_stale.write() = cfg;
    }

    // ── Snapshot ────────────────────────────────────────────────────────

    pub fn to_snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self.state.read().clone()).unwrap_or_default()
    }

    pub fn load_snapshot(&self, payload: &serde_json::Value) -> Result<(), &'static str> {
        let loaded: GuardState =
            serde_json::from_value(payload.clone()).map_err(|_| "invalid_payload")?;
        *self.state.write() = loaded;
        Ok(())
    }
}

impl std::fmt::Debug for RuntimeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("RuntimeGuard")
            .field("paused", &s.paused)
            .field("mask", &s.last_reason_mask)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RuntimeGuardConfig {
        RuntimeGuardConfig {
            enabled: true,
            dry_run: false,
            manual_override_pause: false,
            cancel_rate_per_sec_max: 5.0,
            rest_error_rate_max: 0.2,
            pnl_slope_min_per_min: -50.0,
            ws_lag_ms_max: 2_000.0,
            hysteresis_bad: 2,
            hysteresis_good: 3,
        }
    }

    fn bad_signals() -> GuardSignals {
        GuardSignals {
            cancel_rate_per_sec: 10.0,
            rest_error_rate: 0.0,
            pnl_slope_per_min: 0.0,
            ws_lag_ms: 0.0,
        }
    }

    #[test]
    fn pauses_after_hysteresis_bad() {
        let g = RuntimeGuard::new(cfg());
        g.evaluate(bad_signals(), 1.0);
        assert!(!g.effective_pause());
        g.evaluate(bad_signals(), 2.0);
        assert!(g.effective_pause());
        assert_eq!(g.state().pauses_total, 1);
        assert_eq!(g.state().last_reason_mask, REASON_CANCEL_RATE);
    }

    #[test]
    fn resumes_after_hysteresis_good() {
        let g = RuntimeGuard::new(cfg());
        g.evaluate(bad_signals(), 1.0);
        g.evaluate(bad_signals(), 2.0);
        assert!(g.effective_pause());

        let calm = GuardSignals::default();
        g.evaluate(calm, 3.0);
        g.evaluate(calm, 4.0);
        assert!(g.effective_pause());
        g.evaluate(calm, 5.0);
        assert!(!g.effective_pause());
    }

    #[test]
    fn dry_run_reports_but_never_pauses_effectively() {
        let g = RuntimeGuard::new(cfg());
        g.set_dry_run(true);
        g.evaluate(bad_signals(), 1.0);
        g.evaluate(bad_signals(), 2.0);
        let s = g.state();
        assert!(s.paused);
        assert_eq!(s.last_reason_mask, REASON_CANCEL_RATE);
        assert!(!g.effective_pause());
    }

    #[test]
    fn manual_override_forces_pause() {
        let g = RuntimeGuard::new(cfg());
        g.set_manual_override(true);
        assert!(g.effective_pause());
        g.evaluate(GuardSignals::default(), 1.0);
        assert!(g.effective_pause());
        assert_eq!(g.state().last_reason_mask & REASON_MANUAL, REASON_MANUAL);
    }

    #[test]
    fn reason_mask_accumulates_bits() {
        let g = RuntimeGuard::new(cfg());
        let mask = g.evaluate(
            GuardSignals {
                cancel_rate_per_sec: 10.0,
                rest_error_rate: 0.9,
                pnl_slope_per_min: -100.0,
                ws_lag_ms: 9_000.0,
            },
            1.0,
        );
        assert_eq!(
            mask,
            REASON_CANCEL_RATE | REASON_REST_ERRORS | REASON_PNL_SLOPE | REASON_WS_LAG
        );
    }

    #[test]
    fn anti_stale_tightens_ws_cap() {
        let g = RuntimeGuard::new(cfg());
        let lagging = GuardSignals {
            ws_lag_ms: 1_500.0,
            ..GuardSignals::default()
        };
        assert_eq!(g.evaluate(lagging, 1.0), 0);

        g.set_anti_stale(AntiStaleConfig {
            enabled: true,
            max_ws_lag_ms: 1_000.0,
        });
        assert_eq!(g.evaluate(lagging, 2.0), REASON_WS_LAG);
    }

    #[test]
    fn snapshot_roundtrip() {
        let g = RuntimeGuard::new(cfg());
        g.evaluate(bad_signals(), 1.0);
        g.evaluate(bad_signals(), 2.0);
        let snap = g.to_snapshot();

        let g2 = RuntimeGuard::new(cfg());
        g2.load_snapshot(&snap).unwrap();
        assert_eq!(g2.state().pauses_total, 1);
        assert!(g2.state().paused);
        assert_eq!(g2.to_snapshot(), snap);
    }
}
