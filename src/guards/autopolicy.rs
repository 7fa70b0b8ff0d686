// =============================================================================
// AutoPolicy — level-based strategy attenuation with hysteresis
// =============================================================================
//
// Watches throttle pressure (max backoff, total events) and steps an
// attenuation level up or down, one step per evaluation, gated by a
// cooldown.  Each level multiplies the base strategy parameters:
//
//   min_time_in_book_ms_eff  = min(cap, base * (1 + step_pct * level))
//   replace_threshold_bps_eff = min(cap, base * (1 + step_pct * level))
//   levels_per_side_max_eff  = max(floor, round(base * (1 - shrink_pct * level)))
//
// The effective triple is what the quoting strategy actually consumes.
// =============================================================================

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::AutopolicyConfig;

/// Base strategy parameters the attenuation is applied to.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PolicyBase {
    pub min_time_in_book_ms: f64,
    pub replace_threshold_bps: f64,
    pub levels_per_side_max: u32,
}

/// Effective parameters after attenuation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyOverrides {
    pub min_time_in_book_ms_eff: f64,
    pub replace_threshold_bps_eff: f64,
    pub levels_per_side_max_eff: u32,
}

/// Serialisable autopolicy state; doubles as the version-1 snapshot payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyState {
    pub level: u32,
    pub consec_bad: u32,
    pub consec_good: u32,
    pub last_change_ts: f64,
    pub steps_total: u64,
    pub base: PolicyBase,
    pub overrides: PolicyOverrides,
}

/// Adaptive parameter attenuation driven by throttle pressure.
pub struct AutoPolicy {
    cfg: RwLock<AutopolicyConfig>,
    state: RwLock<PolicyState>,
}

impl AutoPolicy {
    pub fn new(cfg: AutopolicyConfig) -> Self {
        Self {
            cfg: RwLock::new(cfg),
            state: RwLock::new(PolicyState::default()),
        }
    }

    pub fn set_base(
        &self,
        min_time_in_book_ms: f64,
        replace_threshold_bps: f64,
        levels_per_side_max: u32,
    ) {
        let mut state = self.state.write();
        state.base = PolicyBase {
            min_time_in_book_ms: min_time_in_book_ms.max(0.0),
            replace_threshold_bps: replace_threshold_bps.max(0.0),
            levels_per_side_max: levels_per_side_max.max(1),
        };
    }

    /// Evaluate one tick of throttle pressure. The level moves by at most
    /// one, never inside the cooldown.
    pub fn evaluate(&self, now: f64, backoff_ms_max: f64, events_total: u64) {
        let cfg = self.cfg.read().clone();
        if !cfg.enabled {
            return;
        }
        let mut state = self.state.write();

        let bad = backoff_ms_max >= cfg.trigger_backoff_ms
            || events_total >= cfg.trigger_events_total;
        if bad {
            state.consec_bad += 1;
            state.consec_good = 0;
        } else {
            state.consec_good += 1;
            state.consec_bad = 0;
        }

        let can_change = now - state.last_change_ts >= cfg.cooldown_minutes * 60.0;
        if bad && state.consec_bad >= cfg.hysteresis_bad_required && can_change {
            if state.level < cfg.max_level {
                state.level += 1;
                state.steps_total += 1;
                state.last_change_ts = now;
                info!(level = state.level, "autopolicy tightened");
            }
        }
        if !bad && state.consec_good >= cfg.hysteresis_good_required && can_change {
            if state.level > 0 {
                state.level -= 1;
                state.steps_total += 1;
                state.last_change_ts = now;
                info!(level = state.level, "autopolicy relaxed");
            }
        }
    }

    /// Recompute the effective parameters for the current level.
    pub fn apply(&self) -> PolicyOverrides {
        let cfg = self.cfg.read().clone();
        let mut state = self.state.write();
        let lvl = state.level as f64;

        let tib = (state.base.min_time_in_book_ms
            * (1.0 + cfg.min_time_in_book_ms_step_pct * lvl))
            .min(cfg.max_min_time_in_book_ms);
        let rep = (state.base.replace_threshold_bps
            * (1.0 + cfg.replace_threshold_bps_step_pct * lvl))
            .min(cfg.max_replace_threshold_bps);
        let levels = ((state.base.levels_per_side_max as f64
            * (1.0 - cfg.levels_per_side_shrink_step_pct * lvl))
            .round() as i64)
            .max(cfg.min_levels_cap as i64) as u32;

        state.overrides = PolicyOverrides {
            min_time_in_book_ms_eff: tib,
            replace_threshold_bps_eff: rep,
            levels_per_side_max_eff: levels,
        };
        state.overrides
    }

    pub fn state(&self) -> PolicyState {
        self.state.read().clone()
    }

    pub fn config(&self) -> AutopolicyConfig {
        self.cfg.read().clone()
    }

    pub fn update_config(&self, cfg: AutopolicyConfig) {
        *self.cfg.write() = cfg;
    }

    /// Gauge triple published every apply: (active, level, steps_total).
    pub fn metrics(&self) -> (f64, f64, f64) {
        let cfg = self.cfg.read();
        let state = self.state.read();
        let active = if cfg.enabled && state.level > 0 { 1.0 } else { 0.0 };
        (active, state.level as f64, state.steps_total as f64)
    }

    // ── Snapshot ────────────────────────────────────────────────────────

    pub fn to_snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self.state.read().clone()).unwrap_or_default()
    }

    pub fn load_snapshot(&self, payload: &serde_json::Value) -> Result<(), &'static str> {
        let loaded: PolicyState =
            serde_json::from_value(payload.clone()).map_err(|_| "invalid_payload")?;
        *self.state.write() = loaded;
        Ok(())
    }
}

impl std::fmt::Debug for AutoPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("AutoPolicy")
            .field("level", &s.level)
            .field("steps_total", &s.steps_total)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AutopolicyConfig {
        AutopolicyConfig {
            enabled: true,
            max_level: 3,
            trigger_backoff_ms: 3_000.0,
            trigger_events_total: 40,
            hysteresis_bad_required: 2,
            hysteresis_good_required: 2,
            cooldown_minutes: 2.0,
            min_time_in_book_ms_step_pct: 0.15,
            replace_threshold_bps_step_pct: 0.15,
            levels_per_side_shrink_step_pct: 0.25,
            min_levels_cap: 1,
            max_min_time_in_book_ms: 60_000.0,
            max_replace_threshold_bps: 100.0,
        }
    }

    #[test]
    fn tightens_after_hysteresis_and_cooldown() {
        let p = AutoPolicy::new(cfg());
        p.evaluate(130.0, 5_000.0, 0);
        assert_eq!(p.state().level, 0);
        p.evaluate(140.0, 5_000.0, 0);
        assert_eq!(p.state().level, 1);

        // Inside cooldown: further bad ticks do not move the level.
        p.evaluate(150.0, 5_000.0, 0);
        p.evaluate(160.0, 5_000.0, 0);
        assert_eq!(p.state().level, 1);

        // Past cooldown (120 s) the next qualifying tick steps again.
        p.evaluate(300.0, 5_000.0, 0);
        assert_eq!(p.state().level, 2);
    }

    #[test]
    fn relaxes_when_calm() {
        let p = AutoPolicy::new(cfg());
        p.evaluate(130.0, 5_000.0, 0);
        p.evaluate(140.0, 5_000.0, 0);
        assert_eq!(p.state().level, 1);

        p.evaluate(300.0, 0.0, 0);
        assert_eq!(p.state().level, 1);
        p.evaluate(310.0, 0.0, 0);
        assert_eq!(p.state().level, 0);
    }

    #[test]
    fn level_never_exceeds_max() {
        let p = AutoPolicy::new(cfg());
        let mut now = 0.0;
        for _ in 0..20 {
            now += 200.0;
            p.evaluate(now, 5_000.0, 100);
        }
        assert_eq!(p.state().level, 3);
    }

    #[test]
    fn events_total_also_triggers() {
        let p = AutoPolicy::new(cfg());
        p.evaluate(130.0, 0.0, 50);
        p.evaluate(140.0, 0.0, 50);
        assert_eq!(p.state().level, 1);
    }

    #[test]
    fn apply_attenuates_and_caps() {
        let p = AutoPolicy::new(cfg());
        p.set_base(1_000.0, 10.0, 4);

        let at0 = p.apply();
        assert!((at0.min_time_in_book_ms_eff - 1_000.0).abs() < 1e-9);
        assert_eq!(at0.levels_per_side_max_eff, 4);

        p.evaluate(130.0, 5_000.0, 0);
        p.evaluate(140.0, 5_000.0, 0);
        let at1 = p.apply();
        assert!((at1.min_time_in_book_ms_eff - 1_150.0).abs() < 1e-9);
        assert!((at1.replace_threshold_bps_eff - 11.5).abs() < 1e-9);
        assert_eq!(at1.levels_per_side_max_eff, 3);
    }

    #[test]
    fn levels_floor_holds() {
        let p = AutoPolicy::new(cfg());
        p.set_base(100.0, 1.0, 1);
        let mut now = 0.0;
        for _ in 0..6 {
            now += 200.0;
            p.evaluate(now, 5_000.0, 100);
        }
        let eff = p.apply();
        assert_eq!(eff.levels_per_side_max_eff, 1);
    }

    #[test]
    fn snapshot_roundtrip() {
        let p = AutoPolicy::new(cfg());
        p.set_base(1_000.0, 10.0, 4);
        p.evaluate(130.0, 5_000.0, 0);
        p.evaluate(140.0, 5_000.0, 0);
        p.apply();
        let snap = p.to_snapshot();

        let p2 = AutoPolicy::new(cfg());
        p2.load_snapshot(&snap).unwrap();
        assert_eq!(p2.state().level, 1);
        assert_eq!(p2.to_snapshot(), snap);
    }
}
