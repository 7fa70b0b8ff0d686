// =============================================================================
// Rollout Controller — blue/green split, auto-ramp, kill-switch, auto-promote
// =============================================================================
//
// The rollout state is the authoritative traffic split: `split_pct` is the
// target green share, `active` is the color receiving the remainder.  The
// ramp tick walks `steps_pct` upward while the green deltas stay healthy,
// steps down (with a cooldown) on regressions, and hands severe incidents to
// the kill-switch, whose action is `rollback`, `freeze` (a latched state
// cleared only by admin) or, in dry-run, a counter increment and nothing
// else.
//
// Delta accounting: `last_counters` is written only after the min-sample
// HOLD decision, so held deltas accumulate across ticks instead of being
// dropped.
//
// CID routing is the single authoritative color assignment:
//   bucket = u32(sha1(salt ‖ cid)[0..4]) mod 100 ; green iff pinned or
//   bucket < split_pct.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::{info, warn};

use crate::alerts::AlertsLog;
use crate::config::{AutopromoteConfig, DriftConfig, KillSwitchConfig, RampConfig, RolloutConfig};
use crate::metrics::{ColorCounts, Metrics};
use crate::types::Color;

/// Limits enforced on admin writes.
pub const MAX_SALT_LEN: usize = 64;
pub const MAX_PINNED_CIDS: usize = 10_000;

// =============================================================================
// State records
// =============================================================================

/// Authoritative traffic-split state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutState {
    pub traffic_split_pct: u32,
    pub active: Color,
    pub salt: String,
    pub pinned_cids_green: Vec<String>,
    pub overlay_blue: serde_json::Map<String, serde_json::Value>,
    pub overlay_green: serde_json::Map<String, serde_json::Value>,
}

impl RolloutState {
    fn from_config(cfg: &RolloutConfig) -> Self {
        Self {
            traffic_split_pct: cfg.traffic_split_pct.min(100),
            active: cfg.active,
            salt: cfg.salt.clone(),
            pinned_cids_green: cfg.pinned_cids_green.clone(),
            overlay_blue: cfg.blue.clone(),
            overlay_green: cfg.green.clone(),
        }
    }
}

/// Ramp bookkeeping between ticks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RampState {
    pub enabled: bool,
    pub step_idx: usize,
    pub frozen: bool,
    pub last_fills: ColorCountsSnap,
    pub last_rejects: ColorCountsSnap,
    pub cooldown_until: f64,
    pub consecutive_stable_steps: u32,
    pub killswitch_fired: bool,
    pub holds_sample: u64,
    pub holds_cooldown: u64,
    pub updated_ts: f64,
}

/// Serialisable mirror of [`ColorCounts`] for the ramp snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ColorCountsSnap {
    pub blue: u64,
    pub green: u64,
}

impl From<ColorCounts> for ColorCountsSnap {
    fn from(c: ColorCounts) -> Self {
        Self {
            blue: c.blue,
            green: c.green,
        }
    }
}

/// Synthetic fault injection applied to green's observed deltas.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChaosConfig {
    pub reject_inflate_pct: f64,
    pub latency_inflate_ms: f64,
}

/// What one ramp tick did; the supervisor logs it, tests assert on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Disabled,
    Frozen,
    HoldSample,
    HoldCooldown,
    KillSwitchDryRun,
    KillSwitchFreeze,
    RolledBack,
    SteppedDown,
    SteppedUp,
    Stable,
    Promoted,
}

// =============================================================================
// Controller
// =============================================================================

/// Owns the rollout split, the ramp state machine, the kill-switch and
/// auto-promotion. The only outside mutators are the admin surface and the
/// ramp tick itself.
pub struct RolloutController {
    metrics: Arc<Metrics>,
    alerts: Arc<AlertsLog>,
    rollout: RwLock<RolloutState>,
    ramp: RwLock<RampState>,
    ramp_cfg: RwLock<RampConfig>,
    ks_cfg: RwLock<KillSwitchConfig>,
    ap_cfg: RwLock<AutopromoteConfig>,
    chaos: RwLock<ChaosConfig>,
    drift_cfg: DriftConfig,
    dirty: AtomicBool,
}

impl RolloutController {
    pub fn new(
        rollout_cfg: &RolloutConfig,
        ramp_cfg: RampConfig,
        ks_cfg: KillSwitchConfig,
        ap_cfg: AutopromoteConfig,
        drift_cfg: DriftConfig,
        metrics: Arc<Metrics>,
        alerts: Arc<AlertsLog>,
    ) -> Self {
        let ramp = RampState {
            enabled: ramp_cfg.enabled,
            ..RampState::default()
        };
        let ctl = Self {
            metrics,
            alerts,
            rollout: RwLock::new(RolloutState::from_config(rollout_cfg)),
            ramp: RwLock::new(ramp),
            ramp_cfg: RwLock::new(ramp_cfg),
            ks_cfg: RwLock::new(ks_cfg),
            ap_cfg: RwLock::new(ap_cfg),
            chaos: RwLock::new(ChaosConfig::default()),
            drift_cfg,
            dirty: AtomicBool::new(false),
        };
        ctl.publish_gauges();
        ctl
    }

    // ── Reads ───────────────────────────────────────────────────────────

    pub fn rollout_state(&self) -> RolloutState {
        self.rollout.read().clone()
    }

    pub fn ramp_state(&self) -> RampState {
        self.ramp.read().clone()
    }

    pub fn ramp_config(&self) -> RampConfig {
        self.ramp_cfg.read().clone()
    }

    pub fn killswitch_config(&self) -> KillSwitchConfig {
        self.ks_cfg.read().clone()
    }

    pub fn autopromote_config(&self) -> AutopromoteConfig {
        self.ap_cfg.read().clone()
    }

    pub fn chaos_config(&self) -> ChaosConfig {
        *self.chaos.read()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    // ── Admin mutations ─────────────────────────────────────────────────

    pub fn set_split_pct(&self, pct: u32) {
        self.rollout.write().traffic_split_pct = pct.min(100);
        self.mark_dirty();
        self.publish_gauges();
    }

    pub fn set_active(&self, color: Color) {
        self.rollout.write().active = color;
        self.mark_dirty();
    }

    pub fn set_salt(&self, salt: String) {
        self.rollout.write().salt = salt;
        self.mark_dirty();
    }

    pub fn set_pinned_cids(&self, pins: Vec<String>) {
        self.rollout.write().pinned_cids_green = pins;
        self.mark_dirty();
    }

    pub fn set_overlay(&self, color: Color, overlay: serde_json::Map<String, serde_json::Value>) {
        let mut st = self.rollout.write();
        match color {
            Color::Blue => st.overlay_blue = overlay,
            Color::Green => st.overlay_green = overlay,
        }
        self.mark_dirty();
    }

    pub fn update_ramp_config(&self, cfg: RampConfig) {
        self.ramp.write().enabled = cfg.enabled;
        *self.ramp_cfg.write() = cfg;
        self.mark_dirty();
        self.publish_gauges();
    }

    pub fn set_ramp_enabled(&self, enabled: bool) {
        self.ramp.write().enabled = enabled;
        self.ramp_cfg.write().enabled = enabled;
        self.mark_dirty();
        self.publish_gauges();
    }

    /// Clearing the latch is an explicit admin action; nothing else unfreezes
    /// a ramp.
    pub fn set_frozen(&self, frozen: bool) {
        self.ramp.write().frozen = frozen;
        self.mark_dirty();
        self.publish_gauges();
    }

    pub fn update_killswitch_config(&self, cfg: KillSwitchConfig) {
        *self.ks_cfg.write() = cfg;
    }

    pub fn update_autopromote_config(&self, cfg: AutopromoteConfig) {
        *self.ap_cfg.write() = cfg;
    }

    pub fn set_chaos(&self, chaos: ChaosConfig) {
        *self.chaos.write() = chaos;
    }

    /// Flip the active color to green and retire the ramp. Shared by manual
    /// promotion and auto-promotion; pinned CIDs survive.
    pub fn promote(&self, reason: &str, now: f64) {
        // Lock order is ramp before rollout everywhere in this module.
        {
            let mut ramp = self.ramp.write();
            ramp.enabled = false;
            ramp.step_idx = 0;
            ramp.consecutive_stable_steps = 0;
            ramp.updated_ts = now;
        }
        {
            let mut rollout = self.rollout.write();
            rollout.active = Color::Green;
            rollout.traffic_split_pct = 0;
        }
        self.ramp_cfg.write().enabled = false;
        self.mark_dirty();
        self.publish_gauges();
        self.metrics.inc("autopromote_flips_total");
        self.alerts.append(
            "autopromote_flip",
            serde_json::json!({"reason": reason, "active": "green"}),
        );
        info!(reason, "rollout promoted, active color is now green");
    }

    // ── CID routing ─────────────────────────────────────────────────────

    /// The only authoritative way to assign a color to a client order id.
    pub fn route_color(&self, cid: &str) -> Color {
        let st = self.rollout.read();
        if st.pinned_cids_green.iter().any(|p| p == cid) {
            return Color::Green;
        }
        if cid_bucket(&st.salt, cid) < st.traffic_split_pct {
            Color::Green
        } else {
            Color::Blue
        }
    }

    // ── Ramp tick ───────────────────────────────────────────────────────

    /// One ramp evaluation. `now` is a monotonic-ish seconds timestamp.
    pub fn ramp_tick(&self, now: f64) -> TickOutcome {
        let ramp_cfg = self.ramp_cfg.read().clone();
        let ks_cfg = self.ks_cfg.read().clone();
        let ap_cfg = self.ap_cfg.read().clone();
        let chaos = *self.chaos.read();
        let counters = self.metrics.rollout_counters();

        let mut ramp = self.ramp.write();
        ramp.updated_ts = now;

        if !ramp.enabled {
            return TickOutcome::Disabled;
        }
        if ramp.frozen {
            self.metrics.set_gauge("rollout_ramp_frozen", 1.0);
            return TickOutcome::Frozen;
        }

        // Per-color deltas since the last settled tick.
        let d_fills_b = counters.fills.blue.saturating_sub(ramp.last_fills.blue);
        let d_fills_g = counters.fills.green.saturating_sub(ramp.last_fills.green);
        let d_rej_b = counters.rejects.blue.saturating_sub(ramp.last_rejects.blue);
        let mut d_rej_g = counters.rejects.green.saturating_sub(ramp.last_rejects.green);

        // Chaos inflation makes green look worse than it is.
        if chaos.reject_inflate_pct > 0.0 {
            d_rej_g += (d_fills_g as f64 * chaos.reject_inflate_pct / 100.0).round() as u64;
        }
        let lat_b = counters.latency_ewma_ms.blue;
        let lat_g = counters.latency_ewma_ms.green + chaos.latency_inflate_ms;

        // Minimum sample HOLD — last counters stay untouched so the deltas
        // keep accumulating.
        if d_fills_b.min(d_fills_g) < ramp_cfg.min_sample_fills {
            ramp.holds_sample += 1;
            self.metrics.inc_ramp_hold("sample");
            return TickOutcome::HoldSample;
        }
        ramp.last_fills = counters.fills.into();
        ramp.last_rejects = counters.rejects.into();

        let rr_b = 100.0 * d_rej_b as f64 / (d_fills_b + d_rej_b).max(1) as f64;
        let rr_g = 100.0 * d_rej_g as f64 / (d_fills_g + d_rej_g).max(1) as f64;
        let d_rr = rr_g - rr_b;
        let d_lat = lat_g - lat_b;

        // Severe incident: beyond the hard floor of the configured caps.
        let severe = d_rr > ramp_cfg.max_reject_rate_delta_pct.max(5.0)
            || d_lat > ramp_cfg.max_latency_delta_ms.max(150.0);
        if severe {
            ramp.consecutive_stable_steps = 0;
            warn!(d_rr, d_lat, "severe canary incident");
            return self.apply_incident_action(&mut ramp, &ramp_cfg, &ks_cfg, now);
        }

        // Ordinary unhealthy: step down one and start the cooldown.
        let unhealthy = d_rr > ramp_cfg.max_reject_rate_delta_pct
            || d_lat > ramp_cfg.max_latency_delta_ms;
        if unhealthy {
            ramp.consecutive_stable_steps = 0;
            self.step_down(&mut ramp, &ramp_cfg, now);
            warn!(d_rr, d_lat, "canary unhealthy, stepped down");
            return TickOutcome::SteppedDown;
        }

        // Kill-switch on its own (tighter) thresholds.
        if ks_cfg.enabled
            && d_fills_b.min(d_fills_g) >= ks_cfg.min_fills
            && (d_rr / 100.0 > ks_cfg.max_reject_delta || d_lat > ks_cfg.max_latency_delta_ms)
        {
            ramp.consecutive_stable_steps = 0;
            self.metrics.inc("killswitch_checks_total");
            return self.apply_incident_action(&mut ramp, &ramp_cfg, &ks_cfg, now);
        }

        // Stable branch.
        if now < ramp.cooldown_until {
            ramp.holds_cooldown += 1;
            self.metrics.inc_ramp_hold("cooldown");
            self.metrics
                .set_gauge("rollout_ramp_cooldown_seconds", ramp.cooldown_until - now);
            return TickOutcome::HoldCooldown;
        }
        self.metrics.set_gauge("rollout_ramp_cooldown_seconds", 0.0);

        // A drift alert blocks advancing even when the deltas look healthy.
        if self.drift_alert(&counters) {
            ramp.consecutive_stable_steps = 0;
            self.metrics.inc_ramp_hold("drift");
            return TickOutcome::Stable;
        }

        let mut outcome = TickOutcome::Stable;
        if ramp.step_idx + 1 < ramp_cfg.steps_pct.len() {
            let target = ramp_cfg.steps_pct[ramp.step_idx + 1];
            let current = self.rollout.read().traffic_split_pct;
            if target > current {
                let capped = target.min(current + ramp_cfg.max_step_increase_pct);
                self.rollout.write().traffic_split_pct = capped;
                if capped >= target {
                    ramp.step_idx += 1;
                }
                self.metrics.inc_ramp_transition("up");
                self.mark_dirty();
                info!(split_pct = capped, step_idx = ramp.step_idx, "ramp stepped up");
                outcome = TickOutcome::SteppedUp;
            } else {
                ramp.step_idx += 1;
            }
        }

        // Auto-promotion bookkeeping on fully stable ticks.
        ramp.consecutive_stable_steps += 1;
        self.metrics.set_gauge(
            "autopromote_stable_steps",
            ramp.consecutive_stable_steps as f64,
        );
        if ap_cfg.enabled {
            self.metrics.inc("autopromote_attempts_total");
            let split = self.rollout.read().traffic_split_pct;
            if ramp.consecutive_stable_steps >= ap_cfg.stable_steps_required
                && split >= ap_cfg.min_split_pct
            {
                drop(ramp);
                self.promote("autopromote", now);
                self.publish_gauges();
                return TickOutcome::Promoted;
            }
        }

        self.publish_gauges_from(&ramp);
        outcome
    }

    fn apply_incident_action(
        &self,
        ramp: &mut RampState,
        ramp_cfg: &RampConfig,
        ks_cfg: &KillSwitchConfig,
        now: f64,
    ) -> TickOutcome {
        if ks_cfg.enabled && ks_cfg.dry_run {
            ramp.killswitch_fired = true;
            self.metrics.inc_killswitch_trigger("dry_run");
            info!("kill-switch fired in dry-run, no state change");
            return TickOutcome::KillSwitchDryRun;
        }

        let action = if ks_cfg.enabled {
            ks_cfg.action.as_str()
        } else {
            "rollback"
        };

        if action == "freeze" {
            ramp.frozen = true;
            ramp.killswitch_fired = ks_cfg.enabled;
            self.metrics.inc_killswitch_trigger("freeze");
            self.mark_dirty();
            self.publish_gauges_from(ramp);
            warn!("ramp frozen by kill-switch");
            return TickOutcome::KillSwitchFreeze;
        }

        if ks_cfg.enabled {
            ramp.killswitch_fired = true;
            self.metrics.inc_killswitch_trigger("rollback");
        }
        self.step_down(ramp, ramp_cfg, now);
        TickOutcome::RolledBack
    }

    fn step_down(&self, ramp: &mut RampState, ramp_cfg: &RampConfig, now: f64) {
        if ramp.step_idx > 0 {
            ramp.step_idx -= 1;
        }
        let new_split = ramp_cfg
            .steps_pct
            .get(ramp.step_idx)
            .copied()
            .unwrap_or(0);
        self.rollout.write().traffic_split_pct = new_split;
        ramp.cooldown_until = now + ramp_cfg.cooldown_after_rollback_sec as f64;
        self.metrics.inc_ramp_transition("down");
        self.metrics
            .set_gauge("rollout_ramp_cooldown_seconds", ramp_cfg.cooldown_after_rollback_sec as f64);
        self.mark_dirty();
        self.publish_gauges_from(ramp);
    }

    fn drift_alert(&self, counters: &crate::metrics::RolloutCounters) -> bool {
        let orders = counters.orders.blue + counters.orders.green;
        if orders < self.drift_cfg.min_sample_orders {
            return false;
        }
        let expected = self.rollout.read().traffic_split_pct as f64;
        (counters.split_observed_pct - expected).abs() > self.drift_cfg.cap_pct
    }

    fn publish_gauges(&self) {
        let ramp = self.ramp.read();
        self.publish_gauges_from(&ramp);
    }

    fn publish_gauges_from(&self, ramp: &RampState) {
        let split = self.rollout.read().traffic_split_pct;
        self.metrics.set_split_expected_pct(split as f64);
        self.metrics.set_gauge("rollout_split_pct", split as f64);
        self.metrics
            .set_gauge("rollout_ramp_enabled", if ramp.enabled { 1.0 } else { 0.0 });
        self.metrics
            .set_gauge("rollout_ramp_step_idx", ramp.step_idx as f64);
        self.metrics
            .set_gauge("rollout_ramp_frozen", if ramp.frozen { 1.0 } else { 0.0 });
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    /// `rollout_ramp.json` version-1 payload.
    pub fn ramp_snapshot(&self) -> serde_json::Value {
        let ramp = self.ramp.read();
        serde_json::json!({
            "enabled": ramp.enabled,
            "step_idx": ramp.step_idx,
            "last": {
                "fills": {"blue": ramp.last_fills.blue, "green": ramp.last_fills.green},
                "rejects": {"blue": ramp.last_rejects.blue, "green": ramp.last_rejects.green},
            },
            "updated_ts": ramp.updated_ts,
            "frozen": ramp.frozen,
        })
    }

    pub fn load_ramp_snapshot(&self, payload: &serde_json::Value) -> Result<(), &'static str> {
        let obj = payload.as_object().ok_or("invalid_payload")?;
        let mut ramp = self.ramp.write();
        ramp.enabled = obj.get("enabled").and_then(|v| v.as_bool()).unwrap_or(false);
        ramp.step_idx = obj.get("step_idx").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        ramp.frozen = obj.get("frozen").and_then(|v| v.as_bool()).unwrap_or(false);
        ramp.updated_ts = obj.get("updated_ts").and_then(|v| v.as_f64()).unwrap_or(0.0);
        if let Some(last) = obj.get("last") {
            ramp.last_fills = ColorCountsSnap {
                blue: last["fills"]["blue"].as_u64().unwrap_or(0),
                green: last["fills"]["green"].as_u64().unwrap_or(0),
            };
            ramp.last_rejects = ColorCountsSnap {
                blue: last["rejects"]["blue"].as_u64().unwrap_or(0),
                green: last["rejects"]["green"].as_u64().unwrap_or(0),
            };
        }
        // Wall-clock gates are never restored.
        ramp.cooldown_until = 0.0;
        self.ramp_cfg.write().enabled = ramp.enabled;
        drop(ramp);
        self.publish_gauges();
        Ok(())
    }

    /// `rollout_state.json` version-1 payload.
    pub fn state_snapshot(&self, now: f64) -> serde_json::Value {
        let ramp = self.ramp.read();
        let st = self.rollout.read();
        serde_json::json!({
            "traffic_split_pct": st.traffic_split_pct,
            "active": st.active.as_str(),
            "salt": st.salt,
            "pinned_cids_green": st.pinned_cids_green,
            "overlays": {"blue": st.overlay_blue, "green": st.overlay_green},
            "ramp": {
                "enabled": ramp.enabled,
                "step_idx": ramp.step_idx,
                "frozen": ramp.frozen,
            },
            "updated_ts": now,
        })
    }

    pub fn load_state_snapshot(&self, payload: &serde_json::Value) -> Result<(), &'static str> {
        let obj = payload.as_object().ok_or("invalid_payload")?;
        let split = obj
            .get("traffic_split_pct")
            .and_then(|v| v.as_u64())
            .ok_or("invalid_payload")?;
        if split > 100 {
            return Err("invalid_payload");
        }
        let active = obj
            .get("active")
            .and_then(|v| v.as_str())
            .and_then(Color::parse)
            .ok_or("invalid_payload")?;

        let mut st = self.rollout.write();
        st.traffic_split_pct = split as u32;
        st.active = active;
        st.salt = obj
            .get("salt")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .chars()
            .take(MAX_SALT_LEN)
            .collect();
        st.pinned_cids_green = obj
            .get("pinned_cids_green")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .take(MAX_PINNED_CIDS)
                    .collect()
            })
            .unwrap_or_default();
        if let Some(overlays) = obj.get("overlays").and_then(|v| v.as_object()) {
            if let Some(b) = overlays.get("blue").and_then(|v| v.as_object()) {
                st.overlay_blue = b.clone();
            }
            if let Some(g) = overlays.get("green").and_then(|v| v.as_object()) {
                st.overlay_green = g.clone();
            }
        }
        drop(st);

        if let Some(ramp) = obj.get("ramp").and_then(|v| v.as_object()) {
            let mut r = self.ramp.write();
            r.enabled = ramp.get("enabled").and_then(|v| v.as_bool()).unwrap_or(false);
            r.step_idx = ramp.get("step_idx").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            r.frozen = ramp.get("frozen").and_then(|v| v.as_bool()).unwrap_or(false);
            self.ramp_cfg.write().enabled = r.enabled;
        }
        self.publish_gauges();
        Ok(())
    }
}

impl std::fmt::Debug for RolloutController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.rollout.read();
        f.debug_struct("RolloutController")
            .field("split_pct", &st.traffic_split_pct)
            .field("active", &st.active)
            .finish()
    }
}

/// Stable hash bucket in [0, 100) for a client order id under a salt.
pub fn cid_bucket(salt: &str, cid: &str) -> u32 {
    let mut hasher = Sha1::new();
    hasher.update(salt.as_bytes());
    hasher.update(cid.as_bytes());
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % 100
}

/// Convenience for callers that hold raw state rather than the controller.
pub fn route_color(salt: &str, cid: &str, split_pct: u32, pinned: &HashSet<String>) -> Color {
    if pinned.contains(cid) {
        return Color::Green;
    }
    if cid_bucket(salt, cid) < split_pct {
        Color::Green
    } else {
        Color::Blue
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        ctl: RolloutController,
        metrics: Arc<Metrics>,
        _dir: tempfile::TempDir,
    }

    fn harness(ramp_cfg: RampConfig, ks_cfg: KillSwitchConfig, ap_cfg: AutopromoteConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Metrics::new());
        let alerts = Arc::new(AlertsLog::new(dir.path().join("alerts.log")));
        let ctl = RolloutController::new(
            &RolloutConfig::default(),
            ramp_cfg,
            ks_cfg,
            ap_cfg,
            DriftConfig::default(),
            metrics.clone(),
            alerts,
        );
        Harness {
            ctl,
            metrics,
            _dir: dir,
        }
    }

    fn ramp_cfg() -> RampConfig {
        RampConfig {
            enabled: true,
            steps_pct: vec![0, 10, 25, 50, 100],
            step_interval_sec: 10,
            min_sample_fills: 50,
            max_reject_rate_delta_pct: 2.0,
            max_latency_delta_ms: 50.0,
            max_step_increase_pct: 100,
            cooldown_after_rollback_sec: 300,
        }
    }

    fn feed(metrics: &Metrics, fills_b: u64, rej_b: u64, fills_g: u64, rej_g: u64, lat_b: f64, lat_g: f64) {
        let mut c = metrics.rollout_counters();
        c.fills.blue += fills_b;
        c.fills.green += fills_g;
        c.rejects.blue += rej_b;
        c.rejects.green += rej_g;
        c.latency_ewma_ms.blue = lat_b;
        c.latency_ewma_ms.green = lat_g;
        metrics.set_rollout_counters(c);
    }

    fn set_step(h: &Harness, idx: usize) {
        h.ctl.ramp.write().step_idx = idx;
        let split = h.ctl.ramp_cfg.read().steps_pct[idx];
        h.ctl.rollout.write().traffic_split_pct = split;
    }

    #[test]
    fn healthy_tick_steps_up() {
        let h = harness(ramp_cfg(), KillSwitchConfig::default(), AutopromoteConfig::default());
        set_step(&h, 1);
        feed(&h.metrics, 200, 2, 200, 2, 20.0, 20.0);

        assert_eq!(h.ctl.ramp_tick(100.0), TickOutcome::SteppedUp);
        assert_eq!(h.ctl.ramp_state().step_idx, 2);
        assert_eq!(h.ctl.rollout_state().traffic_split_pct, 25);
    }

    #[test]
    fn reject_regression_rolls_back_with_cooldown() {
        let h = harness(ramp_cfg(), KillSwitchConfig::default(), AutopromoteConfig::default());
        set_step(&h, 2);
        // rr_green = 10/210 ≈ 4.76 %, rr_blue = 2/202 ≈ 0.99 %: delta ≈ 3.77 %
        // above the 2 % cap but below the 5 % severe floor.
        feed(&h.metrics, 200, 2, 200, 10, 20.0, 25.0);

        assert_eq!(h.ctl.ramp_tick(100.0), TickOutcome::SteppedDown);
        let ramp = h.ctl.ramp_state();
        assert_eq!(ramp.step_idx, 1);
        assert_eq!(h.ctl.rollout_state().traffic_split_pct, 10);
        assert!((ramp.cooldown_until - 400.0).abs() < 1e-9);
    }

    #[test]
    fn low_sample_holds_without_consuming_deltas() {
        let mut cfg = ramp_cfg();
        cfg.min_sample_fills = 200;
        let h = harness(cfg, KillSwitchConfig::default(), AutopromoteConfig::default());
        feed(&h.metrics, 100, 0, 100, 0, 10.0, 10.0);

        assert_eq!(h.ctl.ramp_tick(100.0), TickOutcome::HoldSample);
        assert_eq!(h.ctl.ramp_state().step_idx, 0);
        assert_eq!(h.ctl.rollout_state().traffic_split_pct, 0);
        assert_eq!(h.metrics.ramp_holds("sample"), 1);
        // Deltas accumulate: the next 100 fills clear the bar.
        feed(&h.metrics, 100, 0, 100, 0, 10.0, 10.0);
        assert_eq!(h.ctl.ramp_tick(110.0), TickOutcome::SteppedUp);
    }

    #[test]
    fn cooldown_holds_step_up() {
        let h = harness(ramp_cfg(), KillSwitchConfig::default(), AutopromoteConfig::default());
        set_step(&h, 1);
        h.ctl.ramp.write().cooldown_until = 500.0;
        feed(&h.metrics, 1_000, 0, 1_000, 0, 10.0, 10.0);

        assert_eq!(h.ctl.ramp_tick(100.0), TickOutcome::HoldCooldown);
        assert_eq!(h.ctl.rollout_state().traffic_split_pct, 10);
        assert_eq!(h.metrics.ramp_holds("cooldown"), 1);

        // Past the cooldown the same counters allow the step.
        feed(&h.metrics, 100, 0, 100, 0, 10.0, 10.0);
        assert_eq!(h.ctl.ramp_tick(600.0), TickOutcome::SteppedUp);
    }

    #[test]
    fn step_cap_clamps_split_increase() {
        let mut cfg = ramp_cfg();
        cfg.steps_pct = vec![0, 30, 80];
        cfg.max_step_increase_pct = 10;
        cfg.min_sample_fills = 1;
        let h = harness(cfg, KillSwitchConfig::default(), AutopromoteConfig::default());
        feed(&h.metrics, 1_000, 0, 1_000, 0, 10.0, 10.0);

        assert_eq!(h.ctl.ramp_tick(100.0), TickOutcome::SteppedUp);
        let split = h.ctl.rollout_state().traffic_split_pct;
        assert!(split > 0 && split <= 10);
        // The index only advances when the full target is reached.
        assert_eq!(h.ctl.ramp_state().step_idx, 0);
    }

    #[test]
    fn step_idx_moves_at_most_one_per_tick() {
        let h = harness(ramp_cfg(), KillSwitchConfig::default(), AutopromoteConfig::default());
        for i in 0..4 {
            feed(&h.metrics, 200, 0, 200, 0, 10.0, 10.0);
            let before = h.ctl.ramp_state().step_idx;
            h.ctl.ramp_tick(100.0 + i as f64 * 20.0);
            let after = h.ctl.ramp_state().step_idx;
            assert!(after as i64 - before as i64 <= 1);
        }
    }

    #[test]
    fn severe_incident_with_killswitch_disabled_rolls_back() {
        let h = harness(ramp_cfg(), KillSwitchConfig::default(), AutopromoteConfig::default());
        set_step(&h, 2);
        // rr delta ≈ 33 %: severe.
        feed(&h.metrics, 200, 0, 100, 50, 20.0, 20.0);

        assert_eq!(h.ctl.ramp_tick(100.0), TickOutcome::RolledBack);
        assert_eq!(h.ctl.rollout_state().traffic_split_pct, 10);
    }

    #[test]
    fn killswitch_dry_run_counts_but_mutates_nothing() {
        let ks = KillSwitchConfig {
            enabled: true,
            dry_run: true,
            action: "rollback".to_string(),
            max_reject_delta: 0.01,
            max_latency_delta_ms: 10.0,
            min_fills: 10,
        };
        let mut cfg = ramp_cfg();
        cfg.min_sample_fills = 10;
        let h = harness(cfg, ks, AutopromoteConfig::default());
        set_step(&h, 2);
        feed(&h.metrics, 100, 0, 100, 40, 10.0, 300.0);

        let before_split = h.ctl.rollout_state().traffic_split_pct;
        assert_eq!(h.ctl.ramp_tick(100.0), TickOutcome::KillSwitchDryRun);
        let ramp = h.ctl.ramp_state();
        assert_eq!(ramp.step_idx, 2);
        assert!(!ramp.frozen);
        assert_eq!(h.ctl.rollout_state().traffic_split_pct, before_split);
        assert_eq!(h.ctl.rollout_state().active, Color::Blue);
        assert_eq!(h.metrics.killswitch_triggers("dry_run"), 1);
        assert!(ramp.killswitch_fired);
    }

    #[test]
    fn killswitch_freeze_latches_without_moving_split() {
        let ks = KillSwitchConfig {
            enabled: true,
            dry_run: false,
            action: "freeze".to_string(),
            max_reject_delta: 0.01,
            max_latency_delta_ms: 10.0,
            min_fills: 10,
        };
        let mut cfg = ramp_cfg();
        cfg.min_sample_fills = 10;
        let h = harness(cfg, ks, AutopromoteConfig::default());
        set_step(&h, 2);
        feed(&h.metrics, 100, 0, 100, 40, 10.0, 300.0);

        assert_eq!(h.ctl.ramp_tick(100.0), TickOutcome::KillSwitchFreeze);
        assert!(h.ctl.ramp_state().frozen);
        assert_eq!(h.ctl.rollout_state().traffic_split_pct, 25);

        // Frozen is latched: healthy ticks hold until admin clears it.
        feed(&h.metrics, 200, 0, 200, 0, 10.0, 10.0);
        assert_eq!(h.ctl.ramp_tick(200.0), TickOutcome::Frozen);
        h.ctl.set_frozen(false);
        feed(&h.metrics, 200, 0, 200, 0, 10.0, 10.0);
        assert_eq!(h.ctl.ramp_tick(300.0), TickOutcome::SteppedUp);
    }

    #[test]
    fn autopromote_flips_after_stable_steps() {
        let ap = AutopromoteConfig {
            enabled: true,
            stable_steps_required: 3,
            min_split_pct: 25,
        };
        let mut cfg = ramp_cfg();
        cfg.steps_pct = vec![0, 25, 50];
        let h = harness(cfg, KillSwitchConfig::default(), ap);
        set_step(&h, 2);

        for i in 0..2 {
            feed(&h.metrics, 200, 1, 200, 1, 10.0, 10.5);
            let out = h.ctl.ramp_tick(100.0 + i as f64 * 20.0);
            assert_ne!(out, TickOutcome::Promoted);
        }
        feed(&h.metrics, 200, 1, 200, 1, 10.0, 10.5);
        assert_eq!(h.ctl.ramp_tick(160.0), TickOutcome::Promoted);

        let st = h.ctl.rollout_state();
        assert_eq!(st.active, Color::Green);
        assert_eq!(st.traffic_split_pct, 0);
        let ramp = h.ctl.ramp_state();
        assert!(!ramp.enabled);
        assert_eq!(ramp.step_idx, 0);
        assert!(h.ctl.is_dirty());
    }

    #[test]
    fn autopromote_requires_min_split() {
        let ap = AutopromoteConfig {
            enabled: true,
            stable_steps_required: 3,
            min_split_pct: 25,
        };
        let mut cfg = ramp_cfg();
        cfg.steps_pct = vec![0, 10];
        let h = harness(cfg, KillSwitchConfig::default(), ap);
        set_step(&h, 1);

        for i in 0..5 {
            feed(&h.metrics, 200, 1, 200, 1, 10.0, 10.0);
            let out = h.ctl.ramp_tick(100.0 + i as f64 * 20.0);
            assert_ne!(out, TickOutcome::Promoted);
        }
        assert_eq!(h.ctl.rollout_state().active, Color::Blue);
    }

    #[test]
    fn manual_promote_keeps_pins() {
        let h = harness(ramp_cfg(), KillSwitchConfig::default(), AutopromoteConfig::default());
        h.ctl.set_pinned_cids(vec!["cid-1".to_string()]);
        h.ctl.promote("manual", 100.0);
        let st = h.ctl.rollout_state();
        assert_eq!(st.active, Color::Green);
        assert_eq!(st.pinned_cids_green, vec!["cid-1"]);
    }

    #[test]
    fn chaos_inflation_trips_health_checks() {
        let h = harness(ramp_cfg(), KillSwitchConfig::default(), AutopromoteConfig::default());
        set_step(&h, 2);
        h.ctl.set_chaos(ChaosConfig {
            reject_inflate_pct: 0.0,
            latency_inflate_ms: 80.0,
        });
        feed(&h.metrics, 200, 0, 200, 0, 20.0, 20.0);

        // Identical colors, but chaos pushes green latency 80 ms up.
        assert_eq!(h.ctl.ramp_tick(100.0), TickOutcome::SteppedDown);
    }

    #[test]
    fn cid_routing_is_deterministic_and_respects_pins() {
        let h = harness(ramp_cfg(), KillSwitchConfig::default(), AutopromoteConfig::default());
        h.ctl.set_salt("salt-1".to_string());
        h.ctl.set_split_pct(30);
        h.ctl.set_pinned_cids(vec!["pinned-cid".to_string()]);

        assert_eq!(h.ctl.route_color("pinned-cid"), Color::Green);
        let a = h.ctl.route_color("cid-A");
        for _ in 0..10 {
            assert_eq!(h.ctl.route_color("cid-A"), a);
        }

        // At split 0 nothing unpinned routes green; at 100 everything does.
        h.ctl.set_split_pct(0);
        assert_eq!(h.ctl.route_color("cid-A"), Color::Blue);
        h.ctl.set_split_pct(100);
        assert_eq!(h.ctl.route_color("cid-A"), Color::Green);
    }

    #[test]
    fn bucket_distribution_roughly_matches_split() {
        let pinned = HashSet::new();
        let mut green = 0;
        for i in 0..1_000 {
            if route_color("s", &format!("cid-{i}"), 30, &pinned) == Color::Green {
                green += 1;
            }
        }
        assert!((200..400).contains(&green), "green = {green}");
    }

    #[test]
    fn ramp_snapshot_roundtrip() {
        let h = harness(ramp_cfg(), KillSwitchConfig::default(), AutopromoteConfig::default());
        set_step(&h, 1);
        feed(&h.metrics, 200, 2, 200, 2, 20.0, 20.0);
        h.ctl.ramp_tick(100.0);

        let snap = h.ctl.ramp_snapshot();
        assert_eq!(snap["step_idx"], 2);
        assert_eq!(snap["last"]["fills"]["blue"], 200);

        let h2 = harness(ramp_cfg(), KillSwitchConfig::default(), AutopromoteConfig::default());
        h2.ctl.load_ramp_snapshot(&snap).unwrap();
        let ramp = h2.ctl.ramp_state();
        assert_eq!(ramp.step_idx, 2);
        assert_eq!(ramp.last_fills.blue, 200);
        assert_eq!(ramp.cooldown_until, 0.0);
    }

    #[test]
    fn state_snapshot_roundtrip() {
        let h = harness(ramp_cfg(), KillSwitchConfig::default(), AutopromoteConfig::default());
        h.ctl.set_split_pct(40);
        h.ctl.set_salt("s1".to_string());
        h.ctl.set_pinned_cids(vec!["a".to_string(), "b".to_string()]);

        let snap = h.ctl.state_snapshot(123.0);
        assert_eq!(snap["traffic_split_pct"], 40);
        assert_eq!(snap["active"], "blue");

        let h2 = harness(ramp_cfg(), KillSwitchConfig::default(), AutopromoteConfig::default());
        h2.ctl.load_state_snapshot(&snap).unwrap();
        let st = h2.ctl.rollout_state();
        assert_eq!(st.traffic_split_pct, 40);
        assert_eq!(st.salt, "s1");
        assert_eq!(st.pinned_cids_green.len(), 2);
    }

    #[test]
    fn bad_state_snapshot_rejected() {
        let h = harness(ramp_cfg(), KillSwitchConfig::default(), AutopromoteConfig::default());
        assert!(h
            .ctl
            .load_state_snapshot(&serde_json::json!({"traffic_split_pct": 120, "active": "blue"}))
            .is_err());
        assert!(h
            .ctl
            .load_state_snapshot(&serde_json::json!({"traffic_split_pct": 10, "active": "red"}))
            .is_err());
    }
}
