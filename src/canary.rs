// =============================================================================
// Canary Payload Builder — deterministic rollout health report
// =============================================================================
//
// Builds the single JSON object served by `/admin/report/canary` and written
// to `canary_<ts>.json` artifacts.  The shape is stable:
//
//   {meta, rollout, drift, hints, killswitch, autopromote, slo,
//    markout, markout_samples_200, markout_samples_500}
//
// Output is canonical JSON and two successive builds on identical inputs are
// byte-identical; `meta.generated_at` is pinned to the process build time so
// tests can assert exact bytes.  Every fired kill-switch, drift alert,
// non-empty hint list and markout regression appends one line to the alerts
// log as a side effect.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;
use sha1::{Digest, Sha1};

use crate::alerts::AlertsLog;
use crate::config::DriftConfig;
use crate::metrics::Metrics;
use crate::rollout::RolloutController;
use crate::snapshot::canonical_json;
use crate::types::Color;

/// Fallback `meta.generated_at` when no build time is pinned.
pub const EPOCH_ISO: &str = "1970-01-01T00:00:00Z";

/// Environment-tunable caps for the triage hint predicates.
#[derive(Debug, Clone, Copy)]
pub struct CanaryCaps {
    pub lat_min_sample: u64,
    pub p95_cap_ms: f64,
    pub p99_cap_ms: f64,
    pub markout_cap_bps: f64,
}

impl Default for CanaryCaps {
    fn default() -> Self {
        Self {
            lat_min_sample: 200,
            p95_cap_ms: 50.0,
            p99_cap_ms: 100.0,
            markout_cap_bps: 0.5,
        }
    }
}

impl CanaryCaps {
    /// Read caps from `LAT_MIN_SAMPLE`, `LAT_P95_CAP_MS`, `LAT_P99_CAP_MS`
    /// and `MARKOUT_CAP_BPS`, falling back to defaults.
    pub fn from_env() -> Self {
        fn read<T: std::str::FromStr>(key: &str, fallback: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(fallback)
        }
        let d = Self::default();
        Self {
            lat_min_sample: read("LAT_MIN_SAMPLE", d.lat_min_sample),
            p95_cap_ms: read("LAT_P95_CAP_MS", d.p95_cap_ms),
            p99_cap_ms: read("LAT_P99_CAP_MS", d.p99_cap_ms),
            markout_cap_bps: read("MARKOUT_CAP_BPS", d.markout_cap_bps),
        }
    }
}

/// Everything a payload build reads; gathered from live state or, for the
/// replay endpoint, from a caller-supplied snapshot.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct CanaryInputs {
    pub split_expected_pct: f64,
    pub split_observed_pct: f64,
    pub orders_blue: u64,
    pub orders_green: u64,
    pub fills_blue: u64,
    pub fills_green: u64,
    pub rejects_blue: u64,
    pub rejects_green: u64,
    pub latency_ms_avg_blue: f64,
    pub latency_ms_avg_green: f64,
    pub p95_blue: f64,
    pub p95_green: f64,
    pub p99_blue: f64,
    pub p99_green: f64,
    pub lat_samples_blue: u64,
    pub lat_samples_green: u64,
    pub markout_200_blue: f64,
    pub markout_200_green: f64,
    pub markout_500_blue: f64,
    pub markout_500_green: f64,
    pub markout_samples_200_blue: u64,
    pub markout_samples_200_green: u64,
    pub markout_samples_500_blue: u64,
    pub markout_samples_500_green: u64,
}

/// Builds the canary report and owns the stored baseline.
pub struct CanaryBuilder {
    metrics: Arc<Metrics>,
    controller: Arc<RolloutController>,
    alerts: Arc<AlertsLog>,
    drift_cfg: DriftConfig,
    caps: CanaryCaps,
    commit: String,
    params_hash: String,
    build_time_iso: String,
    baseline: RwLock<Option<serde_json::Value>>,
}

impl CanaryBuilder {
    pub fn new(
        metrics: Arc<Metrics>,
        controller: Arc<RolloutController>,
        alerts: Arc<AlertsLog>,
        drift_cfg: DriftConfig,
        caps: CanaryCaps,
        commit: String,
        params_hash: String,
        build_time_iso: Option<String>,
    ) -> Self {
        Self {
            metrics,
            controller,
            alerts,
            drift_cfg,
            caps,
            commit,
            params_hash,
            build_time_iso: build_time_iso.unwrap_or_else(|| EPOCH_ISO.to_string()),
            baseline: RwLock::new(None),
        }
    }

    /// Gather live inputs from the metrics registry.
    pub fn live_inputs(&self) -> CanaryInputs {
        let c = self.metrics.rollout_counters();
        CanaryInputs {
            split_expected_pct: self.controller.rollout_state().traffic_split_pct as f64,
            split_observed_pct: c.split_observed_pct,
            orders_blue: c.orders.blue,
            orders_green: c.orders.green,
            fills_blue: c.fills.blue,
            fills_green: c.fills.green,
            rejects_blue: c.rejects.blue,
            rejects_green: c.rejects.green,
            latency_ms_avg_blue: c.latency_ewma_ms.blue,
            latency_ms_avg_green: c.latency_ewma_ms.green,
            p95_blue: self.metrics.latency_percentile(Color::Blue, 0.95),
            p95_green: self.metrics.latency_percentile(Color::Green, 0.95),
            p99_blue: self.metrics.latency_percentile(Color::Blue, 0.99),
            p99_green: self.metrics.latency_percentile(Color::Green, 0.99),
            lat_samples_blue: self.metrics.latency_samples_total(Color::Blue),
            lat_samples_green: self.metrics.latency_samples_total(Color::Green),
            markout_200_blue: self.metrics.markout_avg_bps(Color::Blue, 200),
            markout_200_green: self.metrics.markout_avg_bps(Color::Green, 200),
            markout_500_blue: self.metrics.markout_avg_bps(Color::Blue, 500),
            markout_500_green: self.metrics.markout_avg_bps(Color::Green, 500),
            markout_samples_200_blue: self.metrics.markout_samples(Color::Blue, 200),
            markout_samples_200_green: self.metrics.markout_samples(Color::Green, 200),
            markout_samples_500_blue: self.metrics.markout_samples(Color::Blue, 500),
            markout_samples_500_green: self.metrics.markout_samples(Color::Green, 500),
        }
    }

    /// Build the report from live state, appending alert lines for anything
    /// that fired.
    pub fn build(&self) -> serde_json::Value {
        let payload = self.build_from(&self.live_inputs());
        self.emit_alerts(&payload);
        payload
    }

    /// Pure build from explicit inputs; the replay endpoint and tests call
    /// this directly.
    pub fn build_from(&self, inputs: &CanaryInputs) -> serde_json::Value {
        let rollout_state = self.controller.rollout_state();
        let ramp_state = self.controller.ramp_state();
        let ks = self.controller.killswitch_config();
        let ap = self.controller.autopromote_config();

        // ── Drift ───────────────────────────────────────────────────
        let orders_total = inputs.orders_blue + inputs.orders_green;
        let drift_delta = (inputs.split_observed_pct - inputs.split_expected_pct).abs();
        let (drift_alert, drift_reason) = if orders_total < self.drift_cfg.min_sample_orders {
            (false, "low_sample")
        } else if drift_delta > self.drift_cfg.cap_pct {
            (true, "split_drift_exceeds_cap")
        } else {
            (false, "ok")
        };

        // ── Reject rates (fractions) ────────────────────────────────
        let rr_blue =
            inputs.rejects_blue as f64 / (inputs.fills_blue + inputs.rejects_blue).max(1) as f64;
        let rr_green = inputs.rejects_green as f64
            / (inputs.fills_green + inputs.rejects_green).max(1) as f64;

        // ── SLO tails ───────────────────────────────────────────────
        let delta_p95 = inputs.p95_green - inputs.p95_blue;
        let delta_p99 = inputs.p99_green - inputs.p99_blue;

        // ── Markout ─────────────────────────────────────────────────
        let delta_200 = inputs.markout_200_green - inputs.markout_200_blue;
        let delta_500 = inputs.markout_500_green - inputs.markout_500_blue;

        // ── Hints, in their fixed order ─────────────────────────────
        let mut hints: Vec<&'static str> = Vec::new();
        let fills_total = inputs.fills_blue + inputs.fills_green;
        if fills_total >= 500 && rr_green - rr_blue > 0.02 {
            hints.push("green_rejects_spike");
        }
        if inputs.latency_ms_avg_green - inputs.latency_ms_avg_blue > 50.0 {
            hints.push("green_latency_regression");
        }
        let tails_sampled = inputs.lat_samples_blue >= self.caps.lat_min_sample
            && inputs.lat_samples_green >= self.caps.lat_min_sample;
        if tails_sampled && delta_p95 > self.caps.p95_cap_ms {
            hints.push("latency_tail_regression_p95");
        }
        if tails_sampled && delta_p99 > self.caps.p99_cap_ms {
            hints.push("latency_tail_regression_p99");
        }
        if drift_alert {
            hints.push("split_drift_exceeds_cap");
        }
        if ramp_state.holds_sample > 0 {
            hints.push("ramp_hold_low_sample");
        }
        if ramp_state.holds_cooldown > 0 {
            hints.push("ramp_on_cooldown");
        }
        if delta_200 < -self.caps.markout_cap_bps {
            hints.push("markout_green_worse_200ms");
        }
        if delta_500 < -self.caps.markout_cap_bps {
            hints.push("markout_green_worse_500ms");
        }

        json!({
            "meta": {
                "commit": self.commit,
                "params_hash": self.params_hash,
                "generated_at": self.build_time_iso,
            },
            "rollout": {
                "split_expected_pct": inputs.split_expected_pct,
                "split_observed_pct": inputs.split_observed_pct,
                "orders_blue": inputs.orders_blue,
                "orders_green": inputs.orders_green,
                "fills_blue": inputs.fills_blue,
                "fills_green": inputs.fills_green,
                "rejects_blue": inputs.rejects_blue,
                "rejects_green": inputs.rejects_green,
                "latency_ms_avg_blue": inputs.latency_ms_avg_blue,
                "latency_ms_avg_green": inputs.latency_ms_avg_green,
                "salt_hash": salt_hash(&rollout_state.salt),
                "overlay_diff_keys": overlay_diff_keys(
                    &rollout_state.overlay_blue,
                    &rollout_state.overlay_green,
                ),
                "ramp": {
                    "enabled": ramp_state.enabled,
                    "step_idx": ramp_state.step_idx,
                    "frozen": ramp_state.frozen,
                    "holds": {
                        "sample": ramp_state.holds_sample,
                        "cooldown": ramp_state.holds_cooldown,
                    },
                    "cooldown_seconds": self.metrics.gauge("rollout_ramp_cooldown_seconds"),
                },
            },
            "drift": {
                "cap_pct": self.drift_cfg.cap_pct,
                "min_sample_orders": self.drift_cfg.min_sample_orders,
                "alert": drift_alert,
                "reason": drift_reason,
            },
            "hints": hints,
            "killswitch": {
                "enabled": ks.enabled,
                "dry_run": ks.dry_run,
                "action": ks.action,
                "fired": ramp_state.killswitch_fired,
            },
            "autopromote": {
                "enabled": ap.enabled,
                "stable_steps_required": ap.stable_steps_required,
                "min_split_pct": ap.min_split_pct,
                "consecutive_stable_steps": ramp_state.consecutive_stable_steps,
            },
            "slo": {
                "p95_ms": {"blue": inputs.p95_blue, "green": inputs.p95_green},
                "p99_ms": {"blue": inputs.p99_blue, "green": inputs.p99_green},
                "samples": {"blue": inputs.lat_samples_blue, "green": inputs.lat_samples_green},
                "delta_p95_ms": delta_p95,
                "delta_p99_ms": delta_p99,
            },
            "markout": {
                "200": {
                    "blue": {"avg_bps": inputs.markout_200_blue},
                    "green": {"avg_bps": inputs.markout_200_green},
                    "delta_bps": delta_200,
                },
                "500": {
                    "blue": {"avg_bps": inputs.markout_500_blue},
                    "green": {"avg_bps": inputs.markout_500_green},
                    "delta_bps": delta_500,
                },
            },
            "markout_samples_200": {
                "blue": inputs.markout_samples_200_blue,
                "green": inputs.markout_samples_200_green,
            },
            "markout_samples_500": {
                "blue": inputs.markout_samples_500_blue,
                "green": inputs.markout_samples_500_green,
            },
        })
    }

    fn emit_alerts(&self, payload: &serde_json::Value) {
        if payload["killswitch"]["fired"].as_bool() == Some(true) {
            self.alerts
                .append("killswitch_fired", payload["killswitch"].clone());
        }
        if payload["drift"]["alert"].as_bool() == Some(true) {
            self.alerts.append("split_drift", payload["drift"].clone());
        }
        let hints = payload["hints"].as_array().cloned().unwrap_or_default();
        if !hints.is_empty() {
            self.alerts
                .append("triage_hints", json!({"hints": hints}));
        }
        for (kind, key) in [
            ("markout_regression_200ms", "200"),
            ("markout_regression_500ms", "500"),
        ] {
            let delta = payload["markout"][key]["delta_bps"].as_f64().unwrap_or(0.0);
            if delta < -self.caps.markout_cap_bps {
                self.alerts
                    .append(kind, json!({"horizon_ms": key, "delta_bps": delta}));
            }
        }
    }

    /// Canonical bytes of a payload, what the HTTP layer actually serves.
    pub fn to_canonical(payload: &serde_json::Value) -> String {
        canonical_json(payload)
    }

    // ── Baseline / diff ─────────────────────────────────────────────────

    pub fn save_baseline(&self, payload: serde_json::Value) {
        *self.baseline.write() = Some(payload);
    }

    pub fn baseline(&self) -> Option<serde_json::Value> {
        self.baseline.read().clone()
    }

    /// Sorted dotted paths at which `payload` differs from the stored
    /// baseline. `None` when no baseline is stored.
    pub fn diff_against_baseline(&self, payload: &serde_json::Value) -> Option<Vec<String>> {
        let baseline = self.baseline.read().clone()?;
        let mut paths = Vec::new();
        diff_values("", &baseline, payload, &mut paths);
        paths.sort();
        Some(paths)
    }
}

impl std::fmt::Debug for CanaryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanaryBuilder")
            .field("commit", &self.commit)
            .finish()
    }
}

/// First 8 hex chars of SHA-1 over the salt; enough to compare deployments
/// without disclosing the salt itself.
pub fn salt_hash(salt: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())[..8].to_string()
}

/// Keys present in only one overlay or mapped to different values, sorted.
pub fn overlay_diff_keys(
    blue: &serde_json::Map<String, serde_json::Value>,
    green: &serde_json::Map<String, serde_json::Value>,
) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for (k, v) in blue {
        if green.get(k) != Some(v) {
            keys.push(k.clone());
        }
    }
    for k in green.keys() {
        if !blue.contains_key(k) {
            keys.push(k.clone());
        }
    }
    keys.sort();
    keys.dedup();
    keys
}

fn diff_values(
    prefix: &str,
    a: &serde_json::Value,
    b: &serde_json::Value,
    out: &mut Vec<String>,
) {
    match (a, b) {
        (serde_json::Value::Object(ao), serde_json::Value::Object(bo)) => {
            let mut keys: Vec<&String> = ao.keys().chain(bo.keys()).collect();
            keys.sort();
            keys.dedup();
            for k in keys {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                match (ao.get(k), bo.get(k)) {
                    (Some(av), Some(bv)) => diff_values(&path, av, bv, out),
                    _ => out.push(path),
                }
            }
        }
        _ => {
            if a != b {
                out.push(prefix.to_string());
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutopromoteConfig, KillSwitchConfig, RampConfig, RolloutConfig};

    struct Harness {
        builder: CanaryBuilder,
        metrics: Arc<Metrics>,
        alerts: Arc<AlertsLog>,
        controller: Arc<RolloutController>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Metrics::new());
        let alerts = Arc::new(AlertsLog::new(dir.path().join("alerts.log")));
        let controller = Arc::new(RolloutController::new(
            &RolloutConfig::default(),
            RampConfig::default(),
            KillSwitchConfig::default(),
            AutopromoteConfig::default(),
            DriftConfig::default(),
            metrics.clone(),
            alerts.clone(),
        ));
        let builder = CanaryBuilder::new(
            metrics.clone(),
            controller.clone(),
            alerts.clone(),
            DriftConfig::default(),
            CanaryCaps::default(),
            "abc123".to_string(),
            "ph".to_string(),
            Some("2024-01-01T00:00:00Z".to_string()),
        );
        Harness {
            builder,
            metrics,
            alerts,
            controller,
            _dir: dir,
        }
    }

    #[test]
    fn payload_has_stable_shape() {
        let h = harness();
        let payload = h.builder.build();
        let keys: Vec<&String> = payload.as_object().unwrap().keys().collect();
        assert_eq!(
            keys,
            vec![
                "autopromote",
                "drift",
                "hints",
                "killswitch",
                "markout",
                "markout_samples_200",
                "markout_samples_500",
                "meta",
                "rollout",
                "slo",
            ]
        );
        assert_eq!(payload["meta"]["generated_at"], "2024-01-01T00:00:00Z");
        assert_eq!(payload["meta"]["commit"], "abc123");
        assert_eq!(payload["drift"]["reason"], "low_sample");
    }

    #[test]
    fn two_builds_on_identical_inputs_are_byte_identical() {
        let h = harness();
        for _ in 0..200 {
            h.metrics.record_order(Color::Blue);
            h.metrics.record_fill(Color::Blue);
            h.metrics.record_fill(Color::Green);
        }
        let a = CanaryBuilder::to_canonical(&h.builder.build());
        let b = CanaryBuilder::to_canonical(&h.builder.build());
        assert_eq!(a, b);
        assert!(a.is_ascii());
    }

    fn spike_inputs() -> CanaryInputs {
        CanaryInputs {
            split_expected_pct: 40.0,
            split_observed_pct: 60.0,
            orders_blue: 1_000,
            orders_green: 1_000,
            fills_blue: 900,
            fills_green: 800,
            rejects_blue: 10,
            rejects_green: 40,
            latency_ms_avg_blue: 30.0,
            latency_ms_avg_green: 90.5,
            ..CanaryInputs::default()
        }
    }

    #[test]
    fn hints_fire_in_fixed_order() {
        let h = harness();
        // Seed hold counters so the ramp hints fire too.
        {
            let mut cfg = RampConfig::default();
            cfg.enabled = true;
            cfg.min_sample_fills = 1_000_000;
            h.controller.update_ramp_config(cfg);
            h.controller.ramp_tick(100.0); // hold: sample
        }
        let payload = h.builder.build_from(&spike_inputs());
        assert_eq!(
            payload["hints"],
            json!([
                "green_rejects_spike",
                "green_latency_regression",
                "split_drift_exceeds_cap",
                "ramp_hold_low_sample",
            ])
        );
    }

    #[test]
    fn latency_tail_hints_need_samples() {
        let h = harness();
        let mut inputs = CanaryInputs {
            p95_blue: 10.0,
            p95_green: 200.0,
            p99_blue: 10.0,
            p99_green: 400.0,
            ..CanaryInputs::default()
        };
        // Below the sample floor: no tail hints.
        let p = h.builder.build_from(&inputs);
        assert_eq!(p["hints"], json!([]));

        inputs.lat_samples_blue = 500;
        inputs.lat_samples_green = 500;
        let p2 = h.builder.build_from(&inputs);
        assert_eq!(
            p2["hints"],
            json!(["latency_tail_regression_p95", "latency_tail_regression_p99"])
        );
    }

    #[test]
    fn markout_regression_hints_and_deltas() {
        let h = harness();
        let inputs = CanaryInputs {
            markout_200_blue: 5.0,
            markout_200_green: -5.0,
            markout_500_blue: 10.0,
            markout_500_green: -10.0,
            ..CanaryInputs::default()
        };
        let p = h.builder.build_from(&inputs);
        assert_eq!(p["markout"]["200"]["delta_bps"], -10.0);
        assert_eq!(p["markout"]["500"]["delta_bps"], -20.0);
        assert_eq!(
            p["hints"],
            json!(["markout_green_worse_200ms", "markout_green_worse_500ms"])
        );
    }

    #[test]
    fn build_appends_alerts_for_fired_conditions() {
        let h = harness();
        // Force an observed split far from expected with enough orders.
        for _ in 0..200 {
            h.metrics.record_order(Color::Blue);
        }
        h.metrics.set_split_observed_pct(0.0);
        h.controller.set_split_pct(50);

        let payload = h.builder.build();
        assert_eq!(payload["drift"]["alert"], true);

        let records = h.alerts.read_all();
        let kinds: Vec<&str> = records.iter().map(|r| r.kind.as_str()).collect();
        assert!(kinds.contains(&"split_drift"));
        assert!(kinds.contains(&"triage_hints"));
    }

    #[test]
    fn salt_hash_is_short_and_stable() {
        assert_eq!(salt_hash("s"), salt_hash("s"));
        assert_eq!(salt_hash("s").len(), 8);
        assert_ne!(salt_hash("s"), salt_hash("t"));
    }

    #[test]
    fn overlay_diff_keys_sorted_union() {
        let mut blue = serde_json::Map::new();
        blue.insert("a".into(), json!(1));
        blue.insert("b".into(), json!(2));
        let mut green = serde_json::Map::new();
        green.insert("b".into(), json!(3));
        green.insert("c".into(), json!(4));
        assert_eq!(overlay_diff_keys(&blue, &green), vec!["a", "b", "c"]);

        let same = blue.clone();
        assert!(overlay_diff_keys(&blue, &same).is_empty());
    }

    #[test]
    fn baseline_diff_reports_dotted_paths() {
        let h = harness();
        let base = h.builder.build();
        h.builder.save_baseline(base);

        // Mutate state, rebuild, diff.
        h.controller.set_split_pct(70);
        let now = h.builder.build();
        let diff = h.builder.diff_against_baseline(&now).unwrap();
        assert!(diff.contains(&"rollout.split_expected_pct".to_string()));

        let identical = h.builder.diff_against_baseline(&h.builder.build()).unwrap();
        assert!(identical.is_empty());
    }
}
