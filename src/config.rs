// =============================================================================
// Configuration — strict YAML schema with per-field defaults
// =============================================================================
//
// Central configuration hub for the Meridian control plane.  Every tunable
// parameter lives here; the file is loaded once at startup and individual
// sections are hot-mutable through the admin surface afterwards.
//
// The schema is strict: unknown keys are rejected at load time so that a
// typo'd threshold never silently falls back to a default.  Every field
// carries a serde default so that older config files missing new fields
// still deserialise.
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Color;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_tz() -> String {
    "UTC".to_string()
}

fn default_window_sec() -> f64 {
    60.0
}

fn default_steps_pct() -> Vec<u32> {
    vec![0, 5, 10, 25, 50, 100]
}

fn default_step_interval_sec() -> u64 {
    900
}

fn default_min_sample_fills() -> u64 {
    200
}

fn default_max_reject_rate_delta_pct() -> f64 {
    2.0
}

fn default_max_latency_delta_ms() -> f64 {
    50.0
}

fn default_max_step_increase_pct() -> u32 {
    25
}

fn default_cooldown_after_rollback_sec() -> u64 {
    900
}

fn default_half_open_probes() -> u32 {
    5
}

fn default_open_duration_sec() -> f64 {
    30.0
}

fn default_err_rate_open() -> f64 {
    0.5
}

fn default_http_5xx_rate_open() -> f64 {
    0.2
}

fn default_http_429_rate_open() -> f64 {
    0.2
}

fn default_true() -> bool {
    true
}

fn default_backoff_base_ms() -> f64 {
    200.0
}

fn default_backoff_max_ms() -> f64 {
    60_000.0
}

fn default_per_kind_cap() -> u32 {
    60
}

fn default_hysteresis_bad() -> u32 {
    2
}

fn default_hysteresis_good() -> u32 {
    3
}

fn default_cancel_rate_per_sec_max() -> f64 {
    5.0
}

fn default_rest_error_rate_max() -> f64 {
    0.2
}

fn default_pnl_slope_min_per_min() -> f64 {
    -50.0
}

fn default_ws_lag_ms_max() -> f64 {
    2_000.0
}

fn default_alpha() -> f64 {
    0.3
}

fn default_min_samples() -> u32 {
    10
}

fn default_budget_usd() -> f64 {
    10_000.0
}

fn default_k_eff() -> f64 {
    50.0
}

fn default_cap_eff_bps() -> f64 {
    2_000.0
}

fn default_max_level() -> u32 {
    3
}

fn default_trigger_backoff_ms() -> f64 {
    3_000.0
}

fn default_trigger_events_total() -> u64 {
    40
}

fn default_cooldown_minutes() -> f64 {
    2.0
}

fn default_tib_step_pct() -> f64 {
    0.15
}

fn default_rep_step_pct() -> f64 {
    0.15
}

fn default_shrink_step_pct() -> f64 {
    0.25
}

fn default_min_levels_cap() -> u32 {
    1
}

fn default_max_tib_ms() -> f64 {
    60_000.0
}

fn default_max_rep_bps() -> f64 {
    100.0
}

fn default_ks_max_reject_delta() -> f64 {
    0.02
}

fn default_ks_max_latency_delta_ms() -> f64 {
    50.0
}

fn default_ks_min_fills() -> u64 {
    500
}

fn default_ks_action() -> String {
    "rollback".to_string()
}

fn default_stable_steps_required() -> u32 {
    6
}

fn default_min_split_pct() -> u32 {
    25
}

fn default_health_port() -> u16 {
    18993
}

fn default_snapshot_interval_sec() -> u64 {
    60
}

fn default_drift_cap_pct() -> f64 {
    5.0
}

fn default_drift_min_sample_orders() -> u64 {
    100
}

// =============================================================================
// Sections
// =============================================================================

/// Blue/green traffic split owned by the rollout controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RolloutConfig {
    #[serde(default)]
    pub traffic_split_pct: u32,
    #[serde(default)]
    pub active: Color,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub pinned_cids_green: Vec<String>,
    #[serde(default)]
    pub blue: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub green: serde_json::Map<String, serde_json::Value>,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            traffic_split_pct: 0,
            active: Color::Blue,
            salt: String::new(),
            pinned_cids_green: Vec::new(),
            blue: serde_json::Map::new(),
            green: serde_json::Map::new(),
        }
    }
}

/// Automatic stepwise increase of the green share.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RampConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_steps_pct")]
    pub steps_pct: Vec<u32>,
    #[serde(default = "default_step_interval_sec")]
    pub step_interval_sec: u64,
    #[serde(default = "default_min_sample_fills")]
    pub min_sample_fills: u64,
    #[serde(default = "default_max_reject_rate_delta_pct")]
    pub max_reject_rate_delta_pct: f64,
    #[serde(default = "default_max_latency_delta_ms")]
    pub max_latency_delta_ms: f64,
    #[serde(default = "default_max_step_increase_pct")]
    pub max_step_increase_pct: u32,
    #[serde(default = "default_cooldown_after_rollback_sec")]
    pub cooldown_after_rollback_sec: u64,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            steps_pct: default_steps_pct(),
            step_interval_sec: default_step_interval_sec(),
            min_sample_fills: default_min_sample_fills(),
            max_reject_rate_delta_pct: default_max_reject_rate_delta_pct(),
            max_latency_delta_ms: default_max_latency_delta_ms(),
            max_step_increase_pct: default_max_step_increase_pct(),
            cooldown_after_rollback_sec: default_cooldown_after_rollback_sec(),
        }
    }
}

/// Automated regression detector over the canary deltas.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KillSwitchConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub dry_run: bool,
    /// `rollback` or `freeze`.
    #[serde(default = "default_ks_action")]
    pub action: String,
    /// Reject-rate delta as a fraction (0.02 = 2 percentage points).
    #[serde(default = "default_ks_max_reject_delta")]
    pub max_reject_delta: f64,
    #[serde(default = "default_ks_max_latency_delta_ms")]
    pub max_latency_delta_ms: f64,
    #[serde(default = "default_ks_min_fills")]
    pub min_fills: u64,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dry_run: true,
            action: default_ks_action(),
            max_reject_delta: default_ks_max_reject_delta(),
            max_latency_delta_ms: default_ks_max_latency_delta_ms(),
            min_fills: default_ks_min_fills(),
        }
    }
}

/// Flipping the active color after sustained stability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutopromoteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_stable_steps_required")]
    pub stable_steps_required: u32,
    #[serde(default = "default_min_split_pct")]
    pub min_split_pct: u32,
}

impl Default for AutopromoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            stable_steps_required: default_stable_steps_required(),
            min_split_pct: default_min_split_pct(),
        }
    }
}

/// Circuit breaker over REST call outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitConfig {
    #[serde(default = "default_window_sec")]
    pub window_sec: f64,
    #[serde(default = "default_err_rate_open")]
    pub err_rate_open: f64,
    #[serde(default = "default_http_5xx_rate_open")]
    pub http_5xx_rate_open: f64,
    #[serde(default = "default_http_429_rate_open")]
    pub http_429_rate_open: f64,
    #[serde(default = "default_open_duration_sec")]
    pub open_duration_sec: f64,
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window_sec: default_window_sec(),
            err_rate_open: default_err_rate_open(),
            http_5xx_rate_open: default_http_5xx_rate_open(),
            http_429_rate_open: default_http_429_rate_open(),
            open_duration_sec: default_open_duration_sec(),
            half_open_probes: default_half_open_probes(),
        }
    }
}

/// Per-symbol order-event throttling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThrottleConfig {
    #[serde(default = "default_window_sec")]
    pub window_sec: f64,
    #[serde(default = "default_per_kind_cap")]
    pub max_creates_per_window: u32,
    #[serde(default = "default_per_kind_cap")]
    pub max_amends_per_window: u32,
    #[serde(default = "default_per_kind_cap")]
    pub max_cancels_per_window: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: f64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            window_sec: default_window_sec(),
            max_creates_per_window: default_per_kind_cap(),
            max_amends_per_window: default_per_kind_cap(),
            max_cancels_per_window: default_per_kind_cap(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Runtime guard thresholds and hysteresis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeGuardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub manual_override_pause: bool,
    #[serde(default = "default_cancel_rate_per_sec_max")]
    pub cancel_rate_per_sec_max: f64,
    #[serde(default = "default_rest_error_rate_max")]
    pub rest_error_rate_max: f64,
    #[serde(default = "default_pnl_slope_min_per_min")]
    pub pnl_slope_min_per_min: f64,
    #[serde(default = "default_ws_lag_ms_max")]
    pub ws_lag_ms_max: f64,
    #[serde(default = "default_hysteresis_bad")]
    pub hysteresis_bad: u32,
    #[serde(default = "default_hysteresis_good")]
    pub hysteresis_good: u32,
}

impl Default for RuntimeGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dry_run: false,
            manual_override_pause: false,
            cancel_rate_per_sec_max: default_cancel_rate_per_sec_max(),
            rest_error_rate_max: default_rest_error_rate_max(),
            pnl_slope_min_per_min: default_pnl_slope_min_per_min(),
            ws_lag_ms_max: default_ws_lag_ms_max(),
            hysteresis_bad: default_hysteresis_bad(),
            hysteresis_good: default_hysteresis_good(),
        }
    }
}

/// A single trading window in the scheduler's timezone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowConfig {
    pub name: String,
    pub days: Vec<u8>,
    pub start: String,
    pub end: String,
}

/// Time-of-day gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_tz")]
    pub tz: String,
    #[serde(default)]
    pub windows: Vec<WindowConfig>,
    #[serde(default)]
    pub holidays: Vec<String>,
    #[serde(default)]
    pub cooldown_open_minutes: f64,
    #[serde(default)]
    pub cooldown_close_minutes: f64,
    #[serde(default = "default_true")]
    pub block_in_cooldown: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tz: default_tz(),
            windows: Vec::new(),
            holidays: Vec::new(),
            cooldown_open_minutes: 0.0,
            cooldown_close_minutes: 0.0,
            block_in_cooldown: true,
        }
    }
}

/// EWMA volatility estimation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolaConfig {
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,
}

impl Default for VolaConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            min_samples: default_min_samples(),
        }
    }
}

/// Portfolio allocator budget and per-symbol effective parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllocatorConfig {
    #[serde(default = "default_budget_usd")]
    pub budget_usd: f64,
    #[serde(default = "default_k_eff")]
    pub k_eff: f64,
    #[serde(default = "default_cap_eff_bps")]
    pub cap_eff_bps: f64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            budget_usd: default_budget_usd(),
            k_eff: default_k_eff(),
            cap_eff_bps: default_cap_eff_bps(),
        }
    }
}

/// Adaptive strategy attenuation under throttle pressure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutopolicyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_level")]
    pub max_level: u32,
    #[serde(default = "default_trigger_backoff_ms")]
    pub trigger_backoff_ms: f64,
    #[serde(default = "default_trigger_events_total")]
    pub trigger_events_total: u64,
    #[serde(default = "default_hysteresis_bad")]
    pub hysteresis_bad_required: u32,
    #[serde(default = "default_hysteresis_bad")]
    pub hysteresis_good_required: u32,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: f64,
    #[serde(default = "default_tib_step_pct")]
    pub min_time_in_book_ms_step_pct: f64,
    #[serde(default = "default_rep_step_pct")]
    pub replace_threshold_bps_step_pct: f64,
    #[serde(default = "default_shrink_step_pct")]
    pub levels_per_side_shrink_step_pct: f64,
    #[serde(default = "default_min_levels_cap")]
    pub min_levels_cap: u32,
    #[serde(default = "default_max_tib_ms")]
    pub max_min_time_in_book_ms: f64,
    #[serde(default = "default_max_rep_bps")]
    pub max_replace_threshold_bps: f64,
}

impl Default for AutopolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_level: default_max_level(),
            trigger_backoff_ms: default_trigger_backoff_ms(),
            trigger_events_total: default_trigger_events_total(),
            hysteresis_bad_required: default_hysteresis_bad(),
            hysteresis_good_required: default_hysteresis_bad(),
            cooldown_minutes: default_cooldown_minutes(),
            min_time_in_book_ms_step_pct: default_tib_step_pct(),
            replace_threshold_bps_step_pct: default_rep_step_pct(),
            levels_per_side_shrink_step_pct: default_shrink_step_pct(),
            min_levels_cap: default_min_levels_cap(),
            max_min_time_in_book_ms: default_max_tib_ms(),
            max_replace_threshold_bps: default_max_rep_bps(),
        }
    }
}

/// Split-drift alerting thresholds used by the canary report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriftConfig {
    #[serde(default = "default_drift_cap_pct")]
    pub cap_pct: f64,
    #[serde(default = "default_drift_min_sample_orders")]
    pub min_sample_orders: u64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            cap_pct: default_drift_cap_pct(),
            min_sample_orders: default_drift_min_sample_orders(),
        }
    }
}

/// Monitoring / admin server binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitoringConfig {
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_port: default_health_port(),
        }
    }
}

/// Snapshot writer cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotsConfig {
    #[serde(default = "default_snapshot_interval_sec")]
    pub interval_sec: u64,
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self {
            interval_sec: default_snapshot_interval_sec(),
        }
    }
}

// =============================================================================
// Top-level config
// =============================================================================

/// Top-level configuration for the Meridian control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub rollout: RolloutConfig,
    #[serde(default)]
    pub rollout_ramp: RampConfig,
    #[serde(default)]
    pub killswitch: KillSwitchConfig,
    #[serde(default)]
    pub autopromote: AutopromoteConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub runtime_guard: RuntimeGuardConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub vola: VolaConfig,
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub autopolicy: AutopolicyConfig,
    #[serde(default)]
    pub drift: DriftConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub snapshots: SnapshotsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            rollout: RolloutConfig::default(),
            rollout_ramp: RampConfig::default(),
            killswitch: KillSwitchConfig::default(),
            autopromote: AutopromoteConfig::default(),
            circuit: CircuitConfig::default(),
            throttle: ThrottleConfig::default(),
            runtime_guard: RuntimeGuardConfig::default(),
            scheduler: SchedulerConfig::default(),
            vola: VolaConfig::default(),
            allocator: AllocatorConfig::default(),
            autopolicy: AutopolicyConfig::default(),
            drift: DriftConfig::default(),
            monitoring: MonitoringConfig::default(),
            snapshots: SnapshotsConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a YAML file at `path`.
    ///
    /// Errors here are process-fatal at startup; the caller exits with code 1.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config.validate()?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            split_pct = config.rollout.traffic_split_pct,
            active = %config.rollout.active,
            "config loaded"
        );

        Ok(config)
    }

    /// Range checks that the serde schema cannot express.
    pub fn validate(&self) -> Result<()> {
        let symbols: Vec<String> = self
            .symbols
            .iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if symbols.is_empty() {
            bail!("symbols must contain at least one non-empty symbol");
        }

        if self.rollout.traffic_split_pct > 100 {
            bail!("rollout.traffic_split_pct must be in [0, 100]");
        }
        if self.rollout.salt.len() > 64 {
            bail!("rollout.salt must be at most 64 characters");
        }
        if self.rollout.pinned_cids_green.len() > 10_000 {
            bail!("rollout.pinned_cids_green must hold at most 10000 entries");
        }

        let steps = &self.rollout_ramp.steps_pct;
        if steps.is_empty() {
            bail!("rollout_ramp.steps_pct must not be empty");
        }
        if !steps.windows(2).all(|w| w[0] < w[1]) {
            bail!("rollout_ramp.steps_pct must be strictly ascending");
        }
        if steps.iter().any(|&s| s > 100) {
            bail!("rollout_ramp.steps_pct values must be in [0, 100]");
        }
        if self.rollout_ramp.step_interval_sec < 10 {
            bail!("rollout_ramp.step_interval_sec must be at least 10");
        }

        match self.killswitch.action.as_str() {
            "rollback" | "freeze" => {}
            other => bail!("killswitch.action must be rollback or freeze, got {other}"),
        }

        for w in &self.scheduler.windows {
            if w.days.iter().any(|&d| d < 1 || d > 7) {
                bail!("scheduler window {} has a day outside 1..=7", w.name);
            }
        }

        if !(0.0..=1.0).contains(&self.vola.alpha) {
            bail!("vola.alpha must be in [0, 1]");
        }
        if !(0.0..=1000.0).contains(&self.allocator.k_eff) {
            bail!("allocator.k_eff must be in [0, 1000]");
        }
        if !(0.0..=10_000.0).contains(&self.allocator.cap_eff_bps) {
            bail!("allocator.cap_eff_bps must be in [0, 10000]");
        }

        Ok(())
    }

    /// Uppercased, deduplicated symbol list used by all per-symbol components.
    pub fn normalized_symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for s in &self.symbols {
            let sym = s.trim().to_uppercase();
            if !sym.is_empty() && !out.contains(&sym) {
                out.push(sym);
            }
        }
        out
    }
}
