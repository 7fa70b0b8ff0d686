// =============================================================================
// Central Application State — Meridian control plane
// =============================================================================
//
// The single wiring point for the whole control plane.  Every subsystem owns
// its mutable state behind its own lock; `AppState` ties them together and
// is shared across tasks as `Arc<AppState>`.  Cross-component references go
// through these Arcs, never through shared mutable handles.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use crate::alerts::AlertsLog;
use crate::allocator::PortfolioAllocator;
use crate::api::audit::AdminGate;
use crate::api::auth::TokenAuthenticator;
use crate::canary::{CanaryBuilder, CanaryCaps};
use crate::config::Config;
use crate::exchange::{ExecutionRecorder, RestExchange};
use crate::guards::autopolicy::AutoPolicy;
use crate::guards::circuit::{CircuitBreaker, CircuitState};
use crate::guards::runtime::RuntimeGuard;
use crate::guards::throttle::ThrottleGuard;
use crate::market_data::VolatilityManager;
use crate::metrics::Metrics;
use crate::rollout::RolloutController;
use crate::scheduler::tod::TimeOfDayScheduler;
use crate::snapshot;
use crate::types::Profile;

/// Wall-clock seconds since the UNIX epoch; the time source for every guard
/// and window in the control plane.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Central application state shared across all async tasks.
pub struct AppState {
    pub symbols: Vec<String>,
    pub profile: Profile,
    pub dry_run: bool,
    pub artifacts_dir: PathBuf,

    pub metrics: Arc<Metrics>,
    pub auth: Arc<TokenAuthenticator>,
    pub gate: Arc<AdminGate>,
    pub alerts: Arc<AlertsLog>,

    pub circuit: Arc<CircuitBreaker>,
    pub throttle: Arc<ThrottleGuard>,
    pub guard: Arc<RuntimeGuard>,
    pub autopolicy: Arc<AutoPolicy>,
    pub scheduler: Arc<TimeOfDayScheduler>,
    pub vola: Arc<VolatilityManager>,
    pub allocator: Arc<PortfolioAllocator>,
    pub rollout: Arc<RolloutController>,
    pub canary: Arc<CanaryBuilder>,
    pub recorder: Arc<ExecutionRecorder>,
    pub exchange: Arc<dyn RestExchange>,

    /// Live inputs the guard loop samples each tick; fed by the connectors.
    pub live: RwLock<LiveSignals>,

    pub commit: String,
    pub build_time_iso: Option<String>,
}

/// Signals produced outside the control plane and consumed by the guard.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveSignals {
    pub rest_error_rate: f64,
    pub pnl_slope_per_min: f64,
    pub ws_lag_ms: f64,
    pub equity_usd: f64,
}

impl AppState {
    pub fn new(
        config: &Config,
        artifacts_dir: PathBuf,
        exchange: Arc<dyn RestExchange>,
        profile: Profile,
        dry_run: bool,
        auth: Arc<TokenAuthenticator>,
        gate: Arc<AdminGate>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let alerts = Arc::new(AlertsLog::new(artifacts_dir.join("alerts.log")));

        let rollout = Arc::new(RolloutController::new(
            &config.rollout,
            config.rollout_ramp.clone(),
            config.killswitch.clone(),
            config.autopromote.clone(),
            config.drift.clone(),
            metrics.clone(),
            alerts.clone(),
        ));

        let commit = std::env::var("GIT_COMMIT").unwrap_or_else(|_| "unknown".to_string());
        let build_time_iso = std::env::var("BUILD_TIME_ISO").ok().filter(|v| !v.is_empty());
        let params_hash = {
            let canonical = snapshot::canonical_json(
                &serde_json::to_value(config).unwrap_or_default(),
            );
            use sha1::{Digest, Sha1};
            let mut hasher = Sha1::new();
            hasher.update(canonical.as_bytes());
            hex::encode(hasher.finalize())[..12].to_string()
        };

        let canary = Arc::new(CanaryBuilder::new(
            metrics.clone(),
            rollout.clone(),
            alerts.clone(),
            config.drift.clone(),
            CanaryCaps::from_env(),
            commit.clone(),
            params_hash,
            build_time_iso.clone(),
        ));

        Self {
            symbols: config.normalized_symbols(),
            profile,
            dry_run,
            artifacts_dir: artifacts_dir.clone(),

            auth,
            gate,
            alerts,

            circuit: Arc::new(CircuitBreaker::new(config.circuit.clone())),
            throttle: Arc::new(ThrottleGuard::new(config.throttle.clone())),
            guard: Arc::new(RuntimeGuard::new(config.runtime_guard.clone())),
            autopolicy: Arc::new(AutoPolicy::new(config.autopolicy.clone())),
            scheduler: Arc::new(TimeOfDayScheduler::new(&config.scheduler)),
            vola: Arc::new(VolatilityManager::new(config.vola.clone(), metrics.clone())),
            allocator: Arc::new(PortfolioAllocator::new(config.allocator.clone())),
            rollout,
            canary,
            recorder: Arc::new(ExecutionRecorder::new(
                artifacts_dir.join("execution_recorder.jsonl"),
            )),
            exchange,
            metrics,

            live: RwLock::new(LiveSignals::default()),

            commit,
            build_time_iso,
        }
    }

    // ── Snapshot paths ──────────────────────────────────────────────────

    pub fn allocator_snapshot_path(&self) -> PathBuf {
        self.artifacts_dir.join("allocator_hwm.json")
    }

    pub fn throttle_snapshot_path(&self) -> PathBuf {
        self.artifacts_dir.join("throttle_snapshot.json")
    }

    pub fn ramp_snapshot_path(&self) -> PathBuf {
        self.artifacts_dir.join("rollout_ramp.json")
    }

    pub fn rollout_state_snapshot_path(&self) -> PathBuf {
        self.artifacts_dir.join("rollout_state.json")
    }

    pub fn guard_snapshot_path(&self) -> PathBuf {
        self.artifacts_dir.join("runtime_guard.json")
    }

    pub fn autopolicy_snapshot_path(&self) -> PathBuf {
        self.artifacts_dir.join("autopolicy.json")
    }

    /// Load every persisted snapshot that exists; a snapshot always wins over
    /// the config value it shadows. Integrity failures are counted and the
    /// config value stands.
    pub fn load_snapshots(&self) {
        self.load_one("allocator", &self.allocator_snapshot_path(), |p| {
            self.allocator.load_snapshot(p)
        });
        self.load_one("throttle", &self.throttle_snapshot_path(), |p| {
            self.throttle.load_snapshot(p)
        });
        self.load_one("ramp", &self.ramp_snapshot_path(), |p| {
            self.rollout.load_ramp_snapshot(p)
        });
        self.load_one("rollout_state", &self.rollout_state_snapshot_path(), |p| {
            self.rollout.load_state_snapshot(p)
        });
        self.load_one("guard", &self.guard_snapshot_path(), |p| {
            self.guard.load_snapshot(p)
        });
        self.load_one("autopolicy", &self.autopolicy_snapshot_path(), |p| {
            self.autopolicy.load_snapshot(p)
        });
    }

    fn load_one<F>(&self, kind: &str, path: &Path, apply: F)
    where
        F: Fn(&serde_json::Value) -> Result<(), &'static str>,
    {
        if !path.exists() {
            return;
        }
        match snapshot::load(path) {
            Ok(payload) => match apply(&payload) {
                Ok(()) => {
                    self.metrics
                        .set_gauge(&format!("snapshot_load_ok_ts{{kind=\"{kind}\"}}"), now_secs());
                    tracing::info!(kind, path = %path.display(), "snapshot restored");
                }
                Err(_) => {
                    self.note_snapshot_failure(kind);
                    tracing::warn!(kind, path = %path.display(), "snapshot payload invalid, keeping config state");
                }
            },
            Err(e) => {
                self.note_snapshot_failure(kind);
                tracing::warn!(kind, error = %e, path = %path.display(), "snapshot load failed, keeping config state");
            }
        }
    }

    pub fn note_snapshot_failure(&self, kind: &str) {
        self.metrics.inc_snapshot_integrity_fail(kind);
        self.metrics.set_gauge(
            &format!("snapshot_last_load_failed_ts{{kind=\"{kind}\"}}"),
            now_secs(),
        );
    }

    // ── Readiness ───────────────────────────────────────────────────────

    /// Sorted list of not-ready reasons; empty means ready.
    pub fn readiness_reasons(&self) -> Vec<&'static str> {
        let mut reasons = Vec::new();
        if self.circuit.state() == CircuitState::Open {
            reasons.push("circuit_open");
        }
        if self.guard.effective_pause() {
            reasons.push("guard_paused_effective");
        }
        reasons.sort_unstable();
        reasons
    }

    /// Writable probe for the artifacts directory; required at startup.
    pub fn artifacts_dir_writable(dir: &Path) -> bool {
        let probe = dir.join(".write_probe");
        let ok = std::fs::write(&probe, b"ok").is_ok();
        let _ = std::fs::remove_file(&probe);
        ok
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("symbols", &self.symbols)
            .field("profile", &self.profile)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::exchange::NoopExchange;
    use crate::api::auth::TokenAuthenticator;

    pub(crate) fn test_state() -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let state = Arc::new(AppState::new(
            &config,
            dir.path().to_path_buf(),
            Arc::new(NoopExchange::new()),
            Profile::Paper,
            true,
            Arc::new(TokenAuthenticator::new("t".into(), String::new(), false)),
            Arc::new(AdminGate::new(None)),
        ));
        (state, dir)
    }

    #[test]
    fn readiness_reasons_sorted() {
        let (state, _dir) = test_state();
        assert!(state.readiness_reasons().is_empty());

        state.guard.set_manual_override(true);
        // Trip the circuit too and verify the deterministic order.
        for i in 0..10 {
            state.circuit.on_result(false, 500, 100.0 + i as f64);
        }
        state.circuit.tick(105.0);
        let reasons = state.readiness_reasons();
        assert_eq!(reasons, vec!["circuit_open", "guard_paused_effective"]);
    }

    #[test]
    fn snapshot_load_failure_counts_and_keeps_state() {
        let (state, _dir) = test_state();
        state.allocator.observe_equity(500.0);

        // A corrupt allocator snapshot on disk must not clobber the HWM.
        std::fs::write(state.allocator_snapshot_path(), b"{\"broken\": true}").unwrap();
        state.load_snapshots();
        assert_eq!(state.allocator.hwm_equity_usd(), 500.0);
        assert_eq!(state.metrics.snapshot_integrity_fails("allocator"), 1);
    }

    #[test]
    fn snapshot_wins_over_config_on_load() {
        let (state, _dir) = test_state();
        snapshot::atomic_write(
            state.allocator_snapshot_path(),
            &serde_json::json!({"hwm_equity_usd": 777.0}),
            1,
        )
        .unwrap();
        state.load_snapshots();
        assert_eq!(state.allocator.hwm_equity_usd(), 777.0);
    }

    #[test]
    fn artifacts_probe_detects_writability() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AppState::artifacts_dir_writable(dir.path()));
        assert!(!AppState::artifacts_dir_writable(&dir.path().join("missing")));
    }
}
