// =============================================================================
// Meridian Market Maker — Control Plane Entry Point
// =============================================================================
//
// Boots the control plane: config, admin HTTP surface, guard and controller
// loops, snapshot writers.  Quote connectors and the strategy proper hang
// off the interfaces wired here; the bot starts with the ramp in whatever
// state the last snapshot left it (a snapshot always wins over config).
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod allocator;
mod api;
mod app_state;
mod canary;
mod config;
mod exchange;
mod guards;
mod market_data;
mod metrics;
mod rollout;
mod scheduler;
mod snapshot;
mod supervisor;
mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::audit::AdminGate;
use crate::api::auth::TokenAuthenticator;
use crate::app_state::{now_secs, AppState};
use crate::canary::CanaryBuilder;
use crate::config::Config;
use crate::exchange::{HttpRestExchange, NoopExchange, RestExchange};
use crate::guards::runtime::GuardSignals;
use crate::supervisor::LoopSupervisor;
use crate::types::{OrderOp, Profile};

/// Overall budget for stopping the named tasks at shutdown.
const TASK_STOP_BUDGET: Duration = Duration::from_secs(30);
/// Budget for flushing the execution recorder at shutdown.
const RECORDER_STOP_BUDGET: Duration = Duration::from_secs(10);

// =============================================================================
// CLI
// =============================================================================

#[derive(Debug, Parser)]
#[command(name = "meridian-mm", about = "Market-maker control plane")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Compute everything but never let the guards block paper order flow.
    #[arg(long)]
    dry_run: bool,

    /// Exchange environment.
    #[arg(long, value_enum, default_value_t = Profile::Testnet)]
    profile: Profile,

    /// Shorthand for `--profile paper`.
    #[arg(long)]
    paper: bool,

    /// Override the throttle snapshot location.
    #[arg(long)]
    throttle_snapshot_path: Option<PathBuf>,

    /// Override the throttle snapshot cadence.
    #[arg(long)]
    throttle_snapshot_interval_seconds: Option<u64>,
}

fn env_u64(key: &str, fallback: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

// =============================================================================
// Entry point
// =============================================================================

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let profile = if cli.paper { Profile::Paper } else { cli.profile };

    info!(
        config = %cli.config.display(),
        profile = %profile,
        dry_run = cli.dry_run,
        "Meridian control plane starting"
    );

    // ── 1. Config (an invalid file is process-fatal; a missing one falls
    // back to defaults so fresh checkouts can boot in paper mode) ────────
    let config = if cli.config.exists() {
        match Config::load(&cli.config) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "configuration invalid, refusing to start");
                std::process::exit(1);
            }
        }
    } else {
        warn!(path = %cli.config.display(), "config file not found, using defaults");
        Config::default()
    };

    // ── 2. Artifacts directory (process-fatal when unwritable) ──────────
    let artifacts_dir = std::env::var("ARTIFACTS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("artifacts"));
    if let Err(e) = std::fs::create_dir_all(&artifacts_dir) {
        error!(error = %e, dir = %artifacts_dir.display(), "cannot create artifacts dir");
        std::process::exit(1);
    }
    if !AppState::artifacts_dir_writable(&artifacts_dir) {
        error!(dir = %artifacts_dir.display(), "artifacts dir not writable");
        std::process::exit(1);
    }

    // ── 3. Exchange seam ─────────────────────────────────────────────────
    let exchange: Arc<dyn RestExchange> = match profile {
        Profile::Paper => Arc::new(NoopExchange::new()),
        Profile::Testnet | Profile::Mainnet => {
            let api_key = std::env::var("EXCHANGE_API_KEY").unwrap_or_default();
            let secret = std::env::var("EXCHANGE_API_SECRET").unwrap_or_default();
            let base = std::env::var("EXCHANGE_BASE_URL").unwrap_or_else(|_| {
                if profile == Profile::Mainnet {
                    "https://api.exchange.example".to_string()
                } else {
                    "https://testnet.exchange.example".to_string()
                }
            });
            Arc::new(HttpRestExchange::new(api_key, secret, base))
        }
    };

    // ── 4. Shared state, snapshots win over config ───────────────────────
    let state = Arc::new(AppState::new(
        &config,
        artifacts_dir.clone(),
        exchange,
        profile,
        cli.dry_run,
        Arc::new(TokenAuthenticator::from_env()),
        Arc::new(AdminGate::from_env()),
    ));
    if cli.dry_run {
        state.guard.set_dry_run(true);
    }
    state.load_snapshots();

    // ── 5. Admin HTTP surface ────────────────────────────────────────────
    let bind_addr = format!("0.0.0.0:{}", config.monitoring.health_port);
    let http_state = state.clone();
    let http_addr = bind_addr.clone();
    let http_task = tokio::spawn(async move {
        let app = api::rest::router(http_state);
        let listener = match tokio::net::TcpListener::bind(&http_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %http_addr, error = %e, "failed to bind admin server");
                return;
            }
        };
        info!(addr = %http_addr, "admin server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "admin server failed");
        }
    });

    // ── 6. Named periodic tasks ──────────────────────────────────────────
    let supervisor = Arc::new(LoopSupervisor::new(state.metrics.clone()));
    let throttle_snapshot_path = cli
        .throttle_snapshot_path
        .unwrap_or_else(|| state.throttle_snapshot_path());
    let throttle_interval = cli
        .throttle_snapshot_interval_seconds
        .unwrap_or(config.snapshots.interval_sec);
    register_loops(
        &supervisor,
        &state,
        &config,
        throttle_snapshot_path,
        throttle_interval,
    );

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 7. Graceful shutdown, strictly ordered ───────────────────────────
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    warn!("shutdown signal received");

    // (1) Cancel all live exchange orders through the throttled path.
    for symbol in &state.symbols {
        state.throttle.on_event(symbol, OrderOp::Cancel, now_secs());
        match state.exchange.cancel_all(symbol).await {
            Ok(outcome) => state
                .circuit
                .on_result(outcome.ok, outcome.http_code, now_secs()),
            Err(e) => {
                state.circuit.on_result(false, 0, now_secs());
                warn!(symbol = %symbol, error = %e, "cancel-all failed at shutdown");
            }
        }
    }
    // (2) Strategy and (3) WebSocket are external collaborators; they stop
    // with their own tasks. (4) REST closes when the exchange Arc drops.
    info!("strategy and connectors signalled to stop");

    // (5) Stop the HTTP surface.
    http_task.abort();

    // (6) Named tasks within the overall budget.
    supervisor.shutdown(TASK_STOP_BUDGET).await;

    // (7) Recorder flush within its own budget.
    let recorder = state.recorder.clone();
    let flush = tokio::task::spawn_blocking(move || recorder.status());
    if tokio::time::timeout(RECORDER_STOP_BUDGET, flush).await.is_err() {
        warn!("recorder did not stop within budget, skipped");
    }

    // Final snapshot pass so a restart resumes where we left off.
    write_all_snapshots(&state);

    info!("Meridian control plane shut down complete");
}

// =============================================================================
// Loop registration
// =============================================================================

fn register_loops(
    supervisor: &Arc<LoopSupervisor>,
    state: &Arc<AppState>,
    config: &Config,
    throttle_snapshot_path: PathBuf,
    throttle_interval_sec: u64,
) {
    // Ramp controller.
    let ramp_interval = env_u64(
        "ROLLOUT_STEP_INTERVAL_SEC",
        config.rollout_ramp.step_interval_sec,
    )
    .max(config.rollout_ramp.step_interval_sec);
    {
        let state = state.clone();
        supervisor.spawn_periodic(
            "ramp",
            Duration::from_secs(ramp_interval),
            None,
            move || {
                let state = state.clone();
                async move {
                    let outcome = state.rollout.ramp_tick(now_secs());
                    tracing::debug!(?outcome, "ramp tick");
                }
            },
        );
    }

    // Guard + circuit + autopolicy evaluation.
    {
        let state = state.clone();
        supervisor.spawn_periodic("guard", Duration::from_secs(1), None, move || {
            let state = state.clone();
            async move {
                let now = now_secs();
                state.circuit.tick(now);
                let live = *state.live.read();
                let (err_rate, _, _) = state.circuit.current_rates(now);
                state.guard.evaluate(
                    GuardSignals {
                        cancel_rate_per_sec: state.throttle.cancel_rate_per_sec(now),
                        rest_error_rate: err_rate.max(live.rest_error_rate),
                        pnl_slope_per_min: live.pnl_slope_per_min,
                        ws_lag_ms: live.ws_lag_ms,
                    },
                    now,
                );
                state.allocator.observe_equity(live.equity_usd);
                state.autopolicy.evaluate(
                    now,
                    state.throttle.backoff_ms_max(),
                    state.throttle.events_total(),
                );
                let eff = state.autopolicy.apply();
                state
                    .metrics
                    .set_gauge("autopolicy_min_time_in_book_ms_eff", eff.min_time_in_book_ms_eff);
                state
                    .metrics
                    .set_gauge("autopolicy_replace_threshold_bps_eff", eff.replace_threshold_bps_eff);
                state.metrics.set_gauge(
                    "autopolicy_levels_per_side_max_eff",
                    eff.levels_per_side_max_eff as f64,
                );
            }
        });
    }

    // Cancel-all enforcement while effectively paused.
    {
        let state = state.clone();
        supervisor.spawn_periodic("pause_enforcer", Duration::from_secs(2), None, move || {
            let state = state.clone();
            async move {
                if !state.guard.effective_pause() {
                    return;
                }
                for symbol in &state.symbols {
                    if !state.circuit.allowed(OrderOp::Cancel) {
                        continue;
                    }
                    state.throttle.on_event(symbol, OrderOp::Cancel, now_secs());
                    match state.exchange.cancel_all(symbol).await {
                        Ok(outcome) => {
                            state
                                .circuit
                                .on_result(outcome.ok, outcome.http_code, now_secs());
                        }
                        Err(e) => {
                            state.circuit.on_result(false, 0, now_secs());
                            warn!(symbol = %symbol, error = %e, "cancel-all failed");
                        }
                    }
                }
            }
        });
    }

    // Snapshot writers, each with its own deterministic jitter tag.
    let snapshot_interval = Duration::from_secs(config.snapshots.interval_sec);
    {
        let state = state.clone();
        let path = state.allocator_snapshot_path();
        let seed = path.display().to_string();
        supervisor.spawn_periodic(
            "allocator_snapshot",
            snapshot_interval,
            Some((seed, "alloc".to_string())),
            move || {
                let state = state.clone();
                let path = path.clone();
                async move {
                    write_snapshot(&state, &path, &state.allocator.to_snapshot(), 1);
                }
            },
        );
    }
    {
        let state = state.clone();
        let path = throttle_snapshot_path;
        let seed = path.display().to_string();
        supervisor.spawn_periodic(
            "throttle_snapshot",
            Duration::from_secs(throttle_interval_sec),
            Some((seed, "throttle".to_string())),
            move || {
                let state = state.clone();
                let path = path.clone();
                async move {
                    write_snapshot(&state, &path, &state.throttle.to_snapshot(), 2);
                }
            },
        );
    }
    {
        let state = state.clone();
        let path = state.ramp_snapshot_path();
        let seed = path.display().to_string();
        supervisor.spawn_periodic(
            "ramp_snapshot",
            snapshot_interval,
            Some((seed, "ramp".to_string())),
            move || {
                let state = state.clone();
                let path = path.clone();
                async move {
                    write_snapshot(&state, &path, &state.rollout.ramp_snapshot(), 1);
                }
            },
        );
    }
    {
        let state = state.clone();
        let path = state.rollout_state_snapshot_path();
        let seed = path.display().to_string();
        supervisor.spawn_periodic(
            "rollout_state_snapshot",
            snapshot_interval,
            Some((seed, "rollout_state".to_string())),
            move || {
                let state = state.clone();
                let path = path.clone();
                async move {
                    // Only persist when an admin write or a tick dirtied it.
                    if state.rollout.is_dirty() {
                        write_snapshot(&state, &path, &state.rollout.state_snapshot(now_secs()), 1);
                        state.rollout.clear_dirty();
                    }
                }
            },
        );
    }
    {
        let state = state.clone();
        let path = state.guard_snapshot_path();
        let seed = path.display().to_string();
        supervisor.spawn_periodic(
            "guard_snapshot",
            snapshot_interval,
            Some((seed, "guard".to_string())),
            move || {
                let state = state.clone();
                let path = path.clone();
                async move {
                    write_snapshot(&state, &path, &state.guard.to_snapshot(), 1);
                }
            },
        );
    }
    {
        let state = state.clone();
        let path = state.autopolicy_snapshot_path();
        let seed = path.display().to_string();
        supervisor.spawn_periodic(
            "autopolicy_snapshot",
            snapshot_interval,
            Some((seed, "autopolicy".to_string())),
            move || {
                let state = state.clone();
                let path = path.clone();
                async move {
                    write_snapshot(&state, &path, &state.autopolicy.to_snapshot(), 1);
                }
            },
        );
    }

    // Allocator targets from inverse-volatility weights.
    {
        let state = state.clone();
        supervisor.spawn_periodic(
            "allocator_targets",
            Duration::from_secs(60),
            None,
            move || {
                let state = state.clone();
                async move {
                    let mut weights = std::collections::BTreeMap::new();
                    for symbol in &state.symbols {
                        // Unready symbols quote at unit weight; ready ones are
                        // weighted inversely to their volatility estimate.
                        let w = if state.vola.is_ready(symbol) {
                            1.0 / state.vola.volatility(symbol).max(1e-4)
                        } else {
                            1.0
                        };
                        weights.insert(symbol.clone(), w);
                    }
                    let budget = state.allocator.budget_usd();
                    let targets = state.allocator.targets_from_weights(&weights, budget);
                    for (symbol, target) in targets {
                        state.metrics.set_gauge(
                            &format!("allocator_target_usd{{symbol=\"{symbol}\"}}"),
                            target.target_usd,
                        );
                    }
                }
            },
        );
    }

    // Latency SLO gauges.
    {
        let state = state.clone();
        supervisor.spawn_periodic("slo", Duration::from_secs(30), None, move || {
            let state = state.clone();
            async move {
                use crate::types::Color;
                let p95_b = state.metrics.latency_percentile(Color::Blue, 0.95);
                let p95_g = state.metrics.latency_percentile(Color::Green, 0.95);
                let p99_b = state.metrics.latency_percentile(Color::Blue, 0.99);
                let p99_g = state.metrics.latency_percentile(Color::Green, 0.99);
                state.metrics.set_gauge("slo_delta_p95_ms", p95_g - p95_b);
                state.metrics.set_gauge("slo_delta_p99_ms", p99_g - p99_b);
            }
        });
    }

    // Soak watchdog: process-level resource gauges against env caps.
    {
        let state = state.clone();
        let window = env_u64("SOAK_WINDOW_SEC", 300);
        supervisor.spawn_periodic("soak", Duration::from_secs(window), None, move || {
            let state = state.clone();
            async move {
                if let Some(rss_mb) = read_proc_status_kb("VmRSS:").map(|kb| kb / 1024.0) {
                    state.metrics.set_gauge("soak_rss_mb", rss_mb);
                    let cap = env_u64("SOAK_RSS_MAX_MB", 0);
                    if cap > 0 && rss_mb > cap as f64 {
                        state.alerts.append(
                            "soak_rss_exceeded",
                            serde_json::json!({"rss_mb": rss_mb, "cap_mb": cap}),
                        );
                    }
                }
                if let Some(threads) = read_proc_status_kb("Threads:") {
                    state.metrics.set_gauge("soak_threads", threads);
                    let cap = env_u64("SOAK_THREADS_MAX", 0);
                    if cap > 0 && threads > cap as f64 {
                        state.alerts.append(
                            "soak_threads_exceeded",
                            serde_json::json!({"threads": threads, "cap": cap}),
                        );
                    }
                }
                let drift_cap = env_u64("SOAK_DRIFT_MAX_MS", 0) as f64;
                if drift_cap > 0.0 {
                    let dump = state.metrics.dump();
                    if let Some(gauges) = dump.get("gauges").and_then(|v| v.as_object()) {
                        let worst = gauges
                            .iter()
                            .filter(|(name, _)| name.starts_with("loop_drift_ms{"))
                            .filter_map(|(_, v)| v.as_f64())
                            .fold(0.0_f64, f64::max);
                        state.metrics.set_gauge("soak_drift_max_ms", worst);
                        if worst > drift_cap {
                            state.alerts.append(
                                "soak_drift_exceeded",
                                serde_json::json!({"drift_ms": worst, "cap_ms": drift_cap}),
                            );
                        }
                    }
                }
            }
        });
    }

    // Canary export.
    {
        let state = state.clone();
        let interval = env_u64("CANARY_EXPORT_INTERVAL_SEC", 300);
        supervisor.spawn_periodic(
            "export_canary",
            Duration::from_secs(interval),
            None,
            move || {
                let state = state.clone();
                async move {
                    let report = state.canary.build();
                    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
                    let path = state.artifacts_dir.join(format!("canary_{stamp}.json"));
                    if let Err(e) =
                        std::fs::write(&path, CanaryBuilder::to_canonical(&report))
                    {
                        warn!(error = %e, "canary export failed");
                    }
                }
            },
        );
    }

    // Artifact pruning.
    {
        let state = state.clone();
        let interval = env_u64("PRUNE_INTERVAL_SEC", 3_600);
        supervisor.spawn_periodic("prune", Duration::from_secs(interval), None, move || {
            let state = state.clone();
            async move {
                let max_snapshots = env_u64("CANARY_MAX_SNAPSHOTS", 200) as usize;
                let max_days = env_u64("CANARY_MAX_DAYS", 14) as i64;
                let max_lines = env_u64("ALERTS_MAX_LINES", 10_000) as usize;
                if let Err(e) = crate::alerts::prune_canary_artifacts(
                    &state.artifacts_dir,
                    max_snapshots,
                    max_days,
                    chrono::Utc::now(),
                ) {
                    warn!(error = %e, "canary prune failed");
                }
                if let Err(e) = state.alerts.truncate_to(max_lines) {
                    warn!(error = %e, "alerts prune failed");
                }
            }
        });
    }

    // Scheduler gauges.
    {
        let state = state.clone();
        let interval = env_u64("SCHEDULER_RECOMPUTE_SEC", 300);
        supervisor.spawn_periodic(
            "scheduler_recompute",
            Duration::from_secs(interval),
            None,
            move || {
                let state = state.clone();
                async move {
                    let now = chrono::Utc::now();
                    state.metrics.set_gauge(
                        "scheduler_is_open",
                        if state.scheduler.is_open(now) { 1.0 } else { 0.0 },
                    );
                    state.metrics.set_gauge(
                        "scheduler_trade_allowed",
                        if state.scheduler.is_trade_allowed(now) { 1.0 } else { 0.0 },
                    );
                }
            },
        );
    }

    // Execution journal bookkeeping.
    {
        let state = state.clone();
        supervisor.spawn_periodic(
            "orders_snapshot",
            Duration::from_secs(60),
            None,
            move || {
                let state = state.clone();
                async move {
                    let status = state.recorder.status();
                    if let Some(lines) = status.get("lines").and_then(|v| v.as_u64()) {
                        state.metrics.set_gauge("recorder_lines", lines as f64);
                    }
                }
            },
        );
    }
}

/// Atomic snapshot write with a last-write gauge; failures are logged and
/// the previous file stays intact.
fn write_snapshot(state: &AppState, path: &std::path::Path, payload: &serde_json::Value, version: u64) {
    match snapshot::atomic_write(path, payload, version) {
        Ok(()) => {
            state.metrics.set_gauge(
                &format!("snapshot_write_ts{{path=\"{}\"}}", path.display()),
                now_secs(),
            );
        }
        Err(e) => warn!(error = %e, path = %path.display(), "snapshot write failed"),
    }
}

fn write_all_snapshots(state: &AppState) {
    write_snapshot(state, &state.allocator_snapshot_path(), &state.allocator.to_snapshot(), 1);
    write_snapshot(state, &state.throttle_snapshot_path(), &state.throttle.to_snapshot(), 2);
    write_snapshot(state, &state.ramp_snapshot_path(), &state.rollout.ramp_snapshot(), 1);
    write_snapshot(
        state,
        &state.rollout_state_snapshot_path(),
        &state.rollout.state_snapshot(now_secs()),
        1,
    );
    write_snapshot(state, &state.guard_snapshot_path(), &state.guard.to_snapshot(), 1);
    write_snapshot(state, &state.autopolicy_snapshot_path(), &state.autopolicy.to_snapshot(), 1);
}

/// Numeric field from /proc/self/status on Linux; `None` elsewhere.
fn read_proc_status_kb(prefix: &str) -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix(prefix) {
            return rest.trim().trim_end_matches("kB").trim().parse().ok();
        }
    }
    None
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["meridian-mm"]);
        assert_eq!(cli.config, PathBuf::from("config.yaml"));
        assert_eq!(cli.profile, Profile::Testnet);
        assert!(!cli.dry_run);
        assert!(!cli.paper);
    }

    #[test]
    fn cli_paper_flag_and_overrides() {
        let cli = Cli::parse_from([
            "meridian-mm",
            "--paper",
            "--dry-run",
            "--config",
            "alt.yaml",
            "--throttle-snapshot-path",
            "/tmp/t.json",
            "--throttle-snapshot-interval-seconds",
            "30",
        ]);
        assert!(cli.paper);
        assert!(cli.dry_run);
        assert_eq!(cli.config, PathBuf::from("alt.yaml"));
        assert_eq!(cli.throttle_snapshot_path, Some(PathBuf::from("/tmp/t.json")));
        assert_eq!(cli.throttle_snapshot_interval_seconds, Some(30));
    }

    #[test]
    fn cli_profile_parses_all_variants() {
        for (arg, profile) in [
            ("testnet", Profile::Testnet),
            ("mainnet", Profile::Mainnet),
            ("paper", Profile::Paper),
        ] {
            let cli = Cli::parse_from(["meridian-mm", "--profile", arg]);
            assert_eq!(cli.profile, profile);
        }
    }

    #[test]
    fn env_u64_falls_back() {
        assert_eq!(env_u64("MERIDIAN_TEST_UNSET_VAR", 42), 42);
    }
}
