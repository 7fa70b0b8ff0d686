// =============================================================================
// Loop Supervisor — named periodic tasks with jitter, heartbeats, drift
// =============================================================================
//
// Every periodic behaviour in the process is one named task owned by the
// supervisor; nothing is fire-and-forget.  Loops sleep in ≤ 50 ms slices so
// a cleared `running` flag is observed within one slice, publish a heartbeat
// gauge and a duration accumulator after every body, and report a drift
// gauge when the actual sleep overshoots the nominal interval by more than
// 100 ms.  Periodic writers get a deterministic ±10 % jitter keyed on their
// snapshot path so independent processes never synchronise.
// =============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::metrics::Metrics;
use crate::snapshot::jittered_interval;

/// Maximum single sleep slice; bounds shutdown latency.
pub const SLICE_MS: u64 = 50;

/// Drift above this is worth a gauge.
const DRIFT_REPORT_MS: f64 = 100.0;

/// Owns every named periodic task in the process.
pub struct LoopSupervisor {
    running: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl LoopSupervisor {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            metrics,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Shared shutdown flag; loops observe a clear within one slice.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn a named periodic loop. When `jitter_seed` is given the interval
    /// is stretched by the deterministic ±10 % jitter of [`jittered_interval`]
    /// (periodic writers); otherwise the nominal period is used as-is.
    pub fn spawn_periodic<F, Fut>(
        &self,
        name: &str,
        period: Duration,
        jitter_seed: Option<(String, String)>,
        mut body: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let nominal_secs = match &jitter_seed {
            Some((seed, tag)) => jittered_interval(seed, tag, period.as_secs_f64()),
            None => period.as_secs_f64(),
        };
        let running = self.running.clone();
        let metrics = self.metrics.clone();
        let loop_name = name.to_string();

        let handle = tokio::spawn(async move {
            info!(name = %loop_name, interval_sec = nominal_secs, "loop started");
            loop {
                let slept = sleep_sliced(&running, nominal_secs).await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let drift_ms = (slept - nominal_secs) * 1_000.0;
                if drift_ms > DRIFT_REPORT_MS {
                    metrics.set_loop_drift_ms(&loop_name, drift_ms);
                }

                let started = Instant::now();
                body().await;
                metrics.add_loop_duration_ms(&loop_name, started.elapsed().as_secs_f64() * 1e3);
                metrics.set_loop_heartbeat(&loop_name, unix_now());
            }
            info!(name = %loop_name, "loop stopped");
        });

        self.handles.lock().push((name.to_string(), handle));
    }

    /// Clear `running` and join every loop within `budget` overall. A loop
    /// that exceeds its share of the budget is logged and abandoned; later
    /// joins still run.
    pub async fn shutdown(&self, budget: Duration) {
        self.running.store(false, Ordering::SeqCst);
        let handles: Vec<(String, JoinHandle<()>)> = self.handles.lock().drain(..).collect();
        let deadline = Instant::now() + budget;

        for (name, handle) in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining.max(Duration::from_millis(1)), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(name = %name, error = %e, "loop join failed"),
                Err(_) => warn!(name = %name, "loop did not stop within budget, skipped"),
            }
        }
    }

    pub fn task_names(&self) -> Vec<String> {
        self.handles.lock().iter().map(|(n, _)| n.clone()).collect()
    }
}

impl std::fmt::Debug for LoopSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopSupervisor")
            .field("running", &self.is_running())
            .field("tasks", &self.handles.lock().len())
            .finish()
    }
}

/// Sleep up to `target_secs` in ≤ 50 ms slices, returning early when the
/// flag clears. Returns the time actually slept in seconds.
async fn sleep_sliced(running: &AtomicBool, target_secs: f64) -> f64 {
    let started = Instant::now();
    let target = Duration::from_secs_f64(target_secs.max(0.0));
    while started.elapsed() < target {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let remaining = target - started.elapsed();
        tokio::time::sleep(remaining.min(Duration::from_millis(SLICE_MS))).await;
    }
    started.elapsed().as_secs_f64()
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn loop_runs_and_updates_heartbeat() {
        let metrics = Arc::new(Metrics::new());
        let sup = LoopSupervisor::new(metrics.clone());
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        sup.spawn_periodic("t", Duration::from_millis(20), None, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        sup.shutdown(Duration::from_secs(1)).await;

        assert!(count.load(Ordering::SeqCst) >= 2);
        assert!(metrics.gauge("loop_heartbeat{name=\"t\"}") > 0.0);
        assert!(metrics.gauge("loop_duration_count{name=\"t\"}") >= 2.0);
    }

    #[tokio::test]
    async fn shutdown_observed_within_a_slice() {
        let metrics = Arc::new(Metrics::new());
        let sup = LoopSupervisor::new(metrics);
        sup.spawn_periodic("slow", Duration::from_secs(3600), None, || async {});

        let started = Instant::now();
        sup.shutdown(Duration::from_secs(5)).await;
        // A loop nominally sleeping an hour must still exit promptly.
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn shutdown_budget_skips_stuck_loops() {
        let metrics = Arc::new(Metrics::new());
        let sup = LoopSupervisor::new(metrics);
        sup.spawn_periodic("stuck", Duration::from_millis(1), None, || async {
            // A body that never yields back within the budget.
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        let started = Instant::now();
        sup.shutdown(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn writer_jitter_stays_within_ten_percent() {
        let d = jittered_interval("artifacts/throttle_snapshot.json", "throttle", 60.0);
        assert!(d >= 54.0 && d <= 66.0);
    }
}
