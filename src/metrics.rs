// =============================================================================
// Metrics Registry — injected, lock-based, test-hermetic
// =============================================================================
//
// Every component receives an `Arc<Metrics>` at construction instead of
// importing a process-wide registry.  Counters are plain u64 behind
// parking_lot locks; gauges are f64 in a name-keyed map.  The registry never
// does I/O; exposition is somebody else's job.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;

use crate::types::Color;

/// Cap on the per-color latency sample reservoir used for p95/p99.
const LATENCY_RESERVOIR_CAP: usize = 4096;

/// Smoothing factor for per-color latency EWMA.
const LATENCY_EWMA_ALPHA: f64 = 0.2;

// =============================================================================
// Per-color aggregates
// =============================================================================

/// A blue/green pair of counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ColorCounts {
    pub blue: u64,
    pub green: u64,
}

impl ColorCounts {
    pub fn get(&self, color: Color) -> u64 {
        match color {
            Color::Blue => self.blue,
            Color::Green => self.green,
        }
    }

    fn bump(&mut self, color: Color) {
        match color {
            Color::Blue => self.blue += 1,
            Color::Green => self.green += 1,
        }
    }
}

/// A blue/green pair of gauges.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ColorValues {
    pub blue: f64,
    pub green: f64,
}

impl ColorValues {
    pub fn get(&self, color: Color) -> f64 {
        match color {
            Color::Blue => self.blue,
            Color::Green => self.green,
        }
    }

    fn set(&mut self, color: Color, v: f64) {
        match color {
            Color::Blue => self.blue = v,
            Color::Green => self.green = v,
        }
    }
}

/// Rollout traffic counters read by the ramp tick and the canary builder.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RolloutCounters {
    pub orders: ColorCounts,
    pub fills: ColorCounts,
    pub rejects: ColorCounts,
    pub latency_ewma_ms: ColorValues,
    pub split_expected_pct: f64,
    pub split_observed_pct: f64,
}

#[derive(Debug, Default)]
struct LatencyTail {
    samples: Vec<f64>,
    total: u64,
}

impl LatencyTail {
    fn observe(&mut self, ms: f64) {
        self.total += 1;
        if self.samples.len() >= LATENCY_RESERVOIR_CAP {
            // Overwrite deterministically so long-running loops stay bounded.
            let idx = (self.total as usize) % LATENCY_RESERVOIR_CAP;
            self.samples[idx] = ms;
        } else {
            self.samples.push(ms);
        }
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((sorted.len() as f64) * p).ceil() as usize;
        sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
    }
}

/// Markout accumulator for one (horizon, color) cell.
#[derive(Debug, Clone, Copy, Default)]
struct MarkoutCell {
    sum_bps: f64,
    count: u64,
}

impl MarkoutCell {
    fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_bps / self.count as f64
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Injected metrics registry shared by all control-plane components.
pub struct Metrics {
    rollout: RwLock<RolloutCounters>,
    latency_tail_blue: RwLock<LatencyTail>,
    latency_tail_green: RwLock<LatencyTail>,
    /// (horizon_ms, color) → accumulator; horizons are fixed at 200/500.
    markout: RwLock<HashMap<(u32, Color), MarkoutCell>>,
    /// Labeled counters, e.g. `snapshot_integrity_fail_total{kind="allocator"}`.
    counters: RwLock<HashMap<String, u64>>,
    /// Named gauges, e.g. `loop_heartbeat{name="ramp"}` or `autopolicy_level`.
    gauges: RwLock<HashMap<String, f64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            rollout: RwLock::new(RolloutCounters::default()),
            latency_tail_blue: RwLock::new(LatencyTail::default()),
            latency_tail_green: RwLock::new(LatencyTail::default()),
            markout: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
        }
    }

    // ── Rollout traffic ─────────────────────────────────────────────────

    pub fn record_order(&self, color: Color) {
        self.rollout.write().orders.bump(color);
    }

    pub fn record_fill(&self, color: Color) {
        self.rollout.write().fills.bump(color);
    }

    pub fn record_reject(&self, color: Color) {
        self.rollout.write().rejects.bump(color);
    }

    /// Record one order round-trip latency: updates the per-color EWMA and
    /// feeds the tail reservoir used for p95/p99.
    pub fn observe_latency(&self, color: Color, ms: f64) {
        {
            let mut r = self.rollout.write();
            let prev = r.latency_ewma_ms.get(color);
            let next = if prev == 0.0 {
                ms
            } else {
                LATENCY_EWMA_ALPHA * ms + (1.0 - LATENCY_EWMA_ALPHA) * prev
            };
            r.latency_ewma_ms.set(color, next);
        }
        match color {
            Color::Blue => self.latency_tail_blue.write().observe(ms),
            Color::Green => self.latency_tail_green.write().observe(ms),
        }
    }

    pub fn set_split_expected_pct(&self, v: f64) {
        self.rollout.write().split_expected_pct = v;
    }

    pub fn set_split_observed_pct(&self, v: f64) {
        self.rollout.write().split_observed_pct = v;
    }

    pub fn rollout_counters(&self) -> RolloutCounters {
        self.rollout.read().clone()
    }

    /// Test/replay hook: overwrite the raw rollout counters wholesale.
    pub fn set_rollout_counters(&self, c: RolloutCounters) {
        *self.rollout.write() = c;
    }

    pub fn latency_percentile(&self, color: Color, p: f64) -> f64 {
        match color {
            Color::Blue => self.latency_tail_blue.read().percentile(p),
            Color::Green => self.latency_tail_green.read().percentile(p),
        }
    }

    pub fn latency_samples_total(&self, color: Color) -> u64 {
        match color {
            Color::Blue => self.latency_tail_blue.read().total,
            Color::Green => self.latency_tail_green.read().total,
        }
    }

    // ── Markout ─────────────────────────────────────────────────────────

    /// Record the mid-price drift after a fill: positive bps means the book
    /// moved in our favour. `horizon_ms` is 200 or 500.
    pub fn record_markout(&self, color: Color, horizon_ms: u32, fill_mid: f64, later_mid: f64) {
        if fill_mid <= 0.0 {
            return;
        }
        let bps = (later_mid - fill_mid) / fill_mid * 10_000.0;
        let mut m = self.markout.write();
        let cell = m.entry((horizon_ms, color)).or_default();
        cell.sum_bps += bps;
        cell.count += 1;
    }

    pub fn markout_avg_bps(&self, color: Color, horizon_ms: u32) -> f64 {
        self.markout
            .read()
            .get(&(horizon_ms, color))
            .copied()
            .unwrap_or_default()
            .avg()
    }

    pub fn markout_samples(&self, color: Color, horizon_ms: u32) -> u64 {
        self.markout
            .read()
            .get(&(horizon_ms, color))
            .map(|c| c.count)
            .unwrap_or(0)
    }

    // ── Labeled counters & gauges ───────────────────────────────────────

    pub fn inc(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, delta: u64) {
        *self.counters.write().entry(name.to_string()).or_insert(0) += delta;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    pub fn set_gauge(&self, name: &str, v: f64) {
        self.gauges.write().insert(name.to_string(), v);
    }

    pub fn gauge(&self, name: &str) -> f64 {
        self.gauges.read().get(name).copied().unwrap_or(0.0)
    }

    // ── Domain-specific shorthands ──────────────────────────────────────

    pub fn inc_snapshot_integrity_fail(&self, kind: &str) {
        self.inc(&format!("snapshot_integrity_fail_total{{kind=\"{kind}\"}}"));
    }

    pub fn snapshot_integrity_fails(&self, kind: &str) -> u64 {
        self.counter(&format!("snapshot_integrity_fail_total{{kind=\"{kind}\"}}"))
    }

    pub fn inc_admin_request(&self, endpoint: &str) {
        self.inc(&format!("admin_requests_total{{endpoint=\"{endpoint}\"}}"));
    }

    pub fn inc_admin_unauthorized(&self, endpoint: &str) {
        self.inc(&format!("admin_unauthorized_total{{endpoint=\"{endpoint}\"}}"));
    }

    pub fn inc_admin_rate_limited(&self, endpoint: &str) {
        self.inc(&format!("admin_rate_limited_total{{endpoint=\"{endpoint}\"}}"));
    }

    pub fn inc_ramp_hold(&self, reason: &str) {
        self.inc(&format!("ramp_holds_total{{reason=\"{reason}\"}}"));
    }

    pub fn ramp_holds(&self, reason: &str) -> u64 {
        self.counter(&format!("ramp_holds_total{{reason=\"{reason}\"}}"))
    }

    pub fn inc_ramp_transition(&self, direction: &str) {
        self.inc(&format!("ramp_transitions_total{{direction=\"{direction}\"}}"));
    }

    pub fn inc_killswitch_trigger(&self, action: &str) {
        self.inc(&format!("killswitch_triggers_total{{action=\"{action}\"}}"));
    }

    pub fn killswitch_triggers(&self, action: &str) -> u64 {
        self.counter(&format!("killswitch_triggers_total{{action=\"{action}\"}}"))
    }

    pub fn set_loop_heartbeat(&self, name: &str, ts: f64) {
        self.set_gauge(&format!("loop_heartbeat{{name=\"{name}\"}}"), ts);
    }

    pub fn set_loop_drift_ms(&self, name: &str, ms: f64) {
        self.set_gauge(&format!("loop_drift_ms{{name=\"{name}\"}}"), ms);
    }

    pub fn add_loop_duration_ms(&self, name: &str, ms: f64) {
        let key = format!("loop_duration_ms_sum{{name=\"{name}\"}}");
        let mut g = self.gauges.write();
        *g.entry(key).or_insert(0.0) += ms;
        *g.entry(format!("loop_duration_count{{name=\"{name}\"}}"))
            .or_insert(0.0) += 1.0;
    }

    /// Debug dump of all counters and gauges, sorted by name.
    pub fn dump(&self) -> serde_json::Value {
        let counters: std::collections::BTreeMap<String, u64> =
            self.counters.read().clone().into_iter().collect();
        let gauges: std::collections::BTreeMap<String, serde_json::Value> = self
            .gauges
            .read()
            .clone()
            .into_iter()
            .map(|(k, v)| (k, serde_json::json!(v)))
            .collect();
        serde_json::json!({ "counters": counters, "gauges": gauges })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("rollout", &*self.rollout.read())
            .finish()
    }
}
