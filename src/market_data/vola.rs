// =============================================================================
// Volatility EWMA — per-symbol return volatility estimate
// =============================================================================
//
// On each accepted mid-price update:
//
//   v ← α · |Δp / p_prev| + (1 − α) · v
//
// Guards: non-positive mids are ignored, updates older than the last
// accepted timestamp are ignored, and the first tick initialises v = 0 so a
// single print never reads as volatility.  `is_ready` requires a minimum
// number of samples before the estimate feeds the allocator.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::VolaConfig;
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, Default)]
struct Tracker {
    ewma: f64,
    last_price: Option<f64>,
    last_update_ts: f64,
    sample_count: u32,
}

impl Tracker {
    fn update(&mut self, alpha: f64, mid: f64, ts: f64) -> f64 {
        if mid <= 0.0 {
            return self.ewma;
        }
        if self.last_update_ts > 0.0 && ts < self.last_update_ts {
            return self.ewma;
        }

        match self.last_price {
            None => {
                self.ewma = 0.0;
                self.last_price = Some(mid);
                self.last_update_ts = ts;
                self.sample_count = 1;
            }
            Some(prev) => {
                let ret = if prev > 0.0 { (mid - prev) / prev } else { 0.0 };
                self.ewma = alpha * ret.abs() + (1.0 - alpha) * self.ewma;
                self.last_price = Some(mid);
                self.last_update_ts = ts;
                self.sample_count += 1;
            }
        }
        self.ewma
    }
}

/// Manages EWMA volatility trackers for all configured symbols and publishes
/// a gauge per update.
pub struct VolatilityManager {
    cfg: VolaConfig,
    metrics: Arc<Metrics>,
    trackers: RwLock<HashMap<String, Tracker>>,
}

impl VolatilityManager {
    pub fn new(cfg: VolaConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            cfg,
            metrics,
            trackers: RwLock::new(HashMap::new()),
        }
    }

    /// Feed one mid-price observation. Returns the updated estimate.
    pub fn update(&self, symbol: &str, mid: f64, ts: f64) -> f64 {
        let v = {
            let mut trackers = self.trackers.write();
            let tracker = trackers.entry(symbol.to_string()).or_default();
            tracker.update(self.cfg.alpha, mid, ts)
        };
        self.metrics
            .set_gauge(&format!("vola_ewma{{symbol=\"{symbol}\"}}"), v);
        v
    }

    /// Current estimate, zero until `min_samples` updates have been accepted.
    pub fn volatility(&self, symbol: &str) -> f64 {
        let trackers = self.trackers.read();
        match trackers.get(symbol) {
            Some(t) if t.sample_count >= self.cfg.min_samples => t.ewma,
            _ => 0.0,
        }
    }

    pub fn is_ready(&self, symbol: &str) -> bool {
        self.trackers
            .read()
            .get(symbol)
            .is_some_and(|t| t.sample_count >= self.cfg.min_samples)
    }

    /// Raw estimates for all tracked symbols regardless of readiness.
    pub fn all_volatilities(&self) -> HashMap<String, f64> {
        self.trackers
            .read()
            .iter()
            .map(|(sym, t)| (sym.clone(), t.ewma))
            .collect()
    }
}

impl std::fmt::Debug for VolatilityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolatilityManager")
            .field("symbols", &self.trackers.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn mgr() -> VolatilityManager {
        VolatilityManager::new(
            VolaConfig {
                alpha: 0.3,
                min_samples: 3,
            },
            Arc::new(Metrics::new()),
        )
    }

    #[test]
    fn first_tick_initialises_zero() {
        let m = mgr();
        assert_eq!(m.update("BTCUSDT", 50_000.0, 1.0), 0.0);
    }

    #[test]
    fn ewma_tracks_absolute_returns() {
        let m = mgr();
        m.update("BTCUSDT", 100.0, 1.0);
        // +1 % move: v = 0.3 * 0.01 + 0.7 * 0 = 0.003
        let v = m.update("BTCUSDT", 101.0, 2.0);
        assert!((v - 0.003).abs() < 1e-12);
        // -1 % (approx) move mixes in with the previous estimate.
        let v2 = m.update("BTCUSDT", 100.0, 3.0);
        assert!(v2 > v);
    }

    #[test]
    fn non_positive_mid_ignored() {
        let m = mgr();
        m.update("BTCUSDT", 100.0, 1.0);
        let before = m.update("BTCUSDT", 101.0, 2.0);
        assert_eq!(m.update("BTCUSDT", 0.0, 3.0), before);
        assert_eq!(m.update("BTCUSDT", -5.0, 4.0), before);
    }

    #[test]
    fn stale_timestamp_ignored() {
        let m = mgr();
        m.update("BTCUSDT", 100.0, 10.0);
        let before = m.update("BTCUSDT", 101.0, 20.0);
        // Strictly older than the last accepted update: ignored.
        assert_eq!(m.update("BTCUSDT", 200.0, 15.0), before);
        // Equal timestamp is accepted (monotonic, not strictly increasing).
        let after = m.update("BTCUSDT", 102.0, 20.0);
        assert!(after != before);
    }

    #[test]
    fn readiness_requires_min_samples() {
        let m = mgr();
        m.update("BTCUSDT", 100.0, 1.0);
        m.update("BTCUSDT", 101.0, 2.0);
        assert!(!m.is_ready("BTCUSDT"));
        assert_eq!(m.volatility("BTCUSDT"), 0.0);

        m.update("BTCUSDT", 102.0, 3.0);
        assert!(m.is_ready("BTCUSDT"));
        assert!(m.volatility("BTCUSDT") > 0.0);
        assert!(!m.is_ready("ETHUSDT"));
    }
}
