// =============================================================================
// Portfolio Allocator — weighted USD targets with HWM and cost overrides
// =============================================================================
//
// Distributes a USD budget across symbols: each symbol receives its weight
// share of the budget, attenuated by a cost function of live spread, volume
// and slippage, and capped at `cap_eff_bps` of the budget.
//
// Cost attenuation (bounded in (0, 1], monotone):
//
//   liquidity = volume / (volume + 1e6)              // → 1 as volume grows
//   friction  = (spread_bps + slippage_bps) / 100
//   cost      = friction * (1 - 0.5 * liquidity)
//   atten     = 1 / (1 + (k_eff / 100) * cost)
//
// Higher k_eff, spread or slippage can only shrink the target; deeper volume
// can only grow it.  An overridden k_eff takes `max(base, override)`, so an
// override never attenuates less than the default for identical inputs.
//
// The high-water mark of observed equity is monotone non-decreasing within
// a process lifetime unless explicitly reset through the admin surface.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::config::AllocatorConfig;

/// Bounds for admin-supplied overrides.
pub const K_EFF_MAX: f64 = 1_000.0;
pub const CAP_EFF_BPS_MAX: f64 = 10_000.0;

/// Live cost inputs for one symbol.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CostInputs {
    pub spread_bps: f64,
    pub volume_usd: f64,
    pub slippage_bps: f64,
}

/// Per-symbol calibration override.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SymbolOverride {
    pub k_eff: Option<f64>,
    pub cap_eff_bps: Option<f64>,
}

/// Computed target for one symbol.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SymbolTarget {
    pub target_usd: f64,
    pub k_eff: f64,
    pub cap_eff_bps: f64,
}

struct Inner {
    hwm_equity_usd: f64,
    cost_inputs: HashMap<String, CostInputs>,
    overrides: HashMap<String, SymbolOverride>,
    last_targets: BTreeMap<String, SymbolTarget>,
}

/// Budget splitter with cost calibration and an equity high-water mark.
pub struct PortfolioAllocator {
    cfg: AllocatorConfig,
    inner: RwLock<Inner>,
}

impl PortfolioAllocator {
    pub fn new(cfg: AllocatorConfig) -> Self {
        Self {
            cfg,
            inner: RwLock::new(Inner {
                hwm_equity_usd: 0.0,
                cost_inputs: HashMap::new(),
                overrides: HashMap::new(),
                last_targets: BTreeMap::new(),
            }),
        }
    }

    // ── High-water mark ─────────────────────────────────────────────────

    /// Observe current equity; the HWM only ratchets upward.
    pub fn observe_equity(&self, equity_usd: f64) -> f64 {
        let mut inner = self.inner.write();
        if equity_usd > inner.hwm_equity_usd {
            inner.hwm_equity_usd = equity_usd;
        }
        inner.hwm_equity_usd
    }

    pub fn hwm_equity_usd(&self) -> f64 {
        self.inner.read().hwm_equity_usd
    }

    /// Admin reset: `zero` clears the mark, `to_current_equity` pins it to a
    /// caller-supplied value.
    pub fn reset_hwm_zero(&self) {
        self.inner.write().hwm_equity_usd = 0.0;
        info!("allocator HWM reset to zero");
    }

    pub fn reset_hwm_to(&self, equity_usd: f64) {
        self.inner.write().hwm_equity_usd = equity_usd.max(0.0);
        info!(equity_usd, "allocator HWM reset to current equity");
    }

    // ── Cost calibration ────────────────────────────────────────────────

    pub fn set_cost_inputs(
        &self,
        symbol: &str,
        spread_bps: f64,
        volume_usd: f64,
        slippage_bps: f64,
    ) {
        self.inner.write().cost_inputs.insert(
            symbol.to_string(),
            CostInputs {
                spread_bps: spread_bps.max(0.0),
                volume_usd: volume_usd.max(0.0),
                slippage_bps: slippage_bps.max(0.0),
            },
        );
    }

    /// Apply an override. Values must already be range-checked by the admin
    /// layer (`k_eff ∈ [0, 1000]`, `cap_eff_bps ∈ [0, 10000]`).
    pub fn set_override(&self, symbol: &str, ov: SymbolOverride) {
        self.inner.write().overrides.insert(symbol.to_string(), ov);
    }

    pub fn clear_overrides(&self) {
        self.inner.write().overrides.clear();
    }

    pub fn overrides(&self) -> BTreeMap<String, SymbolOverride> {
        self.inner
            .read()
            .overrides
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    fn effective_params(&self, inner: &Inner, symbol: &str) -> (f64, f64) {
        let ov = inner.overrides.get(symbol).copied().unwrap_or_default();
        // An override may only tighten k; a looser value would let an
        // overridden symbol attenuate less than the default.
        let k = match ov.k_eff {
            Some(k) => k.max(self.cfg.k_eff),
            None => self.cfg.k_eff,
        };
        let cap = ov.cap_eff_bps.unwrap_or(self.cfg.cap_eff_bps);
        (
            k.clamp(0.0, K_EFF_MAX),
            cap.clamp(0.0, CAP_EFF_BPS_MAX),
        )
    }

    fn attenuation(k_eff: f64, inputs: CostInputs) -> f64 {
        let liquidity = inputs.volume_usd / (inputs.volume_usd + 1_000_000.0);
        let friction = (inputs.spread_bps + inputs.slippage_bps) / 100.0;
        let cost = friction * (1.0 - 0.5 * liquidity);
        1.0 / (1.0 + (k_eff / 100.0) * cost)
    }

    // ── Targets ─────────────────────────────────────────────────────────

    /// Distribute `budget_usd` over `weights`. Non-positive weights receive
    /// a zero target; outputs are remembered for the status endpoint.
    pub fn targets_from_weights(
        &self,
        weights: &BTreeMap<String, f64>,
        budget_usd: f64,
    ) -> BTreeMap<String, SymbolTarget> {
        let mut inner = self.inner.write();
        let total: f64 = weights.values().filter(|&&w| w > 0.0).sum();
        let mut out = BTreeMap::new();

        for (symbol, &weight) in weights {
            let (k_eff, cap_eff_bps) = self.effective_params(&inner, symbol);
            let share = if total > 0.0 && weight > 0.0 {
                weight / total * budget_usd
            } else {
                0.0
            };
            let inputs = inner
                .cost_inputs
                .get(symbol)
                .copied()
                .unwrap_or_default();
            let atten = Self::attenuation(k_eff, inputs);
            let cap_usd = cap_eff_bps / 10_000.0 * budget_usd;
            let target_usd = (share * atten).min(cap_usd).max(0.0);
            out.insert(
                symbol.clone(),
                SymbolTarget {
                    target_usd,
                    k_eff,
                    cap_eff_bps,
                },
            );
        }

        inner.last_targets = out.clone();
        out
    }

    pub fn budget_usd(&self) -> f64 {
        self.cfg.budget_usd
    }

    pub fn status(&self) -> serde_json::Value {
        let inner = self.inner.read();
        serde_json::json!({
            "hwm_equity_usd": inner.hwm_equity_usd,
            "budget_usd": self.cfg.budget_usd,
            "overrides": inner
                .overrides
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::json!({
                    "k_eff": v.k_eff,
                    "cap_eff_bps": v.cap_eff_bps,
                })))
                .collect::<BTreeMap<String, serde_json::Value>>(),
            "last_targets": inner
                .last_targets
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::json!({
                    "target_usd": v.target_usd,
                    "k_eff": v.k_eff,
                    "cap_eff_bps": v.cap_eff_bps,
                })))
                .collect::<BTreeMap<String, serde_json::Value>>(),
        })
    }

    // ── Snapshot ────────────────────────────────────────────────────────

    /// Version-1 snapshot payload.
    pub fn to_snapshot(&self) -> serde_json::Value {
        serde_json::json!({ "hwm_equity_usd": self.inner.read().hwm_equity_usd })
    }

    pub fn load_snapshot(&self, payload: &serde_json::Value) -> Result<(), &'static str> {
        let hwm = payload
            .get("hwm_equity_usd")
            .and_then(|v| v.as_f64())
            .ok_or("invalid_payload")?;
        if hwm < 0.0 {
            return Err("invalid_payload");
        }
        self.inner.write().hwm_equity_usd = hwm;
        Ok(())
    }
}

impl std::fmt::Debug for PortfolioAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortfolioAllocator")
            .field("hwm_equity_usd", &self.inner.read().hwm_equity_usd)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn alloc() -> PortfolioAllocator {
        PortfolioAllocator::new(AllocatorConfig {
            budget_usd: 10_000.0,
            k_eff: 50.0,
            cap_eff_bps: 10_000.0,
        })
    }

    fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(s, w)| (s.to_string(), *w)).collect()
    }

    #[test]
    fn hwm_only_ratchets_up() {
        let a = alloc();
        assert_eq!(a.observe_equity(1_000.0), 1_000.0);
        assert_eq!(a.observe_equity(500.0), 1_000.0);
        assert_eq!(a.observe_equity(1_500.0), 1_500.0);
        a.reset_hwm_zero();
        assert_eq!(a.hwm_equity_usd(), 0.0);
        a.reset_hwm_to(800.0);
        assert_eq!(a.hwm_equity_usd(), 800.0);
    }

    #[test]
    fn equal_weights_split_budget_without_costs() {
        let a = alloc();
        let t = a.targets_from_weights(&weights(&[("BTCUSDT", 1.0), ("ETHUSDT", 1.0)]), 10_000.0);
        // No cost inputs recorded: attenuation is exactly 1.
        assert!((t["BTCUSDT"].target_usd - 5_000.0).abs() < 1e-9);
        assert!((t["ETHUSDT"].target_usd - 5_000.0).abs() < 1e-9);
    }

    #[test]
    fn costs_attenuate_monotonically() {
        let a = alloc();
        a.set_cost_inputs("BTCUSDT", 10.0, 0.0, 0.0);
        a.set_cost_inputs("ETHUSDT", 40.0, 0.0, 0.0);
        let t = a.targets_from_weights(&weights(&[("BTCUSDT", 1.0), ("ETHUSDT", 1.0)]), 10_000.0);
        assert!(t["BTCUSDT"].target_usd > t["ETHUSDT"].target_usd);
        assert!(t["BTCUSDT"].target_usd < 5_000.0);
    }

    #[test]
    fn volume_relieves_attenuation() {
        let a = alloc();
        a.set_cost_inputs("BTCUSDT", 20.0, 0.0, 0.0);
        a.set_cost_inputs("ETHUSDT", 20.0, 50_000_000.0, 0.0);
        let t = a.targets_from_weights(&weights(&[("BTCUSDT", 1.0), ("ETHUSDT", 1.0)]), 10_000.0);
        assert!(t["ETHUSDT"].target_usd > t["BTCUSDT"].target_usd);
    }

    #[test]
    fn override_never_attenuates_less() {
        let a = alloc();
        a.set_cost_inputs("BTCUSDT", 20.0, 0.0, 5.0);
        a.set_cost_inputs("ETHUSDT", 20.0, 0.0, 5.0);
        // Override below the base k is lifted to the base.
        a.set_override(
            "ETHUSDT",
            SymbolOverride {
                k_eff: Some(10.0),
                cap_eff_bps: None,
            },
        );
        let t = a.targets_from_weights(&weights(&[("BTCUSDT", 1.0), ("ETHUSDT", 1.0)]), 10_000.0);
        assert!(t["ETHUSDT"].target_usd <= t["BTCUSDT"].target_usd + 1e-9);
        assert_eq!(t["ETHUSDT"].k_eff, 50.0);

        // A tighter override attenuates strictly more.
        a.set_override(
            "ETHUSDT",
            SymbolOverride {
                k_eff: Some(500.0),
                cap_eff_bps: None,
            },
        );
        let t2 = a.targets_from_weights(&weights(&[("BTCUSDT", 1.0), ("ETHUSDT", 1.0)]), 10_000.0);
        assert!(t2["ETHUSDT"].target_usd < t2["BTCUSDT"].target_usd);
    }

    #[test]
    fn cap_eff_bps_caps_target() {
        let a = alloc();
        a.set_override(
            "BTCUSDT",
            SymbolOverride {
                k_eff: None,
                cap_eff_bps: Some(1_000.0), // 10 % of budget
            },
        );
        let t = a.targets_from_weights(&weights(&[("BTCUSDT", 1.0)]), 10_000.0);
        assert!((t["BTCUSDT"].target_usd - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn zero_weight_gets_zero_target() {
        let a = alloc();
        let t = a.targets_from_weights(&weights(&[("BTCUSDT", 1.0), ("ETHUSDT", 0.0)]), 10_000.0);
        assert_eq!(t["ETHUSDT"].target_usd, 0.0);
        assert!((t["BTCUSDT"].target_usd - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn snapshot_roundtrip() {
        let a = alloc();
        a.observe_equity(1_234.5);
        let snap = a.to_snapshot();
        assert_eq!(snap, serde_json::json!({"hwm_equity_usd": 1234.5}));

        let a2 = alloc();
        a2.load_snapshot(&snap).unwrap();
        assert_eq!(a2.hwm_equity_usd(), 1_234.5);
    }

    #[test]
    fn bad_snapshot_rejected() {
        let a = alloc();
        assert!(a.load_snapshot(&serde_json::json!({"nope": 1})).is_err());
        assert!(a
            .load_snapshot(&serde_json::json!({"hwm_equity_usd": -5.0}))
            .is_err());
        assert_eq!(a.hwm_equity_usd(), 0.0);
    }
}
