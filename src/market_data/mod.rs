// =============================================================================
// Market Data — per-symbol derived signals consumed by the control plane
// =============================================================================

pub mod vola;

pub use vola::VolatilityManager;
