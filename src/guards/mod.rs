// =============================================================================
// Guards — runtime anomaly protection for order flow
// =============================================================================

pub mod autopolicy;
pub mod circuit;
pub mod runtime;
pub mod throttle;
