// =============================================================================
// Scheduler — time-of-day gating for quoting
// =============================================================================

pub mod tod;
