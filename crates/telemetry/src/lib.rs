//! Cost tracking for swerve sessions.
//!
//! Provides the per-model-family pricing table, the pure [`calculate_cost`]
//! function, and the [`CostAccountant`] that keeps each session's persisted
//! cost in step with its usage ledger.

pub mod accountant;
pub mod pricing;

pub use accountant::{CostAccountant, CostLine, CostReport};
pub use pricing::{ModelRates, PricingTable, calculate_cost};
