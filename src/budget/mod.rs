//! Budget module - cost tracking and model pricing.
//!
//! # Key Concepts
//! - BudgetTracker: cumulative cost against an optional limit, with 80%/100% signals
//! - BudgetHandle: shared live accessor steps can query
//! - Pricing: static per-model table with a fallback rate

#[allow(clippy::module_inception)]
mod budget;
pub mod pricing;

pub use budget::{BudgetCheck, BudgetHandle, BudgetTracker, WARNING_RATIO};
pub use pricing::{cost_for_tokens, normalize_model, price_per_million};
