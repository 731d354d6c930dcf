//! Auxiliary abuse guards consulted by the evaluation pipeline.
//!
//! Each guard is a trait so deployments can back it with their own
//! infrastructure; the provided implementations sit on top of the
//! [`crate::store`] contracts.

pub mod budget;
pub mod ephemeral;
pub mod equilibrium;

pub use budget::{BudgetTracker, BudgetTrackerConfig, StoreBudgetTracker};
pub use ephemeral::{CorrelationEphemeralBucket, EphemeralBucket, EphemeralCheck, EphemeralConfig};
pub use equilibrium::{AntiEquilibriumGate, CorrelationEquilibriumGate, EquilibriumConfig};
