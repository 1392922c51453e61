//! Quotagate
//!
//! An admission-control gate that decides, per client and per named
//! policy, whether an incoming unit of work may proceed. Policies carry
//! versioned quota configuration with rollback; enforcement runs through
//! either a fixed-window counter or a token bucket against a pluggable
//! atomic counter store (in-memory or Redis).

pub mod algorithm;
pub mod api;
pub mod config;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod policy;
pub mod redis;
pub mod store;
pub mod utils;

// Re-export main types
pub use algorithm::{AlgorithmKind, QuotaAlgorithm};
pub use error::{EngineError, Result};
pub use gate::{Decision, EnforcementGate, FailurePolicy};
pub use policy::{Policy, PolicySpec, PolicyStore, PolicyUpdate};
pub use store::{BucketState, CounterStore, MemoryCounterStore};
