//! Reliability substrate: circuit breaker, graceful-degradation executor,
//! and the expert-validation deduplication cache.

pub mod circuit;
pub mod dedup;
pub mod degrade;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot};
pub use dedup::ExpertDedup;
pub use degrade::{Degrader, ExecOptions};
