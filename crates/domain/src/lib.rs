//! Shared domain types for the EXAI daemon and shim: the error taxonomy,
//! the coordinated timeout hierarchy, and filesystem path resolution.

pub mod error;
pub mod paths;
pub mod timeouts;

pub use error::{Error, Result, TimeoutLayer};
pub use timeouts::TimeoutSet;
