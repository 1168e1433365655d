//! The LLM-provider seam.
//!
//! Concrete provider SDKs live outside this system; the daemon only needs a
//! capability trait to call through, a registry to resolve tools' declared
//! providers, and per-provider concurrency limits.

mod registry;
mod traits;

pub use registry::{ProviderLimits, ProviderRegistry};
pub use traits::{CompletionRequest, CompletionResponse, Provider, ProviderKind, Usage};
