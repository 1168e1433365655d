use std::time::Duration;

use serde::{Deserialize, Serialize};

use exai_domain::error::{Error, Result};
use exai_domain::timeouts::TimeoutSet;

/// The backend families the daemon can route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Glm,
    Kimi,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Glm, ProviderKind::Kimi];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Glm => "glm",
            Self::Kimi => "kimi",
        }
    }

    /// The provider's call timeout from the loaded hierarchy.  Kimi with web
    /// search enabled gets the extended budget.
    pub fn timeout(&self, timeouts: &TimeoutSet, web_search: bool) -> Duration {
        match self {
            Self::Glm => timeouts.glm,
            Self::Kimi if web_search => timeouts.kimi_web_search,
            Self::Kimi => timeouts.kimi,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "glm" => Ok(Self::Glm),
            "kimi" => Ok(Self::Kimi),
            other => Err(Error::Config(format!("unknown provider: {other}"))),
        }
    }
}

/// A provider-agnostic completion request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Model override; `None` uses the provider's configured default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub use_web_search: bool,
}

/// A provider-agnostic completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    /// The model that actually produced the response.
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Capability implemented by every backend adapter.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("GLM".parse::<ProviderKind>().unwrap(), ProviderKind::Glm);
        assert_eq!("kimi".parse::<ProviderKind>().unwrap(), ProviderKind::Kimi);
        assert!("gpt".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn timeouts_resolve_by_kind_and_search_flag() {
        let timeouts = TimeoutSet::default();
        assert_eq!(
            ProviderKind::Glm.timeout(&timeouts, false),
            Duration::from_secs(90)
        );
        assert_eq!(
            ProviderKind::Kimi.timeout(&timeouts, false),
            Duration::from_secs(120)
        );
        assert_eq!(
            ProviderKind::Kimi.timeout(&timeouts, true),
            Duration::from_secs(150)
        );
    }
}
