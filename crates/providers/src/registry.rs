use std::collections::HashMap;
use std::sync::Arc;

use crate::traits::{Provider, ProviderKind};

/// Per-provider in-flight limits, enforced by the daemon's permit gate.
#[derive(Debug, Clone, Copy)]
pub struct ProviderLimits {
    pub glm: usize,
    pub kimi: usize,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self { glm: 8, kimi: 4 }
    }
}

impl ProviderLimits {
    pub fn load_env() -> Self {
        Self::load_from(|name| std::env::var(name).ok())
    }

    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            glm: lookup("EXAI_WS_GLM_MAX_INFLIGHT")
                .and_then(|v| v.trim().parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.glm),
            kimi: lookup("EXAI_WS_KIMI_MAX_INFLIGHT")
                .and_then(|v| v.trim().parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.kimi),
        }
    }

    pub fn for_kind(&self, kind: ProviderKind) -> usize {
        match kind {
            ProviderKind::Glm => self.glm,
            ProviderKind::Kimi => self.kimi,
        }
    }
}

/// Provider instances keyed by kind.  Providers are stateless with respect
/// to individual calls and shared across all sessions; concurrency is
/// bounded only by the per-provider permits.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let kind = provider.kind();
        if self.providers.insert(kind, provider).is_some() {
            tracing::warn!(provider = %kind, "provider re-registered, replacing");
        }
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn Provider>> {
        self.providers.get(&kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{CompletionRequest, CompletionResponse};
    use exai_domain::error::Result;

    struct FakeProvider(ProviderKind);

    #[async_trait::async_trait]
    impl Provider for FakeProvider {
        fn kind(&self) -> ProviderKind {
            self.0
        }

        async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse> {
            Ok(CompletionResponse {
                content: format!("echo: {}", req.prompt),
                model: format!("{}-fake", self.0),
                usage: None,
            })
        }
    }

    #[tokio::test]
    async fn registry_resolves_by_kind() {
        let mut reg = ProviderRegistry::new();
        reg.register(Arc::new(FakeProvider(ProviderKind::Glm)));
        assert_eq!(reg.len(), 1);
        assert!(reg.get(ProviderKind::Kimi).is_none());

        let glm = reg.get(ProviderKind::Glm).unwrap();
        let resp = glm
            .complete(CompletionRequest { prompt: "hi".into(), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(resp.content, "echo: hi");
    }

    #[test]
    fn limits_default_and_override() {
        let limits = ProviderLimits::load_from(|_| None);
        assert_eq!(limits.for_kind(ProviderKind::Glm), 8);
        assert_eq!(limits.for_kind(ProviderKind::Kimi), 4);

        let limits = ProviderLimits::load_from(|name| {
            (name == "EXAI_WS_KIMI_MAX_INFLIGHT").then(|| "2".to_string())
        });
        assert_eq!(limits.for_kind(ProviderKind::Kimi), 2);
    }
}
