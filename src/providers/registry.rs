//! Provider registry: name → adapter plus model → capable-provider lookup.
//!
//! Registrations are startup-time events; lookups happen per request, so the
//! maps sit behind a reader-preferring `RwLock` and hand out cheap
//! `Arc<dyn Provider>` clones.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::Provider;

#[derive(Default)]
struct RegistryInner {
    /// Registration order, preserved for `model_based` determinism.
    ordered: Vec<Arc<dyn Provider>>,
    by_name: HashMap<String, usize>,
}

#[derive(Default)]
pub struct ProviderRegistry {
    inner: RwLock<RegistryInner>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a provider under its own name.
    pub async fn register(&self, provider: Arc<dyn Provider>) {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let name = provider.name().to_string();
        match inner.by_name.get(&name) {
            Some(&idx) => inner.ordered[idx] = provider,
            None => {
                inner.ordered.push(provider);
                inner.by_name.insert(name, inner.ordered.len() - 1);
            }
        }
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let Some(idx) = inner.by_name.remove(name) else {
            return false;
        };
        inner.ordered.remove(idx);
        // Reindex everything after the removed slot.
        inner.by_name.clear();
        for (i, p) in inner.ordered.iter().enumerate() {
            inner.by_name.insert(p.name().to_string(), i);
        }
        true
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        let inner = self.inner.read().await;
        inner.by_name.get(name).map(|&idx| inner.ordered[idx].clone())
    }

    /// Providers that claim `model`, in registration order.
    pub async fn providers_for_model(&self, model: &str) -> Vec<Arc<dyn Provider>> {
        let inner = self.inner.read().await;
        inner
            .ordered
            .iter()
            .filter(|p| p.validate_model(model))
            .cloned()
            .collect()
    }

    pub async fn all(&self) -> Vec<Arc<dyn Provider>> {
        self.inner.read().await.ordered.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::{ChatRequest, ChatResponse};
    use crate::providers::{ModelInfo, ProviderError};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug)]
    struct FakeProvider {
        name: String,
        models: Vec<String>,
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn chat_completion(
            &self,
            _req: &ChatRequest,
            _cancel: &CancellationToken,
        ) -> Result<ChatResponse, ProviderError> {
            Err(ProviderError::Network("fake".into()))
        }

        fn is_available(&self) -> bool {
            true
        }

        fn validate_model(&self, model: &str) -> bool {
            self.models.iter().any(|m| m == model)
        }

        fn get_model_info(&self, model: &str) -> Option<ModelInfo> {
            self.validate_model(model).then(|| ModelInfo {
                id: model.to_string(),
                max_tokens: 4096,
                context_window: 4096,
                prompt_token_price: Decimal::ZERO,
                completion_token_price: Decimal::ZERO,
                supports_chat: true,
                supports_functions: false,
                supports_vision: false,
            })
        }

        fn list_models(&self) -> Vec<ModelInfo> {
            self.models
                .iter()
                .filter_map(|m| self.get_model_info(m))
                .collect()
        }
    }

    fn fake(name: &str, models: &[&str]) -> Arc<dyn Provider> {
        Arc::new(FakeProvider {
            name: name.to_string(),
            models: models.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ProviderRegistry::new();
        registry.register(fake("openai", &["gpt-4"])).await;
        assert!(registry.get("openai").await.is_some());
        assert!(registry.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_model_lookup_preserves_registration_order() {
        let registry = ProviderRegistry::new();
        registry.register(fake("primary", &["gpt-4"])).await;
        registry.register(fake("secondary", &["gpt-4", "gpt-3.5-turbo"])).await;

        let capable = registry.providers_for_model("gpt-4").await;
        assert_eq!(capable.len(), 2);
        assert_eq!(capable[0].name(), "primary");
        assert_eq!(capable[1].name(), "secondary");

        let only = registry.providers_for_model("gpt-3.5-turbo").await;
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].name(), "secondary");
    }

    #[tokio::test]
    async fn test_reregister_replaces_in_place() {
        let registry = ProviderRegistry::new();
        registry.register(fake("openai", &["gpt-4"])).await;
        registry.register(fake("openai", &["gpt-4o"])).await;

        assert_eq!(registry.all().await.len(), 1);
        assert!(registry.providers_for_model("gpt-4").await.is_empty());
        assert_eq!(registry.providers_for_model("gpt-4o").await.len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_reindexes() {
        let registry = ProviderRegistry::new();
        registry.register(fake("a", &["m1"])).await;
        registry.register(fake("b", &["m1"])).await;
        registry.register(fake("c", &["m1"])).await;

        assert!(registry.unregister("b").await);
        assert!(!registry.unregister("b").await);

        let capable = registry.providers_for_model("m1").await;
        assert_eq!(capable.len(), 2);
        assert_eq!(capable[0].name(), "a");
        assert_eq!(capable[1].name(), "c");
        assert!(registry.get("c").await.is_some());
    }
}
