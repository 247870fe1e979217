//! Registry of configured backends: lookup by id, health bookkeeping, and the
//! stable ordering the request manager's tie-breaking relies on.

use crate::providers::Provider;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("provider already registered: {0}")]
    DuplicateId(String),
}

struct Entry {
    provider: Arc<dyn Provider>,
    healthy: bool,
}

/// Holds the configured providers in registration order.
///
/// Health here is an operator-level flag (e.g. flipped by an external health
/// check or an admin action), distinct from the circuit breaker's
/// failure-driven gating.
pub struct ProviderRegistry {
    entries: Mutex<Vec<Entry>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register a backend. Ids must be unique; replacing a provider means
    /// registering a new descriptor under a new id.
    pub fn register(&self, provider: Arc<dyn Provider>) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock().unwrap();
        let id = provider.descriptor().id.clone();
        if entries.iter().any(|e| e.provider.descriptor().id == id) {
            return Err(RegistryError::DuplicateId(id));
        }
        info!(provider_id = %id, name = %provider.descriptor().name, "provider registered");
        entries.push(Entry {
            provider,
            healthy: true,
        });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .find(|e| e.provider.descriptor().id == id)
            .map(|e| Arc::clone(&e.provider))
    }

    /// Providers currently flagged healthy, in registration order.
    pub fn healthy_providers(&self) -> Vec<Arc<dyn Provider>> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|e| e.healthy)
            .map(|e| Arc::clone(&e.provider))
            .collect()
    }

    pub fn all_providers(&self) -> Vec<Arc<dyn Provider>> {
        let entries = self.entries.lock().unwrap();
        entries.iter().map(|e| Arc::clone(&e.provider)).collect()
    }

    /// Flip the health flag for `id`. Returns false if the id is unknown.
    pub fn set_healthy(&self, id: &str, healthy: bool) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries
            .iter_mut()
            .find(|e| e.provider.descriptor().id == id)
        {
            Some(entry) => {
                if entry.healthy != healthy {
                    info!(provider_id = id, healthy, "provider health changed");
                }
                entry.healthy = healthy;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all registered providers, useful for diagnostics.
    pub fn ids(&self) -> HashSet<String> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .map(|e| e.provider.descriptor().id.clone())
            .collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderError;
    use crate::types::{
        CompletionRequest, CompletionResponse, ProviderDescriptor, ProviderKind, StreamChunk,
    };
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};

    struct StubProvider {
        descriptor: ProviderDescriptor,
    }

    impl StubProvider {
        fn arc(id: &str) -> Arc<dyn Provider> {
            Arc::new(Self {
                descriptor: ProviderDescriptor::new(id, id, ProviderKind::Custom),
            })
        }
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn descriptor(&self) -> &ProviderDescriptor {
            &self.descriptor
        }

        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            Err(ProviderError::Other("stub".into()))
        }

        fn stream_complete(
            &self,
            _request: &CompletionRequest,
        ) -> BoxStream<'static, Result<StreamChunk, ProviderError>> {
            Box::pin(stream::empty())
        }
    }

    #[test]
    fn register_and_get_by_id() {
        let registry = ProviderRegistry::new();
        registry.register(StubProvider::arc("a")).unwrap();
        registry.register(StubProvider::arc("b")).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("a").is_some());
        assert!(registry.get("missing").is_none());
        assert!(registry.ids().contains("b"));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let registry = ProviderRegistry::new();
        registry.register(StubProvider::arc("a")).unwrap();
        let err = registry.register(StubProvider::arc("a")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(id) if id == "a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn healthy_providers_preserve_registration_order() {
        let registry = ProviderRegistry::new();
        for id in ["a", "b", "c"] {
            registry.register(StubProvider::arc(id)).unwrap();
        }
        registry.set_healthy("b", false);

        let healthy: Vec<String> = registry
            .healthy_providers()
            .iter()
            .map(|p| p.descriptor().id.clone())
            .collect();
        assert_eq!(healthy, vec!["a", "c"]);
        assert_eq!(registry.all_providers().len(), 3);
    }

    #[test]
    fn set_healthy_unknown_id_returns_false() {
        let registry = ProviderRegistry::new();
        assert!(!registry.set_healthy("nope", false));
    }
}
