//! Composite embedding service
//!
//! Owns one active provider plus configured alternates. Construction probes
//! the preferred provider and falls back in declared order; the winning
//! provider's model is registered in the store as the single active embedding
//! model. A small LRU caches query embeddings so repeated searches do not
//! re-embed the same text.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::config::{EmbeddingConfig, ProviderKind};
use crate::storage::Store;

use super::{EmbeddingError, EmbeddingProvider, OllamaProvider, OpenAiProvider, Result};

/// Query-embedding cache capacity
const QUERY_CACHE_SIZE: usize = 100;

/// Metadata returned alongside embedding vectors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingMetadata {
    pub model: String,
    pub dimensions: usize,
    /// Whether the vector came from the query cache
    pub cached: bool,
}

/// Composite embedding service with fallback
pub struct EmbeddingService {
    providers: Vec<Arc<dyn EmbeddingProvider>>,
    active: RwLock<usize>,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingService {
    /// Build providers from config and connect, falling back in declared
    /// order. Fails with `ProviderUnavailable` when nothing answers.
    pub async fn connect(config: &EmbeddingConfig, store: &Store) -> Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let local: Arc<dyn EmbeddingProvider> =
            Arc::new(OllamaProvider::new(&config.ollama_url, &config.model, timeout));
        let remote: Arc<dyn EmbeddingProvider> = Arc::new(OpenAiProvider::new(
            &config.remote_url,
            &config.remote_model,
            &config.resolve_api_key().unwrap_or_default(),
            timeout,
        ));

        let providers = match config.provider {
            ProviderKind::Ollama => vec![local, remote],
            ProviderKind::OpenAi => vec![remote, local],
        };

        Self::with_providers(providers, store).await
    }

    /// Connect over an explicit provider list (preferred first)
    pub async fn with_providers(
        providers: Vec<Arc<dyn EmbeddingProvider>>,
        store: &Store,
    ) -> Result<Self> {
        let mut active = None;
        for (i, provider) in providers.iter().enumerate() {
            if provider.is_available().await {
                active = Some(i);
                break;
            }
            tracing::warn!(
                provider = provider.name(),
                model = provider.model(),
                "Embedding provider unavailable, trying next"
            );
        }

        let active = active.ok_or_else(|| {
            EmbeddingError::ProviderUnavailable("no embedding provider answered its probe".into())
        })?;

        let service = Self {
            providers,
            active: RwLock::new(active),
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_SIZE).expect("cache size is non-zero"),
            )),
        };
        service.register_active(store);
        Ok(service)
    }

    fn active_index(&self) -> usize {
        *self.active.read().unwrap_or_else(|e| e.into_inner())
    }

    /// The currently active provider
    pub fn active_provider(&self) -> Arc<dyn EmbeddingProvider> {
        self.providers[self.active_index()].clone()
    }

    /// `provider:model` id of the active model
    pub fn get_active_model_id(&self) -> String {
        let provider = self.active_provider();
        format!("{}:{}", provider.name(), provider.model())
    }

    /// Active output dimensionality
    pub fn dimensions(&self) -> usize {
        self.active_provider().dimensions()
    }

    fn register_active(&self, store: &Store) {
        let provider = self.active_provider();
        let id = self.get_active_model_id();
        if let Err(e) =
            store.register_active_model(&id, provider.name(), provider.model(), provider.dimensions())
        {
            tracing::warn!(error = %e, model = %id, "Failed to register active embedding model");
        } else {
            tracing::info!(model = %id, dimensions = provider.dimensions(), "Active embedding model registered");
        }
    }

    /// Probe the named provider and switch to it atomically. The previous
    /// provider stays active when the probe fails.
    pub async fn switch_provider(&self, name: &str, store: &Store) -> Result<()> {
        let target = self
            .providers
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| {
                EmbeddingError::ProviderUnavailable(format!("no provider named '{}'", name))
            })?;

        if !self.providers[target].is_available().await {
            return Err(EmbeddingError::ProviderUnavailable(format!(
                "provider '{}' failed its probe",
                name
            )));
        }

        *self.active.write().unwrap_or_else(|e| e.into_inner()) = target;
        if let Ok(mut cache) = self.query_cache.lock() {
            cache.clear();
        }
        self.register_active(store);
        Ok(())
    }

    /// Embed a single text. Query-cached.
    pub async fn embed(&self, text: &str) -> Result<(Vec<f32>, EmbeddingMetadata)> {
        let provider = self.active_provider();

        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some(vector) = cache.get(text) {
                return Ok((
                    vector.clone(),
                    EmbeddingMetadata {
                        model: self.get_active_model_id(),
                        dimensions: provider.dimensions(),
                        cached: true,
                    },
                ));
            }
        }

        let vector = provider.embed(text).await?;
        if let Ok(mut cache) = self.query_cache.lock() {
            cache.put(text.to_string(), vector.clone());
        }

        Ok((
            vector,
            EmbeddingMetadata {
                model: self.get_active_model_id(),
                dimensions: provider.dimensions(),
                cached: false,
            },
        ))
    }

    /// Embed a batch of texts. Not query-cached; batches come from the
    /// pipeline where the cache-key reuse layer already deduplicates.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, EmbeddingMetadata)> {
        let provider = self.active_provider();
        let vectors = provider.embed_batch(texts).await?;
        Ok((
            vectors,
            EmbeddingMetadata {
                model: self.get_active_model_id(),
                dimensions: provider.dimensions(),
                cached: false,
            },
        ))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Deterministic in-process provider for tests
    pub struct StubProvider {
        pub name: &'static str,
        pub model: &'static str,
        pub dims: usize,
        pub available: bool,
        pub calls: AtomicUsize,
    }

    impl StubProvider {
        fn new(name: &'static str, available: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                model: "stub-model",
                dims: 4,
                available,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EmbeddingProvider for StubProvider {
        fn name(&self) -> &str {
            self.name
        }
        fn model(&self) -> &str {
            self.model
        }
        fn dimensions(&self) -> usize {
            self.dims
        }
        async fn is_available(&self) -> bool {
            self.available
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let seed = text.len() as f32;
            Ok(vec![seed, seed + 1.0, seed + 2.0, seed + 3.0])
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed(t).await?);
            }
            Ok(out)
        }
    }

    fn test_store() -> (TempDir, Store) {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("memories.db")).unwrap();
        (temp, store)
    }

    #[tokio::test]
    async fn falls_back_in_declared_order() {
        let (_temp, store) = test_store();
        let dead = StubProvider::new("dead", false) as Arc<dyn EmbeddingProvider>;
        let alive = StubProvider::new("alive", true) as Arc<dyn EmbeddingProvider>;
        let service =
            EmbeddingService::with_providers(vec![dead, alive], &store).await.unwrap();

        assert_eq!(service.get_active_model_id(), "alive:stub-model");
        let registered = store.active_model().unwrap().unwrap();
        assert_eq!(registered.id, "alive:stub-model");
        assert_eq!(registered.dimensions, 4);
    }

    #[tokio::test]
    async fn all_dead_is_provider_unavailable() {
        let (_temp, store) = test_store();
        let result = EmbeddingService::with_providers(
            vec![
                StubProvider::new("a", false) as Arc<dyn EmbeddingProvider>,
                StubProvider::new("b", false) as Arc<dyn EmbeddingProvider>,
            ],
            &store,
        )
        .await;
        assert!(matches!(result, Err(EmbeddingError::ProviderUnavailable(_))));
    }

    #[tokio::test]
    async fn query_cache_skips_repeat_embeds() {
        let (_temp, store) = test_store();
        let provider = StubProvider::new("alive", true);
        let service = EmbeddingService::with_providers(
            vec![provider.clone() as Arc<dyn EmbeddingProvider>],
            &store,
        )
        .await
        .unwrap();

        let (first, meta) = service.embed("same query").await.unwrap();
        assert!(!meta.cached);
        let (second, meta) = service.embed("same query").await.unwrap();
        assert!(meta.cached);
        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn switch_to_dead_provider_fails_and_keeps_active() {
        let (_temp, store) = test_store();
        let alive = StubProvider::new("alive", true) as Arc<dyn EmbeddingProvider>;
        let dead = StubProvider::new("dead", false) as Arc<dyn EmbeddingProvider>;
        let service =
            EmbeddingService::with_providers(vec![alive, dead], &store).await.unwrap();

        let result = service.switch_provider("dead", &store).await;
        assert!(matches!(result, Err(EmbeddingError::ProviderUnavailable(_))));
        assert_eq!(service.get_active_model_id(), "alive:stub-model");

        // Unknown name is also a refusal
        assert!(service.switch_provider("unknown", &store).await.is_err());
    }
}
