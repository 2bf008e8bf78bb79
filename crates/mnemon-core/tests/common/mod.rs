//! Shared test fixtures: a deterministic in-process embedding provider

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mnemon_core::embeddings::Result as EmbeddingResult;
use mnemon_core::{EmbeddingProvider, EmbeddingService, Store};

/// Deterministic embedding: token-hash buckets, L2-normalized. Similar texts
/// share buckets, so cosine similarity behaves like a crude real model.
pub fn toy_embedding(text: &str, dims: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dims];
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
    {
        let mut hash: u64 = 0xcbf29ce484222325;
        for b in token.to_lowercase().bytes() {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        vector[(hash % dims as u64) as usize] += 1.0;
    }
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

pub struct ToyProvider {
    pub dims: usize,
    pub batch_calls: AtomicUsize,
    pub single_calls: AtomicUsize,
}

impl ToyProvider {
    pub fn new(dims: usize) -> Arc<Self> {
        Arc::new(Self {
            dims,
            batch_calls: AtomicUsize::new(0),
            single_calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for ToyProvider {
    fn name(&self) -> &str {
        "toy"
    }

    fn model(&self) -> &str {
        "toy-model"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        Ok(toy_embedding(text, self.dims))
    }

    async fn embed_batch(&self, texts: &[String]) -> EmbeddingResult<Vec<Vec<f32>>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| toy_embedding(t, self.dims)).collect())
    }
}

/// An embedding service backed by the toy provider
pub async fn toy_service(store: &Arc<Store>, provider: Arc<ToyProvider>) -> Arc<EmbeddingService> {
    Arc::new(
        EmbeddingService::with_providers(vec![provider as Arc<dyn EmbeddingProvider>], store)
            .await
            .expect("toy provider is always available"),
    )
}
