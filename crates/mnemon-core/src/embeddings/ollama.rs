//! Local Ollama-compatible embedding provider
//!
//! Protocol:
//! - `GET {base}/api/tags` → `{"models": [{"name": ...}]}` (availability)
//! - `POST {base}/api/embeddings` with `{"model", "prompt"}` → `{"embedding": [f32]}`
//!
//! Dimensions are auto-detected with a single probe embedding and cached for
//! the process lifetime. Batch embedding is implemented as parallel single
//! embeds; the local server queues them internally.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{EmbeddingError, EmbeddingProvider, Result};

/// Text used for the one-off dimension probe
const PROBE_TEXT: &str = "dimension probe";

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Local HTTP embedding provider
pub struct OllamaProvider {
    base_url: String,
    model: String,
    client: reqwest::Client,
    dimensions: OnceLock<usize>,
}

impl OllamaProvider {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            dimensions: OnceLock::new(),
        }
    }

    async fn embed_raw(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&serde_json::json!({ "model": self.model, "prompt": text }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

        if body.embedding.is_empty() {
            return Err(EmbeddingError::InvalidResponse(
                "empty embedding vector".to_string(),
            ));
        }
        Ok(body.embedding)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions.get().copied().unwrap_or(0)
    }

    async fn is_available(&self) -> bool {
        let tags = match self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                response.json::<TagsResponse>().await.ok()
            }
            Ok(response) => {
                tracing::debug!(status = %response.status(), "Ollama tags probe failed");
                return false;
            }
            Err(e) => {
                tracing::debug!(error = %e, "Ollama unreachable");
                return false;
            }
        };

        if let Some(tags) = tags {
            // Tag names carry a ":latest"-style suffix; match on the stem
            let known = tags
                .models
                .iter()
                .any(|m| m.name == self.model || m.name.split(':').next() == Some(&self.model));
            if !known {
                tracing::warn!(model = %self.model, "Model not listed by Ollama; probing anyway");
            }
        }

        if self.dimensions.get().is_some() {
            return true;
        }

        // One probe embedding auto-detects dimensions
        match self.embed_raw(PROBE_TEXT).await {
            Ok(vector) => {
                let dims = vector.len();
                let _ = self.dimensions.set(dims);
                tracing::info!(model = %self.model, dimensions = dims, "Ollama provider ready");
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "Ollama probe embedding failed");
                false
            }
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self.embed_raw(text).await?;
        // First successful embed also settles dimensions
        let _ = self.dimensions.set(vector.len());
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let futures = texts.iter().map(|t| self.embed_raw(t));
        let results = futures::future::join_all(futures).await;

        let mut vectors = Vec::with_capacity(texts.len());
        for result in results {
            vectors.push(result?);
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let provider = OllamaProvider::new(
            "http://localhost:11434/",
            "nomic-embed-text",
            Duration::from_secs(5),
        );
        assert_eq!(provider.base_url, "http://localhost:11434");
        assert_eq!(provider.name(), "ollama");
        assert_eq!(provider.model(), "nomic-embed-text");
    }

    #[test]
    fn dimensions_default_to_unprobed() {
        let provider =
            OllamaProvider::new("http://localhost:11434", "nomic-embed-text", Duration::from_secs(5));
        assert_eq!(provider.dimensions(), 0);
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        // Port 1 is never listening
        let provider =
            OllamaProvider::new("http://127.0.0.1:1", "nomic-embed-text", Duration::from_millis(200));
        assert!(!provider.is_available().await);
    }
}
