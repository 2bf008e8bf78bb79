//! Remote OpenAI-compatible embedding provider
//!
//! Protocol:
//! - `GET {base}/v1/models` (bearer auth, availability)
//! - `POST {base}/v1/embeddings` with `{"model", "input": string|[string]}` →
//!   `{"data": [{"embedding", "index"}], "model", "usage"}`
//!
//! Dimensions come from a known-model table, defaulting to 1536. Batch
//! embedding is a single bulk request.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{EmbeddingError, EmbeddingProvider, Result};

/// Fallback dimensionality for unknown models
const DEFAULT_DIMENSIONS: usize = 1536;

/// Known output dimensions per model
pub fn known_dimensions(model: &str) -> usize {
    match model {
        "text-embedding-3-small" => 1536,
        "text-embedding-3-large" => 3072,
        "text-embedding-ada-002" => 1536,
        _ => DEFAULT_DIMENSIONS,
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    index: usize,
}

/// Remote HTTP embedding provider
pub struct OpenAiProvider {
    base_url: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
    dimensions: usize,
}

impl OpenAiProvider {
    pub fn new(base_url: &str, model: &str, api_key: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
            client,
            dimensions: known_dimensions(model),
        }
    }

    async fn request(&self, input: serde_json::Value) -> Result<Vec<EmbeddingDatum>> {
        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "model": self.model, "input": input }))
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

        let body: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
        Ok(body.data)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn is_available(&self) -> bool {
        match self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "Remote embedding API unreachable");
                false
            }
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut data = self.request(serde_json::Value::String(text.to_string())).await?;
        data.pop()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbeddingError::InvalidResponse("empty data array".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let input = serde_json::json!(texts);
        let mut data = self.request(input).await?;
        if data.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                data.len()
            )));
        }
        // The API may return out of input order; index is authoritative
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_dimension_table() {
        assert_eq!(known_dimensions("text-embedding-3-small"), 1536);
        assert_eq!(known_dimensions("text-embedding-3-large"), 3072);
        assert_eq!(known_dimensions("text-embedding-ada-002"), 1536);
        assert_eq!(known_dimensions("some-future-model"), 1536);
    }

    #[test]
    fn provider_dimensions_follow_model() {
        let provider = OpenAiProvider::new(
            "https://api.openai.com/",
            "text-embedding-3-large",
            "sk-test",
            Duration::from_secs(5),
        );
        assert_eq!(provider.dimensions(), 3072);
        assert_eq!(provider.base_url, "https://api.openai.com");
    }

    #[tokio::test]
    async fn unreachable_api_is_unavailable() {
        let provider = OpenAiProvider::new(
            "http://127.0.0.1:1",
            "text-embedding-3-small",
            "sk-test",
            Duration::from_millis(200),
        );
        assert!(!provider.is_available().await);
    }
}
