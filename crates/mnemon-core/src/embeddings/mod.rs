//! Embedding Providers
//!
//! A uniform capability set over a local Ollama-compatible server and a
//! remote OpenAI-compatible API, plus the composite [`EmbeddingService`]
//! that owns the active provider, handles fallback, and registers the active
//! model in the store.
//!
//! Failure model: network errors, timeouts, and 5xx responses are
//! *refundable* (the pipeline rate limiter returns the borrowed token);
//! 4xx responses (429 included) are not.

mod ollama;
mod openai;
mod service;

pub use ollama::OllamaProvider;
pub use openai::{known_dimensions, OpenAiProvider};
pub use service::{EmbeddingMetadata, EmbeddingService};

use async_trait::async_trait;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Embedding error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    /// Connection-level failure (DNS, refused, reset)
    #[error("Network error: {0}")]
    Network(String),
    /// Request deadline exceeded
    #[error("Request timed out")]
    Timeout,
    /// Non-success HTTP status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    /// Body did not match the provider protocol
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    /// Availability probe failed for every configured provider, or for the
    /// target of a switch
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),
}

impl EmbeddingError {
    /// Whether the rate-limit token borrowed for this request should be
    /// returned. Network/timeout/5xx are transient; 4xx (429 included) are
    /// the caller's quota being consumed for real.
    pub fn is_refundable(&self) -> bool {
        match self {
            EmbeddingError::Network(_) | EmbeddingError::Timeout => true,
            EmbeddingError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for EmbeddingError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EmbeddingError::Timeout
        } else {
            EmbeddingError::Network(e.to_string())
        }
    }
}

/// Embedding result type
pub type Result<T> = std::result::Result<T, EmbeddingError>;

// ============================================================================
// PROVIDER CAPABILITY SET
// ============================================================================

/// Capability set every embedding backend implements
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Stable provider name ("ollama", "openai")
    fn name(&self) -> &str;

    /// Model identifier within the provider
    fn model(&self) -> &str;

    /// Output dimensionality. For the local provider this is only known
    /// after a successful availability probe; 0 means "not probed yet".
    fn dimensions(&self) -> usize;

    /// Probe the backend. For the local provider this also auto-detects
    /// dimensions, cached for the process lifetime.
    async fn is_available(&self) -> bool;

    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts, one vector per input in input order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ============================================================================
// SIMILARITY
// ============================================================================

/// Cosine similarity between two vectors.
///
/// Returns 0.0 on dimension mismatch or zero magnitude.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = (norm_a * norm_b).sqrt();
    if denominator > 0.0 {
        dot / denominator
    } else {
        0.0
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical() {
        let a = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 0.0001);
    }

    #[test]
    fn cosine_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 0.0001);
    }

    #[test]
    fn cosine_dimension_mismatch_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
    }

    #[test]
    fn cosine_zero_magnitude_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn refund_classification() {
        assert!(EmbeddingError::Timeout.is_refundable());
        assert!(EmbeddingError::Network("reset".into()).is_refundable());
        assert!(EmbeddingError::Http {
            status: 503,
            message: "overloaded".into()
        }
        .is_refundable());
        assert!(!EmbeddingError::Http {
            status: 429,
            message: "rate limited".into()
        }
        .is_refundable());
        assert!(!EmbeddingError::Http {
            status: 400,
            message: "bad request".into()
        }
        .is_refundable());
        assert!(!EmbeddingError::InvalidResponse("garbage".into()).is_refundable());
    }
}
