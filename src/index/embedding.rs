//! Text embeddings and vector similarity.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::IndexError;

/// Turns text into a dense vector
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Human-readable embedder name
    fn name(&self) -> &str;

    /// Embed a piece of text
    async fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Embedder backed by an Ollama-compatible `/api/embeddings` endpoint
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OllamaEmbedder {
    /// Create an embedder for the given server and model
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            timeout,
        }
    }

    /// Model used for embeddings
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| IndexError::unavailable(format!("embedding request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(IndexError::unavailable(format!(
                "embedding endpoint returned HTTP {}",
                response.status()
            )));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| IndexError::unavailable(format!("invalid embedding response: {}", e)))?;

        if body.embedding.is_empty() {
            return Err(IndexError::unavailable("embedding endpoint returned an empty vector"));
        }
        Ok(body.embedding)
    }
}

/// Cosine similarity between two vectors, in [-1, 1]
///
/// Returns 0.0 for mismatched, empty or zero-magnitude vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut mag_a, mut mag_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }
    let denom = mag_a.sqrt() * mag_b.sqrt();
    if denom < f64::EPSILON {
        0.0
    } else {
        (dot / denom).clamp(-1.0, 1.0)
    }
}

/// Similarity score in [0, 1]: cosine similarity with negatives clamped to 0
pub fn similarity_score(a: &[f32], b: &[f32]) -> f64 {
    cosine_similarity(a, b).max(0.0)
}
