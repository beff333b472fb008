//! Query Embedder
//!
//! Embeds free text using an OpenAI-compatible embeddings API.

use crate::config::{PipelineConfig, DUMMY_API_KEY};
use crate::error::{PipelineError, Result};
use crate::schema_rag::vector_store::Embedding;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Text → fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Embedding>;

    /// Length of every vector this embedder returns.
    fn dimension(&self) -> usize;
}

/// Embedding client using the OpenAI API
pub struct OpenAiEmbedder {
    api_key: String,
    base_url: String,
    model: String, // e.g., "text-embedding-3-small"
    dimension: usize,
    timeout: Duration,
    http: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            api_key,
            base_url,
            model,
            dimension,
            timeout,
            http,
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(
            config.api_key.clone(),
            config.base_url.clone(),
            config.embedding_model.clone(),
            config.embedding_dim,
            config.timeouts.embedding,
        )
    }

    async fn embed_remote(&self, text: &str) -> Result<Embedding> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let response = self
            .http
            .post(&format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PipelineError::Timeout {
                        stage: "embedding".to_string(),
                        elapsed_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    PipelineError::EmbeddingFailed {
                        message: format!("Embedding API call failed: {}", e),
                        retryable: e.is_connect(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PipelineError::EmbeddingFailed {
                message: format!("Embedding API error ({}): {}", status, error_text),
                retryable: status.is_server_error() || status.as_u16() == 429,
            });
        }

        let response_json: serde_json::Value = response.json().await.map_err(|e| {
            PipelineError::EmbeddingFailed {
                message: format!("Failed to parse embedding response: {}", e),
                retryable: false,
            }
        })?;

        let data = response_json
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|arr| arr.first())
            .ok_or_else(|| PipelineError::EmbeddingFailed {
                message: "No embedding data in response".to_string(),
                retryable: false,
            })?;

        let embedding: Embedding = data
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| PipelineError::EmbeddingFailed {
                message: "No embedding vector in response".to_string(),
                retryable: false,
            })?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        Ok(embedding)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        if self.api_key == DUMMY_API_KEY {
            return Ok(hashed_embedding(text, self.dimension));
        }
        self.embed_remote(text).await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Offline bag-of-words embedding: each lowercase token is hashed into one
/// bucket, and the vector is L2-normalised. Texts that share vocabulary end
/// up close under cosine similarity.
pub fn hashed_embedding(text: &str, dimension: usize) -> Embedding {
    let mut vector = vec![0.0f32; dimension];
    if dimension == 0 {
        return vector;
    }
    for token in text
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
    {
        let mut hasher = DefaultHasher::new();
        token.to_lowercase().hash(&mut hasher);
        let bucket = (hasher.finish() % dimension as u64) as usize;
        vector[bucket] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
    vector
}
