//! Text embedding providers.
//!
//! `HttpEmbeddingProvider` speaks the OpenAI-compatible `/embeddings` API.
//! `HashingEmbedder` is a local, deterministic fallback used when no endpoint
//! is configured and in tests.

pub mod indexer;

pub use indexer::{EmbeddingIndexer, IndexReport};

use crate::selector::scoring::tokenize;
use crate::types::{EmbeddingConfig, Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

/// Something that turns text into vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Model identifier stored next to each vector.
    fn model_id(&self) -> &str;
}

pub type SharedEmbedder = Arc<dyn EmbeddingProvider>;

/// Pick the provider the configuration asks for.
pub fn from_config(config: &EmbeddingConfig) -> Result<SharedEmbedder> {
    match &config.endpoint {
        Some(endpoint) => Ok(Arc::new(HttpEmbeddingProvider::new(
            endpoint.clone(),
            config.api_key.clone(),
            config.model.clone(),
            config.request_timeout,
        )?)),
        None => Ok(Arc::new(HashingEmbedder::new(config.dimensions))),
    }
}

// =============================================================================
// Hashing embedder
// =============================================================================

/// Signed feature hashing over tokens and their character trigrams, L2-normalised.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
    model: String,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(8);
        Self {
            dimensions,
            model: format!("hashing-{}", dimensions),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut tokens: Vec<String> = tokenize(text).into_iter().collect();
        tokens.sort();

        let mut vector = vec![0.0f32; self.dimensions];
        for token in &tokens {
            self.add_feature(&mut vector, token.as_bytes(), 1.0);
        }
        // Character trigrams make near-spellings land close together.
        for token in &tokens {
            let chars: Vec<char> = token.chars().collect();
            for window in chars.windows(3) {
                let gram: String = window.iter().collect();
                self.add_feature(&mut vector, gram.as_bytes(), 0.5);
            }
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }

    fn add_feature(&self, vector: &mut [f32], bytes: &[u8], weight: f32) {
        let hash = fnv1a(bytes);
        let index = (hash % self.dimensions as u64) as usize;
        let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

// =============================================================================
// HTTP provider
// =============================================================================

/// OpenAI-compatible embeddings endpoint.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl std::fmt::Debug for HttpEmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEmbeddingProvider")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

impl HttpEmbeddingProvider {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        model: String,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal(format!("embedding client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            model,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self
            .client
            .post(format!("{}/embeddings", self.endpoint))
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
            }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(Error::upstream(format!("embedding provider returned {}", status)));
        }
        if !status.is_success() {
            return Err(Error::internal(format!(
                "embedding provider rejected request: {}",
                status
            )));
        }

        let mut body: EmbeddingResponse = response.json().await?;
        if body.data.len() != texts.len() {
            return Err(Error::upstream(format!(
                "embedding provider returned {} vectors for {} inputs",
                body.data.len(),
                texts.len()
            )));
        }
        body.data.sort_by_key(|d| d.index);
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
