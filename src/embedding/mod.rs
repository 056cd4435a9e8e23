//! Text embedding generation
//!
//! Supports two backends behind one trait:
//! - OpenAI API (text-embedding-3-small)
//! - Deterministic feature-hashing fallback (no external dependencies)
//!
//! All backends return unit-norm vectors, so cosine similarity is the
//! shared scoring contract.

mod vision;

pub use vision::VisionEmbedder;

use std::sync::Arc;

use crate::error::{RecollectError, Result};
use crate::types::AppConfig;

/// Trait for text embedding generators
pub trait TextEmbedder: Send + Sync {
    /// Generate embedding for a single text
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_batch(&[text])?.remove(0))
    }

    /// Generate same-order embeddings for multiple texts
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Get embedding dimensions
    fn dimensions(&self) -> usize;

    /// Get model name
    fn model_name(&self) -> &str;
}

/// OpenAI embedding client
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimensions: usize,
}

/// Bounded parallelism for large batches: at most this many embedding
/// requests in flight at once
const EMBED_CONCURRENCY: usize = 4;

/// Inputs per API request
const API_BATCH: usize = 512;

impl OpenAiEmbedder {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            dimensions: 1536,
        }
    }

    /// Async batch embedding with bounded request concurrency.
    ///
    /// Empty inputs are coerced to a single space so the API never sees
    /// an ill-formed request for an otherwise valid batch.
    pub async fn embed_batch_async(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let coerced: Vec<&str> = texts
            .iter()
            .map(|t| if t.is_empty() { " " } else { *t })
            .collect();

        use futures::StreamExt;
        let results: Vec<Result<Vec<Vec<f32>>>> =
            futures::stream::iter(coerced.chunks(API_BATCH).map(|chunk| self.request(chunk)))
                .buffered(EMBED_CONCURRENCY)
                .collect()
                .await;

        let mut all = Vec::with_capacity(texts.len());
        for result in results {
            all.extend(result?);
        }
        Ok(all)
    }

    async fn request(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "input": inputs,
                "model": self.model,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RecollectError::Embedding(format!(
                "embedding API error {}: {}",
                status, body
            )));
        }

        let data: serde_json::Value = response.json().await?;
        let embeddings: Vec<Vec<f32>> = data["data"]
            .as_array()
            .ok_or_else(|| RecollectError::Embedding("invalid response format".to_string()))?
            .iter()
            .map(|item| {
                item["embedding"]
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_f64().map(|f| f as f32))
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect();

        if embeddings.len() != inputs.len() {
            return Err(RecollectError::Embedding(format!(
                "embedding count mismatch: sent {}, got {}",
                inputs.len(),
                embeddings.len()
            )));
        }
        Ok(embeddings)
    }
}

impl TextEmbedder for OpenAiEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        // Blocking call for sync interface
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(self.embed_batch_async(texts))
        })
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Deterministic feature-hashing embedder.
///
/// Tokenizes on non-alphanumerics, hashes each token into a fixed-size
/// bucket space, and L2-normalizes. No semantic power, but stable across
/// runs and process boundaries, which makes it usable offline and in
/// tests.
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl TextEmbedder for HashingEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "feature-hashing"
    }
}

impl HashingEmbedder {
    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimensions];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = fnv1a(token) as usize % self.dimensions;
            vector[bucket] += 1.0;
        }
        normalize(&mut vector);
        vector
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in s.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x1000_0000_01b3);
    }
    hash
}

fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Create a text embedder from configuration: OpenAI when credentials
/// are present, feature-hashing otherwise.
pub fn create_text_embedder(config: &AppConfig) -> Arc<dyn TextEmbedder> {
    match &config.openai_api_key {
        Some(key) => Arc::new(OpenAiEmbedder::new(
            key.clone(),
            config.embedding_model.clone(),
        )),
        None => {
            tracing::warn!("no embedding credentials; falling back to feature-hashing vectors");
            Arc::new(HashingEmbedder::new(256))
        }
    }
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Serialize a vector as little-endian f32 bytes for BLOB storage
pub fn vector_to_bytes(v: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(v.len() * 4);
    for value in v {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Inverse of [`vector_to_bytes`]
pub fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
