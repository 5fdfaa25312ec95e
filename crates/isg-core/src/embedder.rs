//! Embedding generation for nodes, patterns and retrieval queries.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::{EmbeddingConfig, DEFAULT_HTTP_EMBED_MODEL, DEFAULT_HTTP_EMBED_URL};

/// Errors that can occur while embedding text.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// Local model failed to load or run.
    #[error("Embedding model error: {0}")]
    Model(String),

    /// Remote endpoint unreachable.
    #[error("Embedding request failed: {0}")]
    Network(String),

    /// Remote endpoint answered with an error.
    #[error("Embedding API returned error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Response did not match the request.
    #[error("Malformed embedding response: {0}")]
    Response(String),

    #[error("Unknown embedding provider: {0}")]
    UnknownProvider(String),
}

impl From<reqwest::Error> for EmbedError {
    fn from(err: reqwest::Error) -> Self {
        EmbedError::Network(err.to_string())
    }
}

/// Trait for embedding generation.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embeddings for a batch of text.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    /// Get the embedding dimension.
    fn dimension(&self) -> usize;

    /// Get the model name.
    fn model_name(&self) -> &str;

    /// Embed a single text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::Response("empty batch result".to_string()))
    }
}

/// Build the embedder named by the configuration.
pub fn from_config(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, EmbedError> {
    match config.provider.as_str() {
        "fastembed" => Ok(Arc::new(FastEmbedder::new()?)),
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dimension))),
        "openai-compatible" | "openai" => Ok(Arc::new(HttpEmbedder::new(
            config.base_url.as_deref().unwrap_or(DEFAULT_HTTP_EMBED_URL),
            config.api_key.clone().unwrap_or_default(),
            config.model.as_deref().unwrap_or(DEFAULT_HTTP_EMBED_MODEL),
        ))),
        other => Err(EmbedError::UnknownProvider(other.to_string())),
    }
}

// ============================================================================
// FastEmbed (local BGE-Small)
// ============================================================================

/// FastEmbed-based embedder using the BGE-Small model.
pub struct FastEmbedder {
    model: Arc<TextEmbedding>,
    dimension: usize,
    model_name: String,
}

impl FastEmbedder {
    /// Create a new embedder with the default model, cached in `~/.isg/cache/`.
    pub fn new() -> Result<Self, EmbedError> {
        Self::with_model_and_cache(EmbeddingModel::BGESmallENV15, Self::default_cache_dir())
    }

    pub fn with_model_and_cache(model: EmbeddingModel, cache_dir: PathBuf) -> Result<Self, EmbedError> {
        let model_name = format!("{:?}", model);

        std::fs::create_dir_all(&cache_dir)
            .map_err(|e| EmbedError::Model(format!("Failed to create cache directory: {}", e)))?;

        let text_embedding = TextEmbedding::try_new(
            InitOptions::new(model)
                .with_cache_dir(cache_dir)
                .with_show_download_progress(true),
        )
        .map_err(|e| EmbedError::Model(e.to_string()))?;

        let sample = text_embedding
            .embed(vec!["dimension"], None)
            .map_err(|e| EmbedError::Model(e.to_string()))?;
        let dimension = sample.first().map(|v| v.len()).unwrap_or(384);

        Ok(Self {
            model: Arc::new(text_embedding),
            dimension,
            model_name,
        })
    }

    fn default_cache_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".isg")
            .join("cache")
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || model.embed(texts, None))
            .await
            .map_err(|e| EmbedError::Model(e.to_string()))?
            .map_err(|e| EmbedError::Model(e.to_string()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

// ============================================================================
// OpenAI-compatible HTTP endpoint
// ============================================================================

/// Embedder for any endpoint implementing the OpenAI `/embeddings` API.
pub struct HttpEmbedder {
    base_url: String,
    api_key: String,
    model: String,
    client: Client,
    dimension: parking_lot::Mutex<usize>,
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            client: Client::new(),
            dimension: parking_lot::Mutex::new(0),
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.base_url);
        let mut req = self.client.post(&url).header("content-type", "application/json");
        if !self.api_key.is_empty() {
            req = req.header("authorization", format!("Bearer {}", self.api_key));
        }

        let response = req
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EmbedError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let mut body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::Response(e.to_string()))?;
        if body.data.len() != texts.len() {
            return Err(EmbedError::Response(format!(
                "asked for {} embeddings, got {}",
                texts.len(),
                body.data.len()
            )));
        }
        body.data.sort_by_key(|d| d.index);

        if let Some(first) = body.data.first() {
            *self.dimension.lock() = first.embedding.len();
        }
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }

    /// Known after the first successful request; 0 before.
    fn dimension(&self) -> usize {
        *self.dimension.lock()
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Feature hashing (offline)
// ============================================================================

/// Deterministic feature-hashing embedder.
///
/// Identifier tokens (split on non-alphanumerics and `snake_case`/`CamelCase`
/// boundaries) and their character trigrams are hashed into a fixed number
/// of signed buckets, then L2-normalised. Needs no model download.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Embed synchronously.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in tokens(text) {
            self.add_feature(&mut vector, &token, 1.0);
            let chars: Vec<char> = token.chars().collect();
            if chars.len() > 3 {
                for window in chars.windows(3) {
                    let gram: String = window.iter().collect();
                    self.add_feature(&mut vector, &format!("#{gram}"), 0.5);
                }
            }
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "feature-hash"
    }
}

/// Lowercased identifier tokens.
fn tokens(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        let mut current = String::new();
        let mut prev_lower = false;
        for c in word.chars() {
            if c.is_uppercase() && prev_lower && !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
            current.extend(c.to_lowercase());
        }
        if !current.is_empty() {
            out.push(current);
        }
    }
    out
}
