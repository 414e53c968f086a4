//! Embedding providers.
//!
//! Supports an OpenAI-compatible HTTP endpoint and a deterministic offline
//! feature-hashing model. Every provider returns unit-length vectors of a
//! fixed dimension for a stated model version.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

use crate::Embedding;
use crate::error::{EmbeddingError, Result};
use crate::similarity::normalize;

/// Trait for embedding providers.
///
/// Implementations must be deterministic for a fixed model version and input.
/// Anything cached from a provider is keyed on [`EmbeddingProvider::model_version`],
/// so that string must change whenever outputs would change.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Get the name of this provider.
    fn name(&self) -> &str;

    /// Identifier of the model and every setting that affects its output.
    fn model_version(&self) -> &str;

    /// Length of every vector this provider returns.
    fn dimension(&self) -> usize;

    /// Generate an embedding for the given text.
    async fn embed(&self, text: &str) -> Result<Embedding>;

    /// Generate embeddings for multiple texts, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        // Default implementation: process sequentially
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Check if the provider is available (API key set, etc.).
    fn is_available(&self) -> bool {
        true
    }
}

/// Embed `texts` in batches of at most `batch_size`, preserving input order.
///
/// Every returned vector is checked against the provider's dimension.
pub async fn embed_in_batches(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Embedding>> {
    if batch_size == 0 {
        return Err(EmbeddingError::InvalidQuery(
            "batch size must be positive".to_string(),
        ));
    }

    let expected = provider.dimension();
    let mut embeddings = Vec::with_capacity(texts.len());

    for (batch_number, batch) in texts.chunks(batch_size).enumerate() {
        let batch_embeddings = provider.embed_batch(batch).await?;
        if batch_embeddings.len() != batch.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "batch {batch_number}: {} embeddings for {} texts",
                batch_embeddings.len(),
                batch.len()
            )));
        }

        for embedding in batch_embeddings {
            if embedding.len() != expected {
                return Err(EmbeddingError::DimensionMismatch {
                    expected,
                    actual: embedding.len(),
                });
            }
            embeddings.push(embedding);
        }

        debug!(
            "Embedded batch {batch_number} ({} of {} texts)",
            embeddings.len(),
            texts.len()
        );
    }

    info!(
        "Generated {} embeddings with {}",
        embeddings.len(),
        provider.model_version()
    );
    Ok(embeddings)
}

/// OpenAI embedding provider.
pub struct OpenAIProvider {
    /// API key.
    api_key: Option<String>,

    /// API base URL.
    base_url: String,

    /// HTTP client.
    client: reqwest::Client,

    /// Model name sent with each request.
    model: String,

    /// Requested output dimension, if overriding the model default.
    dimensions: Option<usize>,

    /// Cached `model_version()` string.
    model_version: String,
}

impl OpenAIProvider {
    /// Default embedding model.
    pub const DEFAULT_MODEL: &'static str = "text-embedding-3-small";

    /// Create a new OpenAI provider without credentials.
    pub fn new() -> Self {
        let model = Self::DEFAULT_MODEL.to_string();
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
            model_version: version_string(&model, model_default_dimension(&model)),
            model,
            dimensions: None,
        }
    }

    /// Create a provider using `OPENAI_API_KEY` from the environment.
    pub fn from_env() -> Self {
        let provider = Self::new();
        match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => provider.with_api_key(key),
            _ => provider,
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self.model_version = version_string(&self.model, self.dimension());
        self
    }

    /// Request a specific output dimension.
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self.model_version = version_string(&self.model, dimensions);
        self
    }

    /// Apply a per-request timeout to the HTTP client.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    async fn request(&self, input: serde_json::Value) -> Result<OpenAIEmbeddingResponse> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or(EmbeddingError::ProviderNotConfigured)?;

        let mut body = serde_json::json!({
            "input": input,
            "model": self.model
        });

        if let Some(dims) = self.dimensions {
            body["dimensions"] = serde_json::json!(dims);
        }

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);

            return Err(EmbeddingError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::ApiRequest(format!(
                "API error ({status}): {error_text}"
            )));
        }

        Ok(response.json().await?)
    }

    /// Order rows by their response index, normalize, and check dimensions.
    fn into_embeddings(
        &self,
        mut data: Vec<OpenAIEmbeddingData>,
        expected_count: usize,
    ) -> Result<Vec<Embedding>> {
        if data.len() != expected_count {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {expected_count} embeddings, got {}",
                data.len()
            )));
        }

        data.sort_by_key(|item| item.index);

        let expected = self.dimension();
        data.into_iter()
            .map(|item| {
                let mut embedding = item.embedding;
                if embedding.len() != expected {
                    return Err(EmbeddingError::DimensionMismatch {
                        expected,
                        actual: embedding.len(),
                    });
                }
                normalize(&mut embedding);
                Ok(embedding)
            })
            .collect()
    }
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn dimension(&self) -> usize {
        self.dimensions
            .unwrap_or_else(|| model_default_dimension(&self.model))
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        debug!("Generating embedding with model: {}", self.model);

        let result = self.request(serde_json::json!(text)).await?;
        let mut embeddings = self.into_embeddings(result.data, 1)?;

        if let Some(usage) = result.usage {
            debug!("Embedding used {} tokens", usage.total_tokens);
        }

        embeddings
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("No embedding in response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            "Generating batch embeddings for {} texts with model: {}",
            texts.len(),
            self.model
        );

        let result = self.request(serde_json::json!(texts)).await?;
        self.into_embeddings(result.data, texts.len())
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }
}

fn model_default_dimension(model: &str) -> usize {
    match model {
        "text-embedding-3-large" => 3072,
        _ => 1536,
    }
}

fn version_string(model: &str, dimension: usize) -> String {
    format!("openai/{model}/d{dimension}")
}

/// OpenAI API response format.
#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    total_tokens: u64,
}

/// Offline embedding model based on feature hashing.
///
/// Each whitespace token is lowercased and padded as `<token>`; its character
/// trigrams are hashed with xxh3 into `dimension` signed buckets and the
/// result is scaled to unit length. Related spellings ("blueberry",
/// "blueberries") share most trigrams and therefore score close together.
#[derive(Debug, Clone)]
pub struct HashingProvider {
    dimension: usize,
    model_version: String,
}

impl HashingProvider {
    /// Default number of hash buckets.
    pub const DEFAULT_DIMENSION: usize = 512;

    /// Create a provider with `dimension` buckets (at least one).
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            model_version: format!("hashing-trigram-v1-d{dimension}"),
        }
    }

    /// Compute the embedding synchronously.
    pub fn vectorize(&self, text: &str) -> Result<Embedding> {
        let mut embedding = vec![0.0f32; self.dimension];
        let buckets = self.dimension as u64;
        let mut features = 0usize;

        for token in text.split_whitespace() {
            let padded: Vec<char> = std::iter::once('<')
                .chain(token.to_lowercase().chars())
                .chain(std::iter::once('>'))
                .collect();

            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                let hash = xxh3_64(gram.as_bytes());
                let bucket = (hash % buckets) as usize;
                let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
                embedding[bucket] += sign;
                features += 1;
            }
        }

        if features == 0 {
            return Err(EmbeddingError::InvalidQuery(
                "cannot embed empty text".to_string(),
            ));
        }

        normalize(&mut embedding);
        Ok(embedding)
    }
}

impl Default for HashingProvider {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSION)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn name(&self) -> &str {
        "hashing"
    }

    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        self.vectorize(text)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        texts.iter().map(|text| self.vectorize(text)).collect()
    }
}
