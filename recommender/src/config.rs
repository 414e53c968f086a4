//! Configuration for the recipe recommender.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pantry_embeddings::{EmbeddingProvider, HashingProvider, OpenAIProvider};
use serde::{Deserialize, Serialize};

use crate::error::{RecommenderError, Result};

/// Configuration for the recommender service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommenderConfig {
    /// Recipe source.
    pub corpus: CorpusConfig,

    /// Embedding provider configuration.
    pub embedding: EmbeddingConfig,

    /// Asset and query cache configuration.
    pub cache: CacheConfig,
}

impl RecommenderConfig {
    /// Create a new configuration reading recipes from `corpus_path`.
    pub fn new(corpus_path: impl Into<PathBuf>) -> Self {
        Self {
            corpus: CorpusConfig::new(corpus_path),
            ..Self::default()
        }
    }

    /// Parse a TOML document. Missing keys fall back to defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RecommenderError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RecommenderError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Set the corpus configuration.
    pub fn with_corpus(mut self, config: CorpusConfig) -> Self {
        self.corpus = config;
        self
    }

    /// Set the embedding configuration.
    pub fn with_embedding(mut self, config: EmbeddingConfig) -> Self {
        self.embedding = config;
        self
    }

    /// Set the cache configuration.
    pub fn with_cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }
}

/// Layout of a corpus file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorpusFormat {
    /// A single JSON array of objects.
    Json,
    /// One JSON object per line.
    JsonLines,
    /// Comma-separated values with a header row.
    Csv,
    /// Apache Parquet file.
    Parquet,
}

impl CorpusFormat {
    /// Infer the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(Self::Json),
            "jsonl" | "ndjson" => Some(Self::JsonLines),
            "csv" => Some(Self::Csv),
            "parquet" | "pq" => Some(Self::Parquet),
            _ => None,
        }
    }
}

/// Configuration for loading the recipe corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    /// Path to the recipe source.
    pub path: PathBuf,

    /// Explicit format; inferred from the extension when unset.
    pub format: Option<CorpusFormat>,

    /// Column holding the recipe display name.
    pub name_column: String,

    /// Column holding the ingredient list or string.
    pub ingredients_column: String,

    /// Column holding a stable recipe id. Row index is used when absent.
    pub id_column: Option<String>,

    /// Upper bound on the number of recipes embedded.
    pub max_recipes: Option<usize>,

    /// Seed for reproducible sampling when `max_recipes` applies.
    pub sample_seed: u64,
}

impl CorpusConfig {
    /// Create a corpus configuration with the default column names.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: None,
            name_column: "Name".to_string(),
            ingredients_column: "RecipeIngredientParts".to_string(),
            id_column: Some("RecipeId".to_string()),
            max_recipes: None,
            sample_seed: 42,
        }
    }

    /// Bound the corpus size.
    pub fn with_max_recipes(mut self, max_recipes: usize) -> Self {
        self.max_recipes = Some(max_recipes);
        self
    }

    /// Set the sampling seed.
    pub fn with_sample_seed(mut self, seed: u64) -> Self {
        self.sample_seed = seed;
        self
    }

    /// Set the format explicitly.
    pub fn with_format(mut self, format: CorpusFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Resolve the effective format.
    pub fn resolved_format(&self) -> Result<CorpusFormat> {
        self.format
            .or_else(|| CorpusFormat::from_path(&self.path))
            .ok_or_else(|| {
                RecommenderError::CorpusLoad(format!(
                    "cannot infer corpus format from {}",
                    self.path.display()
                ))
            })
    }
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self::new(
            dirs::data_dir()
                .unwrap_or_default()
                .join("pantry/recipes.jsonl"),
        )
    }
}

/// Type of embedding provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderType {
    /// OpenAI embeddings API.
    #[serde(rename = "openai")]
    OpenAI,
    /// Offline feature-hashing model.
    Hashing,
}

/// Configuration for the embedding provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Which provider to use.
    pub provider: EmbeddingProviderType,

    /// Model to use for embeddings.
    pub model: Option<String>,

    /// Output dimension override.
    pub dimension: Option<usize>,

    /// Base URL for OpenAI-compatible endpoints.
    pub base_url: Option<String>,

    /// API key. Falls back to `OPENAI_API_KEY`.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Maximum texts per provider call during a corpus build.
    pub batch_size: usize,

    /// Per-request timeout for remote providers.
    pub request_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderType::Hashing,
            model: None,
            dimension: None,
            base_url: None,
            api_key: None,
            batch_size: 64,
            request_timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    /// Construct the configured provider.
    pub fn build_provider(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        match self.provider {
            EmbeddingProviderType::Hashing => Ok(Arc::new(HashingProvider::new(
                self.dimension.unwrap_or(HashingProvider::DEFAULT_DIMENSION),
            ))),
            EmbeddingProviderType::OpenAI => {
                let mut provider = OpenAIProvider::from_env()
                    .with_timeout(Duration::from_secs(self.request_timeout_secs))?;
                if let Some(key) = &self.api_key {
                    provider = provider.with_api_key(key);
                }
                if let Some(url) = &self.base_url {
                    provider = provider.with_base_url(url);
                }
                if let Some(model) = &self.model {
                    provider = provider.with_model(model);
                }
                if let Some(dimension) = self.dimension {
                    provider = provider.with_dimensions(dimension);
                }
                if !provider.is_available() {
                    return Err(RecommenderError::Config(
                        "OpenAI provider selected but no API key is configured".to_string(),
                    ));
                }
                Ok(Arc::new(provider))
            }
        }
    }
}

/// Configuration for the asset and query caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// File holding the persisted corpus snapshot and index. `None` disables it.
    pub asset_path: Option<PathBuf>,

    /// Maximum number of users with a cached pantry embedding.
    pub max_cached_users: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            asset_path: dirs::cache_dir().map(|dir| dir.join("pantry/recipe-assets.bin")),
            max_cached_users: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = RecommenderConfig::from_toml_str(
            r#"
            [corpus]
            path = "data/recipes.csv"
            max_recipes = 500

            [embedding]
            provider = "hashing"
            dimension = 128
            "#,
        )
        .unwrap();

        assert_eq!(config.corpus.path, PathBuf::from("data/recipes.csv"));
        assert_eq!(config.corpus.max_recipes, Some(500));
        assert_eq!(config.corpus.name_column, "Name");
        assert_eq!(config.corpus.sample_seed, 42);
        assert_eq!(config.embedding.dimension, Some(128));
        assert_eq!(config.embedding.batch_size, 64);
        assert_eq!(config.cache.max_cached_users, 10_000);
        assert_eq!(
            config.corpus.resolved_format().unwrap(),
            CorpusFormat::Csv
        );
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = RecommenderConfig::from_toml_str("[embedding]\nprovider = \"magic\"").unwrap_err();
        assert!(matches!(err, RecommenderError::Config(_)));
    }

    #[test]
    fn test_format_inference() {
        assert_eq!(
            CorpusFormat::from_path(Path::new("a/b.JSONL")),
            Some(CorpusFormat::JsonLines)
        );
        assert_eq!(
            CorpusFormat::from_path(Path::new("recipes.parquet")),
            Some(CorpusFormat::Parquet)
        );
        assert_eq!(CorpusFormat::from_path(Path::new("a/b.xlsx")), None);

        let err = CorpusConfig::new("recipes.xlsx")
            .resolved_format()
            .unwrap_err();
        assert!(matches!(err, RecommenderError::CorpusLoad(_)));
    }

    #[test]
    fn test_hashing_provider_from_config() {
        let config = EmbeddingConfig {
            dimension: Some(96),
            ..EmbeddingConfig::default()
        };

        let provider = config.build_provider().unwrap();
        assert_eq!(provider.dimension(), 96);
        assert_eq!(provider.name(), "hashing");
    }

    #[test]
    fn test_openai_provider_needs_key() {
        let config = EmbeddingConfig {
            provider: EmbeddingProviderType::OpenAI,
            api_key: Some("sk-test".to_string()),
            dimension: Some(256),
            ..EmbeddingConfig::default()
        };

        let provider = config.build_provider().unwrap();
        assert_eq!(provider.dimension(), 256);
        assert!(provider.is_available());
    }
}
