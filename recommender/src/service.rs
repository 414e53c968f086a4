//! Recommender service implementation.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use pantry_embeddings::{
    Embedding, EmbeddingError, EmbeddingProvider, VectorIndex, embed_in_batches,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::asset_cache::{AssetCache, AssetCacheRecord};
use crate::config::{CorpusConfig, RecommenderConfig};
use crate::corpus::{CorpusLoader, CorpusSnapshot};
use crate::error::{RecommenderError, Result};
use crate::query_cache::{QueryCache, pantry_text};

/// One ranked recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Recipe id from the corpus.
    pub id: String,

    /// Recipe display name.
    pub name: String,

    /// Inner product between the pantry and recipe embeddings.
    pub similarity: f32,
}

/// Snapshot and index published together.
struct CorpusAssets {
    snapshot: CorpusSnapshot,
    index: VectorIndex,
    embedding_model_version: String,
    loaded_from_cache: bool,
}

/// Pantry-based recipe recommender.
///
/// Owns the published corpus assets, the per-user query cache and the
/// embedding provider. Construct one at startup and share it behind an `Arc`.
pub struct RecommenderService {
    /// Configuration.
    config: RecommenderConfig,

    /// Embedding provider for both corpus and pantry text.
    provider: Arc<dyn EmbeddingProvider>,

    /// Current snapshot and index. Replaced whole on refresh.
    assets: ArcSwap<CorpusAssets>,

    /// Per-user pantry embeddings.
    query_cache: QueryCache,

    /// Persisted assets, when configured.
    asset_cache: Option<AssetCache>,

    /// Serializes refreshes.
    refresh_lock: Mutex<()>,
}

impl RecommenderService {
    /// Create a new service builder.
    pub fn builder() -> RecommenderServiceBuilder {
        RecommenderServiceBuilder::new()
    }

    /// Start the service with the provider named in `config`.
    pub async fn from_config(config: RecommenderConfig) -> Result<Self> {
        let provider = config.embedding.build_provider()?;
        Self::start(config, provider).await
    }

    /// Load the corpus and make the index ready.
    ///
    /// A matching asset cache is used as is. Otherwise the corpus is embedded,
    /// indexed and written back to the asset cache.
    pub async fn start(
        config: RecommenderConfig,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        info!(
            "Starting recommender with provider {} ({})",
            provider.name(),
            provider.model_version()
        );

        let asset_cache = config.cache.asset_path.clone().map(AssetCache::new);
        let assets = prepare_assets(&config, provider.as_ref(), asset_cache.as_ref()).await?;

        let service = Self {
            query_cache: QueryCache::new(config.cache.max_cached_users),
            config,
            provider,
            assets: ArcSwap::from_pointee(assets),
            asset_cache,
            refresh_lock: Mutex::new(()),
        };

        info!("Recommender ready with {} recipes", service.assets.load().index.len());
        Ok(service)
    }

    /// Rank recipes by similarity to a pantry.
    ///
    /// Returns at most `min(top_n, corpus size)` recipes, best first, with
    /// equal scores in corpus order. With a `user_id`, an unchanged pantry
    /// reuses the embedding computed for that user's previous request.
    pub async fn recommend(
        &self,
        pantry_items: &[String],
        top_n: usize,
        user_id: Option<&str>,
    ) -> Result<Vec<Recommendation>> {
        if top_n == 0 {
            return Err(RecommenderError::InvalidQuery(
                "top_n must be at least 1".to_string(),
            ));
        }

        let text = pantry_text(pantry_items);
        if text.is_empty() {
            return Err(RecommenderError::InvalidQuery(
                "pantry has no items".to_string(),
            ));
        }

        let assets = self.assets.load_full();
        let k = top_n.min(assets.index.len());
        if k == 0 {
            return Ok(Vec::new());
        }

        let dimension = assets.index.dimension();
        let query = self
            .query_cache
            .get_or_compute(user_id, pantry_items, || self.embed_pantry(&text, dimension))
            .await
            .map_err(RecommenderError::RecommendationUnavailable)?;

        let hits = assets.index.search(&query, k).map_err(|e| match e {
            e @ EmbeddingError::InvalidDimension { .. } => {
                RecommenderError::InvalidQuery(e.to_string())
            }
            other => RecommenderError::RecommendationUnavailable(other),
        })?;

        debug!("Pantry {text:?} matched {} recipes", hits.len());

        hits.into_iter()
            .map(|hit| {
                let record = assets.snapshot.get(hit.row).ok_or_else(|| {
                    RecommenderError::IndexBuild(format!("index row {} has no recipe", hit.row))
                })?;
                Ok(Recommendation {
                    id: record.id.clone(),
                    name: record.name.clone(),
                    similarity: hit.score,
                })
            })
            .collect()
    }

    /// Reload the corpus and publish fresh assets.
    ///
    /// The new snapshot and index are prepared before anything is replaced;
    /// requests running during a refresh see either the old or the new
    /// assets. On error the current assets stay in place.
    pub async fn refresh(&self) -> Result<ServiceStats> {
        let _guard = self.refresh_lock.lock().await;

        let assets =
            prepare_assets(&self.config, self.provider.as_ref(), self.asset_cache.as_ref()).await?;
        self.assets.store(Arc::new(assets));

        info!("Published refreshed recipe assets");
        Ok(self.stats())
    }

    /// Get service statistics.
    pub fn stats(&self) -> ServiceStats {
        let assets = self.assets.load();

        ServiceStats {
            provider: self.provider.name().to_string(),
            embedding_model_version: assets.embedding_model_version.clone(),
            corpus_fingerprint: assets.snapshot.fingerprint().to_string(),
            recipes: assets.index.len(),
            dimension: assets.index.dimension(),
            loaded_from_cache: assets.loaded_from_cache,
            cached_users: self.query_cache.len(),
        }
    }

    /// Service configuration.
    pub fn config(&self) -> &RecommenderConfig {
        &self.config
    }

    /// Per-user query cache.
    pub fn query_cache(&self) -> &QueryCache {
        &self.query_cache
    }

    async fn embed_pantry(
        &self,
        text: &str,
        dimension: usize,
    ) -> pantry_embeddings::Result<Embedding> {
        let embedding = self.provider.embed(text).await?;
        if embedding.len() != dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dimension,
                actual: embedding.len(),
            });
        }
        Ok(embedding)
    }
}

/// Load the corpus, then either reuse the asset cache or embed and index.
async fn prepare_assets(
    config: &RecommenderConfig,
    provider: &dyn EmbeddingProvider,
    asset_cache: Option<&AssetCache>,
) -> Result<CorpusAssets> {
    let snapshot = CorpusLoader::new(config.corpus.clone()).load().await?;
    let model_version = provider.model_version().to_string();

    if let Some(cache) = asset_cache
        && let Some(record) = cache.load().await
    {
        if record.matches(snapshot.fingerprint(), &model_version)
            && record.index.dimension() == provider.dimension()
        {
            info!("Using cached recipe index from {}", cache.path().display());
            return Ok(CorpusAssets {
                snapshot: record.snapshot,
                index: record.index,
                embedding_model_version: record.embedding_model_version,
                loaded_from_cache: true,
            });
        }
        info!("Cached recipe index is stale, rebuilding");
    }

    let index = build_index(&snapshot, provider, config.embedding.batch_size).await?;
    let record = AssetCacheRecord::new(model_version, snapshot, index)?;

    if let Some(cache) = asset_cache
        && let Err(e) = cache.store(&record).await
    {
        warn!(
            "Failed to store asset cache at {}: {e}",
            cache.path().display()
        );
    }

    Ok(CorpusAssets {
        snapshot: record.snapshot,
        index: record.index,
        embedding_model_version: record.embedding_model_version,
        loaded_from_cache: false,
    })
}

async fn build_index(
    snapshot: &CorpusSnapshot,
    provider: &dyn EmbeddingProvider,
    batch_size: usize,
) -> Result<VectorIndex> {
    info!(
        "Embedding {} recipes with {}",
        snapshot.len(),
        provider.model_version()
    );

    let embeddings = embed_in_batches(provider, &snapshot.texts(), batch_size.max(1)).await?;
    VectorIndex::build(provider.dimension(), snapshot.ids(), embeddings)
        .map_err(|e| RecommenderError::IndexBuild(e.to_string()))
}

/// Builder for [`RecommenderService`].
pub struct RecommenderServiceBuilder {
    config: RecommenderConfig,
    provider: Option<Arc<dyn EmbeddingProvider>>,
}

impl RecommenderServiceBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: RecommenderConfig::default(),
            provider: None,
        }
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: RecommenderConfig) -> Self {
        self.config = config;
        self
    }

    /// Read recipes from `path`, keeping the other corpus settings.
    pub fn with_corpus_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.corpus.path = path.into();
        self
    }

    /// Set the corpus configuration.
    pub fn with_corpus(mut self, corpus: CorpusConfig) -> Self {
        self.config.corpus = corpus;
        self
    }

    /// Set or disable the asset cache file.
    pub fn with_asset_cache(mut self, path: Option<PathBuf>) -> Self {
        self.config.cache.asset_path = path;
        self
    }

    /// Bound the number of users in the query cache.
    pub fn with_max_cached_users(mut self, max_users: usize) -> Self {
        self.config.cache.max_cached_users = max_users;
        self
    }

    /// Use this provider instead of the configured one.
    pub fn with_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Build and start the service.
    pub async fn build(self) -> Result<RecommenderService> {
        let provider = match self.provider {
            Some(provider) => provider,
            None => self.config.embedding.build_provider()?,
        };
        RecommenderService::start(self.config, provider).await
    }
}

impl Default for RecommenderServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about the recommender service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Provider name.
    pub provider: String,

    /// Model version the index was built with.
    pub embedding_model_version: String,

    /// Content hash of the served snapshot.
    pub corpus_fingerprint: String,

    /// Number of indexed recipes.
    pub recipes: usize,

    /// Embedding dimension.
    pub dimension: usize,

    /// Whether the assets came from the asset cache.
    pub loaded_from_cache: bool,

    /// Users with a cached pantry embedding.
    pub cached_users: usize,
}
