//! # Pantry Recommender
//!
//! Ranks recipes by how well their ingredients match what a user has at home.
//!
//! - **Corpus**: loads and normalizes the recipe source
//! - **Asset Cache**: persists the snapshot and vector index across restarts
//! - **Query Cache**: remembers each user's latest pantry embedding
//! - **Service**: ties them together behind `recommend`
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     Recommender Service                       │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  ┌──────────────┐   hit    ┌──────────────┐                   │
//! │  │    Corpus    │ ───────► │    Asset     │                   │
//! │  │    Loader    │          │    Cache     │                   │
//! │  └──────────────┘          └──────────────┘                   │
//! │         │ miss                    │                           │
//! │         ▼                         ▼                           │
//! │  ┌──────────────┐          ┌──────────────┐                   │
//! │  │  Embedding   │ ───────► │    Vector    │                   │
//! │  │   Provider   │          │    Index     │                   │
//! │  └──────────────┘          └──────────────┘                   │
//! │         ▲                         │                           │
//! │         │ miss                    ▼                           │
//! │  ┌──────────────┐          ┌──────────────┐                   │
//! │  │    Query     │          │  Ranked      │                   │
//! │  │    Cache     │          │  Recipes     │                   │
//! │  └──────────────┘          └──────────────┘                   │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pantry_recommender::RecommenderService;
//!
//! let service = RecommenderService::builder()
//!     .with_corpus_path("data/recipes.jsonl")
//!     .build()
//!     .await?;
//!
//! let pantry = vec!["blueberries".to_string(), "sugar".to_string()];
//! let results = service.recommend(&pantry, 5, Some("user-1")).await?;
//! ```

pub mod asset_cache;
pub mod config;
pub mod corpus;
pub mod error;
pub mod query_cache;
pub mod service;

pub use asset_cache::{AssetCache, AssetCacheRecord};
pub use config::{
    CacheConfig, CorpusConfig, CorpusFormat, EmbeddingConfig, EmbeddingProviderType,
    RecommenderConfig,
};
pub use corpus::{CorpusLoader, CorpusSnapshot, RecipeRecord};
pub use error::{RecommenderError, Result};
pub use query_cache::QueryCache;
pub use service::{Recommendation, RecommenderService, RecommenderServiceBuilder, ServiceStats};

// Re-export from dependencies for convenience
pub use pantry_embeddings::{EmbeddingProvider, HashingProvider, OpenAIProvider, VectorIndex};
