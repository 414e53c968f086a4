//! # Embeddings
//!
//! This crate provides embedding generation and exact similarity search for
//! pantry-based recipe retrieval.
//!
//! ## Features
//!
//! - **Embedding Generation**: Convert text to unit-length dense vectors
//! - **Multiple Providers**: OpenAI-compatible APIs and an offline hashing model
//! - **Exact Search**: Inner-product top-k with a stable tie-break
//! - **Persistence**: Bit-exact binary round trip of a built index
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Embeddings System                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  EmbeddingProvider ──► embed_in_batches ──► VectorIndex         │
//! │       │                                        │                │
//! │       ▼                                        ▼                │
//! │  OpenAI/Hashing                      search / serialize         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod index;
pub mod provider;
pub mod similarity;

pub use error::{EmbeddingError, Result};
pub use index::{Metric, SearchHit, VectorIndex};
pub use provider::{EmbeddingProvider, HashingProvider, OpenAIProvider, embed_in_batches};
pub use similarity::{dot_product, normalize};

/// A dense vector embedding.
pub type Embedding = Vec<f32>;
