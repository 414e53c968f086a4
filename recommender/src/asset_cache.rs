//! Persisted corpus snapshot and vector index.
//!
//! The cache file is a single blob so it can be published with one rename:
//!
//! ```text
//! "PRAC" | u32 version | u32 manifest_len | manifest JSON | index blob
//! ```
//!
//! The manifest records the embedding model version and corpus fingerprint
//! the index was built for, the recipe id list, and the snapshot records.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use pantry_embeddings::VectorIndex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::corpus::{CorpusSnapshot, RecipeRecord};
use crate::error::{RecommenderError, Result};

/// Leading bytes of an asset cache file.
pub const ASSET_MAGIC: &[u8; 4] = b"PRAC";

/// Current cache file layout version.
pub const ASSET_FORMAT_VERSION: u32 = 1;

/// Distinguishes temp files of concurrent stores within one process.
static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    embedding_model_version: String,
    corpus_fingerprint: String,
    recipe_ids: Vec<String>,
    recipes: Vec<RecipeRecord>,
}

/// Everything needed to serve recommendations without re-embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetCacheRecord {
    /// Model the index vectors came from.
    pub embedding_model_version: String,

    /// Snapshot the index rows correspond to.
    pub snapshot: CorpusSnapshot,

    /// Index over `snapshot`, row for row.
    pub index: VectorIndex,
}

impl AssetCacheRecord {
    /// Pair a snapshot with its index.
    pub fn new(
        embedding_model_version: impl Into<String>,
        snapshot: CorpusSnapshot,
        index: VectorIndex,
    ) -> Result<Self> {
        if snapshot.len() != index.len() {
            return Err(RecommenderError::IndexBuild(format!(
                "snapshot has {} recipes but index has {} rows",
                snapshot.len(),
                index.len()
            )));
        }

        Ok(Self {
            embedding_model_version: embedding_model_version.into(),
            snapshot,
            index,
        })
    }

    /// Fingerprint of the cached snapshot.
    pub fn corpus_fingerprint(&self) -> &str {
        self.snapshot.fingerprint()
    }

    /// Whether this record was built from the live corpus with the live model.
    pub fn matches(&self, corpus_fingerprint: &str, embedding_model_version: &str) -> bool {
        self.corpus_fingerprint() == corpus_fingerprint
            && self.embedding_model_version == embedding_model_version
    }

    /// Encode into the cache file layout.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let manifest = serde_json::to_vec(&Manifest {
            embedding_model_version: self.embedding_model_version.clone(),
            corpus_fingerprint: self.corpus_fingerprint().to_string(),
            recipe_ids: self.index.ids().to_vec(),
            recipes: self.snapshot.records().to_vec(),
        })
        .map_err(|e| RecommenderError::IndexBuild(format!("manifest: {e}")))?;

        let manifest_len = u32::try_from(manifest.len())
            .map_err(|_| RecommenderError::IndexBuild("manifest too large".to_string()))?;
        let index = self.index.serialize()?;

        let mut out = Vec::with_capacity(12 + manifest.len() + index.len());
        out.extend_from_slice(ASSET_MAGIC);
        out.extend_from_slice(&ASSET_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&manifest_len.to_le_bytes());
        out.extend_from_slice(&manifest);
        out.extend_from_slice(&index);
        Ok(out)
    }

    /// Decode and cross-check a cache file. Any failure is `IndexCorrupt`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let corrupt = RecommenderError::IndexCorrupt;

        if bytes.len() < 12 || &bytes[..4] != ASSET_MAGIC {
            return Err(corrupt("bad magic".to_string()));
        }

        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != ASSET_FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {version}")));
        }

        let manifest_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let manifest_end = 12usize
            .checked_add(manifest_len)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| corrupt("truncated manifest".to_string()))?;

        let manifest: Manifest = serde_json::from_slice(&bytes[12..manifest_end])
            .map_err(|e| corrupt(format!("manifest: {e}")))?;
        let index = VectorIndex::deserialize(&bytes[manifest_end..])
            .map_err(|e| corrupt(e.to_string()))?;

        if manifest.recipe_ids != index.ids() {
            return Err(corrupt("recipe ids do not match index rows".to_string()));
        }

        let snapshot = CorpusSnapshot::new(manifest.recipes);
        if snapshot.ids() != manifest.recipe_ids {
            return Err(corrupt("recipe records do not match recipe ids".to_string()));
        }
        if snapshot.fingerprint() != manifest.corpus_fingerprint {
            return Err(corrupt("recipe records do not match fingerprint".to_string()));
        }

        Ok(Self {
            embedding_model_version: manifest.embedding_model_version,
            snapshot,
            index,
        })
    }
}

/// File-backed store for one [`AssetCacheRecord`].
pub struct AssetCache {
    path: PathBuf,
}

impl AssetCache {
    /// Create a cache at `path`. Nothing is read until [`AssetCache::load`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted record.
    ///
    /// A missing file is a quiet miss. An unreadable or corrupt file is logged
    /// and also reported as a miss, so the caller rebuilds.
    pub async fn load(&self) -> Option<AssetCacheRecord> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No asset cache at {}", self.path.display());
                return None;
            }
            Err(e) => {
                warn!("Failed to read asset cache {}: {e}", self.path.display());
                return None;
            }
        };

        match AssetCacheRecord::decode(&bytes) {
            Ok(record) => {
                info!(
                    "Loaded asset cache with {} recipes from {}",
                    record.snapshot.len(),
                    self.path.display()
                );
                Some(record)
            }
            Err(e) => {
                warn!("Ignoring asset cache {}: {e}", self.path.display());
                None
            }
        }
    }

    /// Persist a record atomically.
    ///
    /// The bytes go to a temporary file in the same directory, are synced,
    /// and then renamed over the cache file. Readers see the old file or the
    /// new one, never a partial write.
    pub async fn store(&self, record: &AssetCacheRecord) -> Result<()> {
        let bytes = record.encode()?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.temp_path();
        if let Err(e) = write_synced(&temp_path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        info!(
            "Stored asset cache ({} bytes) at {}",
            bytes.len(),
            self.path.display()
        );
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "assets".to_string());
        let sequence = TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.path.with_file_name(format!(
            ".{file_name}.tmp.{}.{sequence}",
            std::process::id()
        ))
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}
