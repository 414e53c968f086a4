//! Exact inner-product index over a fixed set of embeddings.
//!
//! Vectors are kept verbatim in one flat row-major buffer. Position `i` in the
//! index is the `i`-th vector handed to [`VectorIndex::build`]; callers keep a
//! parallel table of records and resolve search hits by that position.
//!
//! The persisted form is a little-endian blob:
//!
//! ```text
//! "PVIX" | u32 version | u32 header_len | header JSON
//!        | count * dimension f32 components
//!        | count * (u32 id_len | id bytes)
//! ```
//!
//! where the header is `{"count":N,"dimension":D,"metric":"inner_product"}`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EmbeddingError, Result};
use crate::similarity::inner_product;

/// Leading bytes of a serialized index.
pub const INDEX_MAGIC: &[u8; 4] = b"PVIX";

/// Current blob layout version.
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Scoring function used by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Plain dot product. Equals cosine similarity over unit vectors.
    InnerProduct,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobHeader {
    count: usize,
    dimension: usize,
    metric: Metric,
}

/// One ranked search result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Position of the matched vector in build order.
    pub row: usize,

    /// Inner product between the query and the matched vector.
    pub score: f32,
}

/// An exact, immutable similarity index.
///
/// `search` takes `&self` and never mutates, so a built index can be shared
/// between threads behind an `Arc` without locking.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    /// Length of every stored vector.
    dimension: usize,

    /// Identifier of each row, parallel to `vectors`.
    ids: Vec<String>,

    /// Row-major `ids.len() * dimension` components.
    vectors: Vec<f32>,
}

impl VectorIndex {
    /// Build an index from row identifiers and their embeddings.
    ///
    /// Vectors are stored exactly as given; no normalization is applied.
    pub fn build(dimension: usize, ids: Vec<String>, embeddings: Vec<Vec<f32>>) -> Result<Self> {
        if dimension == 0 {
            return Err(EmbeddingError::IndexBuild(
                "dimension must be positive".to_string(),
            ));
        }

        if ids.len() != embeddings.len() {
            return Err(EmbeddingError::IndexBuild(format!(
                "{} ids for {} embeddings",
                ids.len(),
                embeddings.len()
            )));
        }

        let total = embeddings
            .len()
            .checked_mul(dimension)
            .ok_or_else(|| EmbeddingError::IndexBuild("index too large".to_string()))?;
        let mut vectors = Vec::with_capacity(total);

        for (row, embedding) in embeddings.iter().enumerate() {
            if embedding.len() != dimension {
                return Err(EmbeddingError::IndexBuild(format!(
                    "row {row} has dimension {}, expected {dimension}",
                    embedding.len()
                )));
            }
            if embedding.iter().any(|x| !x.is_finite()) {
                return Err(EmbeddingError::IndexBuild(format!(
                    "row {row} contains a non-finite component"
                )));
            }
            vectors.extend_from_slice(embedding);
        }

        info!(
            "Built vector index with {} rows of dimension {dimension}",
            ids.len()
        );

        Ok(Self {
            dimension,
            ids,
            vectors,
        })
    }

    /// Dimension shared by all vectors.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Scoring function.
    pub fn metric(&self) -> Metric {
        Metric::InnerProduct
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Row identifiers in index order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Identifier of a row.
    pub fn id(&self, row: usize) -> Option<&str> {
        self.ids.get(row).map(String::as_str)
    }

    /// Stored vector of a row.
    pub fn vector(&self, row: usize) -> Option<&[f32]> {
        let start = row.checked_mul(self.dimension)?;
        let end = start.checked_add(self.dimension)?;
        self.vectors.get(start..end)
    }

    /// Return the `min(k, len)` best rows for `query`.
    ///
    /// Scores are sorted descending; equal scores keep ascending row order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Err(EmbeddingError::InvalidQuery(
                "k must be positive".to_string(),
            ));
        }

        if query.len() != self.dimension {
            return Err(EmbeddingError::InvalidDimension {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        if query.iter().any(|x| !x.is_finite()) {
            return Err(EmbeddingError::InvalidQuery(
                "query contains a non-finite component".to_string(),
            ));
        }

        let k = k.min(self.len());

        // Min-heap of the best k keys seen so far. A larger key ranks higher:
        // higher score first, then lower row.
        let mut best: BinaryHeap<Reverse<(OrderedFloat<f32>, Reverse<usize>)>> =
            BinaryHeap::with_capacity(k + 1);

        for (row, vector) in self.vectors.chunks_exact(self.dimension).enumerate() {
            let key = (OrderedFloat(inner_product(query, vector)), Reverse(row));
            if best.len() < k {
                best.push(Reverse(key));
            } else if let Some(Reverse(worst)) = best.peek()
                && key > *worst
            {
                best.pop();
                best.push(Reverse(key));
            }
        }

        let mut ranked: Vec<(OrderedFloat<f32>, Reverse<usize>)> =
            best.into_iter().map(|Reverse(key)| key).collect();
        ranked.sort_unstable_by_key(|&key| Reverse(key));

        debug!("Vector search returned {} of {} rows", ranked.len(), self.len());

        Ok(ranked
            .into_iter()
            .map(|(score, Reverse(row))| SearchHit {
                row,
                score: score.into_inner(),
            })
            .collect())
    }

    /// Encode the index into its persisted blob form.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let header = serde_json::to_vec(&BlobHeader {
            count: self.len(),
            dimension: self.dimension,
            metric: self.metric(),
        })?;

        let id_bytes: usize = self.ids.iter().map(|id| 4 + id.len()).sum();
        let mut out = Vec::with_capacity(
            12 + header.len() + self.vectors.len() * size_of::<f32>() + id_bytes,
        );

        out.extend_from_slice(INDEX_MAGIC);
        out.extend_from_slice(&INDEX_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&length_prefix(header.len())?);
        out.extend_from_slice(&header);

        for value in &self.vectors {
            out.extend_from_slice(&value.to_le_bytes());
        }

        for id in &self.ids {
            out.extend_from_slice(&length_prefix(id.len())?);
            out.extend_from_slice(id.as_bytes());
        }

        Ok(out)
    }

    /// Decode an index from its persisted blob form.
    ///
    /// The whole input must be consumed; trailing bytes are rejected.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut reader = BlobReader::new(bytes);

        if reader.take(INDEX_MAGIC.len())? != INDEX_MAGIC {
            return Err(corrupt("bad magic"));
        }

        let version = reader.read_u32()?;
        if version != INDEX_FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {version}")));
        }

        let header_len = reader.read_u32()? as usize;
        let header: BlobHeader = serde_json::from_slice(reader.take(header_len)?)
            .map_err(|e| corrupt(format!("bad header: {e}")))?;

        if header.dimension == 0 {
            return Err(corrupt("zero dimension"));
        }

        let components = header
            .count
            .checked_mul(header.dimension)
            .ok_or_else(|| corrupt("vector section overflows"))?;
        let vector_bytes = components
            .checked_mul(size_of::<f32>())
            .ok_or_else(|| corrupt("vector section overflows"))?;

        let vectors: Vec<f32> = reader
            .take(vector_bytes)?
            .chunks_exact(size_of::<f32>())
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        if let Some(position) = vectors.iter().position(|x| !x.is_finite()) {
            return Err(corrupt(format!(
                "non-finite component in row {}",
                position / header.dimension
            )));
        }

        let mut ids = Vec::with_capacity(header.count);
        for row in 0..header.count {
            let len = reader.read_u32()? as usize;
            let id = std::str::from_utf8(reader.take(len)?)
                .map_err(|_| corrupt(format!("row {row} id is not UTF-8")))?;
            ids.push(id.to_string());
        }

        if !reader.is_exhausted() {
            return Err(corrupt("trailing bytes after id section"));
        }

        debug!(
            "Decoded vector index with {} rows of dimension {}",
            ids.len(),
            header.dimension
        );

        Ok(Self {
            dimension: header.dimension,
            ids,
            vectors,
        })
    }
}

fn length_prefix(len: usize) -> Result<[u8; 4]> {
    u32::try_from(len)
        .map(u32::to_le_bytes)
        .map_err(|_| EmbeddingError::IndexBuild(format!("section of {len} bytes is too long")))
}

fn corrupt(reason: impl Into<String>) -> EmbeddingError {
    EmbeddingError::CorruptIndex(reason.into())
}

/// Bounds-checked cursor over a blob.
struct BlobReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BlobReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| corrupt("length overflows"))?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| corrupt(format!("truncated at byte {}", self.pos)))?;
        self.pos = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn is_exhausted(&self) -> bool {
        self.pos == self.bytes.len()
    }
}
