//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the access pattern the ingestion pipeline
//! and the query engine rely on. Backends own storage; callers own retry
//! policy. Implementations never retry internally.
//!
//! Every index is created for one dimensionality and one [`Metric`], and
//! both stay fixed for its lifetime.

pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::embedding::{cosine_similarity, dot_product};
use crate::error::{ConfigurationError, IndexServiceError};
use crate::models::{IndexedRecord, RecordMetadata, RetrievedChunk};

/// Similarity metric an index is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cosine,
    /// Inner product.
    Dot,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::Dot => "dot",
        }
    }

    /// Higher is more similar for both metrics.
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => cosine_similarity(a, b),
            Metric::Dot => dot_product(a, b),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "dot" | "inner_product" | "ip" => Ok(Metric::Dot),
            other => Err(ConfigurationError::MissingMetric(other.to_string())),
        }
    }
}

/// Restricts a query to records whose metadata matches.
///
/// All conditions must hold. A tag condition holds when the record's tag
/// equals any of the listed values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    pub document_id: Option<String>,
    pub tags: BTreeMap<String, Vec<String>>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    /// Add an accepted value for `key`. Repeated calls for the same key OR together.
    pub fn tag_any(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.entry(key.into()).or_default().push(value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.document_id.is_none() && self.tags.values().all(|v| v.is_empty())
    }

    pub fn matches(&self, metadata: &RecordMetadata) -> bool {
        if let Some(id) = &self.document_id {
            if &metadata.document_id != id {
                return false;
            }
        }
        self.tags.iter().all(|(key, accepted)| {
            accepted.is_empty()
                || metadata
                    .tags
                    .get(key)
                    .is_some_and(|v| accepted.iter().any(|a| a == v))
        })
    }
}

/// Storage backend for chunk vectors.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Insert or replace records by `chunk_id` |
/// | [`delete_by_document`](VectorIndex::delete_by_document) | Remove every record of a document |
/// | [`query`](VectorIndex::query) | Nearest neighbours, best first |
/// | [`chunk_ids`](VectorIndex::chunk_ids) | Record ids of a document, by position |
///
/// Must tolerate concurrent callers; last write wins per `chunk_id`.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Dimensionality fixed at creation.
    fn dims(&self) -> usize;

    fn metric(&self) -> Metric;

    /// Insert or replace records. Replacing a record keeps its original
    /// insertion order for tie-breaking.
    async fn upsert(&self, records: &[IndexedRecord]) -> Result<(), IndexServiceError>;

    /// Remove all records for `document_id`, returning how many were removed.
    async fn delete_by_document(&self, document_id: &str) -> Result<usize, IndexServiceError>;

    /// At most `top_k` records ordered by non-increasing score, ties by
    /// insertion order.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievedChunk>, IndexServiceError>;

    /// Chunk ids stored for `document_id`, ordered by position.
    async fn chunk_ids(&self, document_id: &str) -> Result<Vec<String>, IndexServiceError>;
}

/// Reject a vector whose length differs from the index dimensionality.
pub fn check_dims(expected: usize, vector: &[f32]) -> Result<(), IndexServiceError> {
    if vector.len() != expected {
        return Err(ConfigurationError::DimensionMismatch {
            expected,
            actual: vector.len(),
        }
        .into());
    }
    Ok(())
}

/// Sort scored hits best first, breaking ties by ascending `seq`, and keep `top_k`.
pub fn rank<T>(mut hits: Vec<(f32, u64, T)>, top_k: usize) -> Vec<(f32, T)> {
    hits.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.cmp(&b.1))
    });
    hits.truncate(top_k);
    hits.into_iter().map(|(score, _, item)| (score, item)).collect()
}
