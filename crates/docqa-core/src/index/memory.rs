//! In-memory [`VectorIndex`] for tests and single-process runs.
//!
//! Records live in a `HashMap` behind `std::sync::RwLock`. Queries are a
//! brute-force scan under the configured metric.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::IndexServiceError;
use crate::models::{IndexedRecord, RetrievedChunk};

use super::{check_dims, rank, MetadataFilter, Metric, VectorIndex};

struct StoredRecord {
    seq: u64,
    record: IndexedRecord,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, StoredRecord>,
    next_seq: u64,
}

pub struct InMemoryIndex {
    dims: usize,
    metric: Metric,
    inner: RwLock<Inner>,
}

impl InMemoryIndex {
    pub fn new(dims: usize, metric: Metric) -> Self {
        Self {
            dims,
            metric,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one record, if present.
    pub fn get(&self, chunk_id: &str) -> Option<IndexedRecord> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .get(chunk_id)
            .map(|s| s.record.clone())
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    async fn upsert(&self, records: &[IndexedRecord]) -> Result<(), IndexServiceError> {
        for r in records {
            check_dims(self.dims, &r.vector)?;
        }
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for r in records {
            let seq = match inner.records.get(&r.chunk_id) {
                Some(existing) => existing.seq,
                None => {
                    inner.next_seq += 1;
                    inner.next_seq
                }
            };
            inner.records.insert(
                r.chunk_id.clone(),
                StoredRecord {
                    seq,
                    record: r.clone(),
                },
            );
        }
        Ok(())
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize, IndexServiceError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = inner.records.len();
        inner
            .records
            .retain(|_, s| s.record.metadata.document_id != document_id);
        Ok(before - inner.records.len())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievedChunk>, IndexServiceError> {
        check_dims(self.dims, vector)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let hits: Vec<_> = inner
            .records
            .values()
            .filter(|s| filter.map_or(true, |f| f.matches(&s.record.metadata)))
            .map(|s| (self.metric.score(vector, &s.record.vector), s.seq, &s.record))
            .collect();
        Ok(rank(hits, top_k)
            .into_iter()
            .map(|(score, r)| RetrievedChunk {
                chunk_id: r.chunk_id.clone(),
                score,
                metadata: r.metadata.clone(),
            })
            .collect())
    }

    async fn chunk_ids(&self, document_id: &str) -> Result<Vec<String>, IndexServiceError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<(usize, String)> = inner
            .records
            .values()
            .filter(|s| s.record.metadata.document_id == document_id)
            .map(|s| (s.record.metadata.position, s.record.chunk_id.clone()))
            .collect();
        ids.sort();
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }
}
