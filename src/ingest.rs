//! Ingestion pipeline.
//!
//! Per document: load → chunk → embed (batched) → `delete_by_document` →
//! `upsert`. Documents are independent; a failure is recorded in that
//! document's [`DocumentReport`] and the batch carries on.
//!
//! Up to `workers` documents are in flight at once. Reports come back in
//! input order regardless of completion order. The delete/upsert pair of
//! one document id runs under a per-id lock, so two ingestions of the
//! same document never interleave their writes. A failure after the
//! delete leaves the document absent from the index until it is ingested
//! again; it is never left half-replaced.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use docqa_core::chunk::{chunk_document, ChunkParams};
use docqa_core::embedding::{embed_checked, Embedder};
use docqa_core::error::{ConfigurationError, LoadError};
use docqa_core::index::VectorIndex;
use docqa_core::models::{Chunk, Document, DocumentReport, IndexedRecord, IngestStatus, SourceFormat};

use crate::config::Config;
use crate::extract::Loader;
use crate::manifest::Manifest;
use crate::progress::{IngestProgressEvent, NoProgress, ProgressReporter};
use crate::retry::{with_retry, RetryPolicy};
use crate::services::Services;
use crate::sources::scan_documents;

/// Lazily created async mutex per document id.
#[derive(Default)]
struct DocumentLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DocumentLocks {
    fn get(&self, document_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Entries nobody else holds are stale.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(document_id.to_string())
            .or_default()
            .clone()
    }
}

/// A loaded and chunked document, ready to embed.
struct Prepared {
    format: SourceFormat,
    chunks: Vec<Chunk>,
    tags: BTreeMap<String, String>,
}

pub struct IngestPipeline {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    loader: Loader,
    params: ChunkParams,
    batch_size: usize,
    workers: usize,
    embed_retry: RetryPolicy,
    index_retry: RetryPolicy,
    locks: DocumentLocks,
}

impl IngestPipeline {
    /// The embedder and the index must agree on dimensionality.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        params: ChunkParams,
    ) -> Result<Self, ConfigurationError> {
        if embedder.dims() != index.dims() {
            return Err(ConfigurationError::DimensionMismatch {
                expected: index.dims(),
                actual: embedder.dims(),
            });
        }
        let defaults = Config::default();
        Ok(Self {
            embedder,
            index,
            loader: Loader::new(defaults.ingest.max_file_bytes),
            params,
            batch_size: defaults.embedding.batch_size,
            workers: defaults.ingest.workers,
            embed_retry: RetryPolicy::from_config(
                &defaults.retry,
                defaults.embedding.timeout_secs,
            ),
            index_retry: RetryPolicy::from_config(&defaults.retry, defaults.index.timeout_secs),
            locks: DocumentLocks::default(),
        })
    }

    /// Build a pipeline with every knob taken from `config`.
    pub fn from_config(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
    ) -> Result<Self> {
        Ok(Self::new(embedder, index, config.chunking.params()?)?
            .with_loader(Loader::new(config.ingest.max_file_bytes))
            .with_batch_size(config.embedding.batch_size)
            .with_workers(config.ingest.workers)
            .with_retry(
                RetryPolicy::from_config(&config.retry, config.embedding.timeout_secs),
                RetryPolicy::from_config(&config.retry, config.index.timeout_secs),
            ))
    }

    pub fn with_loader(mut self, loader: Loader) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_retry(mut self, embed: RetryPolicy, index: RetryPolicy) -> Self {
        self.embed_retry = embed;
        self.index_retry = index;
        self
    }

    /// Ingest `documents`, returning one report per document in input order.
    pub async fn ingest(&self, documents: Vec<Document>) -> Vec<DocumentReport> {
        self.ingest_with_progress(documents, &NoProgress).await
    }

    pub async fn ingest_with_progress(
        &self,
        documents: Vec<Document>,
        progress: &dyn ProgressReporter,
    ) -> Vec<DocumentReport> {
        let total = documents.len() as u64;
        info!(documents = total, workers = self.workers, "ingestion started");

        let mut reports = Vec::with_capacity(documents.len());
        let mut in_flight = stream::iter(documents.into_iter().map(|doc| self.ingest_one(doc)))
            .buffered(self.workers);
        while let Some(report) = in_flight.next().await {
            progress.report(IngestProgressEvent::Document {
                n: reports.len() as u64 + 1,
                total,
                document_id: report.document_id.clone(),
                status: report.status,
            });
            reports.push(report);
        }

        let failed = reports.iter().filter(|r| !r.is_success()).count();
        info!(documents = total, failed, "ingestion finished");
        reports
    }

    /// Load and chunk without embedding or touching the index.
    ///
    /// Successful reports carry the number of chunks that would be written.
    pub async fn dry_run(&self, documents: Vec<Document>) -> Vec<DocumentReport> {
        let mut reports = Vec::with_capacity(documents.len());
        for doc in documents {
            let id = doc.document_id.clone();
            reports.push(match self.prepare(doc).await {
                Ok(prepared) => DocumentReport::success(id, prepared.chunks.len()),
                Err(e) => DocumentReport::failed(id, IngestStatus::LoadFailed, e.to_string()),
            });
        }
        reports
    }

    async fn prepare(&self, doc: Document) -> Result<Prepared, LoadError> {
        let loader = self.loader;
        let params = self.params;
        let document_id = doc.document_id.clone();
        let format = doc.source_format.clone();
        // Extraction is CPU-bound; keep it off the async workers.
        tokio::task::spawn_blocking(move || -> Result<Prepared, LoadError> {
            let loaded = loader.load(&doc)?;
            let chunks = chunk_document(&doc.document_id, &loaded.text, &params);
            Ok(Prepared {
                format: loaded.format,
                chunks,
                tags: doc.tags,
            })
        })
        .await
        .unwrap_or_else(|join_err| {
            Err(LoadError::Corrupt {
                document_id,
                format,
                cause: format!("extraction task failed: {join_err}"),
            })
        })
    }

    async fn ingest_one(&self, doc: Document) -> DocumentReport {
        let document_id = doc.document_id.clone();
        debug!(document_id = %document_id, format = %doc.source_format, bytes = doc.content.len(), "loading");

        let prepared = match self.prepare(doc).await {
            Ok(p) => p,
            Err(e) => {
                warn!(document_id = %document_id, error = %e, "load failed");
                return DocumentReport::failed(document_id, IngestStatus::LoadFailed, e.to_string());
            }
        };
        debug!(document_id = %document_id, chunks = prepared.chunks.len(), "chunked");

        let records = match self.embed_chunks(&prepared).await {
            Ok(r) => r,
            Err(e) => {
                warn!(document_id = %document_id, error = %e, "embedding failed");
                return DocumentReport::failed(document_id, IngestStatus::EmbedFailed, e.to_string());
            }
        };

        let lock = self.locks.get(&document_id);
        let _guard = lock.lock().await;

        let removed = match with_retry(&self.index_retry, "delete_by_document", || {
            self.index.delete_by_document(&document_id)
        })
        .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!(document_id = %document_id, error = %e, "delete failed");
                return DocumentReport::failed(document_id, IngestStatus::IndexFailed, e.to_string());
            }
        };

        for batch in records.chunks(self.batch_size) {
            if let Err(e) =
                with_retry(&self.index_retry, "upsert", || self.index.upsert(batch)).await
            {
                // Earlier batches may have landed; take them back out.
                if let Err(rollback) = with_retry(&self.index_retry, "delete_by_document", || {
                    self.index.delete_by_document(&document_id)
                })
                .await
                {
                    warn!(
                        document_id = %document_id,
                        error = %rollback,
                        "rollback after failed upsert failed; partial chunk set may remain"
                    );
                    return DocumentReport::failed(
                        document_id,
                        IngestStatus::IndexFailed,
                        format!("{e}; rollback failed: {rollback}"),
                    );
                }
                warn!(
                    document_id = %document_id,
                    error = %e,
                    "upsert failed; document is absent from the index until re-ingested"
                );
                return DocumentReport::failed(document_id, IngestStatus::IndexFailed, e.to_string());
            }
        }

        info!(document_id = %document_id, chunks = records.len(), replaced = removed, "indexed");
        DocumentReport::success(document_id, records.len())
    }

    async fn embed_chunks(
        &self,
        prepared: &Prepared,
    ) -> Result<Vec<IndexedRecord>, docqa_core::error::EmbeddingServiceError> {
        let mut records = Vec::with_capacity(prepared.chunks.len());
        for batch in prepared.chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = with_retry(&self.embed_retry, "embed_many", || {
                embed_checked(self.embedder.as_ref(), &texts)
            })
            .await?;
            records.extend(
                batch
                    .iter()
                    .zip(vectors)
                    .map(|(chunk, vector)| {
                        IndexedRecord::from_chunk(chunk, prepared.format, &prepared.tags, vector)
                    }),
            );
        }
        Ok(records)
    }
}

/// What `docqa ingest` should do.
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    /// Files or directories under the root; empty means the whole root.
    pub paths: Vec<PathBuf>,
    /// Re-ingest documents the manifest says are unchanged.
    pub force: bool,
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct IngestSummary {
    /// One report per document attempted, sorted by document id.
    pub reports: Vec<DocumentReport>,
    /// Documents skipped because their bytes match the manifest.
    pub unchanged: usize,
}

impl IngestSummary {
    pub fn failed(&self) -> usize {
        self.reports.iter().filter(|r| !r.is_success()).count()
    }
}

/// Scan the document root, skip unchanged files, ingest the rest, and
/// record successes in the manifest.
///
/// The manifest is ignored for the in-memory backend, whose index starts
/// empty in every process.
pub async fn run_ingest(
    config: &Config,
    services: &Services,
    request: &IngestRequest,
    progress: &dyn ProgressReporter,
) -> Result<IngestSummary> {
    progress.report(IngestProgressEvent::Scanning {
        root: config.ingest.root.display().to_string(),
    });
    let files = scan_documents(&config.ingest, &request.paths)?;
    let use_manifest = !Services::is_ephemeral(config);
    let mut manifest = if use_manifest {
        Manifest::load(&config.ingest.manifest)?
    } else {
        Manifest::default()
    };

    let mut summary = IngestSummary::default();
    let mut documents = Vec::with_capacity(files.len());
    let mut hashes = HashMap::new();
    for file in &files {
        let doc = match file.read() {
            Ok(doc) => doc,
            Err(e) => {
                warn!(document_id = %file.document_id, error = %e, "read failed");
                summary.reports.push(DocumentReport::failed(
                    &file.document_id,
                    IngestStatus::LoadFailed,
                    format!("{e:#}"),
                ));
                continue;
            }
        };
        let hash = doc.content_hash();
        if use_manifest && !request.force && manifest.is_unchanged(&doc.document_id, &hash) {
            debug!(document_id = %doc.document_id, "unchanged; skipping");
            summary.unchanged += 1;
            continue;
        }
        hashes.insert(doc.document_id.clone(), (hash, doc.ingested_at));
        documents.push(doc);
    }

    let pipeline = services.pipeline(config)?;
    let reports = if request.dry_run {
        pipeline.dry_run(documents).await
    } else {
        pipeline.ingest_with_progress(documents, progress).await
    };

    if use_manifest && !request.dry_run {
        for report in reports.iter().filter(|r| r.is_success()) {
            if let Some((hash, at)) = hashes.remove(&report.document_id) {
                manifest.record(&report.document_id, hash, at);
            }
        }
        manifest.save()?;
    }

    summary.reports.extend(reports);
    summary
        .reports
        .sort_by(|a, b| a.document_id.cmp(&b.document_id));
    Ok(summary)
}

/// Remove a document's records and its manifest entry. Returns the number of records removed.
pub async fn run_delete(config: &Config, services: &Services, document_id: &str) -> Result<usize> {
    let policy = RetryPolicy::from_config(&config.retry, config.index.timeout_secs);
    let removed = with_retry(&policy, "delete_by_document", || {
        services.index.delete_by_document(document_id)
    })
    .await?;
    if !Services::is_ephemeral(config) {
        let mut manifest = Manifest::load(&config.ingest.manifest)?;
        if manifest.remove(document_id) {
            manifest.save()?;
        }
    }
    info!(document_id, removed, "deleted");
    Ok(removed)
}

/// With the in-memory backend, ingest the whole root so that queries in
/// this process have something to search. No-op for persistent backends.
pub async fn prime_ephemeral_index(config: &Config, services: &Services) -> Result<()> {
    if !Services::is_ephemeral(config) {
        return Ok(());
    }
    warn!(
        root = %config.ingest.root.display(),
        "in-memory index does not persist; ingesting the document root for this run"
    );
    let summary = run_ingest(config, services, &IngestRequest::default(), &NoProgress).await?;
    info!(
        documents = summary.reports.len(),
        failed = summary.failed(),
        "in-memory index ready"
    );
    Ok(())
}
