//! SQLite vector index: persistence, replacement, ordering and pinning.

use std::collections::BTreeMap;

use tempfile::TempDir;

use docqa::db;
use docqa::index::sqlite::SqliteIndex;
use docqa_core::error::{ConfigurationError, IndexServiceError};
use docqa_core::index::{MetadataFilter, Metric, VectorIndex};
use docqa_core::models::{IndexedRecord, RecordMetadata, SourceFormat};

fn record(chunk_id: &str, document_id: &str, position: usize, vector: [f32; 3]) -> IndexedRecord {
    IndexedRecord {
        chunk_id: chunk_id.to_string(),
        vector: vector.to_vec(),
        metadata: RecordMetadata {
            document_id: document_id.to_string(),
            source_format: SourceFormat::Text,
            position,
            text: format!("{document_id} #{position}"),
            section: None,
            content_hash: String::new(),
            tags: BTreeMap::new(),
        },
    }
}

async fn open(dir: &TempDir, dims: usize, metric: Metric) -> Result<SqliteIndex, IndexServiceError> {
    let pool = db::connect(&dir.path().join("data").join("index.sqlite"))
        .await
        .unwrap();
    SqliteIndex::open(pool, dims, metric).await
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let index = open(&dir, 3, Metric::Cosine).await.unwrap();
        index
            .upsert(&[
                record("a0", "a", 0, [1.0, 0.0, 0.0]),
                record("a1", "a", 1, [0.0, 1.0, 0.0]),
            ])
            .await
            .unwrap();
        index.pool().close().await;
    }

    let index = open(&dir, 3, Metric::Cosine).await.unwrap();
    assert_eq!(index.chunk_ids("a").await.unwrap(), vec!["a0", "a1"]);
    let hits = index.query(&[0.0, 1.0, 0.0], 1, None).await.unwrap();
    assert_eq!(hits[0].chunk_id, "a1");
    assert_eq!(hits[0].metadata.text, "a #1");
}

#[tokio::test]
async fn test_reopen_with_other_dims_or_metric_is_rejected() {
    let dir = TempDir::new().unwrap();
    let index = open(&dir, 3, Metric::Cosine).await.unwrap();
    index.pool().close().await;

    match open(&dir, 4, Metric::Cosine).await {
        Err(IndexServiceError::Configuration(ConfigurationError::DimensionMismatch {
            expected,
            actual,
        })) => {
            assert_eq!(expected, 4);
            assert_eq!(actual, 3);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("dimension change must be rejected"),
    }

    assert!(matches!(
        open(&dir, 3, Metric::Dot).await,
        Err(IndexServiceError::Configuration(ConfigurationError::MetricMismatch { .. }))
    ));
}

#[tokio::test]
async fn test_upsert_replaces_and_delete_counts() {
    let dir = TempDir::new().unwrap();
    let index = open(&dir, 3, Metric::Cosine).await.unwrap();

    index
        .upsert(&[
            record("a0", "a", 0, [1.0, 0.0, 0.0]),
            record("a1", "a", 1, [0.0, 1.0, 0.0]),
            record("b0", "b", 0, [0.0, 0.0, 1.0]),
        ])
        .await
        .unwrap();
    index
        .upsert(&[record("a0", "a", 0, [0.0, 0.0, 1.0])])
        .await
        .unwrap();

    let hits = index.query(&[0.0, 0.0, 1.0], 10, None).await.unwrap();
    let top: Vec<&str> = hits.iter().take(2).map(|h| h.chunk_id.as_str()).collect();
    // Equal scores keep first-insertion order: a0 was inserted before b0.
    assert_eq!(top, vec!["a0", "b0"]);

    assert_eq!(index.delete_by_document("a").await.unwrap(), 2);
    assert_eq!(index.delete_by_document("a").await.unwrap(), 0);
    assert!(index.chunk_ids("a").await.unwrap().is_empty());
    assert_eq!(index.chunk_ids("b").await.unwrap(), vec!["b0"]);
}

#[tokio::test]
async fn test_query_respects_filter_and_dims() {
    let dir = TempDir::new().unwrap();
    let index = open(&dir, 3, Metric::Cosine).await.unwrap();

    let mut tagged = record("b0", "b", 0, [1.0, 0.0, 0.0]);
    tagged
        .metadata
        .tags
        .insert("role".to_string(), "engineer".to_string());
    index
        .upsert(&[record("a0", "a", 0, [1.0, 0.0, 0.0]), tagged])
        .await
        .unwrap();

    let by_doc = MetadataFilter::new().document("b");
    let hits = index.query(&[1.0, 0.0, 0.0], 5, Some(&by_doc)).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk_id, "b0");

    let by_tag = MetadataFilter::new().tag_any("role", "engineer");
    let hits = index.query(&[1.0, 0.0, 0.0], 5, Some(&by_tag)).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].metadata.tags["role"], "engineer");

    assert!(matches!(
        index.query(&[1.0, 0.0], 5, None).await,
        Err(IndexServiceError::Configuration(ConfigurationError::DimensionMismatch { .. }))
    ));
    assert!(matches!(
        index.upsert(&[IndexedRecord {
            vector: vec![1.0; 4],
            ..record("c0", "c", 0, [0.0; 3])
        }])
        .await,
        Err(IndexServiceError::Configuration(_))
    ));
    assert!(index.query(&[1.0, 0.0, 0.0], 0, None).await.unwrap().is_empty());
}
