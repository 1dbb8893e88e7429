//! SQLite-backed [`VectorIndex`].
//!
//! Vectors are stored as little-endian f32 BLOBs next to their JSON
//! metadata and scanned brute-force at query time. `seq` is an
//! autoincrement column assigned on first insert and kept on conflict,
//! which gives ties a stable insertion order.
//!
//! The `index_meta` table pins the dimensionality and metric the index
//! was created with; opening it with different values is a
//! [`ConfigurationError`].

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use docqa_core::embedding::{blob_to_vec, vec_to_blob};
use docqa_core::error::{ConfigurationError, IndexServiceError};
use docqa_core::index::{check_dims, rank, MetadataFilter, Metric, VectorIndex};
use docqa_core::models::{IndexedRecord, RecordMetadata, RetrievedChunk};

pub struct SqliteIndex {
    pool: SqlitePool,
    dims: usize,
    metric: Metric,
}

fn db_err(e: sqlx::Error) -> IndexServiceError {
    match e {
        sqlx::Error::PoolTimedOut => IndexServiceError::Timeout,
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            IndexServiceError::Unavailable(e.to_string())
        }
        sqlx::Error::Database(db) => IndexServiceError::Rejected {
            status: 0,
            message: db.to_string(),
        },
        other => IndexServiceError::InvalidResponse(other.to_string()),
    }
}

impl SqliteIndex {
    /// Create the schema if missing and check the pinned dims/metric.
    pub async fn open(
        pool: SqlitePool,
        dims: usize,
        metric: Metric,
    ) -> Result<Self, IndexServiceError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS index_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                chunk_id TEXT NOT NULL UNIQUE,
                document_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                metadata_json TEXT NOT NULL,
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(db_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_document_id ON records(document_id)")
            .execute(&pool)
            .await
            .map_err(db_err)?;

        let pinned_dims = meta_get(&pool, "dims").await?;
        let pinned_metric = meta_get(&pool, "metric").await?;
        match pinned_dims {
            Some(d) if d != dims.to_string() => {
                return Err(ConfigurationError::DimensionMismatch {
                    expected: dims,
                    actual: d.parse().unwrap_or(0),
                }
                .into())
            }
            Some(_) => {}
            None => meta_set(&pool, "dims", &dims.to_string()).await?,
        }
        match pinned_metric {
            Some(m) if m != metric.as_str() => {
                return Err(ConfigurationError::MetricMismatch {
                    expected: metric.to_string(),
                    actual: m,
                }
                .into())
            }
            Some(_) => {}
            None => meta_set(&pool, "metric", metric.as_str()).await?,
        }

        Ok(Self { pool, dims, metric })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn meta_get(pool: &SqlitePool, key: &str) -> Result<Option<String>, IndexServiceError> {
    sqlx::query_scalar::<_, String>("SELECT value FROM index_meta WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .map_err(db_err)
}

async fn meta_set(pool: &SqlitePool, key: &str, value: &str) -> Result<(), IndexServiceError> {
    sqlx::query("INSERT INTO index_meta (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(value)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

#[async_trait]
impl VectorIndex for SqliteIndex {
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
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for r in records {
            let metadata = serde_json::to_string(&r.metadata)
                .map_err(|e| IndexServiceError::InvalidResponse(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO records (chunk_id, document_id, position, metadata_json, embedding)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    document_id = excluded.document_id,
                    position = excluded.position,
                    metadata_json = excluded.metadata_json,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&r.chunk_id)
            .bind(&r.metadata.document_id)
            .bind(r.metadata.position as i64)
            .bind(metadata)
            .bind(vec_to_blob(&r.vector))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize, IndexServiceError> {
        let result = sqlx::query("DELETE FROM records WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() as usize)
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
        let rows = match filter.and_then(|f| f.document_id.as_deref()) {
            Some(doc) => sqlx::query(
                "SELECT seq, chunk_id, metadata_json, embedding FROM records WHERE document_id = ?",
            )
            .bind(doc)
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query("SELECT seq, chunk_id, metadata_json, embedding FROM records")
                .fetch_all(&self.pool)
                .await,
        }
        .map_err(db_err)?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let metadata_json: String = row.try_get("metadata_json").map_err(db_err)?;
            let metadata: RecordMetadata = serde_json::from_str(&metadata_json)
                .map_err(|e| IndexServiceError::InvalidResponse(e.to_string()))?;
            if filter.is_some_and(|f| !f.matches(&metadata)) {
                continue;
            }
            let seq: i64 = row.try_get("seq").map_err(db_err)?;
            let chunk_id: String = row.try_get("chunk_id").map_err(db_err)?;
            let blob: Vec<u8> = row.try_get("embedding").map_err(db_err)?;
            let score = self.metric.score(vector, &blob_to_vec(&blob));
            hits.push((score, seq as u64, (chunk_id, metadata)));
        }

        Ok(rank(hits, top_k)
            .into_iter()
            .map(|(score, (chunk_id, metadata))| RetrievedChunk {
                chunk_id,
                score,
                metadata,
            })
            .collect())
    }

    async fn chunk_ids(&self, document_id: &str) -> Result<Vec<String>, IndexServiceError> {
        sqlx::query_scalar::<_, String>("SELECT chunk_id FROM records WHERE document_id = ? ORDER BY position")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }
}
