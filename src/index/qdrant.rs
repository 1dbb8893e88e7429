//! Qdrant REST client implementing [`VectorIndex`].
//!
//! Points use the chunk id (a UUID) as the point id and carry the record
//! metadata as payload, plus an `inserted_at` sequence number used to
//! order equal scores; a replaced point keeps its first sequence number.
//! Tag filters become `match.any` conditions on `tags.<key>`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use docqa_core::error::{ConfigurationError, IndexServiceError};
use docqa_core::index::{check_dims, rank, MetadataFilter, Metric, VectorIndex};
use docqa_core::models::{IndexedRecord, RecordMetadata, RetrievedChunk};

/// Extra hits fetched past `top_k` to see ties at the cut.
const TIE_MARGIN: usize = 8;

pub struct QdrantIndex {
    client: reqwest::Client,
    url: String,
    collection: String,
    api_key: Option<String>,
    dims: usize,
    metric: Metric,
    seq: AtomicU64,
}

#[derive(Serialize, Deserialize)]
struct Payload {
    #[serde(flatten)]
    metadata: RecordMetadata,
    #[serde(default)]
    inserted_at: u64,
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct ScoredPoint {
    id: Value,
    score: f32,
    payload: Payload,
}

#[derive(Deserialize)]
struct ScrollResult {
    points: Vec<ScrollPoint>,
    #[serde(default)]
    next_page_offset: Option<Value>,
}

#[derive(Deserialize)]
struct ScrollPoint {
    id: Value,
    payload: Payload,
}

#[derive(Deserialize)]
struct StoredPoint {
    id: Value,
    #[serde(default)]
    payload: StoredSeq,
}

#[derive(Deserialize, Default)]
struct StoredSeq {
    #[serde(default)]
    inserted_at: Option<u64>,
}

#[derive(Deserialize)]
struct CountResult {
    count: usize,
}

fn distance_name(metric: Metric) -> &'static str {
    match metric {
        Metric::Cosine => "Cosine",
        Metric::Dot => "Dot",
    }
}

fn point_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Translate a [`MetadataFilter`] into a Qdrant filter object.
fn to_qdrant_filter(filter: &MetadataFilter) -> Value {
    let mut must = Vec::new();
    if let Some(doc) = &filter.document_id {
        must.push(json!({ "key": "document_id", "match": { "value": doc } }));
    }
    for (key, values) in &filter.tags {
        if !values.is_empty() {
            must.push(json!({ "key": format!("tags.{key}"), "match": { "any": values } }));
        }
    }
    json!({ "must": must })
}

impl QdrantIndex {
    /// Connect and make sure the collection exists with matching settings.
    pub async fn connect(
        url: &str,
        collection: &str,
        api_key: Option<String>,
        timeout: Duration,
        dims: usize,
        metric: Metric,
    ) -> Result<Self, IndexServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IndexServiceError::Unavailable(e.to_string()))?;
        let start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        let index = Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            api_key,
            dims,
            metric,
            seq: AtomicU64::new(start),
        };
        index.ensure_collection().await?;
        Ok(index)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/collections/{}{}", self.url, self.collection, path)
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<reqwest::Response, IndexServiceError> {
        let mut request = self.client.request(method, self.endpoint(path));
        if let Some(key) = &self.api_key {
            request = request.header("api-key", key);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                IndexServiceError::Timeout
            } else {
                IndexServiceError::Unavailable(e.to_string())
            }
        })
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, IndexServiceError> {
        let response = self.send(method, path, body).await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                IndexServiceError::Unavailable(format!("{status}: {message}"))
            } else {
                IndexServiceError::Rejected {
                    status: status.as_u16(),
                    message,
                }
            });
        }
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| IndexServiceError::InvalidResponse(e.to_string()))?;
        Ok(envelope.result)
    }

    async fn ensure_collection(&self) -> Result<(), IndexServiceError> {
        let response = self.send(reqwest::Method::GET, "", None).await?;
        if response.status().as_u16() == 404 {
            info!(collection = %self.collection, dims = self.dims, metric = %self.metric, "creating Qdrant collection");
            let _: Value = self
                .call(
                    reqwest::Method::PUT,
                    "",
                    Some(json!({
                        "vectors": { "size": self.dims, "distance": distance_name(self.metric) }
                    })),
                )
                .await?;
            return Ok(());
        }
        if !response.status().is_success() {
            let status = response.status();
            let message = response.text().await.unwrap_or_default();
            return Err(IndexServiceError::Unavailable(format!("{status}: {message}")));
        }

        let info: Envelope<Value> = response
            .json()
            .await
            .map_err(|e| IndexServiceError::InvalidResponse(e.to_string()))?;
        let vectors = &info.result["config"]["params"]["vectors"];
        let size = vectors["size"].as_u64().map(|s| s as usize);
        let distance = vectors["distance"].as_str().unwrap_or_default();
        if size != Some(self.dims) {
            return Err(ConfigurationError::DimensionMismatch {
                expected: self.dims,
                actual: size.unwrap_or(0),
            }
            .into());
        }
        if distance != distance_name(self.metric) {
            return Err(ConfigurationError::MetricMismatch {
                expected: distance_name(self.metric).to_string(),
                actual: distance.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    async fn upsert(&self, records: &[IndexedRecord]) -> Result<(), IndexServiceError> {
        if records.is_empty() {
            return Ok(());
        }
        for r in records {
            check_dims(self.dims, &r.vector)?;
        }
        // Replaced points keep their first insertion sequence.
        let ids: Vec<&str> = records.iter().map(|r| r.chunk_id.as_str()).collect();
        let stored: Vec<StoredPoint> = self
            .call(
                reqwest::Method::POST,
                "/points",
                Some(json!({ "ids": ids, "with_payload": ["inserted_at"], "with_vector": false })),
            )
            .await?;
        let existing: HashMap<String, u64> = stored
            .into_iter()
            .filter_map(|p| p.payload.inserted_at.map(|seq| (point_id(&p.id), seq)))
            .collect();

        let mut points = Vec::with_capacity(records.len());
        for r in records {
            let inserted_at = match existing.get(&r.chunk_id) {
                Some(&seq) => seq,
                None => self.seq.fetch_add(1, Ordering::Relaxed),
            };
            let payload = Payload {
                metadata: r.metadata.clone(),
                inserted_at,
            };
            points.push(json!({ "id": r.chunk_id, "vector": r.vector, "payload": payload }));
        }
        let _: Value = self
            .call(
                reqwest::Method::PUT,
                "/points?wait=true",
                Some(json!({ "points": points })),
            )
            .await?;
        Ok(())
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize, IndexServiceError> {
        let filter = to_qdrant_filter(&MetadataFilter::new().document(document_id));
        let counted: CountResult = self
            .call(
                reqwest::Method::POST,
                "/points/count",
                Some(json!({ "filter": filter, "exact": true })),
            )
            .await?;
        if counted.count == 0 {
            return Ok(0);
        }
        let _: Value = self
            .call(
                reqwest::Method::POST,
                "/points/delete?wait=true",
                Some(json!({ "filter": filter })),
            )
            .await?;
        Ok(counted.count)
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
        let mut body = json!({ "vector": vector, "with_payload": true });
        if let Some(f) = filter.filter(|f| !f.is_empty()) {
            body["filter"] = to_qdrant_filter(f);
        }
        // Qdrant orders equal scores its own way, so widen the page until
        // every point tied with the last kept score is in hand.
        let mut limit = top_k + TIE_MARGIN;
        let points = loop {
            body["limit"] = json!(limit);
            let points: Vec<ScoredPoint> = self
                .call(reqwest::Method::POST, "/points/search", Some(body.clone()))
                .await?;
            if points.len() < limit || points.len() <= top_k {
                break points;
            }
            let boundary = points[top_k - 1].score;
            match points.last() {
                Some(last) if last.score < boundary => break points,
                _ => limit *= 2,
            }
        };
        let hits = points
            .into_iter()
            .map(|p| (p.score, p.payload.inserted_at, (point_id(&p.id), p.payload.metadata)))
            .collect();
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
        let filter = to_qdrant_filter(&MetadataFilter::new().document(document_id));
        let mut ids = Vec::new();
        let mut offset: Option<Value> = None;
        loop {
            let mut body = json!({
                "filter": filter,
                "limit": 256,
                "with_payload": true,
                "with_vector": false,
            });
            if let Some(o) = offset.take() {
                body["offset"] = o;
            }
            let page: ScrollResult = self
                .call(reqwest::Method::POST, "/points/scroll", Some(body))
                .await?;
            ids.extend(
                page.points
                    .into_iter()
                    .map(|p| (p.payload.metadata.position, point_id(&p.id))),
            );
            match page.next_page_offset {
                Some(next) if !next.is_null() => offset = Some(next),
                _ => break,
            }
        }
        ids.sort();
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_translation() {
        let filter = MetadataFilter::new()
            .document("handbook.pdf")
            .tag_any("role", "engineer")
            .tag_any("role", "general");
        assert_eq!(
            to_qdrant_filter(&filter),
            json!({ "must": [
                { "key": "document_id", "match": { "value": "handbook.pdf" } },
                { "key": "tags.role", "match": { "any": ["engineer", "general"] } },
            ]})
        );
    }

    #[test]
    fn payload_flattens_metadata() {
        let json = json!({
            "document_id": "d",
            "source_format": "pdf",
            "position": 2,
            "text": "hello",
            "inserted_at": 9
        });
        let payload: Payload = serde_json::from_value(json).unwrap();
        assert_eq!(payload.metadata.position, 2);
        assert_eq!(payload.inserted_at, 9);
        assert!(payload.metadata.tags.is_empty());
    }
}
