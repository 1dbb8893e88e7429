//! HTTP providers against local mock servers: OpenAI and Ollama
//! embeddings, OpenAI chat completions and the Qdrant REST index.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};

use docqa::config::{EmbeddingConfig, GenerationConfig};
use docqa::embedding::{OllamaEmbedder, OpenAiEmbedder};
use docqa::generate::OpenAiGenerator;
use docqa::index::qdrant::QdrantIndex;
use docqa_core::embedding::Embedder;
use docqa_core::error::{
    ConfigurationError, EmbeddingServiceError, GenerationServiceError, IndexServiceError,
};
use docqa_core::generate::{Generator, Prompt};
use docqa_core::index::{MetadataFilter, Metric, VectorIndex};
use docqa_core::models::{IndexedRecord, RecordMetadata, SourceFormat};

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn set_api_key() {
    std::env::set_var("OPENAI_API_KEY", "test-key");
}

fn bearer_ok(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some("Bearer test-key")
}

// ============ Embeddings ============

fn openai_embedding_config(url: String) -> EmbeddingConfig {
    EmbeddingConfig {
        provider: "openai".to_string(),
        model: Some("text-embedding-3-small".to_string()),
        dims: 3,
        url: Some(url),
        timeout_secs: 5,
        ..EmbeddingConfig::default()
    }
}

/// Embeds each input as `[len, position, 1]` and returns the items in
/// reverse order, relying on `index` to restore the input order.
async fn reversed_embeddings(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if !bearer_ok(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "bad key" })));
    }
    let inputs = body["input"].as_array().cloned().unwrap_or_default();
    let mut data: Vec<Value> = inputs
        .iter()
        .enumerate()
        .map(|(i, text)| {
            let len = text.as_str().unwrap_or_default().len() as f32;
            json!({ "index": i, "embedding": [len, i as f32, 1.0] })
        })
        .collect();
    data.reverse();
    (StatusCode::OK, Json(json!({ "object": "list", "data": data })))
}

#[tokio::test]
async fn test_openai_embeddings_follow_input_order() {
    set_api_key();
    let url = serve(Router::new().route("/v1/embeddings", post(reversed_embeddings))).await;
    let embedder = OpenAiEmbedder::new(&openai_embedding_config(format!("{url}/v1/"))).unwrap();

    let vectors = embedder
        .embed_many(&["a".to_string(), "bbb".to_string(), "cc".to_string()])
        .await
        .unwrap();
    assert_eq!(
        vectors,
        vec![
            vec![1.0, 0.0, 1.0],
            vec![3.0, 1.0, 1.0],
            vec![2.0, 2.0, 1.0]
        ]
    );
    assert!(embedder.embed_many(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_openai_embedding_status_mapping() {
    set_api_key();
    let app = Router::new()
        .route(
            "/busy/embeddings",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        )
        .route(
            "/down/embeddings",
            post(|| async { (StatusCode::BAD_GATEWAY, "upstream") }),
        )
        .route(
            "/bad/embeddings",
            post(|| async { (StatusCode::BAD_REQUEST, "input too long") }),
        )
        .route("/garbled/embeddings", post(|| async { "not json" }));
    let url = serve(app).await;
    let embed = |path: &str| {
        OpenAiEmbedder::new(&openai_embedding_config(format!("{url}/{path}"))).unwrap()
    };
    let input = vec!["hello".to_string()];

    let err = embed("busy").embed_many(&input).await.unwrap_err();
    assert_eq!(err, EmbeddingServiceError::RateLimited("slow down".into()));
    assert!(err.is_retryable());

    let err = embed("down").embed_many(&input).await.unwrap_err();
    assert!(matches!(err, EmbeddingServiceError::Unavailable(_)));
    assert!(err.is_retryable());

    let err = embed("bad").embed_many(&input).await.unwrap_err();
    assert_eq!(
        err,
        EmbeddingServiceError::Rejected {
            status: 400,
            message: "input too long".into()
        }
    );
    assert!(!err.is_retryable());

    let err = embed("garbled").embed_many(&input).await.unwrap_err();
    assert!(matches!(err, EmbeddingServiceError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_ollama_embeddings() {
    let app = Router::new().route(
        "/api/embed",
        post(|Json(body): Json<Value>| async move {
            let n = body["input"].as_array().map(|a| a.len()).unwrap_or(0);
            Json(json!({ "model": body["model"], "embeddings": vec![[0.5, 0.5]; n] }))
        }),
    );
    let url = serve(app).await;
    let embedder = OllamaEmbedder::new(&EmbeddingConfig {
        provider: "ollama".to_string(),
        model: Some("nomic-embed-text".to_string()),
        dims: 2,
        url: Some(url),
        ..EmbeddingConfig::default()
    })
    .unwrap();

    let vectors = embedder
        .embed_many(&["x".to_string(), "y".to_string()])
        .await
        .unwrap();
    assert_eq!(vectors, vec![vec![0.5, 0.5], vec![0.5, 0.5]]);
    assert_eq!(embedder.model_name(), "nomic-embed-text");
}

#[tokio::test]
async fn test_unreachable_provider_is_unavailable() {
    let embedder = OllamaEmbedder::new(&EmbeddingConfig {
        provider: "ollama".to_string(),
        model: Some("nomic-embed-text".to_string()),
        url: Some("http://127.0.0.1:9".to_string()),
        timeout_secs: 2,
        ..EmbeddingConfig::default()
    })
    .unwrap();
    let err = embedder.embed_many(&["x".to_string()]).await.unwrap_err();
    assert!(err.is_retryable(), "{err:?}");
}

// ============ Chat completions ============

fn generation_config(url: String) -> GenerationConfig {
    GenerationConfig {
        provider: "openai".to_string(),
        model: "gpt-4o-mini".to_string(),
        url: Some(url),
        timeout_secs: 5,
        ..GenerationConfig::default()
    }
}

#[tokio::test]
async fn test_chat_completion_sends_both_messages() {
    set_api_key();
    let seen: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    let app = Router::new()
        .route(
            "/chat/completions",
            post(
                |State(seen): State<Arc<Mutex<Option<Value>>>>,
                 headers: HeaderMap,
                 Json(body): Json<Value>| async move {
                    assert!(bearer_ok(&headers));
                    *seen.lock().unwrap() = Some(body);
                    Json(json!({
                        "choices": [{ "message": { "role": "assistant", "content": "  Blue [1].\n" } }]
                    }))
                },
            ),
        )
        .with_state(seen.clone());
    let url = serve(app).await;
    let generator = OpenAiGenerator::new(&generation_config(url)).unwrap();

    let prompt = Prompt {
        system: "Answer from context.".to_string(),
        user: "Question: What color is the sky?".to_string(),
    };
    let answer = generator.generate(&prompt, 120).await.unwrap();
    assert_eq!(answer, "Blue [1].");

    let body = seen.lock().unwrap().clone().unwrap();
    assert_eq!(body["model"], "gpt-4o-mini");
    assert_eq!(body["max_tokens"], 120);
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][0]["content"], "Answer from context.");
    assert_eq!(body["messages"][1]["role"], "user");
    assert_eq!(body["messages"][1]["content"], "Question: What color is the sky?");
}

#[tokio::test]
async fn test_chat_completion_failures() {
    set_api_key();
    let app = Router::new()
        .route(
            "/long/chat/completions",
            post(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    r#"{"error":{"code":"context_length_exceeded"}}"#,
                )
            }),
        )
        .route(
            "/empty/chat/completions",
            post(|| async { Json(json!({ "choices": [{ "message": { "content": "   " } }] })) }),
        )
        .route(
            "/busy/chat/completions",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "later") }),
        );
    let url = serve(app).await;
    let prompt = Prompt {
        system: "s".to_string(),
        user: "u".to_string(),
    };
    let generate = |path: &str| OpenAiGenerator::new(&generation_config(format!("{url}/{path}"))).unwrap();

    let err = generate("long").generate(&prompt, 10).await.unwrap_err();
    assert!(matches!(err, GenerationServiceError::ContextTooLong(_)));
    assert!(!err.is_retryable());

    let err = generate("empty").generate(&prompt, 10).await.unwrap_err();
    assert!(matches!(err, GenerationServiceError::InvalidResponse(_)));

    let err = generate("busy").generate(&prompt, 10).await.unwrap_err();
    assert!(matches!(err, GenerationServiceError::RateLimited(_)));
}

// ============ Qdrant ============

/// Just enough of the Qdrant REST API for one collection named `docs`.
#[derive(Default)]
struct FakeQdrant {
    vectors: Option<Value>,
    points: Vec<Value>,
    api_keys: Vec<String>,
}

type Shared = Arc<Mutex<FakeQdrant>>;

fn ok(result: Value) -> Json<Value> {
    Json(json!({ "result": result, "status": "ok", "time": 0.0 }))
}

fn record_key(state: &Shared, headers: &HeaderMap) {
    if let Some(key) = headers.get("api-key").and_then(|v| v.to_str().ok()) {
        state.lock().unwrap().api_keys.push(key.to_string());
    }
}

fn matches_filter(filter: &Value, payload: &Value) -> bool {
    let Some(must) = filter["must"].as_array() else {
        return true;
    };
    must.iter().all(|cond| {
        let key = cond["key"].as_str().unwrap_or_default();
        let value = match key.strip_prefix("tags.") {
            Some(tag) => &payload["tags"][tag],
            None => &payload[key],
        };
        if let Some(any) = cond["match"]["any"].as_array() {
            any.contains(value)
        } else {
            &cond["match"]["value"] == value
        }
    })
}

fn dot(a: &Value, b: &Value) -> f64 {
    let (Some(a), Some(b)) = (a.as_array(), b.as_array()) else {
        return 0.0;
    };
    a.iter()
        .zip(b)
        .map(|(x, y)| x.as_f64().unwrap_or(0.0) * y.as_f64().unwrap_or(0.0))
        .sum()
}

async fn get_collection(State(state): State<Shared>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    record_key(&state, &headers);
    match state.lock().unwrap().vectors.clone() {
        Some(vectors) => (
            StatusCode::OK,
            ok(json!({ "status": "green", "config": { "params": { "vectors": vectors } } })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "status": { "error": "Not found: Collection `docs` doesn't exist!" } })),
        ),
    }
}

async fn create_collection(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    state.lock().unwrap().vectors = Some(body["vectors"].clone());
    ok(json!(true))
}

async fn upsert_points(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let mut state = state.lock().unwrap();
    for point in body["points"].as_array().cloned().unwrap_or_default() {
        match state.points.iter_mut().find(|p| p["id"] == point["id"]) {
            Some(existing) => *existing = point,
            None => state.points.push(point),
        }
    }
    ok(json!({ "operation_id": 1, "status": "completed" }))
}

async fn retrieve_points(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let state = state.lock().unwrap();
    let ids = body["ids"].as_array().cloned().unwrap_or_default();
    let points: Vec<Value> = state
        .points
        .iter()
        .filter(|p| ids.contains(&p["id"]))
        .map(|p| json!({ "id": p["id"], "payload": { "inserted_at": p["payload"]["inserted_at"] } }))
        .collect();
    ok(Value::Array(points))
}

async fn search_points(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let state = state.lock().unwrap();
    let limit = body["limit"].as_u64().unwrap_or(10) as usize;
    // Newest first, so equal scores arrive out of insertion order.
    let mut hits: Vec<Value> = state
        .points
        .iter()
        .rev()
        .filter(|p| matches_filter(&body["filter"], &p["payload"]))
        .map(|p| {
            json!({
                "id": p["id"],
                "version": 0,
                "score": dot(&body["vector"], &p["vector"]),
                "payload": p["payload"],
            })
        })
        .collect();
    hits.sort_by(|a, b| {
        b["score"]
            .as_f64()
            .partial_cmp(&a["score"].as_f64())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(limit);
    ok(Value::Array(hits))
}

async fn count_points(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let state = state.lock().unwrap();
    let count = state
        .points
        .iter()
        .filter(|p| matches_filter(&body["filter"], &p["payload"]))
        .count();
    ok(json!({ "count": count }))
}

async fn delete_points(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let mut state = state.lock().unwrap();
    state
        .points
        .retain(|p| !matches_filter(&body["filter"], &p["payload"]));
    ok(json!({ "operation_id": 2, "status": "completed" }))
}

async fn scroll_points(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let state = state.lock().unwrap();
    let points: Vec<Value> = state
        .points
        .iter()
        .rev()
        .filter(|p| matches_filter(&body["filter"], &p["payload"]))
        .map(|p| json!({ "id": p["id"], "payload": p["payload"] }))
        .collect();
    ok(json!({ "points": points, "next_page_offset": null }))
}

async fn fake_qdrant() -> (String, Shared) {
    let state: Shared = Arc::default();
    let app = Router::new()
        .route("/collections/docs", get(get_collection).put(create_collection))
        .route(
            "/collections/docs/points",
            put(upsert_points).post(retrieve_points),
        )
        .route("/collections/docs/points/search", post(search_points))
        .route("/collections/docs/points/count", post(count_points))
        .route("/collections/docs/points/delete", post(delete_points))
        .route("/collections/docs/points/scroll", post(scroll_points))
        .with_state(state.clone());
    (serve(app).await, state)
}

fn point(chunk_id: &str, document_id: &str, position: usize, vector: [f32; 3]) -> IndexedRecord {
    IndexedRecord {
        chunk_id: chunk_id.to_string(),
        vector: vector.to_vec(),
        metadata: RecordMetadata {
            document_id: document_id.to_string(),
            source_format: SourceFormat::Pdf,
            position,
            text: format!("{document_id} part {position}"),
            section: Some(format!("page {}", position + 1)),
            content_hash: String::new(),
            tags: BTreeMap::new(),
        },
    }
}

async fn connect(url: &str, dims: usize, metric: Metric) -> Result<QdrantIndex, IndexServiceError> {
    QdrantIndex::connect(
        url,
        "docs",
        Some("secret".to_string()),
        Duration::from_secs(5),
        dims,
        metric,
    )
    .await
}

#[tokio::test]
async fn test_qdrant_creates_missing_collection() {
    let (url, state) = fake_qdrant().await;
    connect(&url, 3, Metric::Cosine).await.unwrap();

    let state = state.lock().unwrap();
    assert_eq!(
        state.vectors,
        Some(json!({ "size": 3, "distance": "Cosine" }))
    );
    assert!(state.api_keys.iter().all(|k| k == "secret"));
    assert!(!state.api_keys.is_empty());
}

#[tokio::test]
async fn test_qdrant_rejects_mismatched_collection() {
    let (url, _state) = fake_qdrant().await;
    connect(&url, 3, Metric::Cosine).await.unwrap();

    assert!(matches!(
        connect(&url, 4, Metric::Cosine).await,
        Err(IndexServiceError::Configuration(ConfigurationError::DimensionMismatch {
            expected: 4,
            actual: 3
        }))
    ));
    assert!(matches!(
        connect(&url, 3, Metric::Dot).await,
        Err(IndexServiceError::Configuration(ConfigurationError::MetricMismatch { .. }))
    ));
}

#[tokio::test]
async fn test_qdrant_round_trip() {
    let (url, _state) = fake_qdrant().await;
    let index = connect(&url, 3, Metric::Cosine).await.unwrap();

    let mut tagged = point("c3", "b", 0, [0.0, 0.0, 1.0]);
    tagged
        .metadata
        .tags
        .insert("role".to_string(), "engineer".to_string());
    index
        .upsert(&[
            point("c2", "a", 1, [0.0, 1.0, 0.0]),
            point("c1", "a", 0, [1.0, 0.0, 0.0]),
            tagged,
        ])
        .await
        .unwrap();

    // Ordered by position, not by insertion.
    assert_eq!(index.chunk_ids("a").await.unwrap(), vec!["c1", "c2"]);

    let hits = index.query(&[1.0, 0.0, 0.0], 1, None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk_id, "c1");
    assert_eq!(hits[0].metadata.section.as_deref(), Some("page 1"));

    let engineers = MetadataFilter::new().tag_any("role", "engineer");
    let hits = index
        .query(&[1.0, 1.0, 1.0], 10, Some(&engineers))
        .await
        .unwrap();
    let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
    assert_eq!(ids, vec!["c3"]);

    assert_eq!(index.delete_by_document("a").await.unwrap(), 2);
    assert_eq!(index.delete_by_document("a").await.unwrap(), 0);
    assert!(index.chunk_ids("a").await.unwrap().is_empty());
    assert_eq!(index.chunk_ids("b").await.unwrap(), vec!["c3"]);
}

#[tokio::test]
async fn test_qdrant_equal_scores_keep_insertion_order() {
    let (url, _state) = fake_qdrant().await;
    let index = connect(&url, 3, Metric::Cosine).await.unwrap();

    index
        .upsert(&[point("first", "a", 0, [1.0, 0.0, 0.0])])
        .await
        .unwrap();
    index
        .upsert(&[point("second", "b", 0, [1.0, 0.0, 0.0])])
        .await
        .unwrap();

    let hits = index.query(&[1.0, 0.0, 0.0], 2, None).await.unwrap();
    let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
    assert_eq!(ids, vec!["first", "second"]);

    assert!(matches!(
        index.query(&[1.0, 0.0], 2, None).await,
        Err(IndexServiceError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_qdrant_replaced_point_keeps_its_place_among_ties() {
    let (url, _state) = fake_qdrant().await;
    let index = connect(&url, 3, Metric::Cosine).await.unwrap();

    index
        .upsert(&[point("first", "a", 0, [1.0, 0.0, 0.0])])
        .await
        .unwrap();
    index
        .upsert(&[point("second", "b", 0, [1.0, 0.0, 0.0])])
        .await
        .unwrap();
    index
        .upsert(&[point("first", "a", 0, [1.0, 0.0, 0.0])])
        .await
        .unwrap();

    let hits = index.query(&[1.0, 0.0, 0.0], 2, None).await.unwrap();
    let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
    assert_eq!(ids, vec!["first", "second"]);
}

#[tokio::test]
async fn test_qdrant_ties_past_the_page_still_rank_by_insertion() {
    let (url, _state) = fake_qdrant().await;
    let index = connect(&url, 3, Metric::Cosine).await.unwrap();

    for i in 0..20 {
        index
            .upsert(&[point(&format!("p{i:02}"), "a", i, [0.0, 1.0, 0.0])])
            .await
            .unwrap();
    }
    index
        .upsert(&[point("other", "b", 0, [0.0, 0.0, 1.0])])
        .await
        .unwrap();

    // The server returns newest first, so the oldest tie is only seen once
    // the page covers every tied point.
    let hits = index.query(&[0.0, 1.0, 0.0], 2, None).await.unwrap();
    let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
    assert_eq!(ids, vec!["p00", "p01"]);
}
