//! Embedding providers.
//!
//! Concrete [`Embedder`] implementations behind the core trait:
//! - **[`OpenAiEmbedder`]** calls an OpenAI-compatible `POST {url}/embeddings`.
//! - **[`OllamaEmbedder`]** calls a local Ollama instance's `POST {url}/api/embed`.
//! - **[`HashingEmbedder`]** (from core) runs locally with no network.
//!
//! Providers make exactly one request per call and map HTTP outcomes
//! onto [`EmbeddingServiceError`]:
//!
//! | Outcome | Error | Retried by caller |
//! |---------|-------|-------------------|
//! | 429 | `RateLimited` | yes |
//! | 5xx, connection failure | `Unavailable` | yes |
//! | client timeout | `Timeout` | yes |
//! | other 4xx | `Rejected` | no |
//! | malformed body | `InvalidResponse` | no |
//!
//! Retries and backoff live in [`crate::retry`]; dimensionality is checked
//! by [`docqa_core::embedding::embed_checked`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;

use docqa_core::embedding::{Embedder, HashingEmbedder};
use docqa_core::error::EmbeddingServiceError;

use crate::config::EmbeddingConfig;

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()?)
}

fn transport_error(e: reqwest::Error) -> EmbeddingServiceError {
    if e.is_timeout() {
        EmbeddingServiceError::Timeout
    } else {
        EmbeddingServiceError::Unavailable(e.to_string())
    }
}

/// Map a non-success response onto the error taxonomy.
async fn status_error(response: reqwest::Response) -> EmbeddingServiceError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.as_u16() == 429 {
        EmbeddingServiceError::RateLimited(body)
    } else if status.is_server_error() {
        EmbeddingServiceError::Unavailable(format!("{status}: {body}"))
    } else {
        EmbeddingServiceError::Rejected {
            status: status.as_u16(),
            message: body,
        }
    }
}

async fn post_json<R: for<'de> Deserialize<'de>>(
    request: reqwest::RequestBuilder,
    body: &serde_json::Value,
) -> Result<R, EmbeddingServiceError> {
    let response = request.json(body).send().await.map_err(transport_error)?;
    if !response.status().is_success() {
        return Err(status_error(response).await);
    }
    response
        .json::<R>()
        .await
        .map_err(|e| EmbeddingServiceError::InvalidResponse(e.to_string()))
}

// ============ OpenAI ============

/// OpenAI-compatible embeddings endpoint.
///
/// Requires `OPENAI_API_KEY`.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiItem>,
}

#[derive(Deserialize)]
struct OpenAiItem {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) => key,
            Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
        };
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_URL.to_string()),
            api_key,
            model,
            dims: config.dims,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingServiceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = self
            .client
            .post(format!("{}/embeddings", self.url.trim_end_matches('/')))
            .bearer_auth(&self.api_key);
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let mut parsed: OpenAiResponse = post_json(request, &body).await?;

        // The API may reorder items; `index` ties each back to its input.
        parsed.data.sort_by_key(|item| item.index.unwrap_or(usize::MAX));
        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }
}

// ============ Ollama ============

/// Local Ollama instance (`ollama pull nomic-embed-text` or similar).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

#[derive(Deserialize)]
struct OllamaResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string()),
            model,
            dims: config.dims,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingServiceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')));
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let parsed: OllamaResponse = post_json(request, &body).await.map_err(|e| match e {
            EmbeddingServiceError::Unavailable(msg) => EmbeddingServiceError::Unavailable(format!(
                "{msg} (is Ollama running at {}?)",
                self.url
            )),
            other => other,
        })?;
        Ok(parsed.embeddings)
    }
}

/// Create the configured [`Embedder`].
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"openai"` | [`OpenAiEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"hashing"` | [`HashingEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.dims))),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_provider_needs_no_credentials() {
        let config = EmbeddingConfig {
            dims: 32,
            ..EmbeddingConfig::default()
        };
        let embedder = create_embedder(&config).unwrap();
        assert_eq!(embedder.model_name(), "hashing");
        assert_eq!(embedder.dims(), 32);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = EmbeddingConfig {
            provider: "word2vec".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).is_err());
    }

    #[test]
    fn openai_response_items_are_reordered_by_index() {
        let json = r#"{"data":[{"index":1,"embedding":[2.0]},{"index":0,"embedding":[1.0]}]}"#;
        let mut parsed: OpenAiResponse = serde_json::from_str(json).unwrap();
        parsed.data.sort_by_key(|item| item.index.unwrap_or(usize::MAX));
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|i| i.embedding).collect();
        assert_eq!(vectors, vec![vec![1.0], vec![2.0]]);
    }
}
