//! Answer generators.
//!
//! - **[`OpenAiGenerator`]** calls an OpenAI-compatible
//!   `POST {url}/chat/completions`.
//! - **[`DisabledGenerator`]** always reports the service as unavailable;
//!   retrieval-only setups still get the insufficient-grounding fallback
//!   and `search`.
//!
//! As with embeddings, one call is one request and retries belong to the
//! caller. Dropping the future aborts the HTTP request.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;

use docqa_core::error::GenerationServiceError;
use docqa_core::generate::{Generator, Prompt};

use crate::config::GenerationConfig;

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _: &Prompt, _: usize) -> Result<String, GenerationServiceError> {
        Err(GenerationServiceError::Unavailable(
            "generation provider is disabled".to_string(),
        ))
    }
}

/// OpenAI chat completions. Requires `OPENAI_API_KEY`.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) => key,
            Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
        };
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs.max(1)))
                .build()?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_URL.to_string()),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

/// Classify a failed chat completion.
fn classify(status: u16, body: String) -> GenerationServiceError {
    match status {
        429 => GenerationServiceError::RateLimited(body),
        _ if body.contains("context_length_exceeded") => {
            GenerationServiceError::ContextTooLong(body)
        }
        500..=599 => GenerationServiceError::Unavailable(format!("{status}: {body}")),
        _ => GenerationServiceError::Rejected {
            status,
            message: body,
        },
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        prompt: &Prompt,
        max_tokens: usize,
    ) -> Result<String, GenerationServiceError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_tokens": max_tokens,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
        });
        let response = self
            .client
            .post(format!("{}/chat/completions", self.url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationServiceError::Timeout
                } else {
                    GenerationServiceError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify(status.as_u16(), text));
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationServiceError::InvalidResponse(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GenerationServiceError::InvalidResponse("empty completion".to_string()))
    }
}

pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiGenerator::new(config)?)),
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_statuses() {
        assert!(matches!(
            classify(429, "slow down".into()),
            GenerationServiceError::RateLimited(_)
        ));
        assert!(matches!(
            classify(400, r#"{"error":{"code":"context_length_exceeded"}}"#.into()),
            GenerationServiceError::ContextTooLong(_)
        ));
        assert!(matches!(
            classify(503, "overloaded".into()),
            GenerationServiceError::Unavailable(_)
        ));
        assert_eq!(
            classify(401, "bad key".into()),
            GenerationServiceError::Rejected {
                status: 401,
                message: "bad key".into()
            }
        );
    }

    #[tokio::test]
    async fn disabled_generator_is_unavailable() {
        let prompt = Prompt {
            system: String::new(),
            user: "q".into(),
        };
        let err = DisabledGenerator.generate(&prompt, 10).await.unwrap_err();
        assert!(matches!(err, GenerationServiceError::Unavailable(_)));
    }
}
