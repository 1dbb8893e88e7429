//! Generator trait: assembled prompt in, answer text out.

use async_trait::async_trait;

use crate::chunk::estimate_tokens;
use crate::error::GenerationServiceError;

/// A chat prompt: one system message and one user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn token_estimate(&self) -> usize {
        estimate_tokens(&self.system) + estimate_tokens(&self.user)
    }
}

/// Language-model backend.
///
/// One call is one request; retries and timeouts are applied by the caller.
/// Dropping the returned future must abandon the request.
#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;

    /// Generate at most `max_tokens` tokens of answer for `prompt`.
    async fn generate(
        &self,
        prompt: &Prompt,
        max_tokens: usize,
    ) -> Result<String, GenerationServiceError>;
}
