//! Retrieval-augmented query engine.
//!
//! Each call to [`QueryEngine::answer`] walks one query through
//!
//! ```text
//! RECEIVED → EMBEDDING_QUERY → RETRIEVING → BUILDING_PROMPT → GENERATING → COMPLETE
//!                                   │
//!                                   └─ nothing above min_score → COMPLETE (fallback)
//! ```
//!
//! with `FAILED` reachable from every step. A failed query returns a
//! [`QueryError`] and never a partial answer; the conversation log is
//! only written once an answer exists, so a failed or cancelled query
//! leaves no trace in it.
//!
//! The engine holds no per-query state of its own: concurrent queries,
//! for the same or different conversations, only share the injected
//! service handles and the [`ConversationStore`]. Dropping the future
//! returned by `answer` drops the in-flight service request with it.

use std::sync::Arc;

use tracing::{debug, info, warn};

use docqa_core::conversation::{ConversationStore, TurnLimit};
use docqa_core::embedding::{embed_checked, Embedder};
use docqa_core::error::{ConfigurationError, EmbeddingServiceError, QueryError};
use docqa_core::generate::Generator;
use docqa_core::index::{MetadataFilter, VectorIndex};
use docqa_core::models::{Answer, AnswerStatus, QueryState, RetrievedChunk, Role, Turn};
use docqa_core::prompt::{assemble, Persona, PromptBudget};

use crate::config::Config;
use crate::retry::{with_retry, RetryPolicy};

/// Retrieval and history knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuerySettings {
    pub top_k: usize,
    /// Hits scoring below this are discarded before prompt assembly.
    pub min_score: f32,
    /// Recent user turns folded into the text that gets embedded.
    pub contextual_turns: usize,
    /// Turns offered to prompt assembly.
    pub history_turns: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        let config = Config::default();
        Self::from_config(&config)
    }
}

impl QuerySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            min_score: config.retrieval.min_score,
            contextual_turns: config.retrieval.contextual_turns,
            history_turns: config.conversation.history_turns,
        }
    }
}

/// Tracks and logs the state of one query.
struct QueryRun<'a> {
    conversation_id: &'a str,
    state: QueryState,
}

impl<'a> QueryRun<'a> {
    fn new(conversation_id: &'a str) -> Self {
        debug!(conversation_id, state = %QueryState::Received, "query received");
        Self {
            conversation_id,
            state: QueryState::Received,
        }
    }

    fn advance(&mut self, next: QueryState) {
        debug!(
            conversation_id = self.conversation_id,
            from = %self.state,
            to = %next,
            "query state"
        );
        self.state = next;
    }
}

pub struct QueryEngine {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    generator: Arc<dyn Generator>,
    conversations: Arc<ConversationStore>,
    persona: Persona,
    budget: PromptBudget,
    settings: QuerySettings,
    embed_retry: RetryPolicy,
    index_retry: RetryPolicy,
    generate_retry: RetryPolicy,
}

impl QueryEngine {
    /// The embedder and the index must agree on dimensionality.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        generator: Arc<dyn Generator>,
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
            generator,
            conversations: Arc::new(ConversationStore::new(defaults.conversation.policy())),
            persona: Persona::default(),
            budget: defaults.generation.budget(),
            settings: QuerySettings::from_config(&defaults),
            embed_retry: RetryPolicy::from_config(&defaults.retry, defaults.embedding.timeout_secs),
            index_retry: RetryPolicy::from_config(&defaults.retry, defaults.index.timeout_secs),
            generate_retry: RetryPolicy::from_config(
                &defaults.retry,
                defaults.generation.timeout_secs,
            ),
        })
    }

    pub fn from_config(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        generator: Arc<dyn Generator>,
    ) -> anyhow::Result<Self> {
        Ok(Self::new(embedder, index, generator)?
            .with_conversations(Arc::new(ConversationStore::new(
                config.conversation.policy(),
            )))
            .with_persona(config.assistant.persona())
            .with_budget(config.generation.budget())
            .with_settings(QuerySettings::from_config(config))
            .with_retry(
                RetryPolicy::from_config(&config.retry, config.embedding.timeout_secs),
                RetryPolicy::from_config(&config.retry, config.index.timeout_secs),
                RetryPolicy::from_config(&config.retry, config.generation.timeout_secs),
            ))
    }

    pub fn with_conversations(mut self, conversations: Arc<ConversationStore>) -> Self {
        self.conversations = conversations;
        self
    }

    pub fn with_persona(mut self, persona: Persona) -> Self {
        self.persona = persona;
        self
    }

    pub fn with_budget(mut self, budget: PromptBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_settings(mut self, settings: QuerySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_retry(
        mut self,
        embed: RetryPolicy,
        index: RetryPolicy,
        generate: RetryPolicy,
    ) -> Self {
        self.embed_retry = embed;
        self.index_retry = index;
        self.generate_retry = generate;
        self
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub async fn answer(&self, conversation_id: &str, question: &str) -> Result<Answer, QueryError> {
        self.answer_filtered(conversation_id, question, None).await
    }

    /// Like [`answer`](Self::answer), restricted to records matching `filter`.
    pub async fn answer_filtered(
        &self,
        conversation_id: &str,
        question: &str,
        filter: Option<&MetadataFilter>,
    ) -> Result<Answer, QueryError> {
        let mut run = QueryRun::new(conversation_id);
        match self.run(&mut run, question, filter).await {
            Ok(answer) => {
                run.advance(QueryState::Complete);
                info!(
                    conversation_id,
                    status = ?answer.status,
                    citations = answer.citations.len(),
                    "query complete"
                );
                Ok(answer)
            }
            Err(e) => {
                warn!(
                    conversation_id,
                    failed_in = %run.state,
                    error = %e,
                    "query failed"
                );
                run.advance(QueryState::Failed);
                Err(e)
            }
        }
    }

    /// Embed `text` and return the nearest records, best first, without
    /// applying the relevance threshold or generating anything.
    pub async fn retrieve(
        &self,
        text: &str,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievedChunk>, QueryError> {
        if text.trim().is_empty() {
            return Err(QueryError::EmptyQuestion);
        }
        let vector = self.embed_query(text).await?;
        Ok(with_retry(&self.index_retry, "query", || {
            self.index.query(&vector, top_k, filter)
        })
        .await?)
    }

    async fn run(
        &self,
        run: &mut QueryRun<'_>,
        question: &str,
        filter: Option<&MetadataFilter>,
    ) -> Result<Answer, QueryError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(QueryError::EmptyQuestion);
        }
        let history = self.conversations.recent_turns(
            run.conversation_id,
            TurnLimit::Turns(self.settings.history_turns),
        );

        run.advance(QueryState::EmbeddingQuery);
        let search_text = contextual_query(&history, question, self.settings.contextual_turns);
        let vector = self.embed_query(&search_text).await?;

        run.advance(QueryState::Retrieving);
        let hits = with_retry(&self.index_retry, "query", || {
            self.index.query(&vector, self.settings.top_k, filter)
        })
        .await?;
        let retrieved = hits.len();
        let hits: Vec<RetrievedChunk> = hits
            .into_iter()
            .filter(|h| h.score >= self.settings.min_score)
            .collect();
        debug!(
            conversation_id = run.conversation_id,
            retrieved,
            relevant = hits.len(),
            best = hits.first().map(|h| h.score),
            "retrieved"
        );

        if hits.is_empty() {
            info!(
                conversation_id = run.conversation_id,
                min_score = self.settings.min_score,
                "no chunk above relevance threshold; returning fallback"
            );
            let answer = self.persona.fallback_message.clone();
            self.record_exchange(run.conversation_id, question, &answer);
            return Ok(Answer {
                answer,
                citations: Vec::new(),
                sources: Vec::new(),
                status: AnswerStatus::InsufficientGrounding,
            });
        }

        run.advance(QueryState::BuildingPrompt);
        let assembled = assemble(
            &self.persona.system_message(),
            &hits,
            &history,
            question,
            self.budget,
        )?;
        if assembled.chunks_dropped > 0 || assembled.turns_dropped > 0 {
            debug!(
                conversation_id = run.conversation_id,
                chunks_dropped = assembled.chunks_dropped,
                turns_dropped = assembled.turns_dropped,
                "prompt trimmed to budget"
            );
        }

        run.advance(QueryState::Generating);
        let text = with_retry(&self.generate_retry, "generate", || {
            self.generator
                .generate(&assembled.prompt, self.budget.max_answer_tokens)
        })
        .await?;

        self.record_exchange(run.conversation_id, question, &text);
        Ok(Answer {
            answer: text,
            citations: assembled.citations(),
            sources: assembled.sources(),
            status: AnswerStatus::Grounded,
        })
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingServiceError> {
        let texts = [text.to_string()];
        let mut vectors = with_retry(&self.embed_retry, "embed", || {
            embed_checked(self.embedder.as_ref(), &texts)
        })
        .await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingServiceError::InvalidResponse("no vector returned".into()))
    }

    fn record_exchange(&self, conversation_id: &str, question: &str, answer: &str) {
        self.conversations
            .append_exchange(conversation_id, question, answer);
    }
}

/// The text embedded for retrieval: the last `turns` user questions,
/// then the current one, so follow-ups like "and for managers?" keep
/// their subject.
fn contextual_query(history: &[Turn], question: &str, turns: usize) -> String {
    let mut earlier: Vec<&str> = history
        .iter()
        .rev()
        .filter(|t| t.role == Role::User)
        .take(turns)
        .map(|t| t.text.as_str())
        .collect();
    if earlier.is_empty() {
        return question.to_string();
    }
    earlier.reverse();
    earlier.push(question);
    earlier.join("\n")
}
