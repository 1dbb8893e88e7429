//! TOML configuration.
//!
//! Every section has defaults, so an empty file is a valid configuration
//! for offline use (in-memory index, hashing embedder, generation
//! disabled). [`load_config`] parses and validates; invalid values are
//! reported before any document or question is touched.
//!
//! Secrets are never read from the file: the OpenAI clients take
//! `OPENAI_API_KEY` and the Qdrant client `QDRANT_API_KEY` from the
//! environment.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use docqa_core::chunk::ChunkParams;
use docqa_core::conversation::RetentionPolicy;
use docqa_core::index::Metric;
use docqa_core::prompt::{Persona, PromptBudget, DEFAULT_FALLBACK};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexConfig {
    /// `memory`, `sqlite` or `qdrant`.
    pub backend: String,
    /// SQLite database file.
    pub path: PathBuf,
    /// Qdrant base URL.
    pub url: String,
    pub collection: String,
    pub metric: String,
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            path: PathBuf::from("./data/docqa.sqlite"),
            url: "http://localhost:6333".to_string(),
            collection: "documents".to_string(),
            metric: "cosine".to_string(),
            timeout_secs: 10,
        }
    }
}

impl IndexConfig {
    pub fn metric(&self) -> Result<Metric> {
        Ok(self.metric.parse::<Metric>()?)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    /// How far back from the hard limit to look for a breakpoint.
    pub search_window_tokens: Option<usize>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: 250,
            overlap_tokens: 50,
            search_window_tokens: None,
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> Result<ChunkParams> {
        let params = ChunkParams::new(self.max_tokens, self.overlap_tokens)?;
        Ok(match self.search_window_tokens {
            Some(w) => params.with_search_window(w),
            None => params,
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `openai`, `ollama` or `hashing`.
    pub provider: String,
    pub model: Option<String>,
    pub dims: usize,
    pub url: Option<String>,
    pub batch_size: usize,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            model: None,
            dims: 384,
            url: None,
            batch_size: 64,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    /// `openai` or `disabled`.
    pub provider: String,
    pub model: String,
    pub url: Option<String>,
    pub temperature: f32,
    pub max_answer_tokens: usize,
    /// Context window of the model, prompt and answer together.
    pub context_tokens: usize,
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: "gpt-4o".to_string(),
            url: None,
            temperature: 0.1,
            max_answer_tokens: 800,
            context_tokens: 16_000,
            timeout_secs: 60,
        }
    }
}

impl GenerationConfig {
    pub fn budget(&self) -> PromptBudget {
        PromptBudget {
            context_tokens: self.context_tokens,
            max_answer_tokens: self.max_answer_tokens,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1000,
            max_delay_ms: 32_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Hits scoring below this are ignored; none left means no generation.
    pub min_score: f32,
    /// Recent turns prepended to the question before embedding it.
    pub contextual_turns: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 4,
            min_score: 0.2,
            contextual_turns: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AssistantConfig {
    pub name: String,
    pub system_prompt: Option<String>,
    pub core_values: Option<String>,
    pub fallback_message: String,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            name: "DocQA".to_string(),
            system_prompt: None,
            core_values: None,
            fallback_message: DEFAULT_FALLBACK.to_string(),
        }
    }
}

impl AssistantConfig {
    pub fn persona(&self) -> Persona {
        Persona {
            name: self.name.clone(),
            system_prompt: self.system_prompt.clone(),
            core_values: self.core_values.clone(),
            fallback_message: self.fallback_message.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConversationConfig {
    pub max_turns: usize,
    pub max_tokens: usize,
    /// Turns included in the prompt.
    pub history_turns: usize,
    pub max_conversations: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_turns: 20,
            max_tokens: 4000,
            history_turns: 6,
            max_conversations: 1000,
        }
    }
}

impl ConversationConfig {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_turns: self.max_turns,
            max_tokens: self.max_tokens,
            max_conversations: self.max_conversations,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    pub root: PathBuf,
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: bool,
    /// Names given to leading directory levels, e.g. `["department", "role"]`.
    pub tag_levels: Vec<String>,
    pub workers: usize,
    pub max_file_bytes: usize,
    /// Processed-files manifest.
    pub manifest: PathBuf,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./documents"),
            include_globs: vec![
                "**/*.pdf".to_string(),
                "**/*.docx".to_string(),
                "**/*.pptx".to_string(),
                "**/*.xlsx".to_string(),
                "**/*.txt".to_string(),
                "**/*.md".to_string(),
            ],
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            tag_levels: Vec::new(),
            workers: 4,
            max_file_bytes: 50 * 1024 * 1024,
            manifest: PathBuf::from("./data/processed_files.json"),
        }
    }
}

/// Parse TOML text and validate it.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Invalid config: {}", path.display()))
}

fn validate(config: &Config) -> Result<()> {
    config.chunking.params()?;
    config.index.metric()?;

    match config.index.backend.as_str() {
        "memory" | "sqlite" | "qdrant" => {}
        other => bail!(
            "Unknown index backend: '{}'. Must be memory, sqlite, or qdrant.",
            other
        ),
    }

    match config.embedding.provider.as_str() {
        "hashing" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be openai, ollama, or hashing.",
            other
        ),
    }
    if config.embedding.dims == 0 {
        bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    match config.generation.provider.as_str() {
        "openai" | "disabled" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be openai or disabled.",
            other
        ),
    }
    if config.generation.max_answer_tokens >= config.generation.context_tokens {
        bail!("generation.max_answer_tokens must be < generation.context_tokens");
    }

    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.ingest.workers == 0 {
        bail!("ingest.workers must be >= 1");
    }
    if config.conversation.max_turns == 0 || config.conversation.max_conversations == 0 {
        bail!("conversation.max_turns and conversation.max_conversations must be >= 1");
    }
    Ok(())
}
