//! Service handles shared by the CLI commands.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use docqa_core::embedding::Embedder;
use docqa_core::generate::Generator;
use docqa_core::index::VectorIndex;

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::generate::{create_generator, DisabledGenerator};
use crate::index::create_index;
use crate::ingest::IngestPipeline;
use crate::query::QueryEngine;

/// Embedder plus the index it writes to, checked against each other.
pub struct Services {
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
}

impl Services {
    pub async fn open(config: &Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let index = create_index(&config.index, embedder.dims()).await?;
        debug!(
            embedder = embedder.model_name(),
            dims = embedder.dims(),
            backend = %config.index.backend,
            metric = %index.metric(),
            "services ready"
        );
        Ok(Self { embedder, index })
    }

    /// The in-memory backend forgets everything when the process exits.
    pub fn is_ephemeral(config: &Config) -> bool {
        config.index.backend == "memory"
    }

    pub fn pipeline(&self, config: &Config) -> Result<IngestPipeline> {
        IngestPipeline::from_config(config, self.embedder.clone(), self.index.clone())
    }

    pub fn engine(&self, config: &Config) -> Result<QueryEngine> {
        let generator: Arc<dyn Generator> = create_generator(&config.generation)?;
        if config.generation.provider == "disabled" {
            warn!("generation is disabled; questions with relevant context will fail");
        }
        QueryEngine::from_config(
            config,
            self.embedder.clone(),
            self.index.clone(),
            generator,
        )
    }

    /// An engine for retrieval only; its generator is never configured.
    pub fn retriever(&self, config: &Config) -> Result<QueryEngine> {
        QueryEngine::from_config(
            config,
            self.embedder.clone(),
            self.index.clone(),
            Arc::new(DisabledGenerator),
        )
    }
}
