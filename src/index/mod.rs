//! Vector index backends.
//!
//! | Config Value | Backend | Persistence |
//! |-------------|---------|-------------|
//! | `"memory"` | [`InMemoryIndex`] | process lifetime |
//! | `"sqlite"` | [`sqlite::SqliteIndex`] | local file |
//! | `"qdrant"` | [`qdrant::QdrantIndex`] | remote collection |

pub mod qdrant;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use docqa_core::index::memory::InMemoryIndex;
use docqa_core::index::VectorIndex;

use crate::config::IndexConfig;

/// Open the configured index for vectors of `dims` dimensions.
pub async fn create_index(config: &IndexConfig, dims: usize) -> Result<Arc<dyn VectorIndex>> {
    let metric = config.metric()?;
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryIndex::new(dims, metric))),
        "sqlite" => {
            let pool = crate::db::connect(&config.path).await?;
            let index = sqlite::SqliteIndex::open(pool, dims, metric)
                .await
                .with_context(|| format!("Failed to open index at {}", config.path.display()))?;
            Ok(Arc::new(index))
        }
        "qdrant" => {
            let api_key = std::env::var("QDRANT_API_KEY").ok();
            let index = qdrant::QdrantIndex::connect(
                &config.url,
                &config.collection,
                api_key,
                Duration::from_secs(config.timeout_secs.max(1)),
                dims,
                metric,
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to open Qdrant collection '{}' at {}",
                    config.collection, config.url
                )
            })?;
            Ok(Arc::new(index))
        }
        other => bail!("Unknown index backend: {}", other),
    }
}
