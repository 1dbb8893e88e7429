//! `docqa search`: retrieval without generation.
//!
//! Prints the nearest chunks with their scores so relevance thresholds
//! and tag filters can be tuned before anything reaches the generator.

use anyhow::Result;

use docqa_core::index::MetadataFilter;

use crate::config::Config;
use crate::services::Services;

/// Build a filter from repeated `key=value` pairs. Values for one key are OR-ed.
pub fn filter_from_tags(tags: &[(String, String)]) -> Option<MetadataFilter> {
    if tags.is_empty() {
        return None;
    }
    Some(
        tags.iter()
            .fold(MetadataFilter::new(), |f, (k, v)| f.tag_any(k, v)),
    )
}

pub async fn run_search(
    config: &Config,
    services: &Services,
    query: &str,
    top_k: Option<usize>,
    tags: &[(String, String)],
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    let engine = services.retriever(config)?;
    let filter = filter_from_tags(tags);
    let hits = engine
        .retrieve(query, top_k.unwrap_or(config.retrieval.top_k), filter.as_ref())
        .await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        let marker = if hit.score >= config.retrieval.min_score {
            ""
        } else {
            "  (below min_score)"
        };
        println!(
            "{}. [{:.3}] {} #{}{}{}",
            i + 1,
            hit.score,
            hit.metadata.document_id,
            hit.metadata.position,
            hit.metadata
                .section
                .as_deref()
                .map(|s| format!(" ({s})"))
                .unwrap_or_default(),
            marker
        );
        println!("    {}", snippet(&hit.metadata.text, 200));
    }
    Ok(())
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}
