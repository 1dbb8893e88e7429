//! `docqa get`: what the index holds for one document.

use anyhow::Result;
use serde::Serialize;

use crate::config::Config;
use crate::manifest::Manifest;
use crate::services::Services;

#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub document_id: String,
    /// Indexed chunk ids by position.
    pub chunk_ids: Vec<String>,
    /// SHA-256 of the bytes last ingested, from the manifest.
    pub sha256: Option<String>,
    pub ingested_at: Option<String>,
}

pub async fn get_document(
    config: &Config,
    services: &Services,
    document_id: &str,
) -> Result<DocumentSummary> {
    let chunk_ids = services.index.chunk_ids(document_id).await?;
    let manifest = if Services::is_ephemeral(config) {
        Manifest::default()
    } else {
        Manifest::load(&config.ingest.manifest)?
    };
    let entry = manifest.get(document_id);
    Ok(DocumentSummary {
        document_id: document_id.to_string(),
        chunk_ids,
        sha256: entry.map(|e| e.sha256.clone()),
        ingested_at: entry.map(|e| e.ingested_at.to_rfc3339()),
    })
}

pub async fn run_get(config: &Config, services: &Services, document_id: &str) -> Result<()> {
    let doc = get_document(config, services, document_id).await?;
    if doc.chunk_ids.is_empty() {
        println!("{}: not indexed", doc.document_id);
        return Ok(());
    }
    println!("document: {}", doc.document_id);
    if let Some(sha) = &doc.sha256 {
        println!("  sha256: {}", sha);
    }
    if let Some(at) = &doc.ingested_at {
        println!("  ingested_at: {}", at);
    }
    println!("  chunks: {}", doc.chunk_ids.len());
    for (position, id) in doc.chunk_ids.iter().enumerate() {
        println!("  [{}] {}", position, id);
    }
    Ok(())
}
