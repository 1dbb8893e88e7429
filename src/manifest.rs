//! Processed-files manifest.
//!
//! A JSON map from document id to the SHA-256 of the bytes last ingested
//! successfully. `ingest` skips documents whose hash is unchanged unless
//! `--force` is given. Failed documents are never recorded, so they are
//! retried on the next run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub sha256: String,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct Manifest {
    path: PathBuf,
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    /// Load the manifest at `path`; a missing file is an empty manifest.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("Corrupt manifest: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&self.entries)?)?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }

    pub fn is_unchanged(&self, document_id: &str, sha256: &str) -> bool {
        self.entries
            .get(document_id)
            .is_some_and(|e| e.sha256 == sha256)
    }

    pub fn record(&mut self, document_id: &str, sha256: String, ingested_at: DateTime<Utc>) {
        self.entries.insert(
            document_id.to_string(),
            ManifestEntry {
                sha256,
                ingested_at,
            },
        );
    }

    pub fn remove(&mut self, document_id: &str) -> bool {
        self.entries.remove(document_id).is_some()
    }

    pub fn get(&self, document_id: &str) -> Option<&ManifestEntry> {
        self.entries.get(document_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
