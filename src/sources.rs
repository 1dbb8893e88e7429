//! Filesystem document source.
//!
//! Walks `[ingest].root` (or explicit paths under it), applies include and
//! exclude globs, and turns each file into a [`SourceFile`]. The document
//! id is the path relative to the root with `/` separators, so the same
//! file always maps to the same id.
//!
//! With `tag_levels = ["department", "role"]`, a file at
//! `hr/manager/leave.pdf` is tagged `department=hr, role=manager`. Files
//! shallower than the configured levels are skipped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};
use walkdir::WalkDir;

use docqa_core::models::Document;

use crate::config::IngestConfig;

/// A file selected for ingestion. Content is read lazily by [`SourceFile::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub document_id: String,
    pub path: PathBuf,
    /// File extension, lowercased; the loader resolves it.
    pub format: String,
    pub tags: BTreeMap<String, String>,
}

impl SourceFile {
    pub fn read(&self) -> Result<Document> {
        let content = std::fs::read(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        Ok(Document::new(&self.document_id, &self.format, content).with_tags(self.tags.clone()))
    }
}

/// Collect the files to ingest.
///
/// With no `paths`, the whole root is scanned. Explicit directories are
/// walked with the same globs; explicit files are taken as given.
pub fn scan_documents(config: &IngestConfig, paths: &[PathBuf]) -> Result<Vec<SourceFile>> {
    let root = &config.root;
    if !root.exists() {
        bail!("Document root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes = vec!["**/.git/**".to_string(), "**/.*".to_string()];
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let targets: Vec<PathBuf> = if paths.is_empty() {
        vec![root.clone()]
    } else {
        paths.to_vec()
    };

    let mut files = Vec::new();
    for target in &targets {
        if target.is_file() {
            if let Some(file) = to_source_file(root, target, &config.tag_levels)? {
                files.push(file);
            }
            continue;
        }
        if !target.exists() {
            bail!("Path does not exist: {}", target.display());
        }
        for entry in WalkDir::new(target).follow_links(config.follow_symlinks) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = relative_id(root, entry.path());
            if exclude_set.is_match(&rel) || !include_set.is_match(&rel) {
                continue;
            }
            if let Some(file) = to_source_file(root, entry.path(), &config.tag_levels)? {
                files.push(file);
            }
        }
    }

    files.sort_by(|a, b| a.document_id.cmp(&b.document_id));
    files.dedup_by(|a, b| a.document_id == b.document_id);
    debug!(count = files.len(), root = %root.display(), "scanned documents");
    Ok(files)
}

fn to_source_file(root: &Path, path: &Path, tag_levels: &[String]) -> Result<Option<SourceFile>> {
    let document_id = relative_id(root, path);
    let Some(tags) = tags_for(&document_id, tag_levels) else {
        warn!(
            document_id = %document_id,
            levels = tag_levels.len(),
            "skipping file outside the configured folder layout"
        );
        return Ok(None);
    };
    let format = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    Ok(Some(SourceFile {
        document_id,
        path: path.to_path_buf(),
        format,
        tags,
    }))
}

/// Path relative to `root` with `/` separators; absolute paths outside the root are kept whole.
fn relative_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Tags from the leading directories of `document_id`, or `None` if it is too shallow.
fn tags_for(document_id: &str, tag_levels: &[String]) -> Option<BTreeMap<String, String>> {
    let dirs: Vec<&str> = document_id.split('/').collect();
    // Last segment is the file name.
    if dirs.len() <= tag_levels.len() {
        return None;
    }
    Some(
        tag_levels
            .iter()
            .zip(dirs)
            .map(|(level, dir)| (level.clone(), dir.to_string()))
            .collect(),
    )
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {pattern}"))?);
    }
    Ok(builder.build()?)
}
