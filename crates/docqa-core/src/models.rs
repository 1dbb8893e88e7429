//! Core data models used throughout docqa.
//!
//! These types describe the documents, chunks, index records, conversation
//! turns and answers that flow through the ingestion and query pipelines.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Format of a source document, resolved from the declared format string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Pdf,
    Docx,
    Pptx,
    Xlsx,
    Text,
    Markdown,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Pdf => "pdf",
            SourceFormat::Docx => "docx",
            SourceFormat::Pptx => "pptx",
            SourceFormat::Xlsx => "xlsx",
            SourceFormat::Text => "text",
            SourceFormat::Markdown => "markdown",
        }
    }

    /// MIME type for the format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            SourceFormat::Pdf => "application/pdf",
            SourceFormat::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            SourceFormat::Pptx => {
                "application/vnd.openxmlformats-officedocument.presentationml.presentation"
            }
            SourceFormat::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
            SourceFormat::Text => "text/plain",
            SourceFormat::Markdown => "text/markdown",
        }
    }

    /// Guess the format from a file extension (without the dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(SourceFormat::Pdf),
            "docx" => Some(SourceFormat::Docx),
            "pptx" => Some(SourceFormat::Pptx),
            "xlsx" => Some(SourceFormat::Xlsx),
            "txt" | "text" | "log" | "csv" => Some(SourceFormat::Text),
            "md" | "markdown" => Some(SourceFormat::Markdown),
            _ => None,
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceFormat {
    type Err = String;

    /// Accepts short names (`pdf`, `txt`, ...), extensions and MIME types.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        if let Some(format) = SourceFormat::from_extension(lowered.trim_start_matches('.')) {
            return Ok(format);
        }
        match lowered.as_str() {
            "plain" | "unstructured" | "text/plain" => Ok(SourceFormat::Text),
            "text/markdown" => Ok(SourceFormat::Markdown),
            other => [
                SourceFormat::Pdf,
                SourceFormat::Docx,
                SourceFormat::Pptx,
                SourceFormat::Xlsx,
            ]
            .into_iter()
            .find(|f| f.mime_type() == other)
            .ok_or_else(|| s.to_string()),
        }
    }
}

/// SHA-256 of raw bytes, lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// A source document submitted for ingestion.
///
/// Immutable once built. Re-submitting a document with the same
/// `document_id` replaces everything previously indexed for it.
#[derive(Debug, Clone)]
pub struct Document {
    pub document_id: String,
    /// Declared format as given by the caller; resolved by the loader.
    pub source_format: String,
    pub content: Vec<u8>,
    pub ingested_at: DateTime<Utc>,
    /// Free-form labels copied onto every indexed record (e.g. `role`).
    pub tags: BTreeMap<String, String>,
}

impl Document {
    pub fn new(
        document_id: impl Into<String>,
        source_format: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            source_format: source_format.into(),
            content: content.into(),
            ingested_at: Utc::now(),
            tags: BTreeMap::new(),
        }
    }

    /// Build a document whose id is derived from its content hash.
    pub fn from_content(source_format: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        let id = content_hash(&content);
        Self::new(id, source_format, content)
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn content_hash(&self) -> String {
        content_hash(&self.content)
    }
}

/// Half-open byte range into a normalized text. Always on UTF-8 boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, offset: usize) -> bool {
        offset >= self.start && offset < self.end
    }
}

/// A structural region of a loaded document (a page, paragraph, slide or sheet).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Human-readable marker, e.g. `"page 3"`.
    pub label: String,
    pub span: Span,
}

/// Plain text produced by the loader plus its structural markers.
#[derive(Debug, Clone)]
pub struct NormalizedText {
    pub text: String,
    pub segments: Vec<Segment>,
}

impl NormalizedText {
    /// Build from ordered `(label, text)` parts joined by blank lines.
    ///
    /// Parts that are empty after trimming are dropped.
    pub fn from_parts<I, L, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = (L, T)>,
        L: Into<String>,
        T: AsRef<str>,
    {
        let mut text = String::new();
        let mut segments = Vec::new();
        for (label, part) in parts {
            let part = part.as_ref().trim();
            if part.is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            let start = text.len();
            text.push_str(part);
            segments.push(Segment {
                label: label.into(),
                span: Span::new(start, text.len()),
            });
        }
        Self { text, segments }
    }

    /// Label of the segment containing `offset`, falling back to the
    /// closest preceding segment (for offsets inside separators).
    pub fn section_at(&self, offset: usize) -> Option<&str> {
        self.segments
            .iter()
            .take_while(|s| s.span.start <= offset)
            .last()
            .map(|s| s.label.as_str())
    }
}

/// A bounded passage of a document's text; the unit of embedding and retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Deterministic UUID derived from `document_id` and `position`.
    pub id: String,
    pub document_id: String,
    pub position: usize,
    pub text: String,
    /// Byte range of `text` within the normalized document text.
    pub span: Span,
    pub token_count: usize,
    /// SHA-256 of `text`.
    pub hash: String,
    pub section: Option<String>,
}

/// Metadata stored next to each vector in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub document_id: String,
    pub source_format: SourceFormat,
    pub position: usize,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default)]
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// One vector plus metadata as held by the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedRecord {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub metadata: RecordMetadata,
}

impl IndexedRecord {
    pub fn from_chunk(
        chunk: &Chunk,
        source_format: SourceFormat,
        tags: &BTreeMap<String, String>,
        vector: Vec<f32>,
    ) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            vector,
            metadata: RecordMetadata {
                document_id: chunk.document_id.clone(),
                source_format,
                position: chunk.position,
                text: chunk.text.clone(),
                section: chunk.section.clone(),
                content_hash: chunk.hash.clone(),
                tags: tags.clone(),
            },
        }
    }
}

/// A single nearest-neighbour hit. Transient; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub score: f32,
    pub metadata: RecordMetadata,
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub conversation_id: String,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of ingesting one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngestStatus {
    Success,
    LoadFailed,
    EmbedFailed,
    IndexFailed,
}

impl fmt::Display for IngestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IngestStatus::Success => "success",
            IngestStatus::LoadFailed => "load-failed",
            IngestStatus::EmbedFailed => "embed-failed",
            IngestStatus::IndexFailed => "index-failed",
        };
        f.write_str(s)
    }
}

/// Per-document line of an ingestion report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentReport {
    pub document_id: String,
    pub status: IngestStatus,
    /// Chunks written (or planned, for a dry run).
    pub chunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DocumentReport {
    pub fn success(document_id: impl Into<String>, chunks: usize) -> Self {
        Self {
            document_id: document_id.into(),
            status: IngestStatus::Success,
            chunks,
            error: None,
        }
    }

    pub fn failed(document_id: impl Into<String>, status: IngestStatus, error: String) -> Self {
        Self {
            document_id: document_id.into(),
            status,
            chunks: 0,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == IngestStatus::Success
    }
}

/// States of a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    Received,
    EmbeddingQuery,
    Retrieving,
    BuildingPrompt,
    Generating,
    Complete,
    Failed,
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryState::Received => "RECEIVED",
            QueryState::EmbeddingQuery => "EMBEDDING_QUERY",
            QueryState::Retrieving => "RETRIEVING",
            QueryState::BuildingPrompt => "BUILDING_PROMPT",
            QueryState::Generating => "GENERATING",
            QueryState::Complete => "COMPLETE",
            QueryState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    /// Generated from retrieved context.
    Grounded,
    /// Nothing cleared the relevance threshold; the fallback message was returned.
    InsufficientGrounding,
}

/// A chunk that made it into the prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub document_id: String,
    pub chunk_id: String,
    pub position: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    /// Distinct document ids of the chunks included in the prompt, in prompt order.
    pub citations: Vec<String>,
    pub sources: Vec<SourceRef>,
    pub status: AnswerStatus,
}
