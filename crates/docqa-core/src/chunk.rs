//! Overlapping, boundary-aware text chunker.
//!
//! Splits normalized document text into [`Chunk`]s of at most
//! `max_tokens`, each sharing roughly `overlap_tokens` with its predecessor.
//! Chunks are plain slices of the source text: their spans tile the input
//! with overlap, so every byte of the input lands in at least one chunk.
//!
//! Each chunk receives a deterministic UUID derived from its document ID
//! and position, plus a SHA-256 hash of its text. Re-chunking the same
//! text with the same parameters therefore yields identical chunks and
//! re-ingestion overwrites instead of duplicating.
//!
//! # Algorithm
//!
//! 1. Convert token counts to byte counts using a 4 chars/token ratio.
//! 2. If the rest of the text fits in `max_bytes`, emit it and stop.
//! 3. Otherwise look for a breakpoint in the last `search_window` bytes
//!    before the hard limit, preferring (in order) a paragraph break
//!    (`\n\n`), a line break, a sentence end (`. `, `! `, `? `) and any
//!    whitespace. Without one, cut hard at the limit.
//! 4. Start the next chunk `overlap` bytes before the previous end,
//!    nudged forward to the next word start.
//!
//! Breakpoints are only accepted past `start + overlap`, which together
//! with `overlap < max_tokens` guarantees forward progress.
//!
//! # Example
//!
//! ```rust
//! use docqa_core::chunk::{chunk_text, ChunkParams};
//!
//! let params = ChunkParams::new(700, 80).unwrap();
//! let chunks = chunk_text("doc-123", "Hello world.\n\nSecond paragraph.", &params);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].position, 0);
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ConfigurationError;
use crate::models::{Chunk, NormalizedText, Span};

/// Approximate characters-per-token ratio.
///
/// A rough heuristic (4 chars ≈ 1 token) shared by the chunker and the
/// prompt budget so both agree on what a "token" costs.
pub const CHARS_PER_TOKEN: usize = 4;

/// Namespace for chunk UUIDs (v5).
const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x6d0c_5e2a_9b41_4f7e_8a53_1c2d_3e4f_5a6b);

const SENTENCE_ENDS: [&str; 3] = [". ", "! ", "? "];

/// Validated chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    max_tokens: usize,
    overlap_tokens: usize,
    search_window_tokens: usize,
}

impl ChunkParams {
    /// `overlap_tokens` must be strictly smaller than `max_tokens`.
    ///
    /// The breakpoint search window defaults to half a chunk.
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Result<Self, ConfigurationError> {
        if max_tokens == 0 {
            return Err(ConfigurationError::InvalidChunking(
                "max_tokens must be > 0".to_string(),
            ));
        }
        if overlap_tokens >= max_tokens {
            return Err(ConfigurationError::InvalidChunking(format!(
                "overlap_tokens ({}) must be < max_tokens ({})",
                overlap_tokens, max_tokens
            )));
        }
        Ok(Self {
            max_tokens,
            overlap_tokens,
            search_window_tokens: (max_tokens / 2).max(1),
        })
    }

    /// Override the breakpoint search window (clamped to `max_tokens`).
    pub fn with_search_window(mut self, tokens: usize) -> Self {
        self.search_window_tokens = tokens.min(self.max_tokens);
        self
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn overlap_tokens(&self) -> usize {
        self.overlap_tokens
    }

    pub fn search_window_tokens(&self) -> usize {
        self.search_window_tokens
    }
}

/// Estimate the token count of `text` with [`CHARS_PER_TOKEN`].
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Deterministic chunk id for `(document_id, position)`.
pub fn chunk_id(document_id: &str, position: usize) -> String {
    let name = format!("{}#{}", document_id, position);
    Uuid::new_v5(&CHUNK_NAMESPACE, name.as_bytes()).to_string()
}

/// Split text into overlapping chunks.
///
/// # Guarantees
///
/// - Empty input yields no chunks; otherwise at least one.
/// - Positions are contiguous: `0, 1, 2, …, N-1`.
/// - `chunks[0].span.start == 0`, `chunks[N-1].span.end == text.len()`, and
///   each chunk starts no later than its predecessor ends.
/// - `chunk.text == text[chunk.span]`.
pub fn chunk_text(document_id: &str, text: &str, params: &ChunkParams) -> Vec<Chunk> {
    let max_bytes = params.max_tokens * CHARS_PER_TOKEN;
    let overlap_bytes = params.overlap_tokens * CHARS_PER_TOKEN;
    let window_bytes = params.search_window_tokens * CHARS_PER_TOKEN;

    let mut chunks = Vec::new();
    if text.is_empty() {
        return chunks;
    }

    let mut start = 0;
    loop {
        let end = if text.len() - start <= max_bytes {
            text.len()
        } else {
            find_break(text, start, max_bytes, overlap_bytes, window_bytes)
        };
        chunks.push(make_chunk(document_id, chunks.len(), text, Span::new(start, end)));
        if end >= text.len() {
            break;
        }

        let back = snap_to_char_boundary(text, end.saturating_sub(overlap_bytes));
        let next = if overlap_bytes == 0 || back <= start {
            end
        } else {
            align_to_word_start(text, back, end)
        };
        start = next;
    }

    chunks
}

/// Chunk a loaded document, tagging each chunk with the structural
/// section (page, paragraph, slide) it starts in.
pub fn chunk_document(document_id: &str, doc: &NormalizedText, params: &ChunkParams) -> Vec<Chunk> {
    let mut chunks = chunk_text(document_id, &doc.text, params);
    for chunk in &mut chunks {
        chunk.section = doc.section_at(chunk.span.start).map(str::to_string);
    }
    chunks
}

/// Pick the end of the chunk starting at `start` when the remaining text
/// is longer than `max_bytes`.
fn find_break(
    text: &str,
    start: usize,
    max_bytes: usize,
    overlap_bytes: usize,
    window_bytes: usize,
) -> usize {
    let mut hard = snap_to_char_boundary(text, start + max_bytes);
    if hard <= start {
        hard = next_char_boundary(text, start);
    }

    let floor = (start + overlap_bytes + 1).max(hard.saturating_sub(window_bytes));
    let floor = ceil_char_boundary(text, floor);
    if floor >= hard {
        return hard;
    }
    let region = &text[floor..hard];

    if let Some(pos) = region.rfind("\n\n") {
        return floor + pos + 2;
    }
    if let Some(pos) = region.rfind('\n') {
        return floor + pos + 1;
    }
    if let Some(pos) = SENTENCE_ENDS.iter().filter_map(|s| region.rfind(s)).max() {
        return floor + pos + 2;
    }
    if let Some((pos, ws)) = region.char_indices().rev().find(|(_, c)| c.is_whitespace()) {
        return floor + pos + ws.len_utf8();
    }
    hard
}

/// Move `from` forward past the current word so an overlapping chunk
/// does not open mid-word. Stays put if no whitespace precedes `limit`.
fn align_to_word_start(text: &str, from: usize, limit: usize) -> usize {
    if text[..from].ends_with(char::is_whitespace) {
        return from;
    }
    let slice = &text[from..limit];
    match slice.find(char::is_whitespace) {
        Some(ws) => {
            let after_ws = slice[ws..]
                .char_indices()
                .find(|(_, c)| !c.is_whitespace())
                .map(|(i, _)| ws + i)
                .unwrap_or(slice.len());
            if from + after_ws < limit {
                from + after_ws
            } else {
                from
            }
        }
        None => from,
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Snap a byte index forward to the nearest valid UTF-8 char boundary.
fn ceil_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// Byte index just past the char starting at `index`.
fn next_char_boundary(s: &str, index: usize) -> usize {
    s[index..]
        .chars()
        .next()
        .map(|c| index + c.len_utf8())
        .unwrap_or(s.len())
}

/// Create a single [`Chunk`] with a deterministic id and SHA-256 content hash.
fn make_chunk(document_id: &str, position: usize, source: &str, span: Span) -> Chunk {
    let text = &source[span.start..span.end];
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: chunk_id(document_id, position),
        document_id: document_id.to_string(),
        position,
        text: text.to_string(),
        span,
        token_count: estimate_tokens(text),
        hash,
        section: None,
    }
}
