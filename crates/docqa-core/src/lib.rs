//! # docqa core
//!
//! I/O-free logic for docqa: data models, the typed error taxonomy,
//! chunking, the embedder / vector index / generator seams, prompt
//! assembly and conversation memory.
//!
//! This crate does no networking, filesystem access or process-level
//! setup. Concrete HTTP and SQLite adapters, the ingestion pipeline and
//! the query engine live in the `docqa` application crate.
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Documents, chunks, index records, turns, answers |
//! | [`error`] | Load / service / configuration errors |
//! | [`chunk`] | Breakpoint-aware overlapping chunker |
//! | [`embedding`] | [`Embedder`](embedding::Embedder) trait, vector math, hashing embedder |
//! | [`index`] | [`VectorIndex`](index::VectorIndex) trait, filters, in-memory index |
//! | [`generate`] | [`Generator`](generate::Generator) trait and prompts |
//! | [`prompt`] | Persona and budgeted prompt assembly |
//! | [`conversation`] | Bounded per-conversation turn logs |

pub mod chunk;
pub mod conversation;
pub mod embedding;
pub mod error;
pub mod generate;
pub mod index;
pub mod models;
pub mod prompt;
