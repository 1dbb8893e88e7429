//! # docqa
//!
//! Document-grounded question answering: ingest company documents into a
//! vector index, then answer questions from the retrieved passages with
//! citations, or say plainly that the documents don't cover it.
//!
//! ```text
//! ┌──────────┐   ┌────────┐   ┌─────────┐   ┌──────────┐   ┌──────────────┐
//! │ sources  │──▶│ loader │──▶│ chunker │──▶│ embedder │──▶│ vector index │
//! │ (files)  │   │extract │   │ (core)  │   │          │   │ mem/sqlite/  │
//! └──────────┘   └────────┘   └─────────┘   └──────────┘   │ qdrant       │
//!                                                          └──────┬───────┘
//!   question ──▶ query engine ──▶ embed ──▶ retrieve ─────────────┘
//!                    │                        │
//!                    │◀── prompt (context + conversation) ◀──┘
//!                    ▼
//!                generator ──▶ answer + citations
//! ```
//!
//! Pure logic (models, errors, chunking, prompt assembly, conversation
//! memory, the in-memory index) lives in `docqa-core`; this crate adds I/O.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`sources`] | Filesystem walk, globs, folder tags |
//! | [`extract`] | PDF/DOCX/PPTX/XLSX/text loader |
//! | [`embedding`] | OpenAI and Ollama embedders |
//! | [`generate`] | OpenAI chat generator |
//! | [`index`] | SQLite and Qdrant vector indexes |
//! | [`retry`] | Timeouts and exponential backoff |
//! | [`ingest`] | Ingestion pipeline and `ingest`/`delete` commands |
//! | [`query`] | Query engine state machine |
//! | [`manifest`] | Processed-files manifest |
//! | [`services`] | Wiring of embedder, index and generator |
//! | [`progress`] | Ingestion progress on stderr |
//! | [`db`] | SQLite connection |

pub mod chat;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod generate;
pub mod get;
pub mod index;
pub mod ingest;
pub mod manifest;
pub mod progress;
pub mod query;
pub mod retry;
pub mod search;
pub mod services;
pub mod sources;
