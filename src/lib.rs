//! # ragd
//!
//! **A self-hosted question-answering backend over a private document corpus.**
//!
//! `ragd` ingests documents (PDF, Markdown, plain text, DOCX), splits them
//! into overlapping chunks, embeds the chunks with a local model daemon,
//! and indexes them in a file-backed vector collection. Questions are
//! answered by retrieving the most similar chunks and prompting a local
//! LLM with that context, streaming the answer back as it is generated.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────────┐   ┌───────────┐
//! │ Uploads  │──▶│ loader → chunk   │──▶│  SQLite   │
//! │ PDF/MD/… │   │ → embed (batch) │   │ vectors   │
//! └──────────┘   └─────────────────┘   └─────┬─────┘
//!                                            │ top-k
//!                ┌─────────────────┐   ┌─────▼─────┐
//!                │  HTTP (axum)    │◀──│ RagEngine │──▶ model daemon
//!                │  JSON + SSE     │   │           │    (chat + embed)
//!                └─────────────────┘   └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment-backed configuration, validated at startup |
//! | [`error`] | Failure taxonomy shared across the pipeline |
//! | [`models`] | Core data types: chat messages, chunk records, summaries |
//! | [`chunk`] | Sentence-aware splitter with overlap |
//! | [`loader`] | Upload validation and multi-format text extraction |
//! | [`embedding`] | `Embedder` seam, daemon client, vector utilities |
//! | [`store`] | SQLite-backed persistent vector collection |
//! | [`llm`] | `LanguageModel` seam, chat client, token streams |
//! | [`rag`] | The orchestrator tying ingestion and retrieval together |
//! | [`server`] | HTTP surface: JSON API, SSE streaming, admin gate |
//!
//! The engine is assembled once at startup — configuration, embedder,
//! store, and chat client are constructed and injected; nothing lives in
//! module-level state. Tests build the same engine with fake embedder and
//! model implementations.

pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod loader;
pub mod models;
pub mod rag;
pub mod server;
pub mod store;

pub use chunk::split_text;
pub use config::Config;
pub use embedding::{Embedder, OllamaEmbedder};
pub use error::{RagError, Result};
pub use llm::{LanguageModel, OllamaChat, TokenStream};
pub use loader::DocumentLoader;
pub use models::{
    ChatMessage, ChunkRecord, CollectionStats, DocumentSummary, GenerationOptions, Role,
    ScoredChunk,
};
pub use rag::RagEngine;
pub use server::{build_router, run_server, AppState};
pub use store::VectorStore;
