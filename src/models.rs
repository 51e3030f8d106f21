//! Core data types flowing through the pipeline.
//!
//! ```text
//! upload bytes → parse → text → split → Vec<String> → embed → ChunkRecord
//!                                                                  ↓
//!                                   query → retrieve → ScoredChunk → prompt
//! ```

use serde::{Deserialize, Serialize};

/// Role of a chat message, mirroring the model daemon's wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single turn in a conversation. History is supplied by the caller on
/// every request; nothing is kept server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Generation parameters passed with every model call.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub repeat_penalty: f32,
}

impl GenerationOptions {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            model: config.llm_model.clone(),
            temperature: config.llm_temperature,
            max_tokens: config.llm_max_tokens,
            repeat_penalty: config.llm_repeat_penalty,
        }
    }
}

/// One indexed chunk as stored in the vector collection.
///
/// `chunk_id` is `<document_id>:<ordinal>`, deterministic across re-uploads
/// of identical bytes, so upserting the same document replaces its chunks
/// instead of accumulating duplicates.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub total_chunks: i64,
    pub filename: String,
    pub file_type: String,
    pub file_size: i64,
    pub uploaded_at: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// A retrieved chunk with its cosine similarity to the query.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub filename: String,
    pub text: String,
    pub score: f32,
}

/// Aggregated view of one indexed document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub document_id: String,
    pub filename: String,
    pub file_type: String,
    pub file_size: i64,
    pub chunk_count: i64,
    pub uploaded_at: String,
}

/// Collection-wide statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStats {
    pub total_documents: i64,
    pub total_chunks: i64,
    pub embedding_model: String,
}
