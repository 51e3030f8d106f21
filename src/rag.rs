//! Retrieval-augmented generation orchestrator.
//!
//! [`RagEngine`] owns the full pipeline and is the only component the HTTP
//! layer talks to:
//!
//! ```text
//! ingest:  validate → parse → replace → split → embed → upsert
//! answer:  embed query → top-k retrieve → compose prompt → model call
//! ```
//!
//! The engine is generic over the [`Embedder`] and [`LanguageModel`] seams
//! so tests can run the whole pipeline against in-process fakes. It is
//! constructed once at startup and warmed up before serving; there is no
//! per-query state.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::chunk::split_text;
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{RagError, Result};
use crate::llm::{LanguageModel, TokenStream};
use crate::loader::{extension_of, DocumentLoader};
use crate::models::{
    ChatMessage, ChunkRecord, CollectionStats, DocumentSummary, GenerationOptions, Role,
    ScoredChunk,
};
use crate::store::VectorStore;

/// Fixed grounding instruction sent as the system message of every prompt.
const SYSTEM_PROMPT: &str = "You are an assistant answering questions about a private document \
collection. Use the context supplied with each request to answer accurately. Ground every \
statement in that context; when the context does not contain the answer, say so honestly \
instead of guessing. Keep responses concise but informative.";

pub struct RagEngine<E, L> {
    config: Arc<Config>,
    loader: DocumentLoader,
    embedder: E,
    store: VectorStore,
    llm: L,
}

impl<E, L> RagEngine<E, L>
where
    E: Embedder,
    L: LanguageModel,
{
    pub fn new(config: Arc<Config>, embedder: E, store: VectorStore, llm: L) -> Self {
        let loader = DocumentLoader::new(&config);
        Self {
            config,
            loader,
            embedder,
            store,
            llm,
        }
    }

    /// One-way transition to Ready: loads the embedding model and fixes
    /// the vector dimension. Failure here is fatal to the process.
    pub async fn warm_up(&self) -> Result<()> {
        let dimension = self.embedder.warm_up().await?;
        info!(
            embedding_model = self.embedder.model_name(),
            dimension, "engine ready"
        );
        Ok(())
    }

    /// Ingest one uploaded document: parse, chunk, embed, and index it.
    ///
    /// Re-ingesting identical bytes under the same filename produces the
    /// same `document_id` and replaces the previous chunks, so uploads are
    /// idempotent. A failed upsert triggers a compensating delete so a
    /// partially indexed document never persists.
    pub async fn ingest(&self, filename: &str, bytes: &[u8]) -> Result<DocumentSummary> {
        self.loader.validate(filename, bytes.len() as u64)?;
        let (text, document_id) = self.loader.parse(filename, bytes)?;

        let replaced = self.store.delete_document(&document_id).await?;
        if replaced > 0 {
            info!(%document_id, replaced, "re-ingestion replaces existing chunks");
        }

        let chunks = split_text(&text, self.config.chunk_size, self.config.chunk_overlap);
        if chunks.is_empty() {
            return Err(RagError::ParseFailed("no extractable text".to_string()));
        }

        let embeddings = self.embedder.embed_batch(&chunks).await?;
        if embeddings.len() != chunks.len() {
            return Err(RagError::EmbeddingFailed(format!(
                "embedded {} of {} chunks",
                embeddings.len(),
                chunks.len()
            )));
        }

        let dimension = self.embedder.dimension();
        if embeddings.iter().any(|e| e.len() != dimension) {
            return Err(RagError::EmbeddingFailed(format!(
                "embedding dimension drifted from {dimension}"
            )));
        }

        let uploaded_at = Utc::now().to_rfc3339();
        let file_type = extension_of(filename).unwrap_or_default();
        let total_chunks = chunks.len() as i64;

        let records: Vec<ChunkRecord> = chunks
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(index, (text, embedding))| ChunkRecord {
                chunk_id: format!("{document_id}:{index}"),
                document_id: document_id.clone(),
                chunk_index: index as i64,
                total_chunks,
                filename: filename.to_string(),
                file_type: file_type.clone(),
                file_size: bytes.len() as i64,
                uploaded_at: uploaded_at.clone(),
                text,
                embedding,
            })
            .collect();

        if let Err(upsert_err) = self.store.upsert(&records).await {
            warn!(%document_id, error = %upsert_err, "upsert failed, removing partial index");
            if let Err(cleanup_err) = self.store.delete_document(&document_id).await {
                warn!(%document_id, error = %cleanup_err, "compensating delete failed");
            }
            return Err(upsert_err);
        }

        self.buffer_upload(&document_id, filename, bytes);

        info!(%document_id, filename, chunk_count = total_chunks, "document ingested");

        Ok(DocumentSummary {
            document_id,
            filename: filename.to_string(),
            file_type,
            file_size: bytes.len() as i64,
            chunk_count: total_chunks,
            uploaded_at,
        })
    }

    /// Answer a question in one round trip. Backs `POST /chat`.
    pub async fn answer(
        &self,
        query: &str,
        history: &[ChatMessage],
    ) -> Result<(String, Vec<String>)> {
        let (messages, sources) = self.prepare(query, history).await?;
        let options = GenerationOptions::from_config(&self.config);
        let response = self.llm.complete(&messages, &options).await?;
        Ok((response, sources))
    }

    /// Answer a question as a token stream. The source list is resolved
    /// before the stream starts; tokens arrive in model production order.
    pub async fn answer_stream(
        &self,
        query: &str,
        history: &[ChatMessage],
    ) -> Result<(Vec<String>, TokenStream)> {
        let (messages, sources) = self.prepare(query, history).await?;
        let options = GenerationOptions::from_config(&self.config);
        let stream = self.llm.stream(&messages, &options).await?;
        Ok((sources, stream))
    }

    /// Embed the query, retrieve context, and compose the prompt.
    async fn prepare(
        &self,
        query: &str,
        history: &[ChatMessage],
    ) -> Result<(Vec<ChatMessage>, Vec<String>)> {
        if query.trim().is_empty() {
            return Err(RagError::QueryEmpty);
        }

        let embedding = self.embedder.embed(query).await?;
        let hits = self
            .store
            .query(&embedding, self.config.top_k_results)
            .await?;
        let sources = source_filenames(&hits);

        info!(
            hits = hits.len(),
            sources = sources.len(),
            "retrieved context for query"
        );

        let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
        messages.extend(truncate_history(history, self.config.history_budget_chars()));
        messages.push(ChatMessage::user(build_user_message(query, &hits)));

        Ok((messages, sources))
    }

    pub async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        self.store.list_documents().await
    }

    /// Remove a document's chunks and its buffered upload. Idempotent.
    pub async fn delete_document(&self, document_id: &str) -> Result<u64> {
        let deleted = self.store.delete_document(document_id).await?;
        self.remove_upload(document_id);
        info!(%document_id, deleted, "document deleted");
        Ok(deleted)
    }

    pub async fn stats(&self) -> Result<CollectionStats> {
        self.store.stats().await
    }

    /// Wipe the whole collection.
    pub async fn reset(&self) -> Result<()> {
        self.store.reset().await?;
        warn!("knowledge base reset");
        Ok(())
    }

    pub async fn llm_reachable(&self) -> bool {
        self.llm.ping().await
    }

    /// Model names currently resident in the daemon.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        self.llm.list_models().await
    }

    pub async fn store_healthy(&self) -> bool {
        self.store.healthy().await
    }

    /// Live model streams; exposed so cancellation is observable.
    pub fn active_llm_streams(&self) -> usize {
        self.llm.active_streams()
    }

    /// Keep a copy of the upload for debugging and re-ingestion. The vector
    /// collection stays authoritative, so failures here only warn.
    fn buffer_upload(&self, document_id: &str, filename: &str, bytes: &[u8]) {
        let ext = extension_of(filename).unwrap_or_default();
        let path = self.config.upload_dir.join(format!("{document_id}{ext}"));
        if let Err(e) = std::fs::create_dir_all(&self.config.upload_dir)
            .and_then(|_| std::fs::write(&path, bytes))
        {
            warn!(path = %path.display(), error = %e, "could not buffer upload");
        }
    }

    fn remove_upload(&self, document_id: &str) {
        let Ok(entries) = std::fs::read_dir(&self.config.upload_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let matches_id = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .is_some_and(|stem| stem == document_id);
            if matches_id {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "could not remove buffered upload");
                }
            }
        }
    }
}

/// Drop the oldest turns until the remaining history fits the character
/// budget. Only user and assistant turns are kept; the engine supplies its
/// own system message.
fn truncate_history(history: &[ChatMessage], budget_chars: usize) -> Vec<ChatMessage> {
    let mut kept = Vec::new();
    let mut used = 0usize;

    for message in history.iter().rev() {
        if !matches!(message.role, Role::User | Role::Assistant) {
            continue;
        }
        let cost = message.content.chars().count();
        if used + cost > budget_chars {
            break;
        }
        used += cost;
        kept.push(message.clone());
    }

    kept.reverse();
    kept
}

/// Compose the user message: labelled context blocks, then the question.
fn build_user_message(query: &str, chunks: &[ScoredChunk]) -> String {
    if chunks.is_empty() {
        return query.to_string();
    }

    let blocks: Vec<String> = chunks
        .iter()
        .map(|chunk| {
            format!(
                "[Source: {}, Part {}]\n{}",
                chunk.filename,
                chunk.chunk_index + 1,
                chunk.text
            )
        })
        .collect();

    format!(
        "Context from the knowledge base:\n\n{}\n\nQuestion: {}",
        blocks.join("\n\n---\n\n"),
        query
    )
}

/// Ordered deduplication of the retrieved chunks' filenames.
fn source_filenames(chunks: &[ScoredChunk]) -> Vec<String> {
    let mut seen = HashSet::new();
    chunks
        .iter()
        .filter(|chunk| seen.insert(chunk.filename.clone()))
        .map(|chunk| chunk.filename.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(filename: &str, index: i64, text: &str) -> ScoredChunk {
        ScoredChunk {
            chunk_id: format!("doc:{index}"),
            document_id: "doc".to_string(),
            chunk_index: index,
            filename: filename.to_string(),
            text: text.to_string(),
            score: 0.9,
        }
    }

    #[test]
    fn history_is_truncated_from_the_oldest_end() {
        let history = vec![
            ChatMessage::user("a".repeat(40)),
            ChatMessage::assistant("b".repeat(40)),
            ChatMessage::user("c".repeat(40)),
        ];

        let kept = truncate_history(&history, 100);
        assert_eq!(kept.len(), 2);
        assert!(kept[0].content.starts_with('b'));
        assert!(kept[1].content.starts_with('c'));
    }

    #[test]
    fn history_within_budget_is_kept_in_order() {
        let history = vec![
            ChatMessage::user("first"),
            ChatMessage::assistant("second"),
        ];
        let kept = truncate_history(&history, 1000);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].content, "first");
        assert_eq!(kept[1].content, "second");
    }

    #[test]
    fn system_turns_in_supplied_history_are_dropped() {
        let history = vec![
            ChatMessage::system("ignore me"),
            ChatMessage::user("keep me"),
        ];
        let kept = truncate_history(&history, 1000);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].content, "keep me");
    }

    #[test]
    fn user_message_labels_each_context_block() {
        let chunks = vec![
            scored("resume.pdf", 0, "worked on databases"),
            scored("notes.md", 2, "kubernetes cluster"),
        ];
        let message = build_user_message("what did they work on?", &chunks);

        assert!(message.contains("[Source: resume.pdf, Part 1]"));
        assert!(message.contains("[Source: notes.md, Part 3]"));
        assert!(message.contains("\n\n---\n\n"));
        assert!(message.ends_with("Question: what did they work on?"));
    }

    #[test]
    fn user_message_without_context_is_the_bare_question() {
        assert_eq!(build_user_message("hello?", &[]), "hello?");
    }

    #[test]
    fn sources_are_deduplicated_in_retrieval_order() {
        let chunks = vec![
            scored("b.pdf", 0, ""),
            scored("a.md", 1, ""),
            scored("b.pdf", 2, ""),
        ];
        assert_eq!(source_filenames(&chunks), vec!["b.pdf", "a.md"]);
    }
}
