//! Text embedding via the local model daemon.
//!
//! The [`Embedder`] trait is the seam between the orchestrator and the
//! embedding backend; tests substitute a deterministic fake. The concrete
//! [`OllamaEmbedder`] posts batches to `POST {base}/api/embed` and retries
//! transient failures with exponential backoff (429/5xx/network errors
//! retry; other client errors fail immediately).
//!
//! Also hosts the vector utilities shared with the store:
//! [`cosine_similarity`], [`vec_to_blob`], [`blob_to_vec`].

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::Config;
use crate::error::{RagError, Result};

/// Deterministic text → dense vector. The dimension is fixed once
/// [`warm_up`](Embedder::warm_up) has run and never changes for the life
/// of the process.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Load or probe the model, fixing the vector dimension. Called once
    /// at startup; failure is fatal to the process.
    async fn warm_up(&self) -> Result<usize>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch, preserving input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Vector dimension; `0` until warmed up.
    fn dimension(&self) -> usize;

    /// Model identifier recorded in the collection metadata.
    fn model_name(&self) -> &str;
}

/// Embedding client for a local Ollama daemon.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_retries: u32,
    request_timeout: Duration,
    dimension: OnceLock<usize>,
}

impl OllamaEmbedder {
    /// The HTTP client is shared with the chat client so both reuse one
    /// connection pool.
    pub fn new(config: &Config, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: config.llm_base_url.trim_end_matches('/').to_string(),
            model: config.embedding_model.clone(),
            max_retries: config.embed_max_retries,
            request_timeout: Duration::from_secs(config.llm_timeout_secs),
            dimension: OnceLock::new(),
        }
    }

    async fn request_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Backoff 1s, 2s, 4s, ... capped at 32s.
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/api/embed", self.base_url))
                .timeout(self.request_timeout)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| RagError::EmbeddingFailed(e.to_string()))?;
                        return parse_embed_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(RagError::EmbeddingFailed(format!(
                            "daemon returned {status}: {body_text}"
                        )));
                        continue;
                    }

                    return Err(RagError::EmbeddingFailed(format!(
                        "daemon returned {status}: {body_text}"
                    )));
                }
                Err(e) => {
                    last_err = Some(RagError::EmbeddingFailed(format!(
                        "cannot reach embedding daemon at {}: {}",
                        self.base_url, e
                    )));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| RagError::EmbeddingFailed("retries exhausted".to_string())))
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn warm_up(&self) -> Result<usize> {
        let probe = self.embed("warm-up probe").await?;
        let dims = probe.len();
        if dims == 0 {
            return Err(RagError::EmbeddingFailed(
                "model returned an empty vector".to_string(),
            ));
        }
        let recorded = *self.dimension.get_or_init(|| dims);
        info!(model = %self.model, dimension = recorded, "embedding model warmed up");
        Ok(recorded)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::EmbeddingFailed("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let vectors = self.request_embeddings(texts).await?;

        if vectors.len() != texts.len() {
            return Err(RagError::EmbeddingFailed(format!(
                "requested {} embeddings, daemon returned {}",
                texts.len(),
                vectors.len()
            )));
        }

        if let Some(first) = vectors.first() {
            let _ = self.dimension.get_or_init(|| first.len());
        }

        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension.get().copied().unwrap_or(0)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Parse `{"embeddings": [[f32, ...], ...]}`.
fn parse_embed_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            RagError::EmbeddingFailed("invalid response: missing embeddings array".to_string())
        })?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vector: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| {
                RagError::EmbeddingFailed("invalid response: embedding is not an array".to_string())
            })?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vector);
    }

    Ok(result)
}

/// Encode a vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_handles_empty_and_mismatched_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn parses_daemon_embed_response() {
        let json = serde_json::json!({"embeddings": [[0.1, 0.2], [0.3, 0.4]]});
        let vectors = parse_embed_response(&json).unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), 2);
    }

    #[test]
    fn rejects_malformed_embed_response() {
        let json = serde_json::json!({"something": "else"});
        assert!(parse_embed_response(&json).is_err());
    }
}
