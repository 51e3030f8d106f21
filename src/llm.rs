//! Chat completion client for the local model daemon.
//!
//! [`LanguageModel`] is the seam the orchestrator talks through; the
//! concrete [`OllamaChat`] speaks the daemon's `/api/chat` protocol with
//! one long-lived `reqwest::Client` shared across calls.
//!
//! Streaming contract: [`TokenStream`] is a finite, single-consumer
//! sequence of token fragments. The producing task stops as soon as the
//! consumer drops the stream, which aborts the underlying HTTP request
//! within one inter-chunk timeout. `active_streams` exposes how many
//! model streams are currently live so tests can observe cancellation.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{RagError, Result};
use crate::models::{ChatMessage, GenerationOptions};

/// A finite, single-consumer stream of token fragments. Not restartable;
/// dropping it cancels the upstream model call.
pub struct TokenStream {
    rx: mpsc::Receiver<Result<String>>,
}

impl TokenStream {
    /// Create a channel-backed stream. The producer feeds the sender; the
    /// stream ends when the sender is dropped.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<String>>, TokenStream) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, TokenStream { rx })
    }

    /// Await the next token fragment; `None` once the stream is finished.
    pub async fn next_token(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }
}

impl futures::Stream for TokenStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Client contract for the model daemon.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Full completion in one call.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<String>;

    /// Token-by-token completion.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<TokenStream>;

    /// Model names currently resident in the daemon.
    async fn list_models(&self) -> Result<Vec<String>>;

    /// Reachability probe.
    async fn ping(&self) -> bool;

    /// Number of live token streams, for cancellation observability.
    fn active_streams(&self) -> usize {
        0
    }
}

/// Chat client for a local Ollama daemon.
pub struct OllamaChat {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    idle_timeout: Duration,
    active: Arc<AtomicUsize>,
}

impl OllamaChat {
    pub fn new(config: &Config, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: config.llm_base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(config.llm_timeout_secs),
            idle_timeout: Duration::from_secs(config.llm_idle_timeout_secs),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn chat_body(
        messages: &[ChatMessage],
        options: &GenerationOptions,
        stream: bool,
    ) -> serde_json::Value {
        serde_json::json!({
            "model": options.model,
            "messages": messages,
            "stream": stream,
            "options": {
                "temperature": options.temperature,
                "num_predict": options.max_tokens,
                "repeat_penalty": options.repeat_penalty,
            },
        })
    }
}

/// Counts a live stream; decrements when the producing task ends for any
/// reason (completion, error, consumer gone).
struct StreamGuard(Arc<AtomicUsize>);

impl StreamGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LanguageModel for OllamaChat {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<String> {
        let body = Self::chat_body(messages, options, false);
        let url = format!("{}/api/chat", self.base_url);

        let request = async {
            let response = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| RagError::LlmUnreachable(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                return Err(RagError::LlmUnreachable(format!(
                    "daemon returned {status}: {detail}"
                )));
            }

            let json: serde_json::Value = response
                .json()
                .await
                .map_err(|e| RagError::LlmUnreachable(e.to_string()))?;

            Ok(json
                .pointer("/message/content")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string())
        };

        tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| RagError::LlmTimeout)?
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<TokenStream> {
        let body = Self::chat_body(messages, options, true);
        let url = format!("{}/api/chat", self.base_url);

        let response = tokio::time::timeout(
            self.request_timeout,
            self.client.post(&url).json(&body).send(),
        )
        .await
        .map_err(|_| RagError::LlmTimeout)?
        .map_err(|e| RagError::LlmUnreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RagError::LlmUnreachable(format!(
                "daemon returned {status}: {detail}"
            )));
        }

        let (tx, stream) = TokenStream::channel(32);
        let idle_timeout = self.idle_timeout;
        let guard = StreamGuard::new(&self.active);

        tokio::spawn(async move {
            let _guard = guard;
            let mut body_stream = response.bytes_stream();
            let mut buffer = String::new();

            loop {
                let next = tokio::time::timeout(idle_timeout, body_stream.next()).await;

                let bytes = match next {
                    Err(_) => {
                        let _ = tx.send(Err(RagError::LlmTimeout)).await;
                        return;
                    }
                    Ok(None) => return,
                    Ok(Some(Err(e))) => {
                        let _ = tx.send(Err(RagError::LlmUnreachable(e.to_string()))).await;
                        return;
                    }
                    Ok(Some(Ok(bytes))) => bytes,
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }

                    let Some((content, done)) = parse_chat_line(&line) else {
                        debug!(line = %line, "skipping unparseable stream line");
                        continue;
                    };

                    if !content.is_empty() && tx.send(Ok(content)).await.is_err() {
                        // Consumer gone; dropping the response aborts the request.
                        return;
                    }
                    if done {
                        return;
                    }
                }
            }
        });

        Ok(stream)
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.idle_timeout)
            .send()
            .await
            .map_err(|e| RagError::LlmUnreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RagError::LlmUnreachable(format!(
                "daemon returned {}",
                response.status()
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RagError::LlmUnreachable(e.to_string()))?;

        Ok(json
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                    .map(|name| name.to_string())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ping(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(self.idle_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!(base_url = %self.base_url, error = %e, "model daemon unreachable");
                false
            }
        }
    }

    fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Parse one line of the daemon's streaming chat response:
/// `{"message": {"content": "..."}, "done": false}`.
fn parse_chat_line(line: &str) -> Option<(String, bool)> {
    let json: serde_json::Value = serde_json::from_str(line).ok()?;
    let content = json
        .pointer("/message/content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let done = json.get("done").and_then(|v| v.as_bool()).unwrap_or(false);
    Some((content, done))
}
