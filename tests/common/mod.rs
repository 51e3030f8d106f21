//! Shared fakes and builders for the cross-module tests.
//!
//! The engine is generic over its embedder and language-model seams, so
//! the whole pipeline runs here against deterministic in-process fakes
//! and a temp-directory store.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use ragd::{
    ChatMessage, Config, Embedder, GenerationOptions, LanguageModel, RagEngine, Result,
    TokenStream, VectorStore,
};

pub const TEST_ADMIN_KEY: &str = "test-admin-key-0123456789";

/// Deterministic bag-of-words embedder: each word bumps a hashed bucket,
/// so texts sharing words land near each other in cosine space.
pub struct FakeEmbedder {
    dim: usize,
}

impl FakeEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

pub fn hash_embed(text: &str, dim: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dim];
    for word in text.to_lowercase().split_whitespace() {
        let mut hasher = DefaultHasher::new();
        word.hash(&mut hasher);
        let bucket = (hasher.finish() as usize) % dim;
        vector[bucket] += 1.0;
    }
    if vector.iter().all(|v| *v == 0.0) {
        vector[0] = 1.0;
    }
    vector
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn warm_up(&self) -> Result<usize> {
        Ok(self.dim)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(hash_embed(text, self.dim))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_embed(t, self.dim)).collect())
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn model_name(&self) -> &str {
        "fake-embedder"
    }
}

/// Canned-reply model. `complete` returns the reply whole; `stream` feeds
/// it out in small fragments through a narrow channel so consumers can
/// cancel mid-stream. Live streams are counted for cancellation tests.
pub struct FakeModel {
    reply: String,
    active: Arc<AtomicUsize>,
}

impl FakeModel {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn fragments(reply: &str) -> Vec<String> {
    reply
        .chars()
        .collect::<Vec<_>>()
        .chunks(3)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[async_trait]
impl LanguageModel for FakeModel {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _options: &GenerationOptions,
    ) -> Result<String> {
        Ok(self.reply.clone())
    }

    async fn stream(
        &self,
        _messages: &[ChatMessage],
        _options: &GenerationOptions,
    ) -> Result<TokenStream> {
        let (tx, stream) = TokenStream::channel(1);
        let tokens = fragments(&self.reply);

        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&self.active));

        tokio::spawn(async move {
            let _guard = guard;
            for token in tokens {
                if tx.send(Ok(token)).await.is_err() {
                    return;
                }
            }
        });

        Ok(stream)
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec!["fake-model".to_string()])
    }

    async fn ping(&self) -> bool {
        true
    }

    fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Configuration rooted in a temp directory, small chunks for fast tests.
pub fn test_config(root: &Path) -> Arc<Config> {
    let mut env = HashMap::new();
    env.insert("ADMIN_API_KEY".to_string(), TEST_ADMIN_KEY.to_string());
    env.insert(
        "VECTOR_STORE_DIR".to_string(),
        root.join("vectors").display().to_string(),
    );
    env.insert(
        "UPLOAD_DIR".to_string(),
        root.join("uploads").display().to_string(),
    );
    env.insert("EMBEDDING_MODEL".to_string(), "fake-embedder".to_string());
    env.insert("CHUNK_SIZE".to_string(), "120".to_string());
    env.insert("CHUNK_OVERLAP".to_string(), "20".to_string());
    env.insert("MAX_FILE_SIZE_MB".to_string(), "1".to_string());
    env.insert("TOP_K_RESULTS".to_string(), "3".to_string());

    Arc::new(Config::from_lookup(|key| env.get(key).cloned()).unwrap())
}

pub type TestEngine = RagEngine<FakeEmbedder, FakeModel>;

/// Build a warmed-up engine over fakes and a fresh store.
pub async fn test_engine(root: &Path, reply: &str) -> (Arc<TestEngine>, Arc<Config>) {
    let config = test_config(root);
    let store = VectorStore::open(&config).await.unwrap();
    let engine = Arc::new(RagEngine::new(
        Arc::clone(&config),
        FakeEmbedder::new(16),
        store,
        FakeModel::new(reply),
    ));
    engine.warm_up().await.unwrap();
    (engine, config)
}
