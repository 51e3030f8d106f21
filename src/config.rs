//! Environment-backed configuration.
//!
//! All options are read once at startup via [`Config::from_env`] and are
//! immutable afterwards. Invalid values (missing admin key, overlap not
//! smaller than chunk size) abort startup rather than surfacing later as
//! request failures.

use std::path::PathBuf;

use crate::error::{RagError, Result};

/// Minimum accepted length for `ADMIN_API_KEY`.
pub const MIN_ADMIN_KEY_LEN: usize = 16;

/// Approximate chars-per-token ratio used for the history budget.
pub const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub admin_api_key: String,

    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
    pub llm_repeat_penalty: f32,
    pub llm_timeout_secs: u64,
    pub llm_idle_timeout_secs: u64,

    pub vector_store_dir: PathBuf,
    pub collection_name: String,
    pub upload_dir: PathBuf,

    pub max_file_size_mb: u64,
    pub allowed_extensions: Vec<String>,

    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k_results: usize,
    pub embedding_model: String,
    pub embed_max_retries: u32,
    pub history_budget_tokens: usize,

    pub cors_origins: Vec<String>,
    pub debug: bool,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup. Tests pass a map
    /// instead of mutating the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config = Self {
            bind_addr: string(&get, "BIND_ADDR", "0.0.0.0:8000"),
            admin_api_key: get("ADMIN_API_KEY").unwrap_or_default(),

            llm_base_url: string(&get, "LLM_BASE_URL", "http://localhost:11434"),
            llm_model: string(&get, "LLM_MODEL", "llama3.2:3b"),
            llm_temperature: parse(&get, "LLM_TEMPERATURE", 0.3)?,
            llm_max_tokens: parse(&get, "LLM_MAX_TOKENS", 512)?,
            llm_repeat_penalty: parse(&get, "LLM_REPEAT_PENALTY", 1.2)?,
            llm_timeout_secs: parse(&get, "LLM_TIMEOUT_SECS", 120)?,
            llm_idle_timeout_secs: parse(&get, "LLM_IDLE_TIMEOUT_SECS", 30)?,

            vector_store_dir: PathBuf::from(string(
                &get,
                "VECTOR_STORE_DIR",
                "./data/vector_store",
            )),
            collection_name: string(&get, "COLLECTION_NAME", "knowledge_base"),
            upload_dir: PathBuf::from(string(&get, "UPLOAD_DIR", "./data/uploads")),

            max_file_size_mb: parse(&get, "MAX_FILE_SIZE_MB", 10)?,
            allowed_extensions: list(&get, "ALLOWED_EXTENSIONS", ".pdf,.md,.txt,.docx"),

            chunk_size: parse(&get, "CHUNK_SIZE", 500)?,
            chunk_overlap: parse(&get, "CHUNK_OVERLAP", 50)?,
            top_k_results: parse(&get, "TOP_K_RESULTS", 3)?,
            embedding_model: string(&get, "EMBEDDING_MODEL", "nomic-embed-text"),
            embed_max_retries: parse(&get, "EMBED_MAX_RETRIES", 5)?,
            history_budget_tokens: parse(&get, "HISTORY_BUDGET_TOKENS", 1000)?,

            cors_origins: list(&get, "CORS_ORIGINS", "http://localhost:3000"),
            debug: parse(&get, "DEBUG", false)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.admin_api_key.len() < MIN_ADMIN_KEY_LEN {
            return Err(RagError::InvalidConfig(format!(
                "ADMIN_API_KEY must be set and at least {} characters long",
                MIN_ADMIN_KEY_LEN
            )));
        }

        if self.chunk_size == 0 {
            return Err(RagError::InvalidConfig("CHUNK_SIZE must be > 0".into()));
        }

        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::InvalidConfig(format!(
                "CHUNK_OVERLAP ({}) must be smaller than CHUNK_SIZE ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }

        if self.top_k_results == 0 {
            return Err(RagError::InvalidConfig("TOP_K_RESULTS must be >= 1".into()));
        }

        if self.max_file_size_mb == 0 {
            return Err(RagError::InvalidConfig("MAX_FILE_SIZE_MB must be > 0".into()));
        }

        if self.allowed_extensions.is_empty() {
            return Err(RagError::InvalidConfig(
                "ALLOWED_EXTENSIONS must not be empty".into(),
            ));
        }

        Ok(())
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    /// Approximate history budget expressed as characters.
    pub fn history_budget_chars(&self) -> usize {
        self.history_budget_tokens * CHARS_PER_TOKEN
    }

    /// Create the on-disk directories the process writes to.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.vector_store_dir)?;
        std::fs::create_dir_all(&self.upload_dir)?;
        Ok(())
    }
}

fn string(get: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    match get(key) {
        Some(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

fn list(get: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> Vec<String> {
    string(get, key, default)
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e| {
            RagError::InvalidConfig(format!("{} has invalid value '{}': {}", key, raw, e))
        }),
        None => Ok(default),
    }
}
