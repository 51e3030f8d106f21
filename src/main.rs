//! # ragd CLI
//!
//! `ragd serve` starts the HTTP server; the remaining commands drive the
//! same engine from the command line for local administration.
//!
//! ```bash
//! ADMIN_API_KEY=... ragd serve
//! ragd ingest docs/resume.pdf docs/notes.md
//! ragd documents
//! ragd delete doc_1a2b3c4d5e6f
//! ragd stats
//! ```
//!
//! All configuration comes from the environment; see `Config` for the
//! recognized variables and defaults.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ragd::{Config, OllamaChat, OllamaEmbedder, RagEngine, VectorStore};

#[derive(Parser)]
#[command(
    name = "ragd",
    about = "Self-hosted question answering over a private document corpus",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    ///
    /// Warms up the embedding model, opens the vector collection, and
    /// serves the JSON/SSE API on `BIND_ADDR`.
    Serve,

    /// Ingest local files into the knowledge base.
    ///
    /// Runs the same validate → parse → chunk → embed → index pipeline as
    /// `POST /ingest`. Re-ingesting identical files is idempotent.
    Ingest {
        /// Files to ingest (.pdf, .md, .txt, .docx).
        files: Vec<PathBuf>,
    },

    /// List indexed documents, newest first.
    Documents,

    /// Delete a document and all of its chunks.
    Delete {
        /// Document id as returned by ingestion (e.g. `doc_1a2b3c4d5e6f`).
        document_id: String,
    },

    /// Print collection statistics.
    Stats,

    /// List models resident in the LLM daemon.
    Models,
}

type Engine = RagEngine<OllamaEmbedder, OllamaChat>;

async fn build_engine(config: &Arc<Config>) -> anyhow::Result<Arc<Engine>> {
    config.ensure_directories()?;

    // One HTTP client shared by the embedding and chat paths; per-call
    // deadlines are applied at the request level so streams stay open.
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let embedder = OllamaEmbedder::new(config, http.clone());
    let store = VectorStore::open(config).await?;
    let llm = OllamaChat::new(config, http);

    Ok(Arc::new(RagEngine::new(
        Arc::clone(config),
        embedder,
        store,
        llm,
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Arc::new(Config::from_env()?);
    let engine = build_engine(&config).await?;

    match cli.command {
        Commands::Serve => {
            engine.warm_up().await?;
            ragd::run_server(config, engine).await?;
        }
        Commands::Ingest { files } => {
            if files.is_empty() {
                anyhow::bail!("no files given");
            }
            engine.warm_up().await?;

            for path in files {
                let filename = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .ok_or_else(|| anyhow::anyhow!("bad file name: {}", path.display()))?
                    .to_string();
                let bytes = std::fs::read(&path)?;

                let summary = engine.ingest(&filename, &bytes).await?;
                println!(
                    "{}  {} ({} chunks, {} bytes)",
                    summary.document_id, summary.filename, summary.chunk_count, summary.file_size
                );
            }
        }
        Commands::Documents => {
            let documents = engine.list_documents().await?;
            if documents.is_empty() {
                println!("No documents indexed.");
            }
            for doc in documents {
                println!(
                    "{}  {} ({}, {} chunks, uploaded {})",
                    doc.document_id, doc.filename, doc.file_type, doc.chunk_count, doc.uploaded_at
                );
            }
        }
        Commands::Delete { document_id } => {
            let deleted = engine.delete_document(&document_id).await?;
            if deleted > 0 {
                println!("deleted {deleted} chunks of {document_id}");
            } else {
                println!("{document_id} not found");
            }
        }
        Commands::Stats => {
            let stats = engine.stats().await?;
            println!("documents: {}", stats.total_documents);
            println!("chunks: {}", stats.total_chunks);
            println!("embedding model: {}", stats.embedding_model);
        }
        Commands::Models => {
            let models = engine.list_models().await?;
            if models.is_empty() {
                println!("No models resident.");
            }
            for model in models {
                println!("{model}");
            }
        }
    }

    Ok(())
}
