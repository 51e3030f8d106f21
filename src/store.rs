//! Persistent vector collection backed by SQLite.
//!
//! One collection is a single database file under the configured store
//! directory. Embeddings are stored as little-endian f32 BLOBs next to the
//! chunk text and its document metadata; similarity search loads candidate
//! vectors and ranks them by cosine similarity in process.
//!
//! The collection header records the embedding model that produced the
//! vectors. Opening a collection with a different configured model fails
//! loudly instead of silently mixing embedding spaces; the operator must
//! delete the collection and reindex.
//!
//! Writers are serialized through an internal lock; readers share the pool.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::Config;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{RagError, Result};
use crate::models::{ChunkRecord, CollectionStats, DocumentSummary, ScoredChunk};

#[derive(Debug)]
pub struct VectorStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    embedding_model: String,
}

impl VectorStore {
    /// Open (creating if missing) the configured collection and verify its
    /// recorded embedding model matches the configuration.
    pub async fn open(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.vector_store_dir)
            .map_err(|e| RagError::InvalidConfig(format!("cannot create store dir: {e}")))?;

        let path = config
            .vector_store_dir
            .join(format!("{}.sqlite", config.collection_name));

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(RagError::VectorStoreFailed)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
            embedding_model: config.embedding_model.clone(),
        };

        store.migrate().await?;
        store.check_embedding_model().await?;

        info!(
            collection = %config.collection_name,
            path = %path.display(),
            "vector store opened"
        );

        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collection_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                total_chunks INTEGER NOT NULL,
                filename TEXT NOT NULL,
                file_type TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                uploaded_at TEXT NOT NULL,
                text TEXT NOT NULL,
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn check_embedding_model(&self) -> Result<()> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT value FROM collection_meta WHERE key = 'embedding_model'")
                .fetch_optional(&self.pool)
                .await?;

        match stored {
            Some(stored) if stored != self.embedding_model => {
                Err(RagError::EmbeddingModelMismatch {
                    stored,
                    configured: self.embedding_model.clone(),
                })
            }
            Some(_) => Ok(()),
            None => {
                sqlx::query(
                    "INSERT INTO collection_meta (key, value) VALUES ('embedding_model', ?)",
                )
                .bind(&self.embedding_model)
                .execute(&self.pool)
                .await?;
                Ok(())
            }
        }
    }

    /// Insert or replace chunks by `chunk_id` in one transaction.
    ///
    /// The first upsert fixes the collection's vector dimension; later
    /// batches with a different dimension are rejected.
    pub async fn upsert(&self, records: &[ChunkRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let dims = records[0].embedding.len();
        if records.iter().any(|r| r.embedding.len() != dims) {
            return Err(RagError::EmbeddingFailed(
                "upsert batch mixes embedding dimensions".to_string(),
            ));
        }

        let _write = self.write_lock.lock().await;

        let stored_dims: Option<String> =
            sqlx::query_scalar("SELECT value FROM collection_meta WHERE key = 'dimension'")
                .fetch_optional(&self.pool)
                .await?;

        if let Some(stored) = stored_dims {
            if stored != dims.to_string() {
                return Err(RagError::EmbeddingFailed(format!(
                    "embedding dimension {dims} does not match collection dimension {stored}"
                )));
            }
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR IGNORE INTO collection_meta (key, value) VALUES ('dimension', ?)")
            .bind(dims.to_string())
            .execute(&mut *tx)
            .await?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO chunks
                    (chunk_id, document_id, chunk_index, total_chunks,
                     filename, file_type, file_size, uploaded_at, text, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    document_id = excluded.document_id,
                    chunk_index = excluded.chunk_index,
                    total_chunks = excluded.total_chunks,
                    filename = excluded.filename,
                    file_type = excluded.file_type,
                    file_size = excluded.file_size,
                    uploaded_at = excluded.uploaded_at,
                    text = excluded.text,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&record.chunk_id)
            .bind(&record.document_id)
            .bind(record.chunk_index)
            .bind(record.total_chunks)
            .bind(&record.filename)
            .bind(&record.file_type)
            .bind(record.file_size)
            .bind(&record.uploaded_at)
            .bind(&record.text)
            .bind(vec_to_blob(&record.embedding))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Top-`k` chunks by cosine similarity, descending; ties broken by
    /// `chunk_id` lexicographic order so repeated queries return the same
    /// ordering.
    pub async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        let rows = sqlx::query(
            "SELECT chunk_id, document_id, chunk_index, filename, text, embedding FROM chunks",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<ScoredChunk> = rows
            .into_iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let stored = blob_to_vec(&blob);
                ScoredChunk {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    chunk_index: row.get("chunk_index"),
                    filename: row.get("filename"),
                    text: row.get("text"),
                    score: cosine_similarity(embedding, &stored),
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        scored.truncate(k);

        Ok(scored)
    }

    /// Delete every chunk belonging to `document_id`. Returns the number
    /// of chunks removed; deleting an unknown id is a no-op returning 0.
    pub async fn delete_document(&self, document_id: &str) -> Result<u64> {
        let _write = self.write_lock.lock().await;

        let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// One entry per indexed document, newest upload first.
    pub async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT document_id, filename, file_type, file_size,
                   COUNT(*) AS chunk_count, MAX(uploaded_at) AS uploaded_at
            FROM chunks
            GROUP BY document_id
            ORDER BY uploaded_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| DocumentSummary {
                document_id: row.get("document_id"),
                filename: row.get("filename"),
                file_type: row.get("file_type"),
                file_size: row.get("file_size"),
                chunk_count: row.get("chunk_count"),
                uploaded_at: row.get("uploaded_at"),
            })
            .collect())
    }

    pub async fn stats(&self) -> Result<CollectionStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total_chunks, COUNT(DISTINCT document_id) AS total_documents \
             FROM chunks",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(CollectionStats {
            total_documents: row.get("total_documents"),
            total_chunks: row.get("total_chunks"),
            embedding_model: self.embedding_model.clone(),
        })
    }

    /// Cheap probe used by the health endpoint.
    pub async fn healthy(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    /// Wipe all indexed chunks, keeping the collection usable.
    pub async fn reset(&self) -> Result<()> {
        let _write = self.write_lock.lock().await;

        sqlx::query("DELETE FROM chunks").execute(&self.pool).await?;
        sqlx::query("DELETE FROM collection_meta WHERE key = 'dimension'")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
