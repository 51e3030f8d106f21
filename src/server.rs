//! HTTP surface.
//!
//! The only component that knows about transport concerns: JSON request
//! and response shapes, multipart uploads, SSE framing of the engine's
//! token stream, the admin-key gate, and CORS. Everything else is a call
//! into [`RagEngine`].
//!
//! # Endpoints
//!
//! | Method | Path | Auth | Description |
//! |--------|------|------|-------------|
//! | `GET`  | `/health` | no | Service health, including LLM and store probes |
//! | `GET`  | `/health/ready`, `/health/live` | no | Probes for orchestration |
//! | `POST` | `/chat` | no | One-shot answer with sources |
//! | `POST` | `/chat/stream` | no | SSE token stream, terminal event carries sources |
//! | `POST` | `/ingest` | yes | Multipart document upload |
//! | `GET`  | `/admin/documents` | yes | List indexed documents |
//! | `DELETE` | `/admin/documents/{id}` | yes | Delete one document |
//! | `GET`  | `/admin/stats` | yes | Collection statistics |
//! | `POST` | `/admin/reset` | yes | Wipe the collection |
//!
//! Admin routes require the `X-Admin-Key` header to match the configured
//! key; a missing or wrong key is rejected with 401 before the handler
//! runs. Error bodies follow `{"error": {"code", "message"}}`; dependency
//! failures are sanitized unless `DEBUG` is on.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{error, info, warn};

use crate::config::{Config, MIN_ADMIN_KEY_LEN};
use crate::embedding::Embedder;
use crate::error::RagError;
use crate::llm::LanguageModel;
use crate::models::{ChatMessage, CollectionStats, DocumentSummary};
use crate::rag::RagEngine;

/// Upper bound on `/chat` message length, in characters.
const MAX_MESSAGE_CHARS: usize = 4000;

/// Chunk emitted when a stream fails mid-response, so clients observe a
/// graceful end instead of a broken connection.
const APOLOGY_CHUNK: &str = "I'm sorry, I ran into a problem while answering. Please try again.";

/// Shared application state: the engine container plus configuration.
pub struct AppState<E, L> {
    pub engine: Arc<RagEngine<E, L>>,
    pub config: Arc<Config>,
}

impl<E, L> Clone for AppState<E, L> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            config: Arc::clone(&self.config),
        }
    }
}

impl<E, L> AppState<E, L> {
    /// Map an engine failure to an HTTP error, sanitizing server-side
    /// failures unless debug mode is on.
    fn fail(&self, err: RagError) -> ApiError {
        ApiError::from_rag(err, self.config.debug)
    }
}

/// Start the HTTP server and run until the process is terminated.
pub async fn run_server<E, L>(
    config: Arc<Config>,
    engine: Arc<RagEngine<E, L>>,
) -> anyhow::Result<()>
where
    E: Embedder + 'static,
    L: LanguageModel + 'static,
{
    let bind_addr = config.bind_addr.clone();
    let app = build_router(AppState { engine, config });

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(%bind_addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the full router. Separated from [`run_server`] so tests can drive
/// the app in process with `tower::ServiceExt::oneshot`.
pub fn build_router<E, L>(state: AppState<E, L>) -> Router
where
    E: Embedder + 'static,
    L: LanguageModel + 'static,
{
    let cors = cors_layer(&state.config);
    // Leave headroom above the configured file cap for the multipart envelope.
    let body_limit = state.config.max_file_size_bytes() as usize + 64 * 1024;

    let admin = Router::new()
        .route("/ingest", post(handle_ingest::<E, L>))
        .route("/admin/documents", get(handle_list_documents::<E, L>))
        .route(
            "/admin/documents/{document_id}",
            delete(handle_delete_document::<E, L>),
        )
        .route("/admin/stats", get(handle_stats::<E, L>))
        .route("/admin/reset", post(handle_reset::<E, L>))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_key::<E, L>,
        ));

    Router::new()
        .route("/health", get(handle_health::<E, L>))
        .route("/health/ready", get(handle_ready))
        .route("/health/live", get(handle_live))
        .route("/chat", post(handle_chat::<E, L>))
        .route("/chat/stream", post(handle_chat_stream::<E, L>))
        .merge(admin)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(config: &Config) -> tower_http::cors::CorsLayer {
    use tower_http::cors::{Any, CorsLayer};

    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if config.cors_origins.iter().any(|origin| origin == "*") {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        layer.allow_origin(tower_http::cors::AllowOrigin::list(origins))
    }
}

// ============ Error responses ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// HTTP-mapped failure. Built from [`RagError`] or directly by handlers.
struct ApiError {
    status: StatusCode,
    code: String,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    fn from_rag(err: RagError, debug: bool) -> Self {
        let (status, code) = match &err {
            RagError::UnsupportedFormat(_) => (StatusCode::BAD_REQUEST, "unsupported_format"),
            RagError::TooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "too_large"),
            RagError::QueryEmpty => (StatusCode::BAD_REQUEST, "query_empty"),
            RagError::ParseFailed(_) => (StatusCode::BAD_REQUEST, "parse_failed"),
            RagError::EmbeddingFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "embedding_failed"),
            RagError::VectorStoreFailed(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "vector_store_failed")
            }
            RagError::LlmUnreachable(_) => (StatusCode::BAD_GATEWAY, "llm_unreachable"),
            RagError::LlmTimeout => (StatusCode::GATEWAY_TIMEOUT, "llm_timeout"),
            RagError::EmbeddingModelMismatch { .. } | RagError::InvalidConfig(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };

        let message = if err.is_client_error() || debug {
            err.to_string()
        } else {
            error!(error = %err, "request failed");
            "internal error; check server logs".to_string()
        };

        Self::new(status, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

// ============ Admin-key gate ============

/// Single server-side gate for `/ingest` and `/admin/*`. The configured key
/// is already known to be at least [`MIN_ADMIN_KEY_LEN`] characters; any
/// shorter presented key can never match.
async fn require_admin_key<E, L>(
    State(state): State<AppState<E, L>>,
    request: Request,
    next: Next,
) -> Response
where
    E: Embedder + 'static,
    L: LanguageModel + 'static,
{
    let provided = request
        .headers()
        .get("x-admin-key")
        .and_then(|value| value.to_str().ok());

    match provided {
        None => {
            warn!(path = %request.uri().path(), "admin request without API key");
            ApiError::unauthorized("admin API key required; provide the X-Admin-Key header")
                .into_response()
        }
        Some(key) if key.len() >= MIN_ADMIN_KEY_LEN && key == state.config.admin_api_key => {
            next.run(request).await
        }
        Some(_) => {
            warn!(path = %request.uri().path(), "admin request with invalid API key");
            ApiError::unauthorized("invalid admin API key").into_response()
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    timestamp: String,
    services: ServiceStatus,
}

#[derive(Serialize)]
struct ServiceStatus {
    llm: String,
    vector_store: String,
}

fn connection_label(up: bool) -> String {
    if up {
        "connected".to_string()
    } else {
        "disconnected".to_string()
    }
}

async fn handle_health<E, L>(State(state): State<AppState<E, L>>) -> Json<HealthResponse>
where
    E: Embedder + 'static,
    L: LanguageModel + 'static,
{
    let llm_ok = state.engine.llm_reachable().await;
    let store_ok = state.engine.store_healthy().await;

    let status = if llm_ok && store_ok {
        "healthy"
    } else {
        "degraded"
    };

    if status != "healthy" {
        warn!(llm = llm_ok, vector_store = store_ok, "health check degraded");
    }

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        services: ServiceStatus {
            llm: connection_label(llm_ok),
            vector_store: connection_label(store_ok),
        },
    })
}

async fn handle_ready() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ready"}))
}

async fn handle_live() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "alive"}))
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    history: Vec<ChatMessage>,
}

#[derive(Serialize)]
struct ChatResponse {
    response: String,
    sources: Vec<String>,
}

fn validate_message(message: &str) -> Result<(), ApiError> {
    if message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }
    if message.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ApiError::bad_request(format!(
            "message exceeds {MAX_MESSAGE_CHARS} characters"
        )));
    }
    Ok(())
}

async fn handle_chat<E, L>(
    State(state): State<AppState<E, L>>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError>
where
    E: Embedder + 'static,
    L: LanguageModel + 'static,
{
    validate_message(&req.message)?;

    let (response, sources) = state
        .engine
        .answer(&req.message, &req.history)
        .await
        .map_err(|e| state.fail(e))?;

    Ok(Json(ChatResponse { response, sources }))
}

// ============ POST /chat/stream ============

/// One SSE frame: intermediate frames carry a token, the terminal frame
/// carries the source list.
#[derive(Serialize)]
struct StreamFrame {
    chunk: String,
    done: bool,
    sources: Option<Vec<String>>,
}

fn frame_event(frame: &StreamFrame) -> Option<Event> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(Event::default().data(json)),
        Err(e) => {
            error!(error = %e, "could not serialize stream frame");
            None
        }
    }
}

async fn handle_chat_stream<E, L>(
    State(state): State<AppState<E, L>>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError>
where
    E: Embedder + 'static,
    L: LanguageModel + 'static,
{
    validate_message(&req.message)?;

    let (sources, mut tokens) = state
        .engine
        .answer_stream(&req.message, &req.history)
        .await
        .map_err(|e| state.fail(e))?;

    let (tx, rx) = mpsc::channel::<Event>(32);

    // Re-frame engine tokens as SSE events. If the client disconnects the
    // send fails and dropping `tokens` cancels the upstream model call.
    tokio::spawn(async move {
        while let Some(item) = tokens.next_token().await {
            match item {
                Ok(chunk) => {
                    let frame = StreamFrame {
                        chunk,
                        done: false,
                        sources: None,
                    };
                    let Some(event) = frame_event(&frame) else {
                        continue;
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "token stream failed mid-response");
                    if let Some(event) = frame_event(&StreamFrame {
                        chunk: APOLOGY_CHUNK.to_string(),
                        done: false,
                        sources: None,
                    }) {
                        let _ = tx.send(event).await;
                    }
                    break;
                }
            }
        }

        if let Some(event) = frame_event(&StreamFrame {
            chunk: String::new(),
            done: true,
            sources: Some(sources),
        }) {
            let _ = tx.send(event).await;
        }
        let _ = tx.send(Event::default().data("[DONE]")).await;
    });

    let stream = ReceiverStream::new(rx).map(Ok::<Event, Infallible>);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============ POST /ingest ============

#[derive(Serialize)]
struct IngestResponse {
    success: bool,
    message: String,
    document: DocumentSummary,
}

async fn handle_ingest<E, L>(
    State(state): State<AppState<E, L>>,
    mut multipart: Multipart,
) -> Result<Json<IngestResponse>, ApiError>
where
    E: Embedder + 'static,
    L: LanguageModel + 'static,
{
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {e}")))?
    {
        let Some(filename) = field.file_name().map(|name| name.to_string()) else {
            continue;
        };

        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("could not read upload: {e}")))?;

        let document = state
            .engine
            .ingest(&filename, &bytes)
            .await
            .map_err(|e| state.fail(e))?;

        return Ok(Json(IngestResponse {
            success: true,
            message: format!(
                "Document '{}' ingested with {} chunks",
                document.filename, document.chunk_count
            ),
            document,
        }));
    }

    Err(ApiError::bad_request("upload must contain one file part"))
}

// ============ Admin: documents / stats / reset ============

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentSummary>,
    total_count: usize,
}

async fn handle_list_documents<E, L>(
    State(state): State<AppState<E, L>>,
) -> Result<Json<DocumentListResponse>, ApiError>
where
    E: Embedder + 'static,
    L: LanguageModel + 'static,
{
    let documents = state
        .engine
        .list_documents()
        .await
        .map_err(|e| state.fail(e))?;

    Ok(Json(DocumentListResponse {
        total_count: documents.len(),
        documents,
    }))
}

#[derive(Serialize)]
struct DeleteResponse {
    success: bool,
    deleted_chunks: u64,
    message: String,
}

async fn handle_delete_document<E, L>(
    State(state): State<AppState<E, L>>,
    Path(document_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError>
where
    E: Embedder + 'static,
    L: LanguageModel + 'static,
{
    let deleted_chunks = state
        .engine
        .delete_document(&document_id)
        .await
        .map_err(|e| state.fail(e))?;

    let message = if deleted_chunks > 0 {
        format!("Document {document_id} deleted")
    } else {
        format!("Document {document_id} not found")
    };

    Ok(Json(DeleteResponse {
        success: true,
        deleted_chunks,
        message,
    }))
}

async fn handle_stats<E, L>(
    State(state): State<AppState<E, L>>,
) -> Result<Json<CollectionStats>, ApiError>
where
    E: Embedder + 'static,
    L: LanguageModel + 'static,
{
    let stats = state.engine.stats().await.map_err(|e| state.fail(e))?;
    Ok(Json(stats))
}

#[derive(Serialize)]
struct ResetResponse {
    success: bool,
    message: String,
}

async fn handle_reset<E, L>(
    State(state): State<AppState<E, L>>,
) -> Result<Json<ResetResponse>, ApiError>
where
    E: Embedder + 'static,
    L: LanguageModel + 'static,
{
    state.engine.reset().await.map_err(|e| state.fail(e))?;

    Ok(Json(ResetResponse {
        success: true,
        message: "knowledge base reset".to_string(),
    }))
}
