//! HTTP service.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/query` | Answer a question; NDJSON event stream |
//! | `POST` | `/analyze` | Explain key terms; NDJSON event stream |
//! | `GET`  | `/conversations` | The caller's conversations |
//! | `DELETE` | `/conversations/{conv_id}` | Delete one of the caller's conversations |
//! | `GET`  | `/think-enabled` | Whether reasoning output may be requested |
//! | `POST` | `/admin/index` | Index documents |
//! | `POST` | `/admin/index/clear` | Drop the index and derived artifacts |
//! | `GET`  | `/admin/index/validate` | Index/metadata consistency report |
//! | `GET`  | `/admin/index/summary` | Chunk count and contents (`?limit=N`) |
//! | `POST` | `/admin/config/reload` | Re-read the configuration file |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Identity
//!
//! Authentication happens upstream. The authenticated caller is passed in
//! the `x-user-id` header; requests without it get `401`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "index_not_ready", "message": "No documents have been indexed yet. ..." } }
//! ```
//!
//! A busy decline is not an error: it is a `200` with
//! `{"busy": "system" | "user", "message": ...}`.

use axum::{
    body::Body,
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::SharedConfig;
use crate::coordinator::{EventStream, StreamingCoordinator};
use crate::db;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::RagError;
use crate::gateway::PersistenceGateway;
use crate::generation::{create_generator, GenerationProvider};
use crate::indexing::{IndexReport, IndexingEngine};
use crate::migrate;
use crate::models::SourceDocument;
use crate::pipeline::{QueryOutcome, QueryRequest, QueryService};
use crate::rerank::{create_scorer, RelevanceScorer};
use crate::retrieval::Retriever;
use crate::sqlite_gateway::SqliteGateway;
use crate::store::IndexStore;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SharedConfig>,
    pub store: Arc<IndexStore>,
    pub indexer: Arc<IndexingEngine>,
    pub queries: Arc<QueryService>,
    pub gateway: Arc<dyn PersistenceGateway>,
}

/// Wire up the production components for `config`.
///
/// Runs migrations, releases request slots left pending by a previous
/// process, opens the index and warms the embedding model up.
pub async fn build_state(config: Arc<SharedConfig>) -> anyhow::Result<AppState> {
    let cfg = config.snapshot().await;

    let pool = db::connect(&cfg).await?;
    migrate::migrate_pool(&pool).await?;
    let gateway: Arc<dyn PersistenceGateway> = Arc::new(SqliteGateway::new(pool));
    let abandoned = gateway.abandon_pending().await?;
    if abandoned > 0 {
        tracing::warn!(abandoned, "completed requests left pending by a previous run");
    }

    let store = Arc::new(IndexStore::open(
        &cfg.store.data_dir,
        cfg.store.markdown_dir.as_deref(),
    )?);
    let embedder: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&cfg.embedding)?);
    let scorer: Arc<dyn RelevanceScorer> = Arc::from(create_scorer(&cfg.reranker)?);
    let generator: Arc<dyn GenerationProvider> = Arc::from(create_generator(&cfg.generation)?);

    if cfg.embedding.is_enabled() {
        match embedder.embed("warmup").await {
            Ok(v) => tracing::info!(model = embedder.model_name(), dims = v.len(), "embedding model ready"),
            Err(e) => tracing::warn!(error = %e, "embedding warm-up failed"),
        }
    }

    let retriever = Retriever::new(store.clone(), embedder.clone(), scorer);
    let coordinator = StreamingCoordinator::new(generator, gateway.clone());
    Ok(AppState {
        indexer: Arc::new(IndexingEngine::new(store.clone(), embedder)),
        queries: Arc::new(QueryService::new(
            config.clone(),
            gateway.clone(),
            retriever,
            coordinator,
        )),
        config,
        store,
        gateway,
    })
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/query", post(handle_query))
        .route("/analyze", post(handle_analyze))
        .route("/conversations", get(handle_list_conversations))
        .route("/conversations/{conv_id}", delete(handle_delete_conversation))
        .route("/think-enabled", get(handle_think_enabled))
        .route("/admin/index", post(handle_index))
        .route("/admin/index/clear", post(handle_clear))
        .route("/admin/index/validate", get(handle_validate))
        .route("/admin/index/summary", get(handle_summary))
        .route("/admin/config/reload", post(handle_reload))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Serve until the process is terminated.
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let bind_addr = state.config.snapshot().await.server.bind.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "server listening");
    println!("askdocs listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// An error response in the `{"error": {"code", "message"}}` shape.
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    fn body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                code: self.code.clone(),
                message: self.message.clone(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}

fn status_for(err: &RagError) -> StatusCode {
    match err {
        RagError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        RagError::EmptyIndex | RagError::IndexNotReady => StatusCode::SERVICE_UNAVAILABLE,
        RagError::DimensionMismatch { .. } | RagError::IndexInconsistent { .. } => {
            StatusCode::CONFLICT
        }
        RagError::EmbeddingFailure { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Admin-facing: carries the precise error.
fn admin_error(err: &RagError) -> AppError {
    AppError::new(status_for(err), err.code(), err.to_string())
}

fn internal(err: impl std::fmt::Display) -> AppError {
    tracing::error!(error = %err, "request failed");
    AppError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        "A system error occurred. Please try again later.",
    )
}

// ============ Caller identity ============

pub const USER_HEADER: &str = "x-user-id";

/// The authenticated caller, taken from the `x-user-id` header.
pub struct Caller(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Caller(v.to_string()))
            .ok_or_else(|| {
                AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing caller identity")
            })
    }
}

// ============ POST /query, POST /analyze ============

#[derive(Serialize)]
struct BusyResponse {
    busy: crate::admission::BusyReason,
    message: &'static str,
}

fn ndjson(events: EventStream) -> Response {
    let lines = events.map(|event| {
        serde_json::to_vec(&event).map(|mut line| {
            line.push(b'\n');
            line
        })
    });
    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response()
}

fn outcome_response(outcome: QueryOutcome) -> Response {
    match outcome {
        QueryOutcome::Busy(reason) => Json(BusyResponse {
            busy: reason,
            message: reason.message(),
        })
        .into_response(),
        QueryOutcome::Failed { code, message } => {
            let status = match code {
                "index_not_ready" => StatusCode::SERVICE_UNAVAILABLE,
                "bad_request" => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            AppError::new(status, code, message).into_response()
        }
        QueryOutcome::Streaming(events) => ndjson(events),
    }
}

fn check_question(req: &QueryRequest) -> Result<(), AppError> {
    if req.question.trim().is_empty() && req.keyword.trim().is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "question must not be empty",
        ));
    }
    Ok(())
}

async fn handle_query(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Json(req): Json<QueryRequest>,
) -> Result<Response, AppError> {
    check_question(&req)?;
    Ok(outcome_response(state.queries.ask(&user_id, req).await))
}

async fn handle_analyze(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Json(req): Json<QueryRequest>,
) -> Result<Response, AppError> {
    if req.question.trim().is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "question must not be empty",
        ));
    }
    Ok(outcome_response(state.queries.analyze(&user_id, req).await))
}

// ============ Conversations ============

async fn handle_list_conversations(
    State(state): State<AppState>,
    Caller(user_id): Caller,
) -> Result<Json<serde_json::Value>, AppError> {
    let conversations = state
        .gateway
        .list_conversations(&user_id)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "conversations": conversations })))
}

async fn handle_delete_conversation(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(conv_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let deleted = state
        .gateway
        .delete_conversation(&conv_id, &user_id)
        .await
        .map_err(internal)?;
    if deleted == 0 {
        return Err(AppError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no conversation {}", conv_id),
        ));
    }
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

async fn handle_think_enabled(State(state): State<AppState>) -> Json<serde_json::Value> {
    let enabled = state.config.snapshot().await.generation.think_enabled;
    Json(serde_json::json!({ "think_enabled": enabled }))
}

// ============ Admin ============

#[derive(Deserialize)]
struct IndexRequest {
    documents: Vec<SourceDocument>,
}

async fn handle_index(
    State(state): State<AppState>,
    Json(req): Json<IndexRequest>,
) -> Response {
    let chunking = state.config.snapshot().await.chunking.clone();
    match state.indexer.index(&req.documents, &chunking).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            tracing::error!(error = %e, documents = req.documents.len(), "indexing failed");
            let report = IndexReport::failed(&req.documents, &chunking, &e);
            let err = admin_error(&e);
            let body = serde_json::json!({
                "error": err.body().error,
                "chunks_added": report.chunks_added,
                "documents": report.documents,
            });
            (err.status, Json(body)).into_response()
        }
    }
}

async fn handle_clear(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    state.store.clear().await.map_err(|e| admin_error(&e))?;
    Ok(Json(serde_json::json!({ "status": "cleared" })))
}

async fn handle_validate(State(state): State<AppState>) -> Json<crate::store::Validation> {
    Json(state.store.validate().await)
}

#[derive(Deserialize)]
struct SummaryParams {
    limit: Option<usize>,
}

async fn handle_summary(
    State(state): State<AppState>,
    Query(params): Query<SummaryParams>,
) -> Json<crate::store::IndexSummary> {
    Json(state.store.summary(params.limit).await)
}

async fn handle_reload(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    state
        .config
        .reload()
        .await
        .map_err(|e| AppError::new(StatusCode::BAD_REQUEST, "bad_config", format!("{:#}", e)))?;
    Ok(Json(serde_json::json!({ "status": "reloaded" })))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
