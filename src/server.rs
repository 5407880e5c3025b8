//! HTTP JSON API.
//!
//! Exposes the restore / ask / ingest / chat operations over HTTP for
//! non-CLI frontends. One session is shared by all requests and turns are
//! serialized with a `tokio::sync::Mutex`, mirroring how the original host
//! runtime serialized UI callbacks per user.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/restore?filename=sales.bak` | Raw backup bytes → restore |
//! | `GET`  | `/schema` | Schema summary of the current database |
//! | `POST` | `/ask` | `{"question": ...}` → `{"answer": ...}` |
//! | `POST` | `/ingest` | `{"source": ...}` → ingest report |
//! | `POST` | `/chat` | `{"question": ...}` → `{"answer": ...}` |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "filename is required" } }
//! ```

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};

use crate::answer::{self, DbAnswer};
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::ingest;
use crate::llm::{AzureChatModel, ChatModel};
use crate::mssql::{MssqlExecutor, QueryExecutor};
use crate::rag;
use crate::restore;
use crate::schema::{self, SchemaSummary};
use crate::session::{Role, Session};
use crate::store::Store;

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: Store,
    session: Arc<Mutex<Session>>,
    model: Arc<AzureChatModel>,
    executor: Arc<MssqlExecutor>,
}

pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let store = Store::connect(config).await?;
    store.migrate().await?;
    let session = store.load_or_create_session().await?;

    // Model credentials are required up front: a missing key blocks the
    // server rather than failing on the first chat turn.
    let model = Arc::new(AzureChatModel::new(&config.model)?);
    let executor = Arc::new(MssqlExecutor::new(config.mssql.clone()));

    let state = AppState {
        config: Arc::new(config.clone()),
        store,
        session: Arc::new(Mutex::new(session)),
        model,
        executor,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/restore", post(restore_handler))
        .route("/schema", get(schema_handler))
        .route("/ask", post(ask_handler))
        .route("/ingest", post(ingest_handler))
        .route("/chat", post(chat_handler))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("Listening on http://{}", config.server.bind);
    axum::serve(listener, app).await?;

    Ok(())
}

fn error_response(status: StatusCode, code: &str, message: String) -> axum::response::Response {
    (
        status,
        Json(serde_json::json!({
            "error": { "code": code, "message": message }
        })),
    )
        .into_response()
}

fn internal_error(e: anyhow::Error) -> axum::response::Response {
    tracing::error!(error = %e, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
struct RestoreParams {
    filename: Option<String>,
}

async fn restore_handler(
    State(state): State<AppState>,
    Query(params): Query<RestoreParams>,
    body: Bytes,
) -> axum::response::Response {
    let Some(filename) = params.filename.filter(|f| !f.is_empty()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "filename query parameter is required".to_string(),
        );
    };

    let mut session = state.session.lock().await;

    let outcome = match restore::restore_backup_bytes(&state.config, &filename, &body).await {
        Ok(outcome) => outcome,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "restore_failed", e.to_string()),
    };

    if let Err(e) = state
        .store
        .set_current_db(&mut session, &outcome.database)
        .await
    {
        return internal_error(e);
    }

    Json(serde_json::json!({
        "database": outcome.database,
        "stored_file": outcome.stored_file,
    }))
    .into_response()
}

async fn schema_handler(State(state): State<AppState>) -> axum::response::Response {
    let session = state.session.lock().await;

    let summary = match schema::summarize(&state.config.mssql, session.current_db.as_deref()).await
    {
        Ok(summary) => summary,
        Err(e) => return internal_error(e),
    };

    match summary {
        SchemaSummary::Tables(text) => Json(serde_json::json!({ "schema": text })).into_response(),
        SchemaSummary::NoDatabase => error_response(
            StatusCode::NOT_FOUND,
            "no_database",
            answer::NO_DATABASE_MSG.to_string(),
        ),
        SchemaSummary::NoTables => error_response(
            StatusCode::NOT_FOUND,
            "no_tables",
            answer::EMPTY_SCHEMA_MSG.to_string(),
        ),
    }
}

#[derive(Deserialize)]
struct QuestionBody {
    question: String,
}

async fn ask_handler(
    State(state): State<AppState>,
    Json(body): Json<QuestionBody>,
) -> axum::response::Response {
    if body.question.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "question must not be empty".to_string(),
        );
    }

    let session = state.session.lock().await;

    if let Err(e) = state
        .store
        .append_turn(&session.id, Role::User, &body.question)
        .await
    {
        return internal_error(e);
    }
    let history = match state.store.turns(&session.id).await {
        Ok(history) => history,
        Err(e) => return internal_error(e),
    };

    let summary = match schema::summarize(&state.config.mssql, session.current_db.as_deref()).await
    {
        Ok(summary) => summary,
        Err(e) => return internal_error(e),
    };

    let result = answer::answer_db_question(
        state.model.as_ref() as &dyn ChatModel,
        state.executor.as_ref() as &dyn QueryExecutor,
        session.current_db.as_deref(),
        &summary,
        &history,
        state.config.model.max_result_rows,
    )
    .await;

    let db_answer: DbAnswer = match result {
        Ok(answer) => answer,
        Err(e) => return internal_error(e),
    };

    if let Err(e) = state
        .store
        .append_turn(&session.id, Role::Assistant, db_answer.text())
        .await
    {
        return internal_error(e);
    }

    Json(serde_json::json!({ "answer": db_answer.text() })).into_response()
}

#[derive(Deserialize)]
struct IngestBody {
    source: String,
}

async fn ingest_handler(
    State(state): State<AppState>,
    Json(body): Json<IngestBody>,
) -> axum::response::Response {
    let mut session = state.session.lock().await;

    let report = match ingest::ingest_sources(
        &state.config,
        &state.store,
        &mut session,
        &[body.source],
    )
    .await
    {
        Ok(report) => report,
        Err(e) => return internal_error(e),
    };

    if report.added.is_empty() && !report.failed.is_empty() {
        let (source, reason) = &report.failed[0];
        return error_response(
            StatusCode::BAD_REQUEST,
            "ingest_failed",
            format!("{}: {}", source, reason),
        );
    }

    Json(serde_json::json!({
        "added": report.added,
        "already_present": report.already_present,
        "failed": report.failed,
        "chunks_written": report.chunks_written,
    }))
    .into_response()
}

async fn chat_handler(
    State(state): State<AppState>,
    Json(body): Json<QuestionBody>,
) -> axum::response::Response {
    if body.question.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "question must not be empty".to_string(),
        );
    }

    let session = state.session.lock().await;

    let embedder = match EmbeddingClient::new(&state.config) {
        Ok(embedder) => embedder,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "embeddings_disabled", e.to_string()),
    };

    if let Err(e) = state
        .store
        .append_turn(&session.id, Role::User, &body.question)
        .await
    {
        return internal_error(e);
    }
    let history = match state.store.turns(&session.id).await {
        Ok(history) => history,
        Err(e) => return internal_error(e),
    };

    let mut sink = |_token: &str| {};
    let answer = match rag::answer_with_documents(
        &state.config,
        &state.store,
        &session,
        state.model.as_ref() as &dyn ChatModel,
        &embedder,
        &history,
        &mut sink,
    )
    .await
    {
        Ok(answer) => answer,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "chat_failed", e.to_string()),
    };

    if let Err(e) = state
        .store
        .append_turn(&session.id, Role::Assistant, &answer)
        .await
    {
        return internal_error(e);
    }

    Json(serde_json::json!({ "answer": answer })).into_response()
}
