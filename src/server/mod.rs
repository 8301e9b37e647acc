//! HTTP surface: router, handlers, and server startup.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::coach::service::CoachingService;
use crate::config::{Settings, TurnLimits};
use crate::error::CoachError;
use crate::llm::AnthropicClient;
use crate::phase::Phase;
use crate::store::{
    CoachDb, DbHandle, MessageRecord, Outcome, ReflectionRecord, Role, SessionRecord,
    SessionStatus,
};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub service: CoachingService,
    pub turn_limits: TurnLimits,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub topic: Option<String>,
    pub max_turns: Option<u32>,
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    /// Ask the coach to wrap the session up early.
    #[serde(default)]
    pub request_end: bool,
}

// ── Response payload types ────────────────────────────────────────────

#[derive(Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub phase: Phase,
    pub max_turns: u32,
    pub turn_count: u32,
    pub turns_remaining: u32,
    pub status: SessionStatus,
    pub content: String,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub content: String,
    pub phase: Phase,
    pub turn_count: u32,
    pub turns_remaining: u32,
    pub session_complete: bool,
}

#[derive(Serialize)]
pub struct ReflectionResponse {
    pub key_observations: String,
    pub outcome_classification: Outcome,
    pub insights_summary: String,
    pub commitment: Option<String>,
    pub suggested_followup: Option<String>,
}

impl From<ReflectionRecord> for ReflectionResponse {
    fn from(record: ReflectionRecord) -> Self {
        Self {
            key_observations: record.observations,
            outcome_classification: record.outcome,
            insights_summary: record.insights,
            commitment: record.commitment,
            suggested_followup: record.suggested_followup,
        }
    }
}

#[derive(Serialize)]
pub struct SessionEndResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub reflection: ReflectionResponse,
}

#[derive(Serialize)]
pub struct MessageHistoryItem {
    pub role: Role,
    pub content: String,
    pub phase: Phase,
    pub turn_number: u32,
    pub created_at: String,
}

impl From<MessageRecord> for MessageHistoryItem {
    fn from(record: MessageRecord) -> Self {
        Self {
            role: record.role,
            content: record.content,
            phase: record.phase,
            turn_number: record.turn_number,
            created_at: record.created_at,
        }
    }
}

#[derive(Serialize)]
pub struct SessionDetailResponse {
    pub session_id: String,
    pub topic: Option<String>,
    pub phase: Phase,
    pub turn_count: u32,
    pub max_turns: u32,
    pub turns_remaining: u32,
    pub status: SessionStatus,
    pub created_at: String,
    pub ended_at: Option<String>,
    pub messages: Vec<MessageHistoryItem>,
    pub reflection: Option<ReflectionResponse>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<CoachError> for ApiError {
    fn from(err: CoachError) -> Self {
        match err {
            CoachError::SessionNotFound(_) | CoachError::ReflectionNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            CoachError::InvalidState { .. } | CoachError::TurnsExhausted(_) => {
                ApiError::Conflict(err.to_string())
            }
            CoachError::InvalidInput(_) => ApiError::BadRequest(err.to_string()),
            CoachError::Model(_) | CoachError::Storage(_) => ApiError::Internal(err.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/messages", post(send_message))
        .route("/api/sessions/{id}/end", post(end_session))
        .route("/api/sessions/{id}/reflection", get(get_reflection))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn create_session(
    State(state): State<SharedState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let limits = state.turn_limits;
    let max_turns = request.max_turns.unwrap_or(limits.default_max_turns);
    if !limits.contains(max_turns) {
        return Err(ApiError::BadRequest(format!(
            "max_turns must be between {} and {}",
            limits.min_max_turns, limits.max_max_turns
        )));
    }

    let topic = request.topic.filter(|t| !t.trim().is_empty());
    let (session, content) = state.service.start_session(topic, max_turns).await?;

    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            session_id: session.id,
            phase: session.phase,
            max_turns: session.max_turns,
            turn_count: session.turn_count,
            turns_remaining: session.max_turns,
            status: session.status,
            content,
        }),
    ))
}

async fn send_message(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let outcome = state
        .service
        .process_message(&id, request.content, request.request_end)
        .await?;

    Ok(Json(MessageResponse {
        content: outcome.content,
        phase: outcome.phase,
        turn_count: outcome.turn_count,
        turns_remaining: outcome.turns_remaining,
        session_complete: outcome.session_complete,
    }))
}

async fn end_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<SessionEndResponse>, ApiError> {
    let (session, reflection) = state.service.end_session(&id).await?;
    Ok(Json(SessionEndResponse {
        session_id: session.id,
        status: session.status,
        reflection: reflection.into(),
    }))
}

async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<SessionDetailResponse>, ApiError> {
    let (session, messages, reflection) = state.service.session_detail(&id).await?;
    Ok(Json(detail_response(session, messages, reflection)))
}

fn detail_response(
    session: SessionRecord,
    messages: Vec<MessageRecord>,
    reflection: Option<ReflectionRecord>,
) -> SessionDetailResponse {
    SessionDetailResponse {
        turns_remaining: session.turns_remaining(),
        session_id: session.id,
        topic: session.topic,
        phase: session.phase,
        turn_count: session.turn_count,
        max_turns: session.max_turns,
        status: session.status,
        created_at: session.created_at,
        ended_at: session.ended_at,
        messages: messages.into_iter().map(Into::into).collect(),
        reflection: reflection.map(Into::into),
    }
}

async fn get_reflection(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ReflectionResponse>, ApiError> {
    let reflection = state.service.reflection(&id).await?;
    Ok(Json(reflection.into()))
}

// ── Server startup ────────────────────────────────────────────────────

/// Configuration for the API server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4280,
            db_path: PathBuf::from(".mentor/sessions.db"),
            dev_mode: false,
        }
    }
}

/// Build the application router over shared state.
pub fn build_router(state: SharedState) -> Router {
    api_router().with_state(state)
}

/// Start the coaching API server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let settings = Settings::from_env()?;

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = CoachDb::new(&config.db_path).context("Failed to initialize session database")?;

    let model = Arc::new(AnthropicClient::new(&settings));
    let service = CoachingService::new(DbHandle::new(db), model);
    let state = Arc::new(AppState {
        service,
        turn_limits: settings.turn_limits,
    });

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("mentor API listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Shutting down...");
}
