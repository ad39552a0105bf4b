use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing::{get, post}};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::ModelDescriptor;
use crate::error::{ChatError, ErrorKind};
use crate::orchestrator::{ChatService, Phase, SendOutcome};
use crate::render::{RenderedBlock, ScrollSignal, SearchState, Span, format_blocks, highlight_query};
use crate::session::{MessageView, ModelUsageStats, Session, SessionStats, SessionSummary};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ChatService>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(service: Arc<ChatService>) -> Self {
        Self { service, metrics: None }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// JSON error response carrying the error kind.
pub struct ApiError(ChatError);

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        Self(e)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound | ErrorKind::ModelUnavailable => StatusCode::NOT_FOUND,
        ErrorKind::Busy | ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::Auth => StatusCode::UNAUTHORIZED,
        ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Transport | ErrorKind::Server | ErrorKind::MalformedResponse | ErrorKind::Unknown => {
            StatusCode::BAD_GATEWAY
        }
        ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            warn!(kind = kind.as_str(), error = %self.0, "request failed");
        }
        let body = json!({ "error": { "kind": kind, "message": self.0.to_string() } });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionBody {
    pub model_id: Option<String>,
    pub user_id: Option<String>,
}

async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionBody>>,
) -> ApiResult<Session> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let session = state.service.create_session(body.model_id.as_deref(), body.user_id).await?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    pub user_id: Option<String>,
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

fn default_list_limit() -> usize {
    20
}

#[derive(Debug, Serialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(q): Query<ListSessionsQuery>,
) -> Json<ListSessionsResponse> {
    let sessions = state.service.list_user_sessions(q.user_id.as_deref(), q.limit).await;
    Json(ListSessionsResponse { sessions })
}

async fn load_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Session> {
    Ok(Json(state.service.load_session(id).await?))
}

#[derive(Debug, Serialize)]
pub struct CurrentSessionResponse {
    pub phase: Phase,
    pub session: Option<Session>,
}

async fn current_session(State(state): State<AppState>) -> Json<CurrentSessionResponse> {
    let phase = state.service.phase().await;
    let session = state.service.current_session().await;
    Json(CurrentSessionResponse { phase, session })
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionPatchBody {
    pub title: Option<String>,
    pub model_id: Option<String>,
}

async fn patch_session(State(state): State<AppState>, Json(patch): Json<SessionPatchBody>) -> ApiResult<Session> {
    let session = state
        .service
        .patch_session(patch.title.as_deref(), patch.model_id.as_deref())
        .await?;
    Ok(Json(session))
}

async fn archive_session(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.service.archive_session().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_session(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.service.clear_session().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    100
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub messages: Vec<MessageView>,
}

async fn session_messages(State(state): State<AppState>, Query(q): Query<HistoryQuery>) -> ApiResult<HistoryResponse> {
    let messages = state.service.conversation_history(q.limit).await?;
    Ok(Json(HistoryResponse { messages }))
}

async fn session_stats(State(state): State<AppState>) -> ApiResult<SessionStats> {
    Ok(Json(state.service.session_stats().await?))
}

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    pub content: String,
    pub model_id: Option<String>,
}

async fn send_message(State(state): State<AppState>, Json(body): Json<SendMessageBody>) -> ApiResult<SendOutcome> {
    let outcome = state.service.send_message(&body.content, body.model_id.as_deref()).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelDescriptor>,
}

async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse { models: state.service.available_models().await })
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    #[serde(default = "default_usage_days")]
    pub days: i64,
}

fn default_usage_days() -> i64 {
    30
}

async fn model_usage(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
    Query(q): Query<UsageQuery>,
) -> ApiResult<ModelUsageStats> {
    if state.service.store().get_model(&model_id).await.is_none() {
        return Err(ChatError::not_found("model", model_id).into());
    }
    Ok(Json(state.service.store().model_usage_stats(&model_id, q.days).await))
}

#[derive(Debug, Deserialize)]
pub struct RenderBody {
    pub text: String,
    pub query: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RenderResponse {
    pub blocks: Vec<RenderedBlock>,
}

async fn render(Json(body): Json<RenderBody>) -> Json<RenderResponse> {
    Json(RenderResponse { blocks: format_blocks(&body.text, body.query.as_deref()) })
}

#[derive(Debug, Deserialize)]
pub struct SearchBody {
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub signal: ScrollSignal,
    pub focused: Option<Uuid>,
    pub spans: Option<Vec<Span>>,
}

/// Searches every message of the current session and reports where to scroll.
async fn search(State(state): State<AppState>, Json(body): Json<SearchBody>) -> ApiResult<SearchResponse> {
    let messages = state.service.full_history().await?;
    let mut search = SearchState::default();
    let signal = search.update(&body.query, &messages);
    let spans = search
        .focused()
        .and_then(|slot| messages.iter().find(|m| m.message.id == slot))
        .map(|m| highlight_query(&m.message.content, &body.query));
    Ok(Json(SearchResponse { signal, focused: search.focused(), spans }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], handle.render()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/sessions", post(create_session).get(list_sessions))
        .route("/v1/sessions/:id/load", post(load_session))
        .route("/v1/session", get(current_session).patch(patch_session))
        .route("/v1/session/archive", post(archive_session))
        .route("/v1/session/clear", post(clear_session))
        .route("/v1/session/messages", get(session_messages))
        .route("/v1/session/stats", get(session_stats))
        .route("/v1/messages", post(send_message))
        .route("/v1/models", get(list_models))
        .route("/v1/models/:id/usage", get(model_usage))
        .route("/v1/render", post(render))
        .route("/v1/search", post(search))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
