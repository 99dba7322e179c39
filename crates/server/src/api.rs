//! JSON and SSE routes for the conversational agent.
//!
//! - `POST /api/chat/stream`           run one turn, streamed as server-sent events
//! - `GET  /api/sessions/{id}/export`  session snapshot (live or persisted)
//! - `POST /api/cache/invalidate`      data-change hook for the prompt caches
//! - `GET  /api/tools/metrics`         per-tool execution counters

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sprout_agent::prompt_cache::InvalidationReport;
use sprout_agent::session::{SessionError, SessionSnapshot};
use sprout_agent::stream::{self, EmitterConfig};
use sprout_agent::tools::ToolStatsReport;
use sprout_agent::{AgentRuntime, TurnRequest};
use sprout_core::domain::organization::DataCategory;
use sprout_core::domain::session::SessionId;
use sprout_core::errors::{ApplicationError, InterfaceError};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct ApiState {
    runtime: Arc<AgentRuntime>,
    stream: EmitterConfig,
}

impl ApiState {
    pub fn new(runtime: Arc<AgentRuntime>, stream: EmitterConfig) -> Self {
        Self { runtime, stream }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamRequest {
    pub session_id: Option<String>,
    pub user_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub role: Option<String>,
    pub message: String,
    #[serde(default)]
    pub page_path: Option<String>,
    #[serde(default)]
    pub mode_flags: BTreeSet<String>,
    #[serde(default)]
    pub context: Option<Value>,
    /// Round limit for a new conversation.
    #[serde(default)]
    pub max_rounds: Option<u32>,
    #[serde(default)]
    pub finalize: bool,
}

impl ChatStreamRequest {
    fn validate(&self) -> Result<(), &'static str> {
        if self.message.trim().is_empty() {
            return Err("message must not be empty");
        }
        if self.user_id.trim().is_empty() || self.tenant_id.trim().is_empty() {
            return Err("userId and tenantId are required");
        }
        if self.max_rounds == Some(0) {
            return Err("maxRounds must be at least 1");
        }
        Ok(())
    }

    fn into_turn(self) -> TurnRequest {
        TurnRequest {
            session_id: self.session_id.filter(|id| !id.is_empty()).map(SessionId),
            user_id: self.user_id,
            tenant_id: self.tenant_id,
            role: self.role.unwrap_or_else(|| "staff".to_string()),
            message: self.message,
            page_path: self.page_path,
            mode_flags: self.mode_flags,
            context: self.context,
            max_rounds: self.max_rounds,
            finalize: self.finalize,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateRequest {
    pub category: String,
    pub tenant_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsQuery {
    /// Only the `worst` tools, ranked by failure rate then latency.
    pub worst: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ToolMetricsResponse {
    pub tools: Vec<ToolStatsReport>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/sessions/{id}/export", get(export_session))
        .route("/api/cache/invalidate", post(invalidate_cache))
        .route("/api/tools/metrics", get(tool_metrics))
        .with_state(state)
}

pub async fn chat_stream(
    State(state): State<ApiState>,
    Json(request): Json<ChatStreamRequest>,
) -> ApiResult<Response> {
    let correlation_id = Uuid::new_v4().to_string();
    if let Err(message) = request.validate() {
        return Err(bad_request(message, &correlation_id));
    }

    let (emitter, receiver) = stream::channel(state.stream.clone());
    let turn = request.into_turn();
    info!(
        event_name = "server.chat.accepted",
        correlation_id = %correlation_id,
        stream_id = emitter.stream_id(),
        session_id = turn.session_id.as_ref().map(|id| id.0.as_str()).unwrap_or("new"),
        "chat turn accepted"
    );

    let runtime = Arc::clone(&state.runtime);
    tokio::spawn(async move {
        if let Err(error) = runtime.handle_turn(turn, &emitter).await {
            warn!(
                event_name = "server.chat.turn_failed",
                correlation_id = %correlation_id,
                code = error.code(),
                error = %error,
                "chat turn ended with an error event"
            );
        }
    });

    let body = Body::from_stream(ReceiverStream::new(receiver).map(Ok::<_, Infallible>));
    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response())
}

pub async fn export_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionSnapshot>> {
    let correlation_id = Uuid::new_v4().to_string();
    match state.runtime.sessions().snapshot(&SessionId(id)).await {
        Ok(snapshot) => Ok(Json(snapshot)),
        Err(SessionError::NotFound(id)) => Err((
            StatusCode::NOT_FOUND,
            Json(ApiError { error: format!("session `{id}` was not found"), correlation_id }),
        )),
        Err(SessionError::InvalidId(id)) => {
            Err(bad_request(&format!("invalid session id `{id}`"), &correlation_id))
        }
        Err(error) => Err(interface_error(ApplicationError::from(error), &correlation_id)),
    }
}

pub async fn invalidate_cache(
    State(state): State<ApiState>,
    Json(request): Json<InvalidateRequest>,
) -> ApiResult<Json<InvalidationReport>> {
    let correlation_id = Uuid::new_v4().to_string();
    let Some(category) = DataCategory::parse(&request.category) else {
        return Err(bad_request(
            &format!("unknown data category `{}`", request.category),
            &correlation_id,
        ));
    };
    if request.tenant_id.trim().is_empty() {
        return Err(bad_request("tenantId is required", &correlation_id));
    }

    let report = state.runtime.prompts().invalidate(category, &request.tenant_id).await;
    info!(
        event_name = "server.cache.invalidated",
        correlation_id = %correlation_id,
        category = category.as_str(),
        tenant_id = %request.tenant_id,
        prompts_removed = report.prompts_removed,
        "prompt caches invalidated by data change"
    );
    Ok(Json(report))
}

pub async fn tool_metrics(
    State(state): State<ApiState>,
    Query(query): Query<MetricsQuery>,
) -> Json<ToolMetricsResponse> {
    let metrics = state.runtime.orchestrator().metrics();
    let tools = match query.worst {
        Some(limit) => metrics.worst_performing(limit).await,
        None => metrics.snapshot().await,
    };
    Json(ToolMetricsResponse { tools })
}

fn bad_request(message: &str, correlation_id: &str) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError { error: message.to_string(), correlation_id: correlation_id.to_string() }),
    )
}

fn interface_error(error: ApplicationError, correlation_id: &str) -> (StatusCode, Json<ApiError>) {
    let interface = error.into_interface(correlation_id);
    let status = match &interface {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
        InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(
        event_name = "server.api.error",
        correlation_id = interface.correlation_id(),
        error = %interface,
        "request failed"
    );
    (
        status,
        Json(ApiError {
            error: interface.user_message().to_string(),
            correlation_id: interface.correlation_id().to_string(),
        }),
    )
}
