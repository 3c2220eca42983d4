//! HTTP and WebSocket surface over the agent context.
//!
//! Routes:
//! - `POST /agents` ingest a payload into a new or existing knowledge base
//! - `GET /agents`, `DELETE /agents/{kb_id}`
//! - `POST /agents/{kb_id}/chat` one stateless turn over HTTP
//! - `GET /handoffs`, `GET /handoffs/{request_id}`, `POST /handoffs/{request_id}/resolve`
//! - `GET /ws/agents/{kb_id}/chat` conversational session

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use concierge_agent::{
    open_session, AgentContext, InboundMessage, IngestReport, OutboundMessage, TurnOutcome,
};
use concierge_core::domain::handoff::{HandoffRequest, HandoffRequestId};
use concierge_core::domain::tenant::{TenantId, TenantSummary};
use concierge_core::errors::{ApplicationError, DomainError, InterfaceError};
use concierge_core::ingest::RawInput;

const DEFAULT_SOURCE_REF: &str = "api";
const OUTBOUND_BUFFER: usize = 32;
const HTTP_HANDOFF_MESSAGE: &str = "This question requires human assistance.";

#[derive(Clone)]
pub struct ApiState {
    context: Arc<AgentContext>,
}

pub fn router(context: Arc<AgentContext>) -> Router {
    Router::new()
        .route("/agents", post(create_agent).get(list_agents))
        .route("/agents/{kb_id}", delete(delete_agent))
        .route("/agents/{kb_id}/chat", post(chat_once))
        .route("/handoffs", get(list_handoffs))
        .route("/handoffs/{request_id}", get(get_handoff))
        .route("/handoffs/{request_id}/resolve", post(resolve_handoff))
        .route("/ws/agents/{kb_id}/chat", get(chat))
        .with_state(ApiState { context })
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError(InterfaceError);

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
    pub correlation_id: String,
}

fn correlation_id() -> String {
    format!("req-{}", uuid::Uuid::new_v4().simple())
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        Self(error.into_interface(correlation_id()))
    }
}

impl From<DomainError> for ApiError {
    fn from(error: DomainError) -> Self {
        ApplicationError::from(error).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            InterfaceError::BadRequest { .. } => (StatusCode::BAD_REQUEST, "bad_request"),
            InterfaceError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            InterfaceError::ServiceUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            InterfaceError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        // Caller mistakes are echoed back; infrastructure detail stays in the log.
        let message = match &self.0 {
            InterfaceError::BadRequest { message, .. } | InterfaceError::NotFound { message, .. } => {
                message.clone()
            }
            other => other.user_message().to_string(),
        };

        warn!(
            event_name = "api.request_failed",
            correlation_id = self.0.correlation_id(),
            status = status.as_u16(),
            error = %self.0,
            "request failed"
        );

        let body = ErrorBody {
            error: ErrorDetail {
                kind: kind.to_string(),
                message,
                correlation_id: self.0.correlation_id().to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Knowledge bases
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub source_ref: Option<String>,
}

async fn create_agent(
    State(state): State<ApiState>,
    Json(body): Json<CreateAgentRequest>,
) -> Result<(StatusCode, Json<IngestReport>), ApiError> {
    let tenant_id = body.tenant_id.as_deref().map(TenantId::parse).transpose()?;
    let source_ref = body
        .source_ref
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_SOURCE_REF)
        .to_string();

    let report = state
        .context
        .ingest(tenant_id, body.name, RawInput::from_payload(body.payload), &source_ref)
        .await?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn list_agents(State(state): State<ApiState>) -> Result<Json<Vec<TenantSummary>>, ApiError> {
    Ok(Json(state.context.knowledge().list().await?))
}

async fn delete_agent(
    Path(kb_id): Path<String>,
    State(state): State<ApiState>,
) -> Result<StatusCode, ApiError> {
    let tenant_id = TenantId::parse(&kb_id)?;
    state.context.knowledge().delete(&tenant_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Handoffs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ResolveHandoffRequest {
    pub response_text: String,
    #[serde(default)]
    pub update_kb: bool,
}

async fn list_handoffs(
    State(state): State<ApiState>,
) -> Result<Json<Vec<HandoffRequest>>, ApiError> {
    Ok(Json(state.context.handoffs().pending().await?))
}

async fn get_handoff(
    Path(request_id): Path<String>,
    State(state): State<ApiState>,
) -> Result<Json<HandoffRequest>, ApiError> {
    let request_id = HandoffRequestId(request_id);
    state
        .context
        .handoffs()
        .get(&request_id)
        .await?
        .map(Json)
        .ok_or_else(|| DomainError::UnknownRequest(request_id.to_string()).into())
}

async fn resolve_handoff(
    Path(request_id): Path<String>,
    State(state): State<ApiState>,
    Json(body): Json<ResolveHandoffRequest>,
) -> Result<Json<HandoffRequest>, ApiError> {
    let resolved = state
        .context
        .handoffs()
        .resolve(&HandoffRequestId(request_id), &body.response_text, body.update_kb)
        .await?;
    Ok(Json(resolved))
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatReplyKind {
    Answer,
    Handoff,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: ChatReplyKind,
    pub confidence_score: Option<f32>,
}

/// No session, no history and no handoff request: the caller decides what to
/// do with a `handoff` reply.
async fn chat_once(
    Path(kb_id): Path<String>,
    State(state): State<ApiState>,
    Json(body): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let tenant_id = TenantId::parse(&kb_id)?;
    if body.message.trim().is_empty() {
        return Err(DomainError::MissingInput { field: "message" }.into());
    }
    let kb = state.context.knowledge().open(&tenant_id).await?;

    let report = state.context.runtime().run_turn_scored(&kb, &body.message).await;
    let (content, kind) = match report.outcome {
        TurnOutcome::Answer { text } => (text, ChatReplyKind::Answer),
        TurnOutcome::Handoff { .. } => (HTTP_HANDOFF_MESSAGE.to_string(), ChatReplyKind::Handoff),
        TurnOutcome::GenerationFailure { message } => {
            return Err(ApplicationError::GenerationFailure(message).into());
        }
    };
    debug!(
        event_name = "api.chat_turn",
        tenant_id = %tenant_id,
        kind = ?kind,
        confidence = report.confidence,
        "stateless chat turn finished"
    );
    Ok(Json(ChatResponse { content, kind, confidence_score: report.confidence }))
}

/// Unknown tenants are rejected before the upgrade.
async fn chat_tenant(context: &AgentContext, kb_id: &str) -> Result<TenantId, ApiError> {
    let tenant_id = TenantId::parse(kb_id)?;
    context.knowledge().open(&tenant_id).await?;
    Ok(tenant_id)
}

async fn chat(
    Path(kb_id): Path<String>,
    State(state): State<ApiState>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let tenant_id = chat_tenant(&state.context, &kb_id).await?;
    Ok(upgrade.on_upgrade(move |socket| bridge(socket, state.context, tenant_id)))
}

async fn bridge(mut socket: WebSocket, context: Arc<AgentContext>, tenant_id: TenantId) {
    let (outbound, mut outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let session = match open_session(context, tenant_id.clone(), outbound).await {
        Ok(session) => session,
        Err(error) => {
            warn!(
                event_name = "ws.session_rejected",
                tenant_id = %tenant_id,
                error = %error,
                "could not open session after upgrade"
            );
            let message = OutboundMessage::Error { message: error.into_interface("ws").user_message().to_string() };
            let _ = send_json(&mut socket, &message).await;
            return;
        }
    };
    info!(
        event_name = "ws.connected",
        session_id = %session.session_id(),
        tenant_id = %tenant_id,
        "chat connection established"
    );

    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<InboundMessage>(text.as_str()) {
                        Ok(message) => {
                            if session.send_user_message(message.text).await.is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            debug!(
                                event_name = "ws.inbound_rejected",
                                session_id = %session.session_id(),
                                error = %error,
                                "inbound frame is not a chat message"
                            );
                            let reply = OutboundMessage::Error {
                                message: "Expected a JSON object like {\"text\": \"...\"}.".to_string(),
                            };
                            if send_json(&mut socket, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            outbound = outbound_rx.recv() => match outbound {
                Some(message) => {
                    if send_json(&mut socket, &message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    info!(
        event_name = "ws.disconnected",
        session_id = %session.session_id(),
        tenant_id = %tenant_id,
        "chat connection closed"
    );
    session.close().await;
}

async fn send_json(socket: &mut WebSocket, message: &OutboundMessage) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(payload.into())).await
}
