use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::Engine;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::attachments::Upload;
use crate::blob_store::LocalBlobStore;
use crate::chat::{
    ChatError, ChatService, ConversationDetail, ConversationSummary, TurnReport, TurnView,
    UserIdentity,
};
use crate::config::AppConfig;
use crate::runtime::BackendRuntime;
use crate::supervision::SupervisionEvent;

pub const USER_EMAIL_HEADER: &str = "x-faust-user-email";
pub const SESSION_HEADER: &str = "x-faust-session";

#[derive(Clone)]
pub struct ServerState {
    pub chat: Arc<ChatService>,
    pub blobs: Option<Arc<LocalBlobStore>>,
    pub auth: BackendAuthConfig,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
    /// Write accepted config updates back to faust_config.toml.
    pub persist_config: bool,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct AttachmentPayload {
    file_name: Option<String>,
    mime_type: String,
    data_base64: String,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    #[serde(default)]
    text: String,
    attachment: Option<AttachmentPayload>,
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    title: String,
}

#[derive(Debug, Deserialize)]
struct InstructionRequest {
    instruction: String,
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    deleted: String,
    active: String,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
}

#[derive(Debug, Serialize)]
struct InstructionResponse {
    conversation_id: String,
    instruction: String,
}

pub async fn serve_backend(
    runtime: BackendRuntime,
    event_rx: flume::Receiver<SupervisionEvent>,
) -> Result<()> {
    let bind_addr = std::env::var("FAUST_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
        .parse::<SocketAddr>()
        .context("Invalid FAUST_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);

    let state = Arc::new(ServerState {
        chat: runtime.chat.clone(),
        blobs: runtime.blob_store.clone(),
        auth,
        ws_events: ws_events.clone(),
        persist_config: true,
    });

    spawn_event_bridge(event_rx, ws_events);

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("FausT backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/config", get(get_config).put(update_config))
        .route(
            "/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/conversations/:id",
            get(get_conversation).delete(delete_conversation),
        )
        .route("/conversations/:id/activate", post(activate_conversation))
        .route("/conversations/:id/title", put(rename_conversation))
        .route("/conversations/:id/instruction", put(set_instruction))
        .route("/conversations/:id/turns", get(list_turns))
        .route("/conversations/:id/messages", post(send_message))
        .route("/conversations/:id/regenerate", post(regenerate))
        .route("/conversations/:id/cancel", post(cancel_turn))
        .route("/blobs/:id", get(get_blob))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/v1", protected)
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<SupervisionEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_supervision_event(event);
            let _ = ws_events.send(envelope);
        }
    });
}

fn map_supervision_event(event: SupervisionEvent) -> ApiEventEnvelope {
    let event_type = match &event {
        SupervisionEvent::StateChanged { .. } => "state_changed",
        SupervisionEvent::CandidateChunk { .. } => "candidate_chunk",
        SupervisionEvent::ReviewerScored { .. } => "reviewer_scored",
        SupervisionEvent::AttemptScored { .. } => "attempt_scored",
        SupervisionEvent::Finished { .. } => "turn_finished",
    };
    let mut payload = serde_json::to_value(&event).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(fields) = payload.as_object_mut() {
        fields.remove("kind");
    }
    envelope(event_type, payload)
}

fn envelope(event_type: &str, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("FAUST_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("FAUST_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "FAUST_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid FAUST_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

/// Logged-in users are identified by email, anonymous ones by a session id.
fn identity_from_headers(headers: &HeaderMap) -> Result<UserIdentity, (StatusCode, String)> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    if let Some(email) = header_value(USER_EMAIL_HEADER) {
        if !email.contains('@') {
            return Err(bad_request(format!("invalid user email '{}'", email)));
        }
        return Ok(UserIdentity::logged_in(email));
    }
    if let Some(session) = header_value(SESSION_HEADER) {
        return Ok(UserIdentity::anonymous(session));
    }
    Err(bad_request(format!(
        "missing {} or {} header",
        USER_EMAIL_HEADER, SESSION_HEADER
    )))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_config(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<AppConfig>, (StatusCode, String)> {
    Ok(Json(state.chat.config().await))
}

async fn update_config(
    State(state): State<Arc<ServerState>>,
    Json(new_config): Json<AppConfig>,
) -> Result<Json<AppConfig>, (StatusCode, String)> {
    let config = state
        .chat
        .update_config(new_config)
        .await
        .map_err(chat_error)?;
    if state.persist_config {
        if let Err(error) = config.save() {
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to save config: {error}"),
            ));
        }
    }
    Ok(Json(config))
}

async fn list_conversations(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConversationSummary>>, (StatusCode, String)> {
    let identity = identity_from_headers(&headers)?;
    Ok(Json(state.chat.list(&identity).await))
}

async fn create_conversation(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Result<Json<ConversationSummary>, (StatusCode, String)> {
    let identity = identity_from_headers(&headers)?;
    state
        .chat
        .new_conversation(&identity)
        .await
        .map(Json)
        .map_err(chat_error)
}

async fn get_conversation(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<ConversationDetail>, (StatusCode, String)> {
    let identity = identity_from_headers(&headers)?;
    state
        .chat
        .get(&identity, &conversation_id)
        .await
        .map(Json)
        .map_err(chat_error)
}

async fn delete_conversation(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<DeleteResponse>, (StatusCode, String)> {
    let identity = identity_from_headers(&headers)?;
    let active = state
        .chat
        .delete(&identity, &conversation_id)
        .await
        .map_err(chat_error)?;
    Ok(Json(DeleteResponse {
        deleted: conversation_id,
        active,
    }))
}

async fn activate_conversation(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<ConversationSummary>, (StatusCode, String)> {
    let identity = identity_from_headers(&headers)?;
    state
        .chat
        .activate(&identity, &conversation_id)
        .await
        .map(Json)
        .map_err(chat_error)
}

async fn rename_conversation(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(body): Json<RenameRequest>,
) -> Result<Json<ConversationSummary>, (StatusCode, String)> {
    let identity = identity_from_headers(&headers)?;
    state
        .chat
        .rename(&identity, &conversation_id, &body.title)
        .await
        .map(Json)
        .map_err(chat_error)
}

async fn set_instruction(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(body): Json<InstructionRequest>,
) -> Result<Json<InstructionResponse>, (StatusCode, String)> {
    let identity = identity_from_headers(&headers)?;
    state
        .chat
        .set_system_instruction(&identity, &conversation_id, &body.instruction)
        .await
        .map_err(chat_error)?;
    Ok(Json(InstructionResponse {
        conversation_id,
        instruction: body.instruction.trim().to_string(),
    }))
}

async fn list_turns(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<Vec<TurnView>>, (StatusCode, String)> {
    let identity = identity_from_headers(&headers)?;
    state
        .chat
        .turns(&identity, &conversation_id)
        .await
        .map(Json)
        .map_err(chat_error)
}

async fn send_message(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(body): Json<SendMessageRequest>,
) -> Result<Json<TurnReport>, (StatusCode, String)> {
    let identity = identity_from_headers(&headers)?;
    let upload = body.attachment.map(decode_attachment).transpose()?;
    state
        .chat
        .send(&identity, &conversation_id, &body.text, upload)
        .await
        .map(Json)
        .map_err(chat_error)
}

async fn regenerate(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<TurnReport>, (StatusCode, String)> {
    let identity = identity_from_headers(&headers)?;
    state
        .chat
        .regenerate(&identity, &conversation_id)
        .await
        .map(Json)
        .map_err(chat_error)
}

async fn cancel_turn(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<CancelResponse>, (StatusCode, String)> {
    let identity = identity_from_headers(&headers)?;
    let cancelled = state
        .chat
        .cancel(&identity, &conversation_id)
        .await
        .map_err(chat_error)?;
    Ok(Json(CancelResponse { cancelled }))
}

async fn get_blob(
    State(state): State<Arc<ServerState>>,
    Path(blob_id): Path<String>,
) -> Result<Response, (StatusCode, String)> {
    let Some(store) = state.blobs.as_ref() else {
        return Err(not_found("blob storage is not configured".to_string()));
    };
    match store.read(&blob_id).await.map_err(internal_error)? {
        Some((bytes, mime_type)) => {
            Ok(([(header::CONTENT_TYPE, mime_type)], bytes).into_response())
        }
        None => Err(not_found(format!("blob '{}' not found", blob_id))),
    }
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let identity = identity_from_headers(&headers)?;
    Ok(ws.on_upgrade(move |socket| handle_events_socket(state, identity, socket)))
}

async fn handle_events_socket(
    state: Arc<ServerState>,
    identity: UserIdentity,
    mut socket: WebSocket,
) {
    let mut rx = state.ws_events.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !event_visible_to(&state.chat, &identity, &event).await {
                            continue;
                        }
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

/// Users only see progress for conversations in their own workspace.
async fn event_visible_to(
    chat: &ChatService,
    identity: &UserIdentity,
    event: &ApiEventEnvelope,
) -> bool {
    match event
        .payload
        .get("conversation_id")
        .and_then(serde_json::Value::as_str)
    {
        Some(conversation_id) => chat.owns(identity, conversation_id).await,
        None => true,
    }
}

fn decode_attachment(payload: AttachmentPayload) -> Result<Upload, (StatusCode, String)> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.data_base64.trim())
        .map_err(|e| bad_request(format!("attachment is not valid base64: {}", e)))?;
    Ok(Upload {
        file_name: payload.file_name,
        mime_type: payload.mime_type,
        bytes,
    })
}

fn chat_error(error: ChatError) -> (StatusCode, String) {
    match error {
        ChatError::NotFound(_) => not_found(error.to_string()),
        ChatError::Busy(_) => (StatusCode::CONFLICT, error.to_string()),
        ChatError::Invalid(message) => bad_request(message),
        ChatError::Internal(error) => internal_error(error),
    }
}

fn bad_request(message: String) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message)
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervision::{Outcome, SupervisionState};
    use axum::http::HeaderValue;

    #[test]
    fn authorize_accepts_matching_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token-123"),
        );
        assert!(authorize(
            &headers,
            &BackendAuthConfig {
                mode: AuthMode::Required,
                token: Some("token-123".to_string()),
            }
        )
        .is_ok());
    }

    #[test]
    fn authorize_rejects_missing_or_invalid_token() {
        let auth = BackendAuthConfig {
            mode: AuthMode::Required,
            token: Some("token-123".to_string()),
        };
        assert!(authorize(&HeaderMap::new(), &auth).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wrong"),
        );
        assert!(authorize(&headers, &auth).is_err());
    }

    #[test]
    fn authorize_allows_when_auth_mode_disabled() {
        assert!(authorize(
            &HeaderMap::new(),
            &BackendAuthConfig {
                mode: AuthMode::Disabled,
                token: None,
            }
        )
        .is_ok());
    }

    #[test]
    fn parse_auth_mode_defaults_to_required() {
        assert!(matches!(parse_auth_mode(None).unwrap(), AuthMode::Required));
        assert!(matches!(
            parse_auth_mode(Some("disabled".to_string())).unwrap(),
            AuthMode::Disabled
        ));
        assert!(parse_auth_mode(Some("nope".to_string())).is_err());
    }

    #[test]
    fn identity_prefers_logged_in_email() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("abc"));
        assert_eq!(
            identity_from_headers(&headers).unwrap(),
            UserIdentity::anonymous("abc")
        );

        headers.insert(USER_EMAIL_HEADER, HeaderValue::from_static(" A@Example.com "));
        assert_eq!(
            identity_from_headers(&headers).unwrap(),
            UserIdentity::logged_in("a@example.com")
        );

        let err = identity_from_headers(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn chat_errors_map_to_status_codes() {
        assert_eq!(
            chat_error(ChatError::NotFound("x".to_string())).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            chat_error(ChatError::Busy("x".to_string())).0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            chat_error(ChatError::Invalid("bad".to_string())),
            (StatusCode::BAD_REQUEST, "bad".to_string())
        );
        assert_eq!(
            chat_error(ChatError::Internal(anyhow!("boom"))).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn supervision_events_become_typed_envelopes() {
        let envelope = map_supervision_event(SupervisionEvent::StateChanged {
            conversation_id: "c1".to_string(),
            attempt: 2,
            state: SupervisionState::Scoring,
        });
        assert_eq!(envelope.event_type, "state_changed");
        assert_eq!(envelope.payload["state"], "scoring");
        assert_eq!(envelope.payload["attempt"], 2);
        assert!(envelope.payload.get("kind").is_none());
        assert!(envelope.emitted_at <= Utc::now());

        let finished = map_supervision_event(SupervisionEvent::Finished {
            conversation_id: "c1".to_string(),
            outcome: Outcome::BestEffort,
            score: Some(45.0),
            attempts: 3,
            cancelled: false,
        });
        assert_eq!(finished.event_type, "turn_finished");
        assert_eq!(finished.payload["outcome"], "best_effort");
    }

    #[test]
    fn attachments_must_be_base64() {
        let ok = decode_attachment(AttachmentPayload {
            file_name: None,
            mime_type: "image/png".to_string(),
            data_base64: "AQID".to_string(),
        })
        .unwrap();
        assert_eq!(ok.bytes, vec![1, 2, 3]);

        assert!(decode_attachment(AttachmentPayload {
            file_name: None,
            mime_type: "image/png".to_string(),
            data_base64: "***".to_string(),
        })
        .is_err());
    }
}
