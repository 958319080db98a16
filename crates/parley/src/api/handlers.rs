//! REST handlers for the chat endpoints.

use axum::{
    Json,
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream};

use parley_protocol::{ChatRequest, ChatResponse, StreamChunk};

use crate::auth::CurrentUser;

use super::{ApiError, AppState};

/// `GET /health` - liveness plus a connection gauge.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connected_users": state.hub.connected_user_count(),
    }))
}

/// Body of the register and login endpoints.
#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user_id: String,
    pub username: String,
}

/// `POST /api/auth/register` - create an account and hand back a token.
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<AuthRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let username = request.username.trim();
    if username.is_empty() || request.password.is_empty() {
        return Err(ApiError::BadRequest(
            "username and password are required".to_string(),
        ));
    }

    if state.store.get_user_by_username(username).await?.is_some() {
        return Err(ApiError::BadRequest("username already taken".to_string()));
    }

    let password_hash = bcrypt::hash(&request.password, bcrypt::DEFAULT_COST)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("hashing password: {}", e)))?;
    let user = state.store.create_user(username, &password_hash).await?;
    let token = state.auth.generate_token(&user.id, &user.username)?;

    Ok(Json(AuthResponse {
        token,
        user_id: user.id,
        username: user.username,
    }))
}

/// `POST /api/auth/login` - exchange credentials for a token.
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<AuthRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let user = state
        .store
        .get_user_by_username(request.username.trim())
        .await?
        .ok_or_else(|| ApiError::Unauthorized("invalid username or password".to_string()))?;

    let valid = bcrypt::verify(&request.password, &user.password_hash)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("verifying password: {}", e)))?;
    if !valid {
        return Err(ApiError::Unauthorized(
            "invalid username or password".to_string(),
        ));
    }

    let token = state.auth.generate_token(&user.id, &user.username)?;
    Ok(Json(AuthResponse {
        token,
        user_id: user.id,
        username: user.username,
    }))
}

/// `POST /api/chat` - run one turn to completion and return both persisted
/// messages.
pub async fn chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    validate_content(&request.content)?;

    let record = state
        .relay
        .handle_incoming(user.id(), request.conversation_id.as_deref(), &request.content)
        .await?;

    Ok(Json(ChatResponse {
        conversation_id: record.conversation.id,
        messages: vec![
            record.user_message.to_payload(),
            record.assistant_message.to_payload(),
        ],
    }))
}

/// `POST /api/chat/stream` - run one turn, streaming the accumulated
/// assistant text as SSE chunks. The final chunk carries `done: true` and
/// the conversation id.
pub async fn chat_stream(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    validate_content(&request.content)?;

    let (tx, rx) = mpsc::unbounded_channel::<StreamChunk>();
    let relay = Arc::clone(&state.relay);
    let user_id = user.id().to_string();

    // The turn is tied to the response stream: when the client aborts, the
    // guard below aborts this task, dropping the in-flight upstream call.
    let handle = tokio::spawn(async move {
        let delta_tx = tx.clone();
        let result = relay
            .handle_incoming_streaming(
                &user_id,
                request.conversation_id.as_deref(),
                &request.content,
                move |text| {
                    let _ = delta_tx.send(StreamChunk {
                        content: text.to_string(),
                        conversation_id: None,
                        done: false,
                    });
                },
            )
            .await;

        let final_chunk = match result {
            Ok(record) => StreamChunk {
                content: record.assistant_message.content,
                conversation_id: Some(record.conversation.id),
                done: true,
            },
            Err(e) => StreamChunk {
                content: format!("error: {}", e),
                conversation_id: request.conversation_id,
                done: true,
            },
        };
        let _ = tx.send(final_chunk);
    });

    let guard = AbortOnDrop(handle);
    let stream = UnboundedReceiverStream::new(rx).map(move |chunk| {
        let _guard = &guard;
        Event::default().json_data(&chunk)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Aborts the wrapped turn task when the SSE stream is dropped, so a client
/// abort cancels the conversation's in-flight upstream call.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// `POST /api/chat/{conversation_id}/stop` - ask the workflow engine to
/// halt the conversation's running session.
pub async fn stop_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let stopped = state.relay.stop_turn(user.id(), &conversation_id).await?;
    Ok(Json(json!({ "stopped": stopped })))
}

/// `GET /api/conversations/{conversation_id}/messages` - conversation
/// history in creation order.
pub async fn list_messages(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(conversation_id): Path<String>,
) -> Result<Json<ChatResponse>, ApiError> {
    state
        .relay
        .owned_conversation(user.id(), &conversation_id)
        .await?;

    let messages = state.store.list_messages(&conversation_id).await?;
    Ok(Json(ChatResponse {
        conversation_id,
        messages: messages.iter().map(|m| m.to_payload()).collect(),
    }))
}

fn validate_content(content: &str) -> Result<(), ApiError> {
    if content.trim().is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".to_string()));
    }
    Ok(())
}
