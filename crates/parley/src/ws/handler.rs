//! WebSocket upgrade handler and per-connection message loop.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::time::Duration;

use parley_protocol::{WsCommand, WsEvent};

use crate::api::{ApiError, AppState};
use crate::auth::{AuthError, CurrentUser};

/// Interval between server-sent keepalive pings.
const PING_INTERVAL_SECS: u64 = 30;

/// `GET /api/ws` - upgrade to a WebSocket session.
///
/// The token has already been checked by the auth middleware; here we only
/// confirm the identity still exists before accepting the socket.
pub async fn ws_handler(
    State(state): State<AppState>,
    user: CurrentUser,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user.id().to_string();

    if state.store.get_user(&user_id).await?.is_none() {
        return Err(AuthError::IdentityNotFound.into());
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user_id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (mut event_rx, conn_id) = state.hub.register_connection(&user_id);

    info!("WebSocket session opened for user {}", user_id);

    // Outbound half: greeting, hub events and keepalive pings.
    let send_task = tokio::spawn(async move {
        if let Ok(text) = serde_json::to_string(&WsEvent::Connected)
            && sender.send(WsMessage::Text(text.into())).await.is_err()
        {
            return;
        }

        let mut ping = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping.tick().await; // immediate first tick

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if sender.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    let Ok(text) = serde_json::to_string(&WsEvent::Ping) else { continue };
                    if sender.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Inbound half: parse and dispatch client commands.
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            WsMessage::Text(text) => match serde_json::from_str::<WsCommand>(&text) {
                Ok(command) => handle_command(&state, &user_id, command).await,
                Err(e) => {
                    debug!("Unparseable command from user {}: {}", user_id, e);
                    state
                        .hub
                        .send_to_user(
                            &user_id,
                            WsEvent::Error {
                                message: format!("unrecognized command: {}", e),
                                conversation_id: None,
                            },
                        )
                        .await;
                }
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    send_task.abort();
    state.hub.unregister_connection(&user_id, conn_id);

    // Room membership is per user, not per connection; only drop it once
    // the last socket is gone.
    if !state.hub.is_online(&user_id) {
        for room in state.hub.user_rooms(&user_id) {
            state.hub.leave_room(&user_id, &room);
        }
    }

    info!("WebSocket session closed for user {}", user_id);
}

async fn handle_command(state: &AppState, user_id: &str, command: WsCommand) {
    let conversation_id = command.conversation_id().map(str::to_string);

    let result = match command {
        WsCommand::Pong => Ok(()),

        WsCommand::JoinRoom { conversation_id } => state
            .relay
            .owned_conversation(user_id, &conversation_id)
            .await
            .map(|_| state.hub.join_room(user_id, &conversation_id)),

        WsCommand::LeaveRoom { conversation_id } => {
            state.hub.leave_room(user_id, &conversation_id);
            Ok(())
        }

        WsCommand::SendMessage {
            conversation_id,
            content,
        } => state
            .relay
            .handle_incoming(user_id, conversation_id.as_deref(), &content)
            .await
            .map(|_| ()),

        WsCommand::TypingStart { conversation_id } => {
            state.relay.typing(user_id, &conversation_id, true).await
        }

        WsCommand::TypingStop { conversation_id } => {
            state.relay.typing(user_id, &conversation_id, false).await
        }

        WsCommand::MarkAsRead {
            conversation_id,
            message_ids,
        } => state
            .relay
            .mark_read(user_id, &conversation_id, &message_ids)
            .await
            .map(|_| ()),
    };

    if let Err(e) = result {
        warn!("Command from user {} failed: {}", user_id, e);
        state
            .hub
            .send_to_user(
                user_id,
                WsEvent::Error {
                    message: e.to_string(),
                    conversation_id,
                },
            )
            .await;
    }
}
