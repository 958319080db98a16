//! Canonical wire types for the parley chat relay.
//!
//! These types define the protocol between frontend and backend: WebSocket
//! commands/events plus the request/response bodies of the REST chat
//! endpoints. They are kept in their own crate so clients and the server
//! share one definition.

use serde::{Deserialize, Serialize};

// ============================================================================
// Shared payloads
// ============================================================================

/// A chat message as delivered to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: String,
    pub conversation_id: String,
    /// "user" or "assistant"
    pub role: String,
    pub content: String,
    /// "sending", "sent" or "read"
    pub status: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    /// RFC3339 creation timestamp
    pub created_at: String,
}

// ============================================================================
// Events (Server -> Client)
// ============================================================================

/// Events sent from backend to frontend over WebSocket.
///
/// Room-scoped events carry the conversation id so a client can multiplex
/// several open conversations over a single connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    /// WebSocket connection established.
    Connected,

    /// Heartbeat/keepalive ping.
    Ping,

    /// Error message.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
    },

    /// A message was added to a conversation.
    NewMessage {
        conversation_id: String,
        message: MessagePayload,
    },

    /// Delivery status of a message changed.
    MessageStatus {
        conversation_id: String,
        message_id: String,
        status: String,
    },

    /// A participant started or stopped typing.
    UserTyping {
        conversation_id: String,
        user_id: String,
        typing: bool,
    },

    /// Assistant messages were marked read by the owner.
    MessagesRead {
        conversation_id: String,
        message_ids: Vec<String>,
    },
}

// ============================================================================
// Commands (Client -> Server)
// ============================================================================

/// Commands sent from frontend to backend over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsCommand {
    /// Pong response to ping.
    Pong,

    /// Join a conversation room.
    JoinRoom { conversation_id: String },

    /// Leave a conversation room.
    LeaveRoom { conversation_id: String },

    /// Send a chat message. A missing conversation id starts a new
    /// conversation.
    SendMessage {
        #[serde(default)]
        conversation_id: Option<String>,
        content: String,
    },

    /// Typing indicator on.
    TypingStart { conversation_id: String },

    /// Typing indicator off.
    TypingStop { conversation_id: String },

    /// Mark assistant messages as read.
    MarkAsRead {
        conversation_id: String,
        message_ids: Vec<String>,
    },
}

impl WsCommand {
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            WsCommand::JoinRoom { conversation_id }
            | WsCommand::LeaveRoom { conversation_id }
            | WsCommand::TypingStart { conversation_id }
            | WsCommand::TypingStop { conversation_id }
            | WsCommand::MarkAsRead {
                conversation_id, ..
            } => Some(conversation_id),
            WsCommand::SendMessage {
                conversation_id, ..
            } => conversation_id.as_deref(),
            WsCommand::Pong => None,
        }
    }
}

// ============================================================================
// REST DTOs
// ============================================================================

/// Body of `POST /api/chat` and `POST /api/chat/stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub content: String,
}

/// Response of the synchronous chat endpoint: the persisted user message
/// followed by the assistant reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub conversation_id: String,
    pub messages: Vec<MessagePayload>,
}

/// One chunk of the streaming chat endpoint. `content` is the accumulated
/// assistant text so far, not a delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub done: bool,
}
