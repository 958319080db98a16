//! Chat data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

use parley_protocol::MessagePayload;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(format!("Unknown message role: {}", s)),
        }
    }
}

/// Delivery status of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Read,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sending => write!(f, "sending"),
            Self::Sent => write!(f, "sent"),
            Self::Read => write!(f, "read"),
        }
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "read" => Ok(Self::Read),
            _ => Err(format!("Unknown message status: {}", s)),
        }
    }
}

/// A registered user.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: String,
}

/// A conversation owned by a single user.
///
/// The `continuation_*` columns hold opaque identifiers handed back by the
/// upstream workflow engine mid-stream. They are reused on the next turn in
/// the same conversation and never invented locally.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub continuation_session_id: Option<String>,
    pub continuation_node_id: Option<String>,
    pub continuation_message_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Continuation identifiers discovered during a streamed workflow turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationState {
    pub session_id: Option<String>,
    pub node_id: Option<String>,
    pub message_id: Option<String>,
}

impl ContinuationState {
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.node_id.is_none() && self.message_id.is_none()
    }
}

/// A chat message stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    /// Message role (user, assistant)
    pub role: String,
    pub content: String,
    /// Delivery status (sending, sent, read)
    pub status: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    /// RFC3339 timestamp
    pub created_at: String,
}

impl Message {
    /// Convert into the wire payload shape.
    pub fn to_payload(&self) -> MessagePayload {
        MessagePayload {
            id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            role: self.role.clone(),
            content: self.content.clone(),
            status: self.status.clone(),
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            created_at: self.created_at.clone(),
        }
    }
}

/// Input for creating a new message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub status: MessageStatus,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl NewMessage {
    /// A plain message with zeroed token counters.
    pub fn text(conversation_id: &str, role: MessageRole, content: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            status: MessageStatus::Sent,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        }
    }
}

/// Wire protocol spoken by a direct model endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProtocol {
    /// OpenAI-style chat completions (messages array + usage block).
    ChatCompletion,
    /// Plain prompt completion (choices[0].text / output / text).
    RawCompletion,
    /// Ollama-style local generation (response/output + eval_count).
    LocalGeneration,
}

impl fmt::Display for ModelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChatCompletion => write!(f, "chat_completion"),
            Self::RawCompletion => write!(f, "raw_completion"),
            Self::LocalGeneration => write!(f, "local_generation"),
        }
    }
}

impl std::str::FromStr for ModelProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            // Provider names accepted as aliases for migration friendliness.
            "chat_completion" | "openai" | "siliconflow" => Ok(Self::ChatCompletion),
            "raw_completion" | "raw" | "completion" => Ok(Self::RawCompletion),
            "local_generation" | "ollama" => Ok(Self::LocalGeneration),
            _ => Err(format!("Unknown model protocol: {}", s)),
        }
    }
}

/// Configuration for a direct model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub model_name: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub protocol: ModelProtocol,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: i64,
    /// Whether to send a bounded window of prior messages.
    pub memory_enabled: bool,
    /// History budget in characters of message content.
    pub context_length: i64,
}

impl ModelConfig {
    /// A config that cannot be dispatched (missing endpoint or model name)
    /// short-circuits to the fallback reply without a network call.
    pub fn is_dispatchable(&self) -> bool {
        !self.endpoint.is_empty() && !self.model_name.is_empty()
    }
}

/// Configuration for a streaming workflow engine endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub workflow_id: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Template merged into the fresh-turn input before the user text keys.
    #[serde(default)]
    pub param_map: Option<serde_json::Value>,
    /// Ceiling on one streamed turn, in seconds.
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
}

fn default_turn_timeout_secs() -> u64 {
    60
}

/// The single enabled upstream. Enabling one kind replaces whatever was
/// active before, so at most one target exists at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActiveTarget {
    Model(ModelConfig),
    Workflow(WorkflowConfig),
}
