//! Persistence boundary for conversations, messages and upstream targets.

mod models;
mod sqlite;

pub use models::{
    ActiveTarget, ContinuationState, Conversation, Message, MessageRole, MessageStatus,
    ModelConfig, ModelProtocol, NewMessage, User, WorkflowConfig,
};
pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;

/// Persistence operations the relay depends on.
///
/// The relay only talks to this trait; `SqliteStore` is the reference
/// implementation used in production and tests.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn get_user(&self, id: &str) -> Result<Option<User>>;

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;

    async fn create_user(&self, username: &str, password_hash: &str) -> Result<User>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;

    async fn create_conversation(&self, user_id: &str, title: &str) -> Result<Conversation>;

    /// Bump `updated_at` to now.
    async fn touch_conversation(&self, id: &str) -> Result<()>;

    /// Persist continuation identifiers discovered during a streamed turn.
    /// Only fields present in `state` are written; `None` leaves the stored
    /// value untouched.
    async fn set_continuation(&self, id: &str, state: &ContinuationState) -> Result<()>;

    async fn create_message(&self, message: NewMessage) -> Result<Message>;

    async fn update_message_status(&self, id: &str, status: MessageStatus) -> Result<()>;

    /// Messages of a conversation in creation order.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;

    /// Mark assistant messages as read. Returns the ids actually updated;
    /// user-authored messages in the input are skipped.
    async fn mark_messages_read(
        &self,
        conversation_id: &str,
        message_ids: &[String],
    ) -> Result<Vec<String>>;

    async fn get_active_target(&self) -> Result<Option<ActiveTarget>>;

    /// Atomically replace the enabled upstream target.
    async fn set_active_target(&self, target: ActiveTarget) -> Result<()>;
}
