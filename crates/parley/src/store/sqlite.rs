//! SQLite-backed chat store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use uuid::Uuid;

use super::models::{
    ActiveTarget, ContinuationState, Conversation, Message, MessageStatus, NewMessage, User,
};
use super::ChatStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id),
    title TEXT NOT NULL,
    continuation_session_id TEXT,
    continuation_node_id TEXT,
    continuation_message_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    status TEXT NOT NULL,
    prompt_tokens INTEGER NOT NULL DEFAULT 0,
    completion_tokens INTEGER NOT NULL DEFAULT 0,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, created_at);

-- Single-row table: the one enabled upstream target as tagged JSON.
CREATE TABLE IF NOT EXISTS active_target (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    config TEXT NOT NULL
);
"#;

/// SQLite implementation of [`ChatStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if necessary) the database at `path` and apply the
    /// schema.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("opening database at {}", path.display()))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .context("applying schema")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>(
            "SELECT id, username, password_hash, created_at FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching user")
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>(
            "SELECT id, username, password_hash, created_at FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .context("fetching user by username")
    }

    async fn create_user(&self, username: &str, password_hash: &str) -> Result<User> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO users (id, username, password_hash, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(username)
        .bind(password_hash)
        .bind(&created_at)
        .execute(&self.pool)
        .await
        .context("inserting user")?;

        Ok(User {
            id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at,
        })
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        sqlx::query_as::<_, Conversation>(
            r#"
            SELECT id, user_id, title,
                   continuation_session_id, continuation_node_id, continuation_message_id,
                   created_at, updated_at
            FROM conversations WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching conversation")
    }

    async fn create_conversation(&self, user_id: &str, title: &str) -> Result<Conversation> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO conversations (id, user_id, title, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(title)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("inserting conversation")?;

        Ok(Conversation {
            id,
            user_id: user_id.to_string(),
            title: title.to_string(),
            continuation_session_id: None,
            continuation_node_id: None,
            continuation_message_id: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    async fn touch_conversation(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("touching conversation")?;
        Ok(())
    }

    async fn set_continuation(&self, id: &str, state: &ContinuationState) -> Result<()> {
        if state.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE conversations SET
                continuation_session_id = COALESCE(?, continuation_session_id),
                continuation_node_id = COALESCE(?, continuation_node_id),
                continuation_message_id = COALESCE(?, continuation_message_id),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&state.session_id)
        .bind(&state.node_id)
        .bind(&state.message_id)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("updating continuation state")?;
        Ok(())
    }

    async fn create_message(&self, message: NewMessage) -> Result<Message> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();
        let role = message.role.to_string();
        let status = message.status.to_string();

        sqlx::query(
            r#"
            INSERT INTO messages
                (id, conversation_id, role, content, status,
                 prompt_tokens, completion_tokens, total_tokens, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&message.conversation_id)
        .bind(&role)
        .bind(&message.content)
        .bind(&status)
        .bind(message.prompt_tokens)
        .bind(message.completion_tokens)
        .bind(message.total_tokens)
        .bind(&created_at)
        .execute(&self.pool)
        .await
        .context("inserting message")?;

        Ok(Message {
            id,
            conversation_id: message.conversation_id,
            role,
            content: message.content,
            status,
            prompt_tokens: message.prompt_tokens,
            completion_tokens: message.completion_tokens,
            total_tokens: message.total_tokens,
            created_at,
        })
    }

    async fn update_message_status(&self, id: &str, status: MessageStatus) -> Result<()> {
        sqlx::query("UPDATE messages SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating message status")?;
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT id, conversation_id, role, content, status,
                   prompt_tokens, completion_tokens, total_tokens, created_at
            FROM messages
            WHERE conversation_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .context("listing messages")
    }

    async fn mark_messages_read(
        &self,
        conversation_id: &str,
        message_ids: &[String],
    ) -> Result<Vec<String>> {
        let mut updated = Vec::new();
        for id in message_ids {
            let result = sqlx::query(
                r#"
                UPDATE messages SET status = 'read'
                WHERE id = ? AND conversation_id = ? AND role = 'assistant' AND status != 'read'
                "#,
            )
            .bind(id)
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .context("marking message read")?;

            if result.rows_affected() > 0 {
                updated.push(id.clone());
            }
        }
        Ok(updated)
    }

    async fn get_active_target(&self) -> Result<Option<ActiveTarget>> {
        let config = sqlx::query_scalar::<_, String>("SELECT config FROM active_target WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("fetching active target")?;

        match config {
            Some(json) => {
                let target = serde_json::from_str(&json).context("decoding active target")?;
                Ok(Some(target))
            }
            None => Ok(None),
        }
    }

    async fn set_active_target(&self, target: ActiveTarget) -> Result<()> {
        let config = serde_json::to_string(&target).context("encoding active target")?;

        sqlx::query(
            r#"
            INSERT INTO active_target (id, config) VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET config = excluded.config
            "#,
        )
        .bind(&config)
        .execute(&self.pool)
        .await
        .context("storing active target")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{MessageRole, ModelConfig, ModelProtocol, WorkflowConfig};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqliteStore) {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::open(&temp.path().join("test.db")).await.unwrap();
        (temp, store)
    }

    fn model_config() -> ModelConfig {
        ModelConfig {
            provider: "openai".to_string(),
            model_name: "gpt-test".to_string(),
            endpoint: "http://localhost:1/v1/chat/completions".to_string(),
            api_key: None,
            protocol: ModelProtocol::ChatCompletion,
            temperature: 0.7,
            top_p: 1.0,
            max_tokens: 256,
            memory_enabled: true,
            context_length: 2000,
        }
    }

    #[tokio::test]
    async fn test_conversation_and_message_crud() {
        let (_temp, store) = setup().await;

        let user = store.create_user("alice", "hash").await.unwrap();
        let conv = store.create_conversation(&user.id, "first chat").await.unwrap();
        assert_eq!(conv.title, "first chat");
        assert!(conv.continuation_session_id.is_none());

        let m1 = store
            .create_message(NewMessage::text(&conv.id, MessageRole::User, "hello"))
            .await
            .unwrap();
        let m2 = store
            .create_message(NewMessage::text(&conv.id, MessageRole::Assistant, "hi there"))
            .await
            .unwrap();

        let messages = store.list_messages(&conv.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, m1.id);
        assert_eq!(messages[1].id, m2.id);

        store
            .update_message_status(&m1.id, MessageStatus::Sent)
            .await
            .unwrap();
        let fetched = store.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(fetched.user_id, user.id);
    }

    #[tokio::test]
    async fn test_mark_read_skips_user_messages() {
        let (_temp, store) = setup().await;
        let user = store.create_user("bob", "hash").await.unwrap();
        let conv = store.create_conversation(&user.id, "t").await.unwrap();

        let user_msg = store
            .create_message(NewMessage::text(&conv.id, MessageRole::User, "q"))
            .await
            .unwrap();
        let asst_msg = store
            .create_message(NewMessage::text(&conv.id, MessageRole::Assistant, "a"))
            .await
            .unwrap();

        let updated = store
            .mark_messages_read(&conv.id, &[user_msg.id.clone(), asst_msg.id.clone()])
            .await
            .unwrap();
        assert_eq!(updated, vec![asst_msg.id.clone()]);

        // Idempotent: a second pass updates nothing.
        let updated = store
            .mark_messages_read(&conv.id, &[asst_msg.id])
            .await
            .unwrap();
        assert!(updated.is_empty());
    }

    #[tokio::test]
    async fn test_continuation_partial_update() {
        let (_temp, store) = setup().await;
        let user = store.create_user("carol", "hash").await.unwrap();
        let conv = store.create_conversation(&user.id, "t").await.unwrap();

        store
            .set_continuation(
                &conv.id,
                &ContinuationState {
                    session_id: Some("sess-1".to_string()),
                    node_id: None,
                    message_id: None,
                },
            )
            .await
            .unwrap();

        store
            .set_continuation(
                &conv.id,
                &ContinuationState {
                    session_id: None,
                    node_id: Some("node-7".to_string()),
                    message_id: Some("msg-3".to_string()),
                },
            )
            .await
            .unwrap();

        let conv = store.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(conv.continuation_session_id.as_deref(), Some("sess-1"));
        assert_eq!(conv.continuation_node_id.as_deref(), Some("node-7"));
        assert_eq!(conv.continuation_message_id.as_deref(), Some("msg-3"));
    }

    #[tokio::test]
    async fn test_active_target_swap_is_exclusive() {
        let (_temp, store) = setup().await;

        assert!(store.get_active_target().await.unwrap().is_none());

        store
            .set_active_target(ActiveTarget::Model(model_config()))
            .await
            .unwrap();
        match store.get_active_target().await.unwrap() {
            Some(ActiveTarget::Model(cfg)) => assert_eq!(cfg.model_name, "gpt-test"),
            other => panic!("Expected model target, got {:?}", other),
        }

        // Enabling a workflow replaces the model config entirely.
        store
            .set_active_target(ActiveTarget::Workflow(WorkflowConfig {
                workflow_id: "wf-9".to_string(),
                endpoint: "http://localhost:1/workflow".to_string(),
                api_key: None,
                param_map: None,
                turn_timeout_secs: 60,
            }))
            .await
            .unwrap();
        match store.get_active_target().await.unwrap() {
            Some(ActiveTarget::Workflow(cfg)) => assert_eq!(cfg.workflow_id, "wf-9"),
            other => panic!("Expected workflow target, got {:?}", other),
        }
    }
}
