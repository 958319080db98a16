//! Turn orchestration: accept a user message, run the active upstream
//! target, persist both sides of the exchange and fan the results out to
//! the conversation room.

use anyhow::Context;
use log::{info, warn};
use std::sync::Arc;
use thiserror::Error;

use parley_protocol::WsEvent;

use crate::model::{HistoryMessage, ModelAdapter, ModelReply};
use crate::store::{
    ActiveTarget, ChatStore, ContinuationState, Conversation, Message, MessageRole, MessageStatus,
    ModelConfig, NewMessage,
};
use crate::workflow::WorkflowEngine;
use crate::ws::WsHub;

/// Maximum characters of the first message used as a conversation title.
const TITLE_MAX_CHARS: usize = 20;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("conversation not found")]
    ConversationNotFound,

    #[error("conversation belongs to another user")]
    NotOwner,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Both persisted sides of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub conversation: Conversation,
    pub user_message: Message,
    pub assistant_message: Message,
}

/// Orchestrates one user turn end to end.
pub struct ConversationRelay {
    store: Arc<dyn ChatStore>,
    hub: Arc<WsHub>,
    adapter: ModelAdapter,
    engine: WorkflowEngine,
}

impl ConversationRelay {
    pub fn new(
        store: Arc<dyn ChatStore>,
        hub: Arc<WsHub>,
        adapter: ModelAdapter,
        engine: WorkflowEngine,
    ) -> Self {
        Self {
            store,
            hub,
            adapter,
            engine,
        }
    }

    pub fn hub(&self) -> &Arc<WsHub> {
        &self.hub
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    /// Run a full turn without intermediate streaming.
    pub async fn handle_incoming(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        content: &str,
    ) -> Result<TurnRecord, RelayError> {
        self.handle_incoming_streaming(user_id, conversation_id, content, |_| {})
            .await
    }

    /// Run a full turn, reporting the accumulated assistant text after every
    /// visible change. Used by the SSE endpoint; the WebSocket path passes a
    /// no-op and delivers only the finished message.
    pub async fn handle_incoming_streaming<F>(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        content: &str,
        on_delta: F,
    ) -> Result<TurnRecord, RelayError>
    where
        F: FnMut(&str) + Send,
    {
        let conversation = match conversation_id {
            Some(id) => self.owned_conversation(user_id, id).await?,
            None => {
                let conversation = self
                    .store
                    .create_conversation(user_id, &title_from(content))
                    .await?;
                info!(
                    "Created conversation {} for user {}",
                    conversation.id, user_id
                );
                conversation
            }
        };

        // The sender always follows their own conversation, so a turn sent
        // over REST still reaches their open sockets.
        self.hub.join_room(user_id, &conversation.id);

        let prior = self
            .store
            .list_messages(&conversation.id)
            .await
            .context("listing conversation history")?;

        // The user message stays "sending" until the upstream turn resolves.
        let mut user_message = self
            .store
            .create_message(NewMessage {
                conversation_id: conversation.id.clone(),
                role: MessageRole::User,
                content: content.to_string(),
                status: MessageStatus::Sending,
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
            })
            .await?;

        self.hub
            .broadcast_to_room(
                &conversation.id,
                WsEvent::NewMessage {
                    conversation_id: conversation.id.clone(),
                    message: user_message.to_payload(),
                },
            )
            .await;

        let reply = self
            .run_upstream(&conversation, &prior, content, on_delta)
            .await?;

        self.store
            .update_message_status(&user_message.id, MessageStatus::Sent)
            .await?;
        user_message.status = MessageStatus::Sent.to_string();

        self.hub
            .broadcast_to_room(
                &conversation.id,
                WsEvent::MessageStatus {
                    conversation_id: conversation.id.clone(),
                    message_id: user_message.id.clone(),
                    status: user_message.status.clone(),
                },
            )
            .await;

        let assistant_message = self
            .store
            .create_message(NewMessage {
                conversation_id: conversation.id.clone(),
                role: MessageRole::Assistant,
                content: reply.content,
                status: MessageStatus::Sent,
                prompt_tokens: reply.prompt_tokens,
                completion_tokens: reply.completion_tokens,
                total_tokens: reply.total_tokens,
            })
            .await?;

        self.store.touch_conversation(&conversation.id).await?;

        self.hub
            .broadcast_to_room(
                &conversation.id,
                WsEvent::NewMessage {
                    conversation_id: conversation.id.clone(),
                    message: assistant_message.to_payload(),
                },
            )
            .await;

        Ok(TurnRecord {
            conversation,
            user_message,
            assistant_message,
        })
    }

    /// Dispatch to whichever upstream is enabled. No target behaves like an
    /// undispatchable model config: the echo fallback.
    async fn run_upstream<F>(
        &self,
        conversation: &Conversation,
        prior: &[Message],
        content: &str,
        mut on_delta: F,
    ) -> Result<ModelReply, RelayError>
    where
        F: FnMut(&str) + Send,
    {
        match self.store.get_active_target().await? {
            Some(ActiveTarget::Model(config)) => {
                let history = build_history(prior, content, &config);
                Ok(self.adapter.invoke(&history, &config).await)
            }
            Some(ActiveTarget::Workflow(config)) => {
                let prior_state = ContinuationState {
                    session_id: conversation.continuation_session_id.clone(),
                    node_id: conversation.continuation_node_id.clone(),
                    message_id: conversation.continuation_message_id.clone(),
                };
                let output = self
                    .engine
                    .run_turn(&config, &prior_state, content, &mut on_delta)
                    .await;

                if !output.continuation.is_empty() {
                    self.store
                        .set_continuation(&conversation.id, &output.continuation)
                        .await?;
                }

                Ok(ModelReply {
                    content: output.content,
                    prompt_tokens: 0,
                    completion_tokens: 0,
                    total_tokens: 0,
                })
            }
            None => {
                warn!("No upstream target enabled, echoing");
                Ok(ModelReply::fallback(content))
            }
        }
    }

    /// Mark assistant messages read and notify the owner's connections.
    pub async fn mark_read(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_ids: &[String],
    ) -> Result<Vec<String>, RelayError> {
        self.owned_conversation(user_id, conversation_id).await?;

        let updated = self
            .store
            .mark_messages_read(conversation_id, message_ids)
            .await?;

        if !updated.is_empty() {
            self.hub
                .send_to_user(
                    user_id,
                    WsEvent::MessagesRead {
                        conversation_id: conversation_id.to_string(),
                        message_ids: updated.clone(),
                    },
                )
                .await;
        }

        Ok(updated)
    }

    /// Rebroadcast a typing indicator to the conversation room.
    pub async fn typing(
        &self,
        user_id: &str,
        conversation_id: &str,
        typing: bool,
    ) -> Result<(), RelayError> {
        self.owned_conversation(user_id, conversation_id).await?;

        self.hub
            .broadcast_to_room(
                conversation_id,
                WsEvent::UserTyping {
                    conversation_id: conversation_id.to_string(),
                    user_id: user_id.to_string(),
                    typing,
                },
            )
            .await;
        Ok(())
    }

    /// Ask the workflow engine to halt the conversation's running session.
    /// A no-op unless a workflow target is enabled and the conversation has
    /// a session.
    pub async fn stop_turn(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<bool, RelayError> {
        let conversation = self.owned_conversation(user_id, conversation_id).await?;

        let Some(ActiveTarget::Workflow(config)) = self.store.get_active_target().await? else {
            return Ok(false);
        };
        let Some(session_id) = conversation.continuation_session_id else {
            return Ok(false);
        };

        self.engine.client().stop(&config, &session_id).await?;
        Ok(true)
    }

    pub async fn owned_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation, RelayError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or(RelayError::ConversationNotFound)?;
        if conversation.user_id != user_id {
            return Err(RelayError::NotOwner);
        }
        Ok(conversation)
    }
}

/// First words of the opening message, bounded.
fn title_from(content: &str) -> String {
    let trimmed = content.trim();
    let mut title: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    if trimmed.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    if title.is_empty() {
        title.push_str("New conversation");
    }
    title
}

/// Assemble the model context window, newest messages first against the
/// character budget. The current user message is always included even when
/// it alone exceeds the budget.
fn build_history(prior: &[Message], current: &str, config: &ModelConfig) -> Vec<HistoryMessage> {
    let mut window = vec![HistoryMessage::new("user", current)];

    if config.memory_enabled {
        let mut budget =
            (config.context_length.max(0) as usize).saturating_sub(current.chars().count());
        for message in prior.iter().rev() {
            let cost = message.content.chars().count();
            if cost > budget {
                break;
            }
            budget -= cost;
            window.push(HistoryMessage::new(&message.role, &message.content));
        }
    }

    window.reverse();
    window
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelAdapter;
    use crate::store::{ModelProtocol, SqliteStore};
    use crate::workflow::WorkflowEngine;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, ConversationRelay, Arc<WsHub>) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(&dir.path().join("relay.db"))
            .await
            .unwrap();
        let hub = Arc::new(WsHub::new());
        let relay = ConversationRelay::new(
            Arc::new(store),
            Arc::clone(&hub),
            ModelAdapter::new(),
            WorkflowEngine::new().unwrap(),
        );
        (dir, relay, hub)
    }

    async fn seed_user(relay: &ConversationRelay) -> String {
        relay
            .store()
            .create_user("alice", "hash")
            .await
            .unwrap()
            .id
    }

    #[test]
    fn test_title_truncation() {
        assert_eq!(title_from("short"), "short");
        assert_eq!(
            title_from("a message that is definitely too long for a title"),
            "a message that is de..."
        );
        assert_eq!(title_from("   "), "New conversation");
    }

    #[test]
    fn test_history_budget_newest_first() {
        let config = ModelConfig {
            provider: "test".to_string(),
            model_name: "m".to_string(),
            endpoint: "http://127.0.0.1:1".to_string(),
            api_key: None,
            protocol: ModelProtocol::ChatCompletion,
            temperature: 0.5,
            top_p: 1.0,
            max_tokens: 64,
            memory_enabled: true,
            context_length: 12,
        };
        let prior = vec![
            Message {
                id: "1".to_string(),
                conversation_id: "c1".to_string(),
                role: "user".to_string(),
                content: "aaaaaaaa".to_string(),
                status: "sent".to_string(),
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
                created_at: String::new(),
            },
            Message {
                id: "2".to_string(),
                conversation_id: "c1".to_string(),
                role: "assistant".to_string(),
                content: "bbbb".to_string(),
                status: "sent".to_string(),
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
                created_at: String::new(),
            },
        ];

        // Budget 12, current "cccc" costs 4, "bbbb" costs 4, "aaaaaaaa" does
        // not fit the remaining 4.
        let window = build_history(&prior, "cccc", &config);
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].content, "bbbb");
        assert_eq!(window[1].content, "cccc");
    }

    #[test]
    fn test_history_always_includes_current() {
        let config = ModelConfig {
            provider: "test".to_string(),
            model_name: "m".to_string(),
            endpoint: "http://127.0.0.1:1".to_string(),
            api_key: None,
            protocol: ModelProtocol::ChatCompletion,
            temperature: 0.5,
            top_p: 1.0,
            max_tokens: 64,
            memory_enabled: true,
            context_length: 2,
        };
        let window = build_history(&[], "longer than budget", &config);
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].content, "longer than budget");
    }

    #[test]
    fn test_history_disabled_memory_is_current_only() {
        let config = ModelConfig {
            provider: "test".to_string(),
            model_name: "m".to_string(),
            endpoint: "http://127.0.0.1:1".to_string(),
            api_key: None,
            protocol: ModelProtocol::ChatCompletion,
            temperature: 0.5,
            top_p: 1.0,
            max_tokens: 64,
            memory_enabled: false,
            context_length: 10_000,
        };
        let prior = vec![Message {
            id: "1".to_string(),
            conversation_id: "c1".to_string(),
            role: "user".to_string(),
            content: "earlier".to_string(),
            status: "sent".to_string(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            created_at: String::new(),
        }];
        let window = build_history(&prior, "now", &config);
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].content, "now");
    }

    #[tokio::test]
    async fn test_turn_without_target_echoes() {
        let (_dir, relay, _hub) = setup().await;
        let user_id = seed_user(&relay).await;

        let record = relay
            .handle_incoming(&user_id, None, "hello")
            .await
            .unwrap();

        assert_eq!(record.user_message.content, "hello");
        assert_eq!(record.assistant_message.content, "reply to \"hello\"");
        assert_eq!(record.assistant_message.role, "assistant");
    }

    #[tokio::test]
    async fn test_turn_broadcasts_user_then_assistant() {
        let (_dir, relay, hub) = setup().await;
        let user_id = seed_user(&relay).await;
        let (mut rx, _conn) = hub.register_connection(&user_id);

        let record = relay
            .handle_incoming(&user_id, None, "hello")
            .await
            .unwrap();

        match rx.recv().await {
            Some(WsEvent::NewMessage { message, .. }) => {
                assert_eq!(message.id, record.user_message.id);
                assert_eq!(message.role, "user");
                assert_eq!(message.status, "sending");
            }
            other => panic!("Expected user NewMessage, got {:?}", other),
        }
        match rx.recv().await {
            Some(WsEvent::MessageStatus {
                message_id, status, ..
            }) => {
                assert_eq!(message_id, record.user_message.id);
                assert_eq!(status, "sent");
            }
            other => panic!("Expected MessageStatus, got {:?}", other),
        }
        match rx.recv().await {
            Some(WsEvent::NewMessage { message, .. }) => {
                assert_eq!(message.id, record.assistant_message.id);
                assert_eq!(message.role, "assistant");
            }
            other => panic!("Expected assistant NewMessage, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_user_message_status_finalized() {
        let (_dir, relay, _hub) = setup().await;
        let user_id = seed_user(&relay).await;

        let record = relay
            .handle_incoming(&user_id, None, "hello")
            .await
            .unwrap();
        assert_eq!(record.user_message.status, "sent");

        // The stored row is finalized too, not just the returned copy.
        let messages = relay
            .store()
            .list_messages(&record.conversation.id)
            .await
            .unwrap();
        assert_eq!(messages[0].status, "sent");
    }

    #[tokio::test]
    async fn test_turn_rejects_foreign_conversation() {
        let (_dir, relay, _hub) = setup().await;
        let alice = seed_user(&relay).await;
        let bob = relay.store().create_user("bob", "hash").await.unwrap().id;

        let record = relay.handle_incoming(&alice, None, "mine").await.unwrap();

        let err = relay
            .handle_incoming(&bob, Some(&record.conversation.id), "intrusion")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotOwner));
    }

    #[tokio::test]
    async fn test_mark_read_notifies_owner() {
        let (_dir, relay, hub) = setup().await;
        let user_id = seed_user(&relay).await;

        let record = relay
            .handle_incoming(&user_id, None, "hello")
            .await
            .unwrap();

        let (mut rx, _conn) = hub.register_connection(&user_id);

        let updated = relay
            .mark_read(
                &user_id,
                &record.conversation.id,
                &[
                    record.user_message.id.clone(),
                    record.assistant_message.id.clone(),
                ],
            )
            .await
            .unwrap();

        // Only the assistant message flips; the user's own message is
        // skipped.
        assert_eq!(updated, vec![record.assistant_message.id.clone()]);

        match rx.recv().await {
            Some(WsEvent::MessagesRead { message_ids, .. }) => {
                assert_eq!(message_ids, updated);
            }
            other => panic!("Expected MessagesRead, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_turn_sees_first_in_history() {
        let (_dir, relay, _hub) = setup().await;
        let user_id = seed_user(&relay).await;

        let first = relay.handle_incoming(&user_id, None, "one").await.unwrap();
        let second = relay
            .handle_incoming(&user_id, Some(&first.conversation.id), "two")
            .await
            .unwrap();

        let messages = relay
            .store()
            .list_messages(&first.conversation.id)
            .await
            .unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].content, "one");
        assert_eq!(messages[2].content, "two");
        assert_eq!(second.conversation.id, first.conversation.id);
    }

    #[tokio::test]
    async fn test_stop_without_workflow_target_is_noop() {
        let (_dir, relay, _hub) = setup().await;
        let user_id = seed_user(&relay).await;
        let record = relay.handle_incoming(&user_id, None, "hi").await.unwrap();

        let stopped = relay
            .stop_turn(&user_id, &record.conversation.id)
            .await
            .unwrap();
        assert!(!stopped);
    }

    #[tokio::test]
    async fn test_typing_rebroadcast() {
        let (_dir, relay, hub) = setup().await;
        let user_id = seed_user(&relay).await;
        let record = relay.handle_incoming(&user_id, None, "hi").await.unwrap();

        let (mut rx, _conn) = hub.register_connection(&user_id);
        relay
            .typing(&user_id, &record.conversation.id, true)
            .await
            .unwrap();

        match rx.recv().await {
            Some(WsEvent::UserTyping { typing, .. }) => assert!(typing),
            other => panic!("Expected UserTyping, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_model_target_fails_open() {
        let (_dir, relay, _hub) = setup().await;
        let user_id = seed_user(&relay).await;

        relay
            .store()
            .set_active_target(ActiveTarget::Model(ModelConfig {
                provider: "test".to_string(),
                model_name: "m".to_string(),
                endpoint: "http://127.0.0.1:1/v1/chat/completions".to_string(),
                api_key: None,
                protocol: ModelProtocol::ChatCompletion,
                temperature: 0.5,
                top_p: 1.0,
                max_tokens: 64,
                memory_enabled: true,
                context_length: 4_000,
            }))
            .await
            .unwrap();

        let record = relay
            .handle_incoming(&user_id, None, "hello")
            .await
            .unwrap();
        assert_eq!(record.assistant_message.content, "reply to \"hello\"");

        // The degraded turn is still persisted in order.
        let messages = relay
            .store()
            .list_messages(&record.conversation.id)
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
    }
}
