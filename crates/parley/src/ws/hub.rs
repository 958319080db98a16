//! WebSocket hub for managing user connections and room fan-out.

use dashmap::DashMap;
use log::{info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

use parley_protocol::WsEvent;

/// Size of the per-connection send buffer.
const CONNECTION_BUFFER_SIZE: usize = 64;

/// A sender for WebSocket messages to a specific client.
pub type WsSender = mpsc::Sender<WsEvent>;

/// WebSocket hub managing all user connections and room membership.
///
/// The hub is responsible for:
/// - Tracking active WebSocket connections per user
/// - Managing conversation room membership
/// - Broadcasting events to room members
pub struct WsHub {
    /// User ID -> list of their WebSocket senders, keyed by connection id
    connections: DashMap<String, Vec<(usize, WsSender)>>,

    /// Conversation ID -> set of member user IDs
    rooms: DashMap<String, HashSet<String>>,

    /// Source of unique connection ids. Never reused, so a stale id can
    /// only miss, never evict a live connection.
    next_conn_id: AtomicUsize,
}

impl WsHub {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            next_conn_id: AtomicUsize::new(0),
        }
    }

    /// Register a new WebSocket connection for a user.
    ///
    /// Returns a receiver for events targeted at this connection and the
    /// connection ID.
    pub fn register_connection(&self, user_id: &str) -> (mpsc::Receiver<WsEvent>, usize) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .entry(user_id.to_string())
            .or_default()
            .push((conn_id, tx));
        info!(
            "Registered WebSocket connection {} for user {}",
            conn_id, user_id
        );
        (rx, conn_id)
    }

    /// Unregister a WebSocket connection.
    pub fn unregister_connection(&self, user_id: &str, conn_id: usize) {
        if let Some(mut conns) = self.connections.get_mut(user_id) {
            conns.retain(|(id, _)| *id != conn_id);
            info!(
                "Unregistered WebSocket connection {} for user {}",
                conn_id, user_id
            );
        }

        // Clean up empty entries
        self.connections.retain(|_, v| !v.is_empty());
    }

    /// Add a user to a conversation room. Joining twice is a no-op.
    pub fn join_room(&self, user_id: &str, conversation_id: &str) {
        let inserted = self
            .rooms
            .entry(conversation_id.to_string())
            .or_default()
            .insert(user_id.to_string());

        if inserted {
            info!("User {} joined room {}", user_id, conversation_id);
        }
    }

    /// Remove a user from a conversation room.
    pub fn leave_room(&self, user_id: &str, conversation_id: &str) {
        if let Some(mut members) = self.rooms.get_mut(conversation_id) {
            members.remove(user_id);
            info!("User {} left room {}", user_id, conversation_id);
        }

        // Clean up empty entries. `remove_if` takes the shard lock once;
        // holding a `get` guard across a `remove` on the same key deadlocks.
        self.rooms
            .remove_if(conversation_id, |_, members| members.is_empty());
    }

    /// Check if a user is a member of a room.
    pub fn is_member(&self, user_id: &str, conversation_id: &str) -> bool {
        self.rooms
            .get(conversation_id)
            .map(|m| m.contains(user_id))
            .unwrap_or(false)
    }

    /// Get all rooms a user is a member of.
    pub fn user_rooms(&self, user_id: &str) -> Vec<String> {
        self.rooms
            .iter()
            .filter_map(|entry| {
                if entry.value().contains(user_id) {
                    Some(entry.key().clone())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Get all users in a room.
    pub fn room_members(&self, conversation_id: &str) -> Vec<String> {
        self.rooms
            .get(conversation_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Send an event to all connections of a specific user.
    pub async fn send_to_user(&self, user_id: &str, event: WsEvent) {
        if let Some(conns) = self.connections.get(user_id) {
            for (conn_id, tx) in conns.iter() {
                if tx.send(event.clone()).await.is_err() {
                    warn!(
                        "Failed to send event to user {} connection {}",
                        user_id, conn_id
                    );
                }
            }
        }
    }

    /// Send an event to every member of a conversation room.
    ///
    /// Delivery is best effort and awaited per member, so two broadcasts
    /// made back to back by one caller arrive in that order on every
    /// connection.
    pub async fn broadcast_to_room(&self, conversation_id: &str, event: WsEvent) {
        let members = self.room_members(conversation_id);
        for user_id in members {
            self.send_to_user(&user_id, event.clone()).await;
        }
    }

    /// Check whether a user has at least one live connection.
    pub fn is_online(&self, user_id: &str) -> bool {
        self.connections.contains_key(user_id)
    }

    /// Get count of connected users.
    pub fn connected_user_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the ids of all connected users.
    pub fn online_users(&self) -> Vec<String> {
        self.connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl Default for WsHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_room_idempotent() {
        let hub = WsHub::new();
        hub.join_room("u1", "c1");
        hub.join_room("u1", "c1");

        assert!(hub.is_member("u1", "c1"));
        assert_eq!(hub.room_members("c1").len(), 1);
    }

    #[tokio::test]
    async fn test_leave_room_cleans_up() {
        let hub = WsHub::new();
        hub.join_room("u1", "c1");
        hub.leave_room("u1", "c1");

        assert!(!hub.is_member("u1", "c1"));
        assert!(hub.room_members("c1").is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_preserves_order() {
        let hub = WsHub::new();
        let (mut rx, _conn) = hub.register_connection("u1");
        hub.join_room("u1", "c1");

        hub.broadcast_to_room("c1", WsEvent::Connected).await;
        hub.broadcast_to_room("c1", WsEvent::Ping).await;

        assert!(matches!(rx.recv().await, Some(WsEvent::Connected)));
        assert!(matches!(rx.recv().await, Some(WsEvent::Ping)));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_members() {
        let hub = WsHub::new();
        let (mut rx_a, _) = hub.register_connection("a");
        let (mut rx_b, _) = hub.register_connection("b");
        hub.join_room("a", "c1");
        hub.join_room("b", "c1");

        hub.broadcast_to_room("c1", WsEvent::Ping).await;

        assert!(matches!(rx_a.recv().await, Some(WsEvent::Ping)));
        assert!(matches!(rx_b.recv().await, Some(WsEvent::Ping)));
    }

    #[tokio::test]
    async fn test_unregister_ignores_stale_id_after_churn() {
        let hub = WsHub::new();

        // Close sockets out of order and open a new one in between; the
        // surviving connection must keep receiving events.
        let (_rx_a, conn_a) = hub.register_connection("u1");
        let (_rx_b, conn_b) = hub.register_connection("u1");
        hub.unregister_connection("u1", conn_a);

        let (mut rx_c, _conn_c) = hub.register_connection("u1");
        hub.unregister_connection("u1", conn_b);

        hub.join_room("u1", "c1");
        hub.broadcast_to_room("c1", WsEvent::Ping).await;

        assert!(matches!(rx_c.recv().await, Some(WsEvent::Ping)));
    }

    #[tokio::test]
    async fn test_close_in_open_order_clears_user() {
        let hub = WsHub::new();
        let (_rx_a, conn_a) = hub.register_connection("u1");
        let (_rx_b, conn_b) = hub.register_connection("u1");

        hub.unregister_connection("u1", conn_a);
        hub.unregister_connection("u1", conn_b);

        assert!(!hub.is_online("u1"));
        assert_eq!(hub.connected_user_count(), 0);
    }

    #[tokio::test]
    async fn test_unregister_removes_user() {
        let hub = WsHub::new();
        let (_rx, conn_id) = hub.register_connection("u1");
        assert_eq!(hub.connected_user_count(), 1);

        hub.unregister_connection("u1", conn_id);
        assert_eq!(hub.connected_user_count(), 0);
    }
}
