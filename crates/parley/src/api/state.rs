//! Shared application state.

use std::sync::Arc;

use crate::auth::AuthState;
use crate::relay::ConversationRelay;
use crate::store::ChatStore;
use crate::ws::WsHub;

/// State handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    pub hub: Arc<WsHub>,
    pub auth: AuthState,
    pub relay: Arc<ConversationRelay>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ChatStore>,
        hub: Arc<WsHub>,
        auth: AuthState,
        relay: Arc<ConversationRelay>,
    ) -> Self {
        Self {
            store,
            hub,
            auth,
            relay,
        }
    }
}
