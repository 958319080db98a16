//! WebSocket layer: connection registry, room fan-out and the upgrade
//! handler.

mod handler;
mod hub;

pub use handler::ws_handler;
pub use hub::{WsHub, WsSender};
