//! Parley: a real-time chat relay.
//!
//! Clients talk to the server over WebSocket and REST; replies come from a
//! single enabled upstream, either a direct model endpoint or a streaming
//! workflow engine spoken to over SSE.

pub mod api;
pub mod auth;
pub mod model;
pub mod relay;
pub mod settings;
pub mod store;
pub mod workflow;
pub mod ws;
