//! Workflow engine integration: SSE frame parsing, invoke/stop HTTP
//! client, and the streaming turn driver.

pub mod client;
pub mod engine;
pub mod frame;

pub use client::WorkflowClient;
pub use engine::{NO_REPLY_SENTINEL, TIMEOUT_SENTINEL, TurnOutput, WorkflowEngine};
pub use frame::{FrameOutcome, TurnAccumulator};
