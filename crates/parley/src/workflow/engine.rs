//! Streaming turn execution against the workflow engine.
//!
//! Drives one assistant turn over SSE: opens the invoke stream, feeds
//! frames through the [`TurnAccumulator`], fires at most one automatic
//! continuation when the engine pauses for input, and degrades to sentinel
//! text when the stream times out or ends without content.

use anyhow::{Context, Result};
use futures::StreamExt;
use log::{debug, info, warn};
use reqwest_eventsource::{Event, EventSource};
use serde_json::Value;
use std::time::Duration;

use crate::store::{ContinuationState, WorkflowConfig};

use super::client::{
    MAX_INVOKE_ATTEMPTS, WorkflowClient, calculate_backoff, continuation_payload, fresh_payload,
};
use super::frame::{FrameOutcome, TurnAccumulator};

/// Assistant text when the stream closed without any recognized content.
pub const NO_REPLY_SENTINEL: &str = "No reply received from the workflow engine.";

/// Assistant text when the turn hit the time ceiling before producing
/// content.
pub const TIMEOUT_SENTINEL: &str = "The workflow engine timed out before replying.";

/// Result of a completed (possibly degraded) workflow turn.
#[derive(Debug, Clone)]
pub struct TurnOutput {
    pub content: String,
    pub continuation: ContinuationState,
}

/// Executes streaming turns against the configured workflow engine.
pub struct WorkflowEngine {
    client: WorkflowClient,
}

impl WorkflowEngine {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: WorkflowClient::new()?,
        })
    }

    pub fn client(&self) -> &WorkflowClient {
        &self.client
    }

    /// Run one assistant turn to completion.
    ///
    /// `prior` carries the conversation's persisted continuation ids; when a
    /// session and node id are present the turn resumes the workflow instead
    /// of starting it. `on_delta` is called with the full accumulated text
    /// after every visible change.
    ///
    /// Never fails: upstream trouble degrades to sentinel content. Dropping
    /// the returned future (client abort) half-closes the upstream stream.
    pub async fn run_turn<F>(
        &self,
        config: &WorkflowConfig,
        prior: &ContinuationState,
        user_text: &str,
        mut on_delta: F,
    ) -> TurnOutput
    where
        F: FnMut(&str) + Send,
    {
        let mut acc = TurnAccumulator::new();
        let payload = initial_payload(config, prior, user_text);

        let timed_out = match tokio::time::timeout(
            Duration::from_secs(config.turn_timeout_secs),
            self.stream_turn(config, payload, user_text, &mut acc, &mut on_delta),
        )
        .await
        {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                warn!("Workflow turn failed: {:?}", e);
                false
            }
            Err(_) => {
                warn!(
                    "Workflow turn exceeded {}s ceiling",
                    config.turn_timeout_secs
                );
                true
            }
        };

        let content = if acc.saw_content() {
            acc.content().to_string()
        } else if timed_out {
            TIMEOUT_SENTINEL.to_string()
        } else {
            NO_REPLY_SENTINEL.to_string()
        };

        TurnOutput {
            content,
            continuation: acc.continuation().clone(),
        }
    }

    /// Consume the invoke stream, following at most one continuation.
    async fn stream_turn<F>(
        &self,
        config: &WorkflowConfig,
        mut payload: Value,
        user_text: &str,
        acc: &mut TurnAccumulator,
        on_delta: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&str) + Send,
    {
        loop {
            let mut es = self.connect(config, &payload).await?;
            let mut continue_requested = false;

            while let Some(event_result) = es.next().await {
                match event_result {
                    Ok(Event::Open) => {
                        debug!("Workflow stream reopened");
                    }
                    Ok(Event::Message(msg)) => match acc.apply_raw(&msg.data) {
                        FrameOutcome::Updated => on_delta(acc.content()),
                        FrameOutcome::Ignored => {}
                        FrameOutcome::Continue => {
                            continue_requested = true;
                            break;
                        }
                        FrameOutcome::Done => {
                            es.close();
                            return Ok(());
                        }
                    },
                    Err(reqwest_eventsource::Error::StreamEnded) => {
                        // Server closed the stream; the turn is over.
                        es.close();
                        return Ok(());
                    }
                    Err(e) => {
                        es.close();
                        if acc.saw_content() {
                            // Keep what we already streamed rather than
                            // discarding a mostly-complete reply.
                            warn!("Workflow stream broke mid-turn: {:?}", e);
                            return Ok(());
                        }
                        return Err(anyhow::anyhow!("workflow stream error: {:?}", e));
                    }
                }
            }

            es.close();

            if continue_requested {
                info!(
                    "Workflow paused for input, continuing session {:?}",
                    acc.continuation().session_id
                );
                payload = continuation_payload(config, acc.continuation(), user_text);
                continue;
            }

            return Ok(());
        }
    }

    /// Open the SSE stream, retrying the connection with capped backoff.
    async fn connect(&self, config: &WorkflowConfig, payload: &Value) -> Result<EventSource> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let request = self.client.invoke_request(config, payload);
            let mut es = EventSource::new(request).context("building workflow event source")?;

            match es.next().await {
                Some(Ok(Event::Open)) => return Ok(es),
                Some(Ok(Event::Message(_))) => {
                    // Should not happen before Open, but do not lose the
                    // connection if it does.
                    return Ok(es);
                }
                other => {
                    es.close();
                    warn!(
                        "Workflow connect attempt {} failed: {:?}",
                        attempt, other
                    );
                    if attempt >= MAX_INVOKE_ATTEMPTS {
                        anyhow::bail!(
                            "workflow engine unreachable after {} attempts",
                            MAX_INVOKE_ATTEMPTS
                        );
                    }
                    tokio::time::sleep(Duration::from_millis(calculate_backoff(attempt))).await;
                }
            }
        }
    }
}

/// Choose the opening payload for a turn: resume when the conversation
/// already carries a session and node id, start fresh otherwise.
fn initial_payload(config: &WorkflowConfig, prior: &ContinuationState, user_text: &str) -> Value {
    if prior.session_id.is_some() && prior.node_id.is_some() {
        continuation_payload(config, prior, user_text)
    } else {
        fresh_payload(config, user_text)
    }
}
