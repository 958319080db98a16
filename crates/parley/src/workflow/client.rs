//! HTTP client for the workflow engine.

use anyhow::{Context, Result};
use log::info;
use rand::Rng;
use serde_json::{Map, Value, json};
use std::time::Duration;

use crate::store::{ContinuationState, WorkflowConfig};

/// Connection attempts per invocation before giving up.
pub const MAX_INVOKE_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const BASE_BACKOFF_MS: u64 = 1_000;

/// Maximum backoff delay (milliseconds).
const MAX_BACKOFF_MS: u64 = 5_000;

/// Request timeout for the streaming invoke. Generous because the body is
/// an event stream, not a single response.
const STREAM_TIMEOUT_SECS: u64 = 120;

/// Client for workflow invocations.
pub struct WorkflowClient {
    client: reqwest::Client,
}

impl WorkflowClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(STREAM_TIMEOUT_SECS))
            .build()
            .context("building workflow HTTP client")?;
        Ok(Self { client })
    }

    /// Request builder for a streaming invocation with the given payload.
    pub fn invoke_request(
        &self,
        config: &WorkflowConfig,
        payload: &Value,
    ) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(&config.endpoint)
            .header("Accept", "text/event-stream")
            .json(payload);
        if let Some(ref key) = config.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }
        request
    }

    /// Ask the engine to halt a running workflow session.
    pub async fn stop(&self, config: &WorkflowConfig, session_id: &str) -> Result<()> {
        let url = stop_url(&config.endpoint);
        info!("Stopping workflow session {} via {}", session_id, url);

        let mut request = self.client.post(&url).json(&json!({
            "session_id": session_id,
        }));
        if let Some(ref key) = config.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.context("sending workflow stop")?;
        if !response.status().is_success() {
            anyhow::bail!("workflow stop returned {}", response.status());
        }
        Ok(())
    }
}

/// Payload for the first call of a turn. The config's parameter template is
/// merged into `input` first so explicit user-text keys win on collision.
pub fn fresh_payload(config: &WorkflowConfig, user_text: &str) -> Value {
    let mut input = Map::new();
    if let Some(Value::Object(template)) = &config.param_map {
        for (k, v) in template {
            input.insert(k.clone(), v.clone());
        }
    }
    input.insert("text".to_string(), Value::String(user_text.to_string()));
    input.insert("user_input".to_string(), Value::String(user_text.to_string()));

    json!({
        "workflow_id": config.workflow_id,
        "input": Value::Object(input),
        "stream": true,
    })
}

/// Payload for resuming a paused workflow. The structured `{node_id:
/// {user_input}}` input shape is load-bearing: the flat fresh-turn shape
/// makes the engine restart the workflow instead of resuming it.
pub fn continuation_payload(
    config: &WorkflowConfig,
    continuation: &ContinuationState,
    user_text: &str,
) -> Value {
    let node_id = continuation.node_id.as_deref().unwrap_or_default();
    let mut input = Map::new();
    input.insert(
        node_id.to_string(),
        json!({"user_input": user_text}),
    );

    let mut payload = Map::new();
    payload.insert(
        "workflow_id".to_string(),
        Value::String(config.workflow_id.clone()),
    );
    payload.insert("input".to_string(), Value::Object(input));
    if let Some(ref sid) = continuation.session_id {
        payload.insert("session_id".to_string(), Value::String(sid.clone()));
    }
    if let Some(ref mid) = continuation.message_id {
        payload.insert("message_id".to_string(), Value::String(mid.clone()));
    }
    if let Some(ref nid) = continuation.node_id {
        payload.insert("node_id".to_string(), Value::String(nid.clone()));
    }
    payload.insert("stream".to_string(), Value::Bool(true));
    Value::Object(payload)
}

/// Exponential backoff with jitter, capped.
pub fn calculate_backoff(attempt: u32) -> u64 {
    let exp = BASE_BACKOFF_MS.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let capped = exp.min(MAX_BACKOFF_MS);
    let jitter = rand::rng().random_range(0..=capped / 4);
    capped + jitter
}

fn stop_url(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if let Some(base) = trimmed.strip_suffix("/invoke") {
        format!("{}/stop", base)
    } else {
        format!("{}/stop", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WorkflowConfig {
        WorkflowConfig {
            workflow_id: "wf-1".to_string(),
            endpoint: "http://localhost:9000/v2/workflow/invoke".to_string(),
            api_key: None,
            param_map: Some(json!({"mode": "qa", "text": "template-overridden"})),
            turn_timeout_secs: 60,
        }
    }

    #[test]
    fn test_fresh_payload_shape() {
        let payload = fresh_payload(&config(), "hello");
        assert_eq!(payload["workflow_id"], "wf-1");
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["input"]["user_input"], "hello");
        // User text wins over the template on collision.
        assert_eq!(payload["input"]["text"], "hello");
        assert_eq!(payload["input"]["mode"], "qa");
        assert!(payload.get("session_id").is_none());
    }

    #[test]
    fn test_continuation_payload_shape() {
        let continuation = ContinuationState {
            session_id: Some("s1".to_string()),
            node_id: Some("input_abc".to_string()),
            message_id: Some("m1".to_string()),
        };
        let payload = continuation_payload(&config(), &continuation, "my answer");
        assert_eq!(payload["session_id"], "s1");
        assert_eq!(payload["message_id"], "m1");
        assert_eq!(payload["node_id"], "input_abc");
        assert_eq!(payload["input"]["input_abc"]["user_input"], "my answer");
        // The fresh-turn keys must not leak into a continuation.
        assert!(payload["input"].get("text").is_none());
        assert!(payload["input"].get("user_input").is_none());
    }

    #[test]
    fn test_backoff_is_capped() {
        for attempt in 1..10 {
            let delay = calculate_backoff(attempt);
            assert!(delay >= 1_000, "attempt {} delay {}", attempt, delay);
            assert!(delay <= MAX_BACKOFF_MS + MAX_BACKOFF_MS / 4);
        }
    }

    #[test]
    fn test_stop_url_derivation() {
        assert_eq!(
            stop_url("http://h/v2/workflow/invoke"),
            "http://h/v2/workflow/stop"
        );
        assert_eq!(stop_url("http://h/v2/workflow/"), "http://h/v2/workflow/stop");
    }
}
