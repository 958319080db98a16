//! Direct model invocation.
//!
//! Maps a conversation history onto the wire shape of the configured
//! provider protocol and extracts the reply text plus token usage. The
//! adapter is fail-open: any transport or HTTP failure degrades to a
//! fallback echo instead of aborting the turn, so a returned reply is never
//! proof the upstream worked.

use log::warn;
use serde_json::{Value, json};
use std::time::Duration;

use crate::store::{ModelConfig, ModelProtocol};

/// Request timeout for model endpoints.
const INVOKE_TIMEOUT_SECS: u64 = 15;

/// One turn of conversation history handed to the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

impl HistoryMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

/// Result of a model invocation.
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub content: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl ModelReply {
    pub(crate) fn fallback(prompt: &str) -> Self {
        Self {
            content: format!("reply to \"{}\"", prompt),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        }
    }
}

/// Adapter for direct (non-workflow) model endpoints.
pub struct ModelAdapter {
    client: reqwest::Client,
}

impl ModelAdapter {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(INVOKE_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Invoke the configured model with the given history window.
    ///
    /// The last element of `history` is the current user message; earlier
    /// elements are the bounded context window assembled by the caller.
    /// Never fails: an unusable config or a broken upstream produces the
    /// fallback echo with zeroed token counts.
    pub async fn invoke(&self, history: &[HistoryMessage], config: &ModelConfig) -> ModelReply {
        let prompt = history.last().map(|m| m.content.as_str()).unwrap_or("");
        let fallback = ModelReply::fallback(prompt);

        if !config.is_dispatchable() {
            return fallback;
        }

        let body = build_request_body(history, prompt, config);

        let mut request = self
            .client
            .post(&config.endpoint)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(ref key) = config.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Model endpoint {} unreachable: {}", config.endpoint, e);
                return fallback;
            }
        };

        if !response.status().is_success() {
            warn!(
                "Model endpoint {} returned {}",
                config.endpoint,
                response.status()
            );
            return fallback;
        }

        let data: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!("Model endpoint {} sent unparseable body: {}", config.endpoint, e);
                return fallback;
            }
        };

        extract_reply(&data, config.protocol).unwrap_or(fallback)
    }
}

impl Default for ModelAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the provider-specific request body.
fn build_request_body(history: &[HistoryMessage], prompt: &str, config: &ModelConfig) -> Value {
    match config.protocol {
        ModelProtocol::ChatCompletion => {
            let messages: Vec<Value> = history
                .iter()
                .map(|m| json!({"role": m.role, "content": m.content}))
                .collect();
            json!({
                "model": config.model_name,
                "messages": messages,
                "temperature": config.temperature,
                "max_tokens": config.max_tokens,
                "top_p": config.top_p,
            })
        }
        ModelProtocol::LocalGeneration => json!({
            "model": config.model_name,
            "prompt": prompt,
            "stream": false,
            "options": {"temperature": config.temperature},
        }),
        ModelProtocol::RawCompletion => json!({
            "model": config.model_name,
            "prompt": prompt,
            "temperature": config.temperature,
            "max_tokens": config.max_tokens,
            "top_p": config.top_p,
        }),
    }
}

/// Extract reply text and usage from the provider response, per protocol.
/// Returns None when no text field is present in the expected shape.
fn extract_reply(data: &Value, protocol: ModelProtocol) -> Option<ModelReply> {
    match protocol {
        ModelProtocol::ChatCompletion => {
            let content = data
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)?;
            let (prompt_tokens, completion_tokens, total_tokens) = extract_usage(data);
            Some(ModelReply {
                content: content.to_string(),
                prompt_tokens,
                completion_tokens,
                total_tokens,
            })
        }
        ModelProtocol::LocalGeneration => {
            let content = data
                .get("response")
                .or_else(|| data.get("output"))
                .and_then(Value::as_str)?;
            let total_tokens = data.get("eval_count").and_then(Value::as_i64).unwrap_or(0);
            Some(ModelReply {
                content: content.to_string(),
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens,
            })
        }
        ModelProtocol::RawCompletion => {
            let content = data
                .pointer("/choices/0/text")
                .or_else(|| data.get("output"))
                .or_else(|| data.get("text"))
                .and_then(Value::as_str)?;
            let (prompt_tokens, completion_tokens, total_tokens) = extract_usage(data);
            Some(ModelReply {
                content: content.to_string(),
                prompt_tokens,
                completion_tokens,
                total_tokens,
            })
        }
    }
}

fn extract_usage(data: &Value) -> (i64, i64, i64) {
    let prompt = data
        .pointer("/usage/prompt_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let completion = data
        .pointer("/usage/completion_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let total = data
        .pointer("/usage/total_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(prompt + completion);
    (prompt, completion, total)
}
