//! Chat-completions HTTP backend.
//!
//! Speaks the JSON shape shared by most hosted model APIs
//! (`POST {base_url}/chat/completions`, bearer auth). One attempt per
//! call: rotation and retry live in [`crate::client`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use dex_core::{
    ChatMessage, FinishReason, ModelBackend, ModelReply, Role, ToolCall, ToolDef, UpstreamError,
};
use reqwest::Client;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

const MAX_TOKENS: u32 = 2048;

pub struct OpenAiCompatBackend {
    client: Client,
    base_url: String,
    model: String,
}

impl OpenAiCompatBackend {
    pub fn new(base_url: &str, model: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("failed to create HTTP client")?;

        debug!(base_url, model, "creating chat-completions backend");

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            model: model.to_owned(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_body(&self, messages: &[ChatMessage], tools: &[ToolDef]) -> Value {
        let mut body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": messages.iter().map(format_message).collect::<Vec<_>>(),
        });
        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
        }
        body
    }
}

impl std::fmt::Debug for OpenAiCompatBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatBackend")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ModelBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        "openai-compat"
    }

    async fn invoke(
        &self,
        secret: &str,
        messages: &[ChatMessage],
        tools: &[ToolDef],
    ) -> std::result::Result<ModelReply, UpstreamError> {
        let body = self.build_body(messages, tools);
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(secret)
            .json(&body)
            .send()
            .await
            .map_err(|e| UpstreamError::new(format!("request failed: {e}")))?;

        let status = response.status();
        debug!(status = %status, "http response");

        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(error_from_body(status.as_u16(), &text, retry_after));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::new(format!("unreadable response body: {e}")))?;
        parse_reply(parsed)
    }
}

fn format_message(message: &ChatMessage) -> Value {
    let mut value = json!({
        "role": message.role.as_str(),
        "content": message.content,
    });
    if !message.tool_calls.is_empty() {
        value["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {"name": call.name, "arguments": call.arguments},
                })
            })
            .collect();
    }
    if message.role == Role::Tool {
        if let Some(id) = &message.tool_call_id {
            value["tool_call_id"] = json!(id);
        }
        if let Some(name) = &message.name {
            value["name"] = json!(name);
        }
    }
    value
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    id: String,
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn parse_reply(response: CompletionResponse) -> std::result::Result<ModelReply, UpstreamError> {
    let Some(choice) = response.choices.into_iter().next() else {
        return Err(UpstreamError::new("response contained no choices"));
    };

    let tool_calls: Vec<ToolCall> = choice
        .message
        .tool_calls
        .into_iter()
        .map(|c| ToolCall::new(c.id, c.function.name, c.function.arguments))
        .collect();

    // Some servers report "stop" alongside tool calls; the calls win.
    let finish_reason = if tool_calls.is_empty() {
        FinishReason::Stop
    } else {
        FinishReason::ToolCalls
    };
    debug!(
        reported = choice.finish_reason.as_deref().unwrap_or("unknown"),
        tool_calls = tool_calls.len(),
        "parsed completion"
    );

    Ok(ModelReply {
        finish_reason,
        text: choice.message.content.unwrap_or_default(),
        tool_calls,
    })
}

/// Build an error from a non-success status and its body. Uses
/// `error.message` when the body is the usual JSON error envelope.
fn error_from_body(status: u16, body: &str, retry_after: Option<Duration>) -> UpstreamError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_owned))
        .unwrap_or_else(|| body.chars().take(500).collect());

    let mut error = UpstreamError::new(message).with_status(status);
    error.quota = status == 429;
    if let Some(delay) = retry_after {
        error = error.with_retry_after(delay);
    }
    error
}

/// Delta-seconds form of `Retry-After` only.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get("retry-after")?.to_str().ok()?;
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}
