//! Bounded ask-model / run-tools loop.
//!
//! Each round asks the model for a reply. A reply without tool calls ends
//! the loop. Otherwise every requested call is gated by plan tier, run in
//! order, and its result appended as a tool message before the next round.
//! After `max_tool_calls` tool rounds the loop stops with a canned answer,
//! so a request makes at most `max_tool_calls + 1` model invocations.

use dex_agent::LanguageModelClient;
use dex_core::{
    CallKind, ChatMessage, GatewayError, TierPolicy, ToolCall, ToolContext, ToolOutput,
    ToolRegistry,
};
use dex_memory::ToolNote;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, info, info_span, warn};

pub const REASONING_LIMIT_MESSAGE: &str = "I've reached my reasoning limit for this request. \
Please try rephrasing it or splitting it into smaller questions.";

const EMPTY_REPLY_MESSAGE: &str = "Sorry, I don't have an answer for that right now.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub max_tool_calls: usize,
    pub tool_timeout: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_tool_calls: 5,
            tool_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub text: String,
    /// Model invocations made, cache hits included.
    pub rounds: usize,
    pub hit_limit: bool,
    /// Successful tool outputs, in execution order.
    pub tool_notes: Vec<ToolNote>,
}

pub struct AgentLoop {
    client: Arc<LanguageModelClient>,
    tools: Arc<dyn ToolRegistry>,
    policy: Arc<dyn TierPolicy>,
    settings: LoopSettings,
}

impl std::fmt::Debug for AgentLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLoop")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl AgentLoop {
    pub fn new(
        client: Arc<LanguageModelClient>,
        tools: Arc<dyn ToolRegistry>,
        policy: Arc<dyn TierPolicy>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            client,
            tools,
            policy,
            settings,
        }
    }

    pub async fn run(
        &self,
        mut messages: Vec<ChatMessage>,
        ctx: &ToolContext,
    ) -> Result<LoopOutcome, GatewayError> {
        let tool_defs = self.tools.list();
        let kind = if tool_defs.is_empty() {
            CallKind::Chat
        } else {
            CallKind::Tools
        };
        let max = self.settings.max_tool_calls;
        let mut notes = Vec::new();
        let mut rounds = 0;

        for round in 0..=max {
            rounds += 1;
            let reply = self.client.invoke(kind, &messages, &tool_defs).await?;

            if !reply.wants_tools() {
                debug!(rounds, "model finished");
                let text = if reply.text.trim().is_empty() {
                    EMPTY_REPLY_MESSAGE.to_owned()
                } else {
                    reply.text
                };
                return Ok(LoopOutcome {
                    text,
                    rounds,
                    hit_limit: false,
                    tool_notes: notes,
                });
            }

            if round == max {
                break;
            }

            debug!(round, calls = reply.tool_calls.len(), "model requested tools");
            messages.push(ChatMessage::assistant_with_calls(reply.text, reply.tool_calls.clone()));
            for call in &reply.tool_calls {
                let output = self.execute_call(call, ctx).await;
                if !output.is_error {
                    notes.push(ToolNote::new(&call.name, &output.content));
                }
                messages.push(ChatMessage::tool_result(&call.id, &call.name, output.content));
            }
        }

        warn!(max_tool_calls = max, "tool round limit reached");
        Ok(LoopOutcome {
            text: REASONING_LIMIT_MESSAGE.to_owned(),
            rounds,
            hit_limit: true,
            tool_notes: notes,
        })
    }

    /// Run one tool call. Never fails: denials, bad arguments, errors,
    /// timeouts and panics all come back as error outputs for the model.
    async fn execute_call(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let span = info_span!("tool_call", tool = %call.name, call_id = %call.id, plan = %ctx.plan);

        async {
            if !self.policy.is_allowed(&ctx.plan, &call.name) {
                info!("tool denied for plan");
                return ToolOutput::error(self.policy.denial_message(&ctx.plan, &call.name));
            }

            let arguments = if call.arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                match serde_json::from_str(&call.arguments) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(error = %e, "tool arguments are not valid JSON");
                        return ToolOutput::error(format!(
                            "invalid arguments for tool '{}': {e}",
                            call.name
                        ));
                    }
                }
            };

            let execution =
                AssertUnwindSafe(self.tools.execute(&call.name, arguments, ctx)).catch_unwind();
            let output = match tokio::time::timeout(self.settings.tool_timeout, execution).await {
                Ok(Ok(Ok(output))) => output,
                Ok(Ok(Err(e))) => ToolOutput::error(format!("tool '{}' failed: {e}", call.name)),
                Ok(Err(panic)) => ToolOutput::error(format!(
                    "tool '{}' crashed: {}",
                    call.name,
                    panic_message(panic.as_ref())
                )),
                Err(_elapsed) => ToolOutput::error(format!(
                    "tool '{}' timed out after {}s",
                    call.name,
                    self.settings.tool_timeout.as_secs()
                )),
            };

            if output.is_error {
                warn!(output = %output.content, "tool execution failed");
            } else {
                info!(output_len = output.content.len(), "tool executed");
            }
            output
        }
        .instrument(span)
        .await
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
