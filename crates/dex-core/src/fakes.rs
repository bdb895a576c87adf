//! Fake implementations for testing.
#![allow(clippy::unwrap_used)]

use crate::error::UpstreamError;
use crate::traits::{ModelBackend, TierPolicy, Tool, ToolContext};
use crate::types::{ChatMessage, ModelReply, PlanTier, ScopeKey, ToolDef, ToolOutput};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

pub fn tool_context(plan: &str) -> ToolContext {
    ToolContext {
        user_id: "user-1".to_owned(),
        scope: ScopeKey::new("tenant-1", "whatsapp", "chat-1"),
        plan: PlanTier::new(plan),
    }
}

// ---------------------------------------------------------------------------
// ScriptedBackend
// ---------------------------------------------------------------------------

/// One recorded backend invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub secret: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<String>,
}

/// Backend that replays a script of replies and records every call.
///
/// Once the script runs out, every call returns the fallback reply.
#[derive(Debug)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<std::result::Result<ModelReply, UpstreamError>>>,
    fallback: Mutex<ModelReply>,
    calls: Mutex<Vec<RecordedCall>>,
    delay: Option<Duration>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(ModelReply::text("ok")),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Backend that always answers with the same text.
    pub fn replying(text: impl Into<String>) -> Self {
        let backend = Self::new();
        backend.set_fallback(ModelReply::text(text));
        backend
    }

    /// Sleep before every reply, simulating a slow upstream.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, reply: ModelReply) {
        self.script.lock().unwrap().push_back(Ok(reply));
    }

    pub fn push_error(&self, error: UpstreamError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    pub fn set_fallback(&self, reply: ModelReply) {
        *self.fallback.lock().unwrap() = reply;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(
        &self,
        secret: &str,
        messages: &[ChatMessage],
        tools: &[ToolDef],
    ) -> std::result::Result<ModelReply, UpstreamError> {
        self.calls.lock().unwrap().push(RecordedCall {
            secret: secret.to_owned(),
            messages: messages.to_vec(),
            tools: tools.iter().map(|t| t.name.clone()).collect(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.lock().unwrap().clone()))
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// Fake tool returning a fixed output and counting executions.
#[derive(Debug)]
pub struct FakeTool {
    pub def: ToolDef,
    pub output: Mutex<ToolOutput>,
    pub executions: Mutex<Vec<serde_json::Value>>,
}

impl FakeTool {
    pub fn new(name: impl Into<String>, output: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            def: ToolDef::new(name, "A fake tool", serde_json::json!({"type": "object"})),
            output: Mutex::new(ToolOutput::success(output)),
            executions: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Tool for FakeTool {
    fn definition(&self) -> ToolDef {
        self.def.clone()
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput> {
        self.executions.lock().unwrap().push(arguments);
        Ok(self.output.lock().unwrap().clone())
    }
}

/// How a [`FaultyTool`] misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Error,
    Panic,
    Hang,
}

/// Tool that errors, panics, or never finishes.
#[derive(Debug)]
pub struct FaultyTool {
    name: String,
    fault: Fault,
}

impl FaultyTool {
    pub fn new(name: impl Into<String>, fault: Fault) -> Self {
        Self {
            name: name.into(),
            fault,
        }
    }
}

#[async_trait]
impl Tool for FaultyTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new(&self.name, "A misbehaving tool", serde_json::json!({"type": "object"}))
    }

    async fn execute(
        &self,
        _arguments: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput> {
        match self.fault {
            Fault::Error => anyhow::bail!("upstream service unreachable"),
            Fault::Panic => panic!("tool blew up"),
            Fault::Hang => futures::future::pending().await,
        }
    }
}

// ---------------------------------------------------------------------------
// DenyListPolicy
// ---------------------------------------------------------------------------

/// Tier policy that allows everything except explicit (plan, tool) pairs.
#[derive(Debug, Default)]
pub struct DenyListPolicy {
    denied: HashSet<(String, String)>,
}

impl DenyListPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn deny(mut self, plan: &str, tool: &str) -> Self {
        self.denied.insert((plan.to_owned(), tool.to_owned()));
        self
    }
}

impl TierPolicy for DenyListPolicy {
    fn is_allowed(&self, plan: &PlanTier, tool: &str) -> bool {
        !self
            .denied
            .contains(&(plan.as_str().to_owned(), tool.to_owned()))
    }
}
