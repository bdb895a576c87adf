//! Contracts between the gateway and its collaborators.
//!
//! Implementations live elsewhere: backends in dex-agent, stores in
//! [`crate::stores`], tier policies in dex-gateway, tools in the host
//! application.

use crate::error::UpstreamError;
use crate::types::{ChatMessage, ModelReply, PlanTier, ScopeKey, ToolDef, ToolOutput};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Model backend
// ---------------------------------------------------------------------------

/// A language-model backend. One call is one attempt with one credential;
/// retry and rotation belong to the caller.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Backend name used in logs (e.g. "openai-compat").
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        secret: &str,
        messages: &[ChatMessage],
        tools: &[ToolDef],
    ) -> std::result::Result<ModelReply, UpstreamError>;
}

// ---------------------------------------------------------------------------
// Tool execution
// ---------------------------------------------------------------------------

/// Context available to a tool during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub user_id: String,
    pub scope: ScopeKey,
    pub plan: PlanTier,
}

/// A typed tool handler.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The tool definition (name, description, parameter schema).
    fn definition(&self) -> ToolDef;

    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolContext)
    -> Result<ToolOutput>;
}

/// Name-indexed table of tools the model may call.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    fn list(&self) -> Vec<ToolDef>;

    async fn execute(
        &self,
        name: &str,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput>;
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Key/value cache with per-entry expiry. Capacity is the store's concern.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;
}

/// Document store for conversation state and per-user memory.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    async fn set(&self, key: &str, doc: serde_json::Value) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Tier gating
// ---------------------------------------------------------------------------

/// Decides which tools a plan tier may use.
pub trait TierPolicy: Send + Sync {
    fn is_allowed(&self, plan: &PlanTier, tool: &str) -> bool;

    /// Text handed back to the model in place of a denied tool's output.
    fn denial_message(&self, plan: &PlanTier, tool: &str) -> String {
        format!(
            "The tool '{tool}' is not available on the '{plan}' plan. \
             Tell the user an upgrade is required to use it."
        )
    }
}
