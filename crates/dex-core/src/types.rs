use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments exactly as the backend produced them.
    pub arguments: String,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// A single message in a model request or in persisted history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// Assistant turn that requested tools. Must precede the matching
    /// tool-role messages in a request.
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            name: Some(name.into()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

/// Tool definition advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON-schema-like parameter contract.
    pub parameters: serde_json::Value,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Output of one tool execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
}

/// Reply from a language-model backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelReply {
    pub finish_reason: FinishReason,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ModelReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            finish_reason: FinishReason::Stop,
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            finish_reason: FinishReason::ToolCalls,
            text: String::new(),
            tool_calls: calls,
        }
    }

    /// True when the model asked for at least one tool execution.
    pub fn wants_tools(&self) -> bool {
        self.finish_reason == FinishReason::ToolCalls && !self.tool_calls.is_empty()
    }
}

/// Request category. Tags the cache fingerprint and selects the cache TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Chat,
    Tools,
    Summary,
    Moderation,
    Facts,
    Rewrite,
}

impl CallKind {
    pub fn tag(self) -> &'static str {
        match self {
            CallKind::Chat => "chat",
            CallKind::Tools => "tools",
            CallKind::Summary => "summary",
            CallKind::Moderation => "moderation",
            CallKind::Facts => "facts",
            CallKind::Rewrite => "rewrite",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Opaque subscription plan identifier supplied by billing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanTier(String);

impl PlanTier {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PlanTier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tenant, channel and chat a conversation belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub tenant: String,
    pub channel: String,
    pub chat: String,
}

impl ScopeKey {
    pub fn new(
        tenant: impl Into<String>,
        channel: impl Into<String>,
        chat: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            channel: channel.into(),
            chat: chat.into(),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.channel, self.chat)
    }
}

/// Conversation memory for one user inside one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub user_id: String,
    pub scope: ScopeKey,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub last_interaction: Option<DateTime<Utc>>,
}

impl ConversationState {
    pub fn empty(user_id: impl Into<String>, scope: ScopeKey) -> Self {
        Self {
            user_id: user_id.into(),
            scope,
            history: Vec::new(),
            summary: String::new(),
            last_interaction: None,
        }
    }
}

/// One completed user/assistant exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub user: String,
    pub assistant: String,
}

impl Exchange {
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: assistant.into(),
        }
    }

    pub fn into_messages(self) -> [ChatMessage; 2] {
        [
            ChatMessage::user(self.user),
            ChatMessage::assistant(self.assistant),
        ]
    }
}

/// A slow-changing fact learned about a user across conversations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedFact {
    pub id: Uuid,
    pub content: String,
    pub confidence: f32,
    pub extracted_at: DateTime<Utc>,
}

impl LearnedFact {
    pub fn new(content: impl Into<String>, confidence: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            confidence,
            extracted_at: Utc::now(),
        }
    }
}
