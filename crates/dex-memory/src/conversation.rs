//! Bounded per-user conversation history with a rolling summary.
//!
//! History grows by one exchange per turn. Once it reaches the summarize
//! threshold, the oldest slice is condensed into the summary and history is
//! pruned to its most recent entries. The summary is a sliding window:
//! when it exceeds its cap, text is dropped from the front.

use anyhow::{Context, Result};
use chrono::Utc;
use dex_agent::LanguageModelClient;
use dex_core::stores::{load_doc, save_doc};
use dex_core::{CallKind, ChatMessage, ConversationState, DocumentStore, Exchange, ScopeKey};
use std::sync::Arc;
use tracing::{Instrument, debug, info, info_span, warn};

const SUMMARY_PROMPT: &str = "You maintain long-term memory for a chat assistant. \
Condense the conversation excerpt below into a short third-person summary. \
Keep names, facts the user shared, decisions, preferences and open questions. \
Drop greetings and filler. Reply with the summary text only.";

/// Size limits for history and summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
    pub summarize_threshold: usize,
    pub messages_to_summarize: usize,
    pub history_prune_length: usize,
    /// Characters, not bytes.
    pub max_summary_length: usize,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            summarize_threshold: 16,
            messages_to_summarize: 10,
            history_prune_length: 6,
            max_summary_length: 1000,
        }
    }
}

pub struct ConversationStore {
    docs: Arc<dyn DocumentStore>,
    client: Arc<LanguageModelClient>,
    limits: MemoryLimits,
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStore")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

fn conversation_key(user_id: &str, scope: &ScopeKey) -> String {
    format!("dex:conversation:{user_id}:{scope}")
}

impl ConversationStore {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        client: Arc<LanguageModelClient>,
        limits: MemoryLimits,
    ) -> Self {
        Self { docs, client, limits }
    }

    pub fn limits(&self) -> &MemoryLimits {
        &self.limits
    }

    /// Stored state for `(user, scope)`, or a fresh empty one.
    pub async fn load(&self, user_id: &str, scope: &ScopeKey) -> Result<ConversationState> {
        let key = conversation_key(user_id, scope);
        let state = load_doc::<ConversationState>(self.docs.as_ref(), &key)
            .await
            .with_context(|| format!("failed to load conversation for {user_id} in {scope}"))?;
        Ok(state.unwrap_or_else(|| ConversationState::empty(user_id, scope.clone())))
    }

    pub async fn save(&self, state: &ConversationState) -> Result<()> {
        let key = conversation_key(&state.user_id, &state.scope);
        save_doc(self.docs.as_ref(), &key, state)
            .await
            .with_context(|| {
                format!(
                    "failed to save conversation for {} in {}",
                    state.user_id, state.scope
                )
            })
    }

    /// Add one completed exchange. In memory only; call [`Self::save`] to
    /// persist.
    pub fn append(&self, state: &mut ConversationState, exchange: Exchange) {
        state.history.extend(exchange.into_messages());
        state.last_interaction = Some(Utc::now());
    }

    pub fn should_summarize(&self, state: &ConversationState) -> bool {
        state.history.len() >= self.limits.summarize_threshold
    }

    /// Condense the oldest entries into the summary and prune history.
    ///
    /// Never fails. If the model call fails, history is still pruned and
    /// the summary is left as it was.
    pub async fn summarize(&self, state: &mut ConversationState) {
        let span = info_span!(
            "summarize",
            history_len = state.history.len(),
            summary_len = state.summary.chars().count(),
        );

        async {
            let take = self.limits.messages_to_summarize.min(state.history.len());
            let messages = [
                ChatMessage::system(SUMMARY_PROMPT),
                ChatMessage::user(transcript(&state.history[..take])),
            ];

            match self.client.invoke(CallKind::Summary, &messages, &[]).await {
                Ok(reply) if !reply.text.trim().is_empty() => {
                    state.summary = merge_summary(
                        &state.summary,
                        reply.text.trim(),
                        self.limits.max_summary_length,
                    );
                    info!(
                        summarized = take,
                        summary_len = state.summary.chars().count(),
                        "history summarized"
                    );
                }
                Ok(_) => warn!("summary model returned empty text, pruning without summary"),
                Err(e) => warn!(error = %e, "summarization failed, pruning without summary"),
            }

            prune(&mut state.history, self.limits.history_prune_length);
            debug!(history_len = state.history.len(), "history pruned");
        }
        .instrument(span)
        .await;
    }
}

/// Keep only the most recent `keep` entries.
fn prune(history: &mut Vec<ChatMessage>, keep: usize) {
    if history.len() > keep {
        history.drain(..history.len() - keep);
    }
}

fn transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Append `addition` to `existing`, then drop characters from the front
/// until the result fits in `max_chars`.
pub fn merge_summary(existing: &str, addition: &str, max_chars: usize) -> String {
    let merged = if existing.is_empty() {
        addition.to_owned()
    } else {
        format!("{existing}\n\n{addition}")
    };
    let len = merged.chars().count();
    if len <= max_chars {
        return merged;
    }
    merged.chars().skip(len - max_chars).collect::<String>().trim_start().to_owned()
}
