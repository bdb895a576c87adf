//! Recent tool results per `(user, scope)`, fed into the next turn's
//! system prompt so follow-up questions can refer to them.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dex_core::stores::{load_doc, save_doc};
use dex_core::{DocumentStore, ScopeKey};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

const MAX_OUTPUT_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolNote {
    pub tool: String,
    pub output: String,
    pub recorded_at: DateTime<Utc>,
}

impl ToolNote {
    /// Output is cut to a bounded number of characters.
    pub fn new(tool: impl Into<String>, output: &str) -> Self {
        let output = if output.chars().count() > MAX_OUTPUT_CHARS {
            let mut cut: String = output.chars().take(MAX_OUTPUT_CHARS).collect();
            cut.push_str("...");
            cut
        } else {
            output.to_owned()
        };
        Self {
            tool: tool.into(),
            output,
            recorded_at: Utc::now(),
        }
    }
}

pub struct ToolContextStore {
    docs: Arc<dyn DocumentStore>,
    max_entries: usize,
}

impl std::fmt::Debug for ToolContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContextStore")
            .field("max_entries", &self.max_entries)
            .finish_non_exhaustive()
    }
}

fn context_key(user_id: &str, scope: &ScopeKey) -> String {
    format!("dex:tool_context:{user_id}:{scope}")
}

impl ToolContextStore {
    pub fn new(docs: Arc<dyn DocumentStore>, max_entries: usize) -> Self {
        Self { docs, max_entries }
    }

    pub async fn load(&self, user_id: &str, scope: &ScopeKey) -> Result<Vec<ToolNote>> {
        let notes = load_doc::<Vec<ToolNote>>(self.docs.as_ref(), &context_key(user_id, scope))
            .await
            .with_context(|| format!("failed to load tool context for {user_id} in {scope}"))?;
        Ok(notes.unwrap_or_default())
    }

    /// Append notes and keep only the newest `max_entries`.
    pub async fn record(
        &self,
        user_id: &str,
        scope: &ScopeKey,
        notes: Vec<ToolNote>,
    ) -> Result<()> {
        if notes.is_empty() {
            return Ok(());
        }
        let mut all = self.load(user_id, scope).await?;
        all.extend(notes);
        if all.len() > self.max_entries {
            all.drain(..all.len() - self.max_entries);
        }
        debug!(entries = all.len(), "tool context updated");
        save_doc(self.docs.as_ref(), &context_key(user_id, scope), &all)
            .await
            .with_context(|| format!("failed to save tool context for {user_id} in {scope}"))
    }
}

/// System-prompt section for recent tool results, or `None` when empty.
pub fn render(notes: &[ToolNote]) -> Option<String> {
    if notes.is_empty() {
        return None;
    }
    let mut out = String::from("Recent tool results in this conversation:\n");
    for note in notes {
        let _ = writeln!(out, "- [{}] {}", note.tool, note.output);
    }
    Some(out.trim_end().to_owned())
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use dex_core::stores::MemoryDocumentStore;

    fn scope() -> ScopeKey {
        ScopeKey::new("acme", "telegram", "42")
    }

    #[test]
    fn long_output_is_truncated() {
        let note = ToolNote::new("web_search", &"x".repeat(2000));
        assert_eq!(note.output.chars().count(), MAX_OUTPUT_CHARS + 3);
        assert!(note.output.ends_with("..."));
    }

    #[tokio::test]
    async fn keeps_newest_entries() {
        let store = ToolContextStore::new(Arc::new(MemoryDocumentStore::new()), 3);
        for i in 0..5 {
            store
                .record("u1", &scope(), vec![ToolNote::new("calc", &i.to_string())])
                .await
                .unwrap();
        }
        let notes = store.load("u1", &scope()).await.unwrap();
        let outputs: Vec<&str> = notes.iter().map(|n| n.output.as_str()).collect();
        assert_eq!(outputs, ["2", "3", "4"]);
    }

    #[tokio::test]
    async fn scoped_per_chat() {
        let store = ToolContextStore::new(Arc::new(MemoryDocumentStore::new()), 5);
        store
            .record("u1", &scope(), vec![ToolNote::new("weather", "sunny")])
            .await
            .unwrap();
        let elsewhere = ScopeKey::new("acme", "telegram", "43");
        assert!(store.load("u1", &elsewhere).await.unwrap().is_empty());
    }

    #[test]
    fn render_lists_notes() {
        assert!(render(&[]).is_none());
        let text = render(&[ToolNote::new("weather", "sunny, 24C")]).unwrap();
        assert!(text.ends_with("- [weather] sunny, 24C"));
    }
}
