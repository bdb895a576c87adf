//! Slow-changing per-user memory: learned facts and preferences.
//!
//! Facts are extracted from completed exchanges by a separate model call
//! and capped per user, oldest first out.

use anyhow::{Context, Result};
use dex_agent::LanguageModelClient;
use dex_core::stores::{load_doc, save_doc};
use dex_core::{CallKind, ChatMessage, DocumentStore, Exchange, LearnedFact};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{Instrument, debug, info, info_span};

const EXTRACTION_PROMPT: &str = "Extract durable facts about the user from the exchange below. \
Only include things worth remembering across conversations (name, location, job, \
ongoing projects, stated preferences). Ignore small talk. Respond with JSON only, \
in the form {\"facts\": [{\"content\": \"...\", \"confidence\": 0.0-1.0}], \
\"preferences\": {\"key\": \"value\"}}. Use empty collections when there is nothing to learn.";

const DEFAULT_CONFIDENCE: f32 = 0.7;

/// Everything remembered about one user across scopes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMemory {
    #[serde(default)]
    pub facts: Vec<LearnedFact>,
    #[serde(default)]
    pub preferences: BTreeMap<String, String>,
}

impl UserMemory {
    /// Add facts, skipping case-insensitive duplicates, then evict the
    /// oldest entries beyond `max_facts`. Returns how many were added.
    pub fn remember(&mut self, facts: Vec<LearnedFact>, max_facts: usize) -> usize {
        let mut added = 0;
        for fact in facts {
            let content = fact.content.trim();
            if content.is_empty() {
                continue;
            }
            let duplicate = self
                .facts
                .iter()
                .any(|known| known.content.trim().eq_ignore_ascii_case(content));
            if !duplicate {
                self.facts.push(fact);
                added += 1;
            }
        }
        if self.facts.len() > max_facts {
            let excess = self.facts.len() - max_facts;
            self.facts.drain(..excess);
        }
        added
    }

    /// System-prompt section, or `None` when nothing is known.
    pub fn prompt_section(&self) -> Option<String> {
        if self.facts.is_empty() && self.preferences.is_empty() {
            return None;
        }
        let mut out = String::new();
        if !self.facts.is_empty() {
            out.push_str("Known facts about the user:\n");
            for fact in &self.facts {
                let _ = writeln!(out, "- {}", fact.content);
            }
        }
        if !self.preferences.is_empty() {
            out.push_str("User preferences:\n");
            for (key, value) in &self.preferences {
                let _ = writeln!(out, "- {key}: {value}");
            }
        }
        Some(out.trim_end().to_owned())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExtractedFact {
    Plain(String),
    Scored {
        content: String,
        #[serde(default)]
        confidence: Option<f32>,
    },
}

impl ExtractedFact {
    fn into_fact(self) -> LearnedFact {
        match self {
            Self::Plain(content) => LearnedFact::new(content, DEFAULT_CONFIDENCE),
            Self::Scored { content, confidence } => {
                LearnedFact::new(content, confidence.unwrap_or(DEFAULT_CONFIDENCE).clamp(0.0, 1.0))
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Extraction {
    #[serde(default)]
    facts: Vec<ExtractedFact>,
    #[serde(default)]
    preferences: BTreeMap<String, serde_json::Value>,
}

/// Parse a model reply into an extraction. Tolerates code fences and
/// prose around the JSON object.
fn parse_extraction(text: &str) -> Result<Extraction> {
    let start = text.find('{').context("no JSON object in extraction reply")?;
    let end = text.rfind('}').context("no JSON object in extraction reply")?;
    if end < start {
        anyhow::bail!("malformed JSON object in extraction reply");
    }
    serde_json::from_str(&text[start..=end]).context("extraction reply is not valid JSON")
}

pub struct FactStore {
    docs: Arc<dyn DocumentStore>,
    client: Arc<LanguageModelClient>,
    max_facts: usize,
}

impl std::fmt::Debug for FactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactStore")
            .field("max_facts", &self.max_facts)
            .finish_non_exhaustive()
    }
}

fn memory_key(user_id: &str) -> String {
    format!("dex:memory:{user_id}")
}

impl FactStore {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        client: Arc<LanguageModelClient>,
        max_facts: usize,
    ) -> Self {
        Self {
            docs,
            client,
            max_facts,
        }
    }

    pub async fn load(&self, user_id: &str) -> Result<UserMemory> {
        let memory = load_doc::<UserMemory>(self.docs.as_ref(), &memory_key(user_id))
            .await
            .with_context(|| format!("failed to load memory for {user_id}"))?;
        Ok(memory.unwrap_or_default())
    }

    pub async fn save(&self, user_id: &str, memory: &UserMemory) -> Result<()> {
        save_doc(self.docs.as_ref(), &memory_key(user_id), memory)
            .await
            .with_context(|| format!("failed to save memory for {user_id}"))
    }

    /// Ask the model what is worth remembering from `exchange` and merge it
    /// into the user's memory. Returns the number of new facts.
    pub async fn learn(&self, user_id: &str, exchange: &Exchange) -> Result<usize> {
        let span = info_span!("learn_facts", user = user_id);

        async {
            let messages = [
                ChatMessage::system(EXTRACTION_PROMPT),
                ChatMessage::user(format!(
                    "User: {}\nAssistant: {}",
                    exchange.user, exchange.assistant
                )),
            ];
            let reply = self
                .client
                .invoke(CallKind::Facts, &messages, &[])
                .await
                .context("fact extraction call failed")?;
            let extraction = parse_extraction(&reply.text)?;

            let mut memory = self.load(user_id).await?;
            let facts = extraction.facts.into_iter().map(ExtractedFact::into_fact).collect();
            let added = memory.remember(facts, self.max_facts);

            let mut preferences_changed = 0;
            for (key, value) in extraction.preferences {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => continue,
                    other => other.to_string(),
                };
                if memory.preferences.get(&key) != Some(&value) {
                    memory.preferences.insert(key, value);
                    preferences_changed += 1;
                }
            }

            if added == 0 && preferences_changed == 0 {
                debug!("nothing new learned");
                return Ok(0);
            }
            self.save(user_id, &memory).await?;
            info!(added, preferences_changed, total = memory.facts.len(), "user memory updated");
            Ok(added)
        }
        .instrument(span)
        .await
    }
}
