use crate::agent_loop::{AgentLoop, LoopOutcome, LoopSettings};
use crate::config::Config;
use crate::spin;
use crate::tier::TierTable;
use anyhow::{Context, Result};
use dex_agent::credential_pool::resolve_credential_refs;
use dex_agent::{CredentialPool, LanguageModelClient, OpenAiCompatBackend, ResponseCache};
use dex_core::stores::{FileDocumentStore, MemoryCacheStore, MemoryDocumentStore};
use dex_core::{
    ChatMessage, DocumentStore, Exchange, GatewayError, ModelBackend, PlanTier, ScopeKey,
    TierPolicy, ToolContext, ToolRegistry,
};
use dex_memory::{
    ConversationStore, FactStore, MemoryLimits, ToolContextStore, ToolNote, UserMemory,
    tool_context,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub system_prompt: String,
    /// End-to-end budget for one `respond` call.
    pub timeout: Duration,
    pub max_input_chars: usize,
    pub learning_enabled: bool,
    pub loop_settings: LoopSettings,
    pub memory: MemoryLimits,
    pub max_facts: usize,
    pub tool_context_entries: usize,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Config::default().gateway_options()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
}

/// Answers one user message end to end.
///
/// Everything the gateway talks to is injected at construction; there is
/// no process-wide state.
pub struct Gateway {
    client: Arc<LanguageModelClient>,
    conversations: ConversationStore,
    facts: FactStore,
    tool_notes: ToolContextStore,
    agent: AgentLoop,
    options: GatewayOptions,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("client", &self.client)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(
        client: Arc<LanguageModelClient>,
        docs: Arc<dyn DocumentStore>,
        tools: Arc<dyn ToolRegistry>,
        policy: Arc<dyn TierPolicy>,
        options: GatewayOptions,
    ) -> Self {
        let conversations =
            ConversationStore::new(Arc::clone(&docs), Arc::clone(&client), options.memory);
        let facts = FactStore::new(Arc::clone(&docs), Arc::clone(&client), options.max_facts);
        let tool_notes = ToolContextStore::new(docs, options.tool_context_entries);
        let agent = AgentLoop::new(Arc::clone(&client), tools, policy, options.loop_settings);
        Self {
            client,
            conversations,
            facts,
            tool_notes,
            agent,
            options,
        }
    }

    /// Build from config: resolve credentials from the environment and talk
    /// to the configured HTTP backend.
    pub fn from_config(config: &Config, tools: Arc<dyn ToolRegistry>) -> Result<Self> {
        let secrets = resolve_credential_refs(&config.credentials.keys)?;
        let backend = OpenAiCompatBackend::new(&config.backend.base_url, &config.backend.model)
            .context("failed to build model backend")?;
        Self::from_config_with(config, secrets, Arc::new(backend), tools)
    }

    /// Like [`Self::from_config`] with credentials and backend supplied by
    /// the caller.
    pub fn from_config_with(
        config: &Config,
        secrets: Vec<String>,
        backend: Arc<dyn ModelBackend>,
        tools: Arc<dyn ToolRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        anyhow::ensure!(!secrets.is_empty(), "no credentials configured");

        let pool = Arc::new(CredentialPool::new(secrets, config.pool_settings()));
        let cache = ResponseCache::new(
            Arc::new(MemoryCacheStore::with_capacity(config.cache.max_entries)),
            config.cache_ttls(),
        );
        let client = LanguageModelClient::new(backend, pool, cache)
            .with_retry_policy(config.retry_policy());

        let docs: Arc<dyn DocumentStore> = match &config.store.dir {
            Some(dir) => Arc::new(FileDocumentStore::new(dir)?),
            None => Arc::new(MemoryDocumentStore::new()),
        };
        let policy = TierTable::new(&config.effective_tiers(), &config.gateway.default_tier)?;

        info!(
            backend = client.backend_name(),
            credentials = client.pool().len(),
            tiers = ?policy.tier_names(),
            persistent = config.store.dir.is_some(),
            "gateway configured"
        );

        Ok(Self::new(
            Arc::new(client),
            docs,
            tools,
            Arc::new(policy),
            config.gateway_options(),
        ))
    }

    pub fn client(&self) -> &LanguageModelClient {
        &self.client
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    /// Answer `text` from `user_id` in `scope`.
    ///
    /// The conversation is written back only once the whole exchange has
    /// completed, so a timed-out request leaves stored history untouched.
    pub async fn respond(
        &self,
        user_id: &str,
        scope: &ScopeKey,
        text: &str,
        plan: &PlanTier,
    ) -> Result<Reply, GatewayError> {
        let text = self.validate_input(user_id, text)?;
        let deadline = Instant::now() + self.options.timeout;

        let span = info_span!("respond", user = user_id, scope = %scope, plan = %plan);

        async {
            let exchange =
                tokio::time::timeout_at(deadline, self.run_exchange(user_id, scope, text, plan))
                    .await
                    .map_err(|_elapsed| {
                        warn!(timeout = ?self.options.timeout, "request timed out");
                        GatewayError::Timeout(self.options.timeout)
                    })??;

            if self.options.learning_enabled {
                let learning = self.facts.learn(user_id, &exchange);
                match tokio::time::timeout_at(deadline, learning).await {
                    Ok(Ok(added)) => debug!(added, "fact learning finished"),
                    Ok(Err(e)) => warn!(error = format!("{e:#}"), "fact learning failed"),
                    Err(_) => warn!("fact learning ran out of time"),
                }
            }

            Ok(Reply {
                text: exchange.assistant,
            })
        }
        .instrument(span)
        .await
    }

    fn validate_input<'a>(&self, user_id: &str, text: &'a str) -> Result<&'a str, GatewayError> {
        if user_id.trim().is_empty() {
            return Err(GatewayError::Validation("user id is empty".to_owned()));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(GatewayError::Validation("message is empty".to_owned()));
        }
        let chars = text.chars().count();
        if chars > self.options.max_input_chars {
            return Err(GatewayError::Validation(format!(
                "message is {chars} characters, the limit is {}",
                self.options.max_input_chars
            )));
        }
        Ok(text)
    }

    async fn run_exchange(
        &self,
        user_id: &str,
        scope: &ScopeKey,
        text: &str,
        plan: &PlanTier,
    ) -> Result<Exchange, GatewayError> {
        let mut state = self.conversations.load(user_id, scope).await?;

        let memory = self.facts.load(user_id).await.unwrap_or_else(|e| {
            warn!(error = format!("{e:#}"), "failed to load user memory, continuing without it");
            UserMemory::default()
        });
        let notes = self.tool_notes.load(user_id, scope).await.unwrap_or_else(|e| {
            warn!(error = format!("{e:#}"), "failed to load tool context, continuing without it");
            Vec::new()
        });

        let system = self.system_prompt(&state.summary, &memory, &notes);
        let mut messages = Vec::with_capacity(state.history.len() + 2);
        messages.push(ChatMessage::system(system));
        messages.extend(state.history.iter().cloned());
        messages.push(ChatMessage::user(text));

        debug!(
            history_len = state.history.len(),
            facts = memory.facts.len(),
            tool_notes = notes.len(),
            "context built"
        );

        let ctx = ToolContext {
            user_id: user_id.to_owned(),
            scope: scope.clone(),
            plan: plan.clone(),
        };
        let LoopOutcome {
            text: answer,
            rounds,
            hit_limit,
            tool_notes,
        } = self.agent.run(messages, &ctx).await?;

        let exchange = Exchange::new(text, answer);
        self.conversations.append(&mut state, exchange.clone());
        if self.conversations.should_summarize(&state) {
            self.conversations.summarize(&mut state).await;
        }
        self.conversations.save(&state).await?;

        if let Err(e) = self.tool_notes.record(user_id, scope, tool_notes).await {
            warn!(error = format!("{e:#}"), "failed to record tool context");
        }

        info!(rounds, hit_limit, history_len = state.history.len(), "exchange completed");
        Ok(exchange)
    }

    fn system_prompt(&self, summary: &str, memory: &UserMemory, notes: &[ToolNote]) -> String {
        let mut sections = vec![self.options.system_prompt.clone()];
        if !summary.is_empty() {
            sections.push(format!("Summary of the earlier conversation:\n{summary}"));
        }
        if let Some(known) = memory.prompt_section() {
            sections.push(known);
        }
        if let Some(recent) = tool_context::render(notes) {
            sections.push(recent);
        }
        sections.join("\n\n")
    }

    /// Rewrite outbound copy for `tenant_id`, keeping `{{placeholders}}`.
    /// Returns `content` unchanged on failure or timeout.
    pub async fn spin_message(&self, content: &str, tenant_id: &str) -> String {
        let rewrite = spin::spin_message(&self.client, content, tenant_id);
        match tokio::time::timeout(self.options.timeout, rewrite).await {
            Ok(rewritten) => rewritten,
            Err(_) => {
                warn!(tenant = tenant_id, "rewrite timed out, keeping original");
                content.to_owned()
            }
        }
    }
}
