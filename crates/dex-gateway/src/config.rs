use crate::agent_loop::LoopSettings;
use crate::gateway::GatewayOptions;
use crate::tier::{TierConfig, default_tiers};
use anyhow::{Context, Result};
use dex_agent::{CacheTtls, PoolSettings, RetryPolicy};
use dex_memory::MemoryLimits;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const CONFIG_FILE: &str = "dex.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub tiers: Vec<TierConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub system_prompt: String,
    pub max_tool_calls: usize,
    pub timeout_secs: u64,
    pub tool_timeout_secs: u64,
    pub max_input_chars: usize,
    /// Tier applied to plans the tier table does not know.
    pub default_tier: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful assistant in a messaging app. Keep replies short \
                            and friendly, and use tools when they help answer accurately."
                .to_owned(),
            max_tool_calls: 5,
            timeout_secs: 120,
            tool_timeout_secs: 30,
            max_input_chars: 4000,
            default_tier: "starter".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// `env:VAR` references. A variable may hold comma-separated keys.
    pub keys: Vec<String>,
    pub quota_cooldown_secs: u64,
    pub max_quota_cooldown_secs: u64,
    pub failure_threshold: u32,
    /// Wait before an unhealthy credential gets a test request.
    pub half_open_after_secs: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            keys: vec!["env:DEX_API_KEYS".to_owned()],
            quota_cooldown_secs: 60,
            max_quota_cooldown_secs: 600,
            failure_threshold: 3,
            half_open_after_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub quota_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 8000,
            quota_delay_ms: 250,
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub chat_ttl_secs: u64,
    pub tools_ttl_secs: u64,
    pub summary_ttl_secs: u64,
    pub moderation_ttl_secs: u64,
    pub facts_ttl_secs: u64,
    pub rewrite_ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            chat_ttl_secs: 30 * 60,
            tools_ttl_secs: 15 * 60,
            summary_ttl_secs: 60 * 60,
            moderation_ttl_secs: 30 * 60,
            facts_ttl_secs: 60 * 60,
            rewrite_ttl_secs: 30 * 60,
            max_entries: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub summarize_threshold: usize,
    pub messages_to_summarize: usize,
    pub history_prune_length: usize,
    pub max_summary_length: usize,
    pub max_facts: usize,
    pub learning_enabled: bool,
    pub tool_context_entries: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            summarize_threshold: 16,
            messages_to_summarize: 10,
            history_prune_length: 6,
            max_summary_length: 1000,
            max_facts: 50,
            learning_enabled: true,
            tool_context_entries: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Wire format. Only `chat-completions` is built in.
    pub api: String,
    pub base_url: String,
    pub model: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api: "chat-completions".to_owned(),
            base_url: "https://api.openai.com/v1".to_owned(),
            model: "gpt-4o-mini".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory for file-backed documents. In-memory when unset.
    pub dir: Option<String>,
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Resolve config path: check arg, then default locations.
    pub fn find_config_path(explicit: Option<&str>) -> PathBuf {
        if let Some(p) = explicit {
            return PathBuf::from(p);
        }

        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return local;
        }

        if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
            let xdg = PathBuf::from(config_dir).join("dex").join(CONFIG_FILE);
            if xdg.exists() {
                return xdg;
            }
        }

        if let Ok(home) = std::env::var("HOME") {
            let home_config = PathBuf::from(home).join(".config/dex").join(CONFIG_FILE);
            if home_config.exists() {
                return home_config;
            }
        }

        local
    }

    /// Declared tiers, or the built-in ladder when none are declared.
    pub fn effective_tiers(&self) -> Vec<TierConfig> {
        if self.tiers.is_empty() {
            default_tiers()
        } else {
            self.tiers.clone()
        }
    }

    /// Reject configurations that would break the gateway's bounds.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        let positive = [
            ("gateway.max_tool_calls", self.gateway.max_tool_calls as u64),
            ("gateway.timeout_secs", self.gateway.timeout_secs),
            ("gateway.tool_timeout_secs", self.gateway.tool_timeout_secs),
            ("gateway.max_input_chars", self.gateway.max_input_chars as u64),
            ("credentials.failure_threshold", u64::from(self.credentials.failure_threshold)),
            ("credentials.half_open_after_secs", self.credentials.half_open_after_secs),
            ("retry.request_timeout_secs", self.retry.request_timeout_secs),
            ("cache.max_entries", self.cache.max_entries as u64),
            ("memory.summarize_threshold", self.memory.summarize_threshold as u64),
            ("memory.messages_to_summarize", self.memory.messages_to_summarize as u64),
            ("memory.history_prune_length", self.memory.history_prune_length as u64),
            ("memory.max_summary_length", self.memory.max_summary_length as u64),
            ("memory.max_facts", self.memory.max_facts as u64),
            ("memory.tool_context_entries", self.memory.tool_context_entries as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                problems.push(format!("{name} must be greater than zero"));
            }
        }

        if self.credentials.keys.is_empty() {
            problems.push("credentials.keys must list at least one env: reference".to_owned());
        }
        for key in &self.credentials.keys {
            if !key.starts_with("env:") {
                problems.push(format!("credentials.keys entry '{key}' must use the env: prefix"));
            }
        }
        if self.credentials.max_quota_cooldown_secs < self.credentials.quota_cooldown_secs {
            problems.push(
                "credentials.max_quota_cooldown_secs is below quota_cooldown_secs".to_owned(),
            );
        }

        if self.memory.history_prune_length >= self.memory.summarize_threshold {
            problems.push(format!(
                "memory.history_prune_length ({}) must be below memory.summarize_threshold ({})",
                self.memory.history_prune_length, self.memory.summarize_threshold
            ));
        }

        if self.backend.api != "chat-completions" {
            problems.push(format!(
                "backend.api '{}' is not supported (use chat-completions)",
                self.backend.api
            ));
        }

        // Tier names compare case-insensitively, as plans do at lookup.
        let tiers = self.effective_tiers();
        let mut seen = HashSet::new();
        for tier in &tiers {
            if !seen.insert(tier.name.to_ascii_lowercase()) {
                problems.push(format!("tier '{}' declared twice", tier.name));
            }
        }
        if !seen.contains(&self.gateway.default_tier.to_ascii_lowercase()) {
            problems.push(format!(
                "gateway.default_tier '{}' is not a declared tier",
                self.gateway.default_tier
            ));
        }

        if problems.is_empty() {
            debug!("config validated");
            Ok(())
        } else {
            anyhow::bail!("invalid configuration:\n  - {}", problems.join("\n  - "))
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            quota_cooldown: Duration::from_secs(self.credentials.quota_cooldown_secs),
            max_quota_cooldown: Duration::from_secs(self.credentials.max_quota_cooldown_secs),
            failure_threshold: self.credentials.failure_threshold,
            half_open_after: Duration::from_secs(self.credentials.half_open_after_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            quota_delay: Duration::from_millis(self.retry.quota_delay_ms),
            request_timeout: Duration::from_secs(self.retry.request_timeout_secs),
        }
    }

    pub fn cache_ttls(&self) -> CacheTtls {
        CacheTtls {
            chat: Duration::from_secs(self.cache.chat_ttl_secs),
            tools: Duration::from_secs(self.cache.tools_ttl_secs),
            summary: Duration::from_secs(self.cache.summary_ttl_secs),
            moderation: Duration::from_secs(self.cache.moderation_ttl_secs),
            facts: Duration::from_secs(self.cache.facts_ttl_secs),
            rewrite: Duration::from_secs(self.cache.rewrite_ttl_secs),
        }
    }

    pub fn memory_limits(&self) -> MemoryLimits {
        MemoryLimits {
            summarize_threshold: self.memory.summarize_threshold,
            messages_to_summarize: self.memory.messages_to_summarize,
            history_prune_length: self.memory.history_prune_length,
            max_summary_length: self.memory.max_summary_length,
        }
    }

    pub fn gateway_options(&self) -> GatewayOptions {
        GatewayOptions {
            system_prompt: self.gateway.system_prompt.clone(),
            timeout: Duration::from_secs(self.gateway.timeout_secs),
            max_input_chars: self.gateway.max_input_chars,
            learning_enabled: self.memory.learning_enabled,
            loop_settings: LoopSettings {
                max_tool_calls: self.gateway.max_tool_calls,
                tool_timeout: Duration::from_secs(self.gateway.tool_timeout_secs),
            },
            memory: self.memory_limits(),
            max_facts: self.memory.max_facts,
            tool_context_entries: self.memory.tool_context_entries,
        }
    }
}
