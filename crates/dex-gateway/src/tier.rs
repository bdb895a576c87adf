//! Plan-tier tool gating.
//!
//! Tiers are ordered from least to most capable. Each tier inherits every
//! tool allowed by the tiers before it; `"*"` allows everything.

use anyhow::Result;
use dex_core::{PlanTier, TierPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

pub const ALL_TOOLS: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl TierConfig {
    pub fn new(name: &str, tools: &[&str]) -> Self {
        Self {
            name: name.to_owned(),
            tools: tools.iter().map(|t| (*t).to_owned()).collect(),
        }
    }
}

/// Built-in ladder used when the config declares no tiers.
pub fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig::new("starter", &[]),
        TierConfig::new("pro", &["web_search", "weather"]),
        TierConfig::new("enterprise", &[ALL_TOOLS]),
    ]
}

#[derive(Debug)]
struct Tier {
    name: String,
    /// Cumulative: includes every lower tier's tools.
    tools: HashSet<String>,
    all: bool,
}

#[derive(Debug)]
pub struct TierTable {
    tiers: Vec<Tier>,
    default_index: usize,
}

impl TierTable {
    /// Build from ordered tier declarations. Plans not in the table are
    /// treated as `default_tier`.
    pub fn new(configs: &[TierConfig], default_tier: &str) -> Result<Self> {
        anyhow::ensure!(!configs.is_empty(), "at least one tier must be declared");

        let mut tiers: Vec<Tier> = Vec::with_capacity(configs.len());
        for config in configs {
            anyhow::ensure!(
                !tiers.iter().any(|t| t.name.eq_ignore_ascii_case(&config.name)),
                "tier '{}' declared twice",
                config.name
            );
            let (mut tools, mut all) = tiers
                .last()
                .map_or_else(|| (HashSet::new(), false), |prev| (prev.tools.clone(), prev.all));
            for tool in &config.tools {
                if tool == ALL_TOOLS {
                    all = true;
                } else {
                    tools.insert(tool.clone());
                }
            }
            tiers.push(Tier {
                name: config.name.clone(),
                tools,
                all,
            });
        }

        let default_index = tiers
            .iter()
            .position(|t| t.name.eq_ignore_ascii_case(default_tier))
            .ok_or_else(|| anyhow::anyhow!("default tier '{default_tier}' is not declared"))?;

        Ok(Self { tiers, default_index })
    }

    fn resolve(&self, plan: &PlanTier) -> &Tier {
        let index = self
            .tiers
            .iter()
            .position(|t| t.name.eq_ignore_ascii_case(plan.as_str()))
            .unwrap_or_else(|| {
                debug!(plan = %plan, "unknown plan tier, using default");
                self.default_index
            });
        &self.tiers[index]
    }

    /// Lowest tier that allows `tool`, if any.
    pub fn lowest_tier_for(&self, tool: &str) -> Option<&str> {
        self.tiers
            .iter()
            .find(|t| t.all || t.tools.contains(tool))
            .map(|t| t.name.as_str())
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.name.as_str()).collect()
    }
}

impl TierPolicy for TierTable {
    fn is_allowed(&self, plan: &PlanTier, tool: &str) -> bool {
        let tier = self.resolve(plan);
        tier.all || tier.tools.contains(tool)
    }

    fn denial_message(&self, plan: &PlanTier, tool: &str) -> String {
        let current = &self.resolve(plan).name;
        match self.lowest_tier_for(tool) {
            Some(required) => format!(
                "The tool '{tool}' is not available on the '{current}' plan. It requires the \
                 '{required}' plan or higher. Tell the user an upgrade is required to use it, \
                 and answer as well as possible without it."
            ),
            None => format!(
                "The tool '{tool}' is not available on any plan. Answer without it."
            ),
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TierTable {
        TierTable::new(&default_tiers(), "starter").unwrap()
    }

    #[test]
    fn starter_cannot_search() {
        assert!(!table().is_allowed(&PlanTier::new("starter"), "web_search"));
    }

    #[test]
    fn higher_tiers_inherit_lower_tools() {
        let tiers = vec![
            TierConfig::new("basic", &["calculator"]),
            TierConfig::new("plus", &["web_search"]),
        ];
        let table = TierTable::new(&tiers, "basic").unwrap();
        let plus = PlanTier::new("plus");
        assert!(table.is_allowed(&plus, "calculator"));
        assert!(table.is_allowed(&plus, "web_search"));
        assert!(!table.is_allowed(&PlanTier::new("basic"), "web_search"));
    }

    #[test]
    fn wildcard_allows_everything() {
        assert!(table().is_allowed(&PlanTier::new("enterprise"), "anything_at_all"));
    }

    #[test]
    fn unknown_plan_uses_default() {
        let table = table();
        assert!(!table.is_allowed(&PlanTier::new("mystery"), "web_search"));
        assert!(table.is_allowed(&PlanTier::new("PRO"), "web_search"));
    }

    #[test]
    fn denial_names_required_tier() {
        let message = table().denial_message(&PlanTier::new("starter"), "web_search");
        assert!(message.contains("'pro'"));
        assert!(message.contains("upgrade"));
    }

    #[test]
    fn rejects_duplicate_and_missing_default() {
        let dup = vec![TierConfig::new("a", &[]), TierConfig::new("a", &[])];
        assert!(TierTable::new(&dup, "a").is_err());
        assert!(TierTable::new(&default_tiers(), "gold").is_err());
        assert!(TierTable::new(&[], "starter").is_err());
    }

    #[test]
    fn names_compare_ignoring_case() {
        let table = TierTable::new(&default_tiers(), "STARTER").unwrap();
        assert!(!table.is_allowed(&PlanTier::new("unknown"), "web_search"));
        let dup = vec![TierConfig::new("pro", &[]), TierConfig::new("Pro", &[])];
        assert!(TierTable::new(&dup, "pro").is_err());
    }
}
