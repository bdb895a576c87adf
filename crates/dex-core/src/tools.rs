//! Statically constructed tool table.
//!
//! Tools are registered once at startup through [`ToolTableBuilder`];
//! `build()` validates names and parameter schemas so a bad registration
//! fails the process early instead of surfacing mid-conversation.

use crate::traits::{Tool, ToolContext, ToolRegistry};
use crate::types::{ToolDef, ToolOutput};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{Instrument, debug, info_span};

const MAX_TOOL_NAME_LEN: usize = 64;

/// Immutable name -> handler table.
pub struct ToolTable {
    tools: HashMap<String, Box<dyn Tool>>,
    defs: Vec<ToolDef>,
}

impl std::fmt::Debug for ToolTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolTable")
            .field("tools", &self.defs.iter().map(|d| &d.name).collect::<Vec<_>>())
            .finish()
    }
}

impl ToolTable {
    pub fn builder() -> ToolTableBuilder {
        ToolTableBuilder { tools: Vec::new() }
    }

    /// A table with no tools; the model can only answer in text.
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
            defs: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

#[allow(missing_debug_implementations)]
pub struct ToolTableBuilder {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolTableBuilder {
    #[must_use]
    pub fn register(mut self, tool: Box<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn build(self) -> Result<ToolTable> {
        let mut tools = HashMap::with_capacity(self.tools.len());
        let mut defs = Vec::with_capacity(self.tools.len());

        for tool in self.tools {
            let def = tool.definition();
            validate_definition(&def)?;
            if tools.contains_key(&def.name) {
                anyhow::bail!("tool '{}' registered twice", def.name);
            }
            debug!(tool = %def.name, "registered tool");
            tools.insert(def.name.clone(), tool);
            defs.push(def);
        }

        Ok(ToolTable { tools, defs })
    }
}

fn validate_definition(def: &ToolDef) -> Result<()> {
    let name_ok = !def.name.is_empty()
        && def.name.len() <= MAX_TOOL_NAME_LEN
        && def
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    anyhow::ensure!(
        name_ok,
        "invalid tool name '{}': use 1-{MAX_TOOL_NAME_LEN} characters from [A-Za-z0-9_-]",
        def.name
    );

    let schema_type = def.parameters.get("type").and_then(serde_json::Value::as_str);
    anyhow::ensure!(
        def.parameters.is_object() && schema_type == Some("object"),
        "tool '{}' parameters must be a JSON schema with \"type\": \"object\"",
        def.name
    );
    Ok(())
}

#[async_trait]
impl ToolRegistry for ToolTable {
    fn list(&self) -> Vec<ToolDef> {
        self.defs.clone()
    }

    async fn execute(
        &self,
        name: &str,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput> {
        let span = info_span!("tool_execute", tool = %name);
        async {
            debug!(arguments = %arguments, "tool arguments");
            match self.tools.get(name) {
                Some(tool) => tool.execute(arguments, ctx).await,
                None => Ok(ToolOutput::error(format!("unknown tool: {name}"))),
            }
        }
        .instrument(span)
        .await
    }
}
