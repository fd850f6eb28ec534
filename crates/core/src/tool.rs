//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act on the sandbox:
//! run commands, clone repositories, keep a todo list, report progress.
//! Anything that can answer a named tool call implements [`ToolProvider`];
//! the local [`ToolRegistry`] and the external tool servers both do.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ToolError;
use crate::message::{ContentBlock, SessionId};
use crate::provider::ToolDefinition;

/// Per-call context handed to a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContext {
    /// The call id the model assigned to this invocation
    pub tool_call_id: String,

    pub session_id: SessionId,
}

/// What a tool produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToolOutput {
    /// Plain text; rendered into the result wrapper by the dispatcher
    Text(String),

    /// Rich content (e.g. images) passed through as-is
    Blocks(Vec<ContentBlock>),
}

impl ToolOutput {
    /// A short textual rendering for logs and live updates.
    pub fn preview(&self) -> String {
        match self {
            ToolOutput::Text(text) => text.clone(),
            ToolOutput::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.clone(),
                    ContentBlock::Image { format, .. } => format!("[image/{format}]"),
                    _ => String::new(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<String> for ToolOutput {
    fn from(text: String) -> Self {
        ToolOutput::Text(text)
    }
}

impl From<&str> for ToolOutput {
    fn from(text: &str) -> Self {
        ToolOutput::Text(text.to_string())
    }
}

/// The core Tool trait.
///
/// Each local tool (executeCommand, cloneRepository, todoInit, ...)
/// implements this trait. Tools are registered in the [`ToolRegistry`] and
/// made available to the turn loop.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "executeCommand").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's input.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Check the input before execution. Defaults to the schema check.
    fn validate(&self, input: &serde_json::Value) -> std::result::Result<(), ToolError> {
        validate_input(&self.parameters_schema(), input)
    }

    /// Execute the tool with already-validated input.
    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> std::result::Result<ToolOutput, ToolError>;

    /// Whether a successful call changes what the system prompt should say.
    fn refreshes_prompt(&self) -> bool {
        false
    }

    /// Whether a successful call counts as reporting progress to the user.
    fn reports_progress(&self) -> bool {
        false
    }

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.parameters_schema(),
        }
    }
}

/// Minimal JSON Schema check: object type, required fields, primitive
/// property types, and `enum` membership.
pub fn validate_input(
    schema: &serde_json::Value,
    input: &serde_json::Value,
) -> std::result::Result<(), ToolError> {
    let Some(object) = input.as_object() else {
        return Err(ToolError::InvalidArguments(
            "input must be a JSON object".into(),
        ));
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if !object.contains_key(field) {
                return Err(ToolError::InvalidArguments(format!(
                    "missing required field '{field}'"
                )));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return Ok(());
    };

    for (field, value) in object {
        let Some(prop) = properties.get(field) else {
            continue;
        };

        if let Some(expected) = prop.get("type").and_then(|t| t.as_str()) {
            let ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(ToolError::InvalidArguments(format!(
                    "field '{field}' must be of type {expected}"
                )));
            }
        }

        if let Some(allowed) = prop.get("enum").and_then(|e| e.as_array()) {
            if !allowed.contains(value) {
                return Err(ToolError::InvalidArguments(format!(
                    "field '{field}' must be one of {}",
                    serde_json::Value::Array(allowed.clone())
                )));
            }
        }
    }

    Ok(())
}

/// Anything that can answer named tool calls.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// A human-readable name for logs (e.g., "local", "mcp").
    fn name(&self) -> &str;

    /// The definitions this provider contributes to the catalogue.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Validate and run one call.
    async fn invoke(
        &self,
        tool_name: &str,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> std::result::Result<ToolOutput, ToolError>;

    fn refreshes_prompt(&self, _tool_name: &str) -> bool {
        false
    }

    fn reports_progress(&self, _tool_name: &str) -> bool {
        false
    }
}

/// A registry of local tools.
///
/// The turn loop uses this to:
/// 1. Get tool definitions to send to the LLM
/// 2. Look up and execute tools when the LLM requests them
#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Builder-style registration.
    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// List all registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolProvider for ToolRegistry {
    fn name(&self) -> &str {
        "local"
    }

    /// Sorted by name so the catalogue (and the prompt cache) is stable.
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.names()
            .into_iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.to_definition())
            .collect()
    }

    async fn invoke(
        &self,
        tool_name: &str,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> std::result::Result<ToolOutput, ToolError> {
        let tool = self
            .tools
            .get(tool_name)
            .ok_or_else(|| ToolError::NotFound(tool_name.to_string()))?;
        tool.validate(&input)?;
        tool.execute(input, ctx).await
    }

    fn refreshes_prompt(&self, tool_name: &str) -> bool {
        self.tools
            .get(tool_name)
            .is_some_and(|t| t.refreshes_prompt())
    }

    fn reports_progress(&self, tool_name: &str) -> bool {
        self.tools
            .get(tool_name)
            .is_some_and(|t| t.reports_progress())
    }
}
