//! Tool registry and dispatcher.
//!
//! Maps tool names to their schema and executor. Dispatch never fails: unknown tools,
//! invalid arguments and executor errors all come back as JSON error payloads so the
//! model can react to them in the next round.

use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde_json::{json, Value};

use crate::llm::ToolDefinition;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
    #[error("invalid schema for tool {name}: {reason}")]
    InvalidSchema { name: String, reason: String },
    #[error("tool already registered: {0}")]
    Duplicate(String),
}

/// A side-effecting function the model can call. May suspend (e.g. for user confirmation).
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> Option<&str> {
        None
    }

    /// JSON Schema for the arguments object.
    fn parameters(&self) -> Option<Value> {
        None
    }

    /// Returns a JSON-serialized result string.
    async fn execute(&self, args: Value) -> Result<String, ToolError>;
}

struct Entry {
    tool: Arc<dyn Tool>,
    definition: ToolDefinition,
    schema: Option<JSONSchema>,
}

/// Registered tools in registration order.
#[derive(Default)]
pub struct ToolRegistry {
    entries: Vec<Entry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; its parameter schema is compiled once here.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.has_tool(&name) {
            return Err(ToolError::Duplicate(name));
        }
        let parameters = tool.parameters();
        let schema = match &parameters {
            Some(p) => Some(JSONSchema::compile(p).map_err(|e| ToolError::InvalidSchema {
                name: name.clone(),
                reason: e.to_string(),
            })?),
            None => None,
        };
        let definition =
            ToolDefinition::function(name, tool.description().map(str::to_string), parameters);
        self.entries.push(Entry {
            tool,
            definition,
            schema,
        });
        Ok(())
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.definition.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.definition.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Definitions to send with each chat request.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.entries.iter().map(|e| e.definition.clone()).collect()
    }

    /// Validate and run a tool. Always returns a result string for the tool turn.
    pub async fn execute(&self, name: &str, args: Value) -> String {
        let Some(entry) = self.entries.iter().find(|e| e.definition.name() == name) else {
            log::warn!("tools: unknown tool requested: {}", name);
            return json!({
                "error": format!("Unknown tool: {}", name),
                "available": self.names(),
            })
            .to_string();
        };
        match self.run(entry, args).await {
            Ok(out) => out,
            Err(e) => {
                log::warn!("tools: {} failed: {}", name, e);
                error_payload(&e.to_string())
            }
        }
    }

    async fn run(&self, entry: &Entry, args: Value) -> Result<String, ToolError> {
        if let Some(schema) = &entry.schema {
            if let Err(errors) = schema.validate(&args) {
                let reasons: Vec<String> = errors.map(|e| e.to_string()).collect();
                return Err(ToolError::InvalidArguments(reasons.join("; ")));
            }
        }
        entry.tool.execute(args).await
    }
}

/// `{"error": message}` as a JSON string.
pub fn error_payload(message: &str) -> String {
    json!({ "error": message }).to_string()
}
