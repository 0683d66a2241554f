//! Tool layer: schema-described tools and a dispatcher that never propagates failures.

mod registry;

pub use crate::llm::ToolDefinition;
pub use registry::{error_payload, Tool, ToolError, ToolRegistry};
