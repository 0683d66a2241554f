//! Request settings and normalized result shapes shared by both backend adapters.

use serde::{Deserialize, Serialize};

use crate::history::ConversationTurn;

/// Server endpoint and optional bearer credential.
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    pub url: String,
    pub token: Option<String>,
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }
}

/// Per-request sampling and budget options (`num_ctx`, `num_predict`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    pub num_ctx: u32,
    pub num_predict: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            num_ctx: 8192,
            num_predict: 1024,
            temperature: 0.2,
            top_p: 0.9,
            top_k: 40,
        }
    }
}

/// Stop tokens from the model template and from the user; sent concatenated.
#[derive(Debug, Clone, Default)]
pub struct StopTokens {
    pub model_stop: Vec<String>,
    pub user_stop: Vec<String>,
}

impl StopTokens {
    pub fn combined(&self) -> Vec<String> {
        self.model_stop
            .iter()
            .chain(self.user_stop.iter())
            .cloned()
            .collect()
    }
}

/// Everything a backend needs besides the payload: where, who, which model, how.
#[derive(Debug, Clone, Default)]
pub struct RequestSettings {
    pub endpoint: Endpoint,
    pub model: String,
    pub options: ModelOptions,
    pub stop: StopTokens,
}

/// One streaming chat call.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub settings: &'a RequestSettings,
    pub messages: &'a [ConversationTurn],
    pub tools: &'a [ToolDefinition],
    pub think: bool,
}

/// One single-turn generation call.
#[derive(Debug, Clone, Copy)]
pub struct GenerateRequest<'a> {
    pub settings: &'a RequestSettings,
    pub prompt: &'a str,
    pub system: Option<&'a str>,
}

/// A tool invocation requested by the model. Arguments stay raw JSON until dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments_json: String,
}

/// Normalized result of one chat call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResult {
    pub content: String,
    /// Empty exactly when the model produced a final answer.
    pub tool_calls: Vec<ToolCallRequest>,
    pub truncated: bool,
    pub thinking_text: Option<String>,
}

/// Normalized result of one generate call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub truncated: bool,
}

/// Tool definition for function calling, in the format both backends accept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub typ: String,
    pub function: ToolFunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFunctionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

impl ToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: Option<String>,
        parameters: Option<serde_json::Value>,
    ) -> Self {
        Self {
            typ: "function".to_string(),
            function: ToolFunctionDefinition {
                name: name.into(),
                description,
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("llm api error: {0}")]
    Api(String),
    #[error("prompt too large for context window: need {required} tokens, {available} available")]
    ContextOverflow { required: u64, available: u64 },
    #[error("no backend detected for {0} requests")]
    BackendNotDetected(super::RequestCategory),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_tokens_concatenate_model_then_user() {
        let stop = StopTokens {
            model_stop: vec!["<|eot|>".into()],
            user_stop: vec!["\n\n".into(), "END".into()],
        };
        assert_eq!(stop.combined(), vec!["<|eot|>", "\n\n", "END"]);
    }

    #[test]
    fn endpoint_trims_trailing_slash_and_blank_token() {
        let ep = Endpoint::new("http://localhost:11434/").with_token(Some("  ".into()));
        assert_eq!(ep.url, "http://localhost:11434");
        assert!(ep.token.is_none());
    }

    #[test]
    fn tool_definition_serializes_function_shape() {
        let def = ToolDefinition::function(
            "readFile",
            Some("Read a file".into()),
            Some(serde_json::json!({"type": "object"})),
        );
        let v = serde_json::to_value(&def).unwrap();
        assert_eq!(v["type"], "function");
        assert_eq!(v["function"]["name"], "readFile");
        assert_eq!(v["function"]["parameters"]["type"], "object");
    }
}
