//! Ollama API adapter (http://127.0.0.1:11434 by default).
//! Streams /api/chat and /api/generate as NDJSON; tool calls arrive whole per chunk.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use super::accumulator::synthesize_call_id;
use super::stream::LineBuffer;
use super::{
    authorized, ensure_success, log_stream_failure, normalize, ChatRequest, ChatResult,
    GenerateRequest, Generation, LlmBackend, LlmError, ModelOptions, RequestSettings,
    ToolCallRequest, ToolDefinition,
};
use crate::history::ConversationTurn;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

/// Client for the Ollama HTTP API. Holds no conversation state.
#[derive(Clone, Default)]
pub struct OllamaClient {
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn post_stream<B: Serialize + ?Sized>(
        &self,
        settings: &RequestSettings,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}{}", settings.endpoint.url, path);
        let res = authorized(self.client.post(&url), &settings.endpoint)
            .json(body)
            .send()
            .await?;
        ensure_success(res).await
    }
}

#[async_trait]
impl LlmBackend for OllamaClient {
    /// POST /api/chat with stream: true. Calls on_chunk for each content delta.
    async fn chat(
        &self,
        request: ChatRequest<'_>,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<ChatResult, LlmError> {
        let settings = request.settings;
        let body = OllamaChatRequest {
            model: &settings.model,
            messages: to_ollama_messages(request.messages),
            stream: true,
            tools: (!request.tools.is_empty()).then_some(request.tools),
            think: request.think.then_some(true),
            options: OllamaOptions::new(settings),
        };
        log::debug!(
            "ollama: POST {}/api/chat model={} messages={} tools={}",
            settings.endpoint.url,
            settings.model,
            request.messages.len(),
            request.tools.len()
        );
        let res = self.post_stream(settings, "/api/chat", &body).await?;

        let mut stream = res.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut state = ChatStreamState::default();

        'stream: while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    log_stream_failure("ollama", settings, request.messages.len(), &state.content, &e);
                    return Err(LlmError::Request(e));
                }
            };
            for line in lines.push(&chunk) {
                if state.handle_line(&line, on_chunk)? {
                    break 'stream;
                }
            }
        }
        if let Some(line) = lines.finish() {
            state.handle_line(&line, on_chunk)?;
        }

        let truncated =
            normalize::hit_predict_limit(&state.content, state.eval_count, &settings.options);
        Ok(ChatResult {
            content: state.content,
            tool_calls: state.tool_calls,
            truncated,
            thinking_text: (!state.thinking.is_empty()).then_some(state.thinking),
        })
    }

    /// POST /api/generate with stream: true; the text is normalized before returning.
    async fn generate(&self, request: GenerateRequest<'_>) -> Result<Generation, LlmError> {
        let settings = request.settings;
        let body = OllamaGenerateRequest {
            model: &settings.model,
            prompt: request.prompt,
            system: request.system,
            stream: true,
            options: OllamaOptions::new(settings),
        };
        log::debug!(
            "ollama: POST {}/api/generate model={} prompt_chars={}",
            settings.endpoint.url,
            settings.model,
            request.prompt.len()
        );
        let res = self.post_stream(settings, "/api/generate", &body).await?;

        let mut stream = res.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut state = GenerateStreamState::default();

        'stream: while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    log_stream_failure("ollama", settings, 1, &state.text, &e);
                    return Err(LlmError::Request(e));
                }
            };
            for line in lines.push(&chunk) {
                if state.handle_line(&line)? {
                    break 'stream;
                }
            }
        }
        if let Some(line) = lines.finish() {
            state.handle_line(&line)?;
        }

        Ok(normalize::finalize(&state.text, state.eval_count, &settings.options))
    }
}

/// Text, thinking and tool calls gathered from one /api/chat stream.
#[derive(Default)]
struct ChatStreamState {
    content: String,
    thinking: String,
    tool_calls: Vec<ToolCallRequest>,
    eval_count: Option<u32>,
}

impl ChatStreamState {
    /// Apply one NDJSON line; returns true once the final (done) chunk was seen.
    fn handle_line(
        &mut self,
        line: &str,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<bool, LlmError> {
        let event: ChatStreamEvent = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(e) => {
                log::debug!("ollama: skipping unparsable line: {}", e);
                return Ok(false);
            }
        };
        if let Some(err) = event.error {
            return Err(LlmError::Api(err));
        }
        if let Some(msg) = event.message {
            if !msg.content.is_empty() {
                on_chunk(&msg.content);
                self.content.push_str(&msg.content);
            }
            if let Some(t) = msg.thinking {
                self.thinking.push_str(&t);
            }
            self.tool_calls
                .extend(msg.tool_calls.into_iter().flatten().map(into_request));
        }
        if event.done {
            self.eval_count = event.eval_count;
            log::debug!(
                "ollama: done prompt_eval_count={:?} eval_count={:?} total_duration_ns={:?}",
                event.prompt_eval_count,
                event.eval_count,
                event.total_duration
            );
        }
        Ok(event.done)
    }
}

#[derive(Default)]
struct GenerateStreamState {
    text: String,
    eval_count: Option<u32>,
}

impl GenerateStreamState {
    fn handle_line(&mut self, line: &str) -> Result<bool, LlmError> {
        let Ok(event) = serde_json::from_str::<GenerateStreamEvent>(line) else {
            return Ok(false);
        };
        if let Some(err) = event.error {
            return Err(LlmError::Api(err));
        }
        self.text.push_str(&event.response);
        if event.done {
            self.eval_count = event.eval_count;
        }
        Ok(event.done)
    }
}

fn into_request(tc: StreamToolCall) -> ToolCallRequest {
    let arguments_json = match tc.function.arguments {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => "{}".to_string(),
        other => other.to_string(),
    };
    ToolCallRequest {
        id: tc.id.filter(|id| !id.is_empty()).unwrap_or_else(synthesize_call_id),
        name: tc.function.name,
        arguments_json,
    }
}

/// Ollama matches tool results by tool name rather than id, so resolve names from the calls.
fn to_ollama_messages(turns: &[ConversationTurn]) -> Vec<OllamaMessage<'_>> {
    let mut names: HashMap<&str, &str> = HashMap::new();
    turns
        .iter()
        .map(|turn| match turn {
            ConversationTurn::System { content } => OllamaMessage::plain("system", content),
            ConversationTurn::User { content } => OllamaMessage::plain("user", content),
            ConversationTurn::Assistant {
                content,
                tool_calls,
            } => {
                let calls: Vec<OllamaToolCall> = tool_calls
                    .iter()
                    .map(|c| {
                        names.insert(c.id.as_str(), c.name.as_str());
                        OllamaToolCall {
                            function: OllamaFunctionCall {
                                name: &c.name,
                                arguments: serde_json::from_str(&c.arguments_json).unwrap_or_else(
                                    |_| serde_json::Value::String(c.arguments_json.clone()),
                                ),
                            },
                        }
                    })
                    .collect();
                OllamaMessage {
                    role: "assistant",
                    content,
                    tool_calls: (!calls.is_empty()).then_some(calls),
                    tool_name: None,
                }
            }
            ConversationTurn::Tool {
                content,
                tool_call_id,
            } => OllamaMessage {
                role: "tool",
                content,
                tool_calls: None,
                tool_name: names.get(tool_call_id.as_str()).copied(),
            },
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_ctx: u32,
    num_predict: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

impl OllamaOptions {
    fn new(settings: &RequestSettings) -> Self {
        let ModelOptions {
            num_ctx,
            num_predict,
            temperature,
            top_p,
            top_k,
        } = settings.options;
        Self {
            num_ctx,
            num_predict,
            temperature,
            top_p,
            top_k,
            stop: settings.stop.combined(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    think: Option<bool>,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OllamaToolCall<'a>>>,
    /// When role is "tool", the name of the tool this result is for.
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_name: Option<&'a str>,
}

impl<'a> OllamaMessage<'a> {
    fn plain(role: &'static str, content: &'a str) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_name: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaToolCall<'a> {
    function: OllamaFunctionCall<'a>,
}

#[derive(Debug, Serialize)]
struct OllamaFunctionCall<'a> {
    name: &'a str,
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatStreamEvent {
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    total_duration: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    id: Option<String>,
    function: StreamFunction,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: String,
    /// JSON object or string, depending on the model.
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GenerateStreamEvent {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}
