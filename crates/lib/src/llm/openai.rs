//! OpenAI-compatible adapter (/v1/chat/completions with server-sent events).
//!
//! Tool calls arrive as index-keyed fragments and are reassembled by a
//! [`StreamAccumulator`] using the configured [`FragmentPolicy`].

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use super::accumulator::{FragmentPolicy, StreamAccumulator, ToolCallFragment};
use super::stream::{sse_data, LineBuffer};
use super::{
    authorized, ensure_success, log_stream_failure, normalize, ChatRequest, ChatResult,
    GenerateRequest, Generation, LlmBackend, LlmError, RequestSettings, ToolDefinition,
};
use crate::history::ConversationTurn;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:1234/v1";

/// Client for OpenAI-style servers. Holds no conversation state.
#[derive(Clone, Default)]
pub struct OpenAiClient {
    client: reqwest::Client,
    policy: FragmentPolicy,
}

impl OpenAiClient {
    pub fn new(client: reqwest::Client, policy: FragmentPolicy) -> Self {
        Self { client, policy }
    }

    /// POST /chat/completions with stream: true and drain the event stream.
    async fn stream_completion(
        &self,
        settings: &RequestSettings,
        body: &OpenAiChatRequest<'_>,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<StreamState, LlmError> {
        let url = format!("{}/chat/completions", settings.endpoint.url);
        log::debug!(
            "openai: POST {} model={} messages={} tools={}",
            url,
            settings.model,
            body.messages.len(),
            body.tools.map_or(0, <[_]>::len)
        );
        let res = authorized(self.client.post(&url), &settings.endpoint)
            .json(body)
            .send()
            .await?;
        let res = ensure_success(res).await?;

        let mut stream = res.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut state = StreamState::new(self.policy);

        'stream: while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    log_stream_failure("openai", settings, body.messages.len(), &state.content, &e);
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
        log::debug!(
            "openai: done prompt_tokens={:?} completion_tokens={:?} finish_reason={:?}",
            state.prompt_tokens,
            state.completion_tokens,
            state.finish_reason
        );
        Ok(state)
    }
}

#[async_trait]
impl LlmBackend for OpenAiClient {
    async fn chat(
        &self,
        request: ChatRequest<'_>,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<ChatResult, LlmError> {
        let settings = request.settings;
        let body = OpenAiChatRequest::new(
            settings,
            messages_to_openai(request.messages),
            (!request.tools.is_empty()).then_some(request.tools),
        );
        let state = self.stream_completion(settings, &body, on_chunk).await?;
        let output_tokens = state.output_tokens(settings);
        let truncated = normalize::hit_predict_limit(&state.content, output_tokens, &settings.options);
        Ok(ChatResult {
            tool_calls: state.accumulator.finish(),
            truncated,
            thinking_text: (!state.thinking.is_empty()).then_some(state.thinking),
            content: state.content,
        })
    }

    /// Single-turn generation through the chat endpoint (system + user message).
    async fn generate(&self, request: GenerateRequest<'_>) -> Result<Generation, LlmError> {
        let settings = request.settings;
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system {
            messages.push(OpenAiMessage::System { content: system });
        }
        messages.push(OpenAiMessage::User {
            content: request.prompt,
        });
        let body = OpenAiChatRequest::new(settings, messages, None);
        let state = self
            .stream_completion(settings, &body, &mut |_: &str| {})
            .await?;
        let output_tokens = state.output_tokens(settings);
        Ok(normalize::finalize(&state.content, output_tokens, &settings.options))
    }
}

/// Everything gathered from one event stream.
struct StreamState {
    content: String,
    thinking: String,
    accumulator: StreamAccumulator,
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    finish_reason: Option<String>,
}

impl StreamState {
    fn new(policy: FragmentPolicy) -> Self {
        Self {
            content: String::new(),
            thinking: String::new(),
            accumulator: StreamAccumulator::new(policy),
            prompt_tokens: None,
            completion_tokens: None,
            finish_reason: None,
        }
    }

    /// Reported completion tokens; a "length" finish counts as a spent budget.
    fn output_tokens(&self, settings: &RequestSettings) -> Option<u32> {
        self.completion_tokens.or_else(|| {
            (self.finish_reason.as_deref() == Some("length")).then_some(settings.options.num_predict)
        })
    }

    /// Apply one SSE line; returns true on the [DONE] sentinel.
    fn handle_line(
        &mut self,
        line: &str,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<bool, LlmError> {
        let Some(data) = sse_data(line) else {
            return Ok(false);
        };
        if data == "[DONE]" {
            return Ok(true);
        }
        let ev: OpenAiStreamChunk = match serde_json::from_str(data) {
            Ok(ev) => ev,
            Err(e) => {
                log::debug!("openai: skipping unparsable event: {}", e);
                return Ok(false);
            }
        };
        if let Some(err) = ev.error {
            return Err(LlmError::Api(err.to_string()));
        }
        if let Some(usage) = ev.usage {
            self.prompt_tokens = usage.prompt_tokens.or(self.prompt_tokens);
            self.completion_tokens = usage.completion_tokens.or(self.completion_tokens);
        }
        let Some(choice) = ev.choices.into_iter().next() else {
            return Ok(false);
        };
        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(reason);
        }
        let Some(delta) = choice.delta else {
            return Ok(false);
        };
        if let Some(c) = delta.content.filter(|c| !c.is_empty()) {
            on_chunk(&c);
            self.content.push_str(&c);
        }
        if let Some(r) = delta.reasoning_content.or(delta.reasoning) {
            self.thinking.push_str(&r);
        }
        for (position, tc) in delta.tool_calls.into_iter().flatten().enumerate() {
            let function = tc.function.as_ref();
            self.accumulator.push(ToolCallFragment {
                index: tc.index.unwrap_or(position as u32),
                id: tc.id.as_deref(),
                name: function.and_then(|f| f.name.as_deref()),
                arguments: function.and_then(|f| f.arguments.as_deref()),
            });
        }
        Ok(false)
    }
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    stream: bool,
    stream_options: StreamOptions,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
}

impl<'a> OpenAiChatRequest<'a> {
    fn new(
        settings: &'a RequestSettings,
        messages: Vec<OpenAiMessage<'a>>,
        tools: Option<&'a [ToolDefinition]>,
    ) -> Self {
        Self {
            model: &settings.model,
            messages,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
            max_tokens: settings.options.num_predict,
            temperature: settings.options.temperature,
            top_p: settings.options.top_p,
            top_k: settings.options.top_k,
            stop: settings.stop.combined(),
            tools,
        }
    }
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
enum OpenAiMessage<'a> {
    System {
        content: &'a str,
    },
    User {
        content: &'a str,
    },
    Assistant {
        content: Option<&'a str>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<OpenAiToolCallRef<'a>>,
    },
    Tool {
        tool_call_id: &'a str,
        content: &'a str,
    },
}

#[derive(Debug, Serialize)]
struct OpenAiToolCallRef<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    typ: &'static str,
    function: OpenAiToolCallFunctionRef<'a>,
}

#[derive(Debug, Serialize)]
struct OpenAiToolCallFunctionRef<'a> {
    name: &'a str,
    arguments: &'a str,
}

/// Convert history to OpenAI messages; tool results keep their call ids.
fn messages_to_openai(turns: &[ConversationTurn]) -> Vec<OpenAiMessage<'_>> {
    turns
        .iter()
        .map(|turn| match turn {
            ConversationTurn::System { content } => OpenAiMessage::System { content },
            ConversationTurn::User { content } => OpenAiMessage::User { content },
            ConversationTurn::Assistant {
                content,
                tool_calls,
            } => OpenAiMessage::Assistant {
                content: (!content.is_empty() || tool_calls.is_empty()).then_some(content.as_str()),
                tool_calls: tool_calls
                    .iter()
                    .map(|c| OpenAiToolCallRef {
                        id: &c.id,
                        typ: "function",
                        function: OpenAiToolCallFunctionRef {
                            name: &c.name,
                            arguments: &c.arguments_json,
                        },
                    })
                    .collect(),
            },
            ConversationTurn::Tool {
                content,
                tool_call_id,
            } => OpenAiMessage::Tool {
                tool_call_id,
                content,
            },
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: Option<OpenAiStreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    tool_calls: Option<Vec<OpenAiStreamDeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDeltaToolCall {
    index: Option<u32>,
    id: Option<String>,
    function: Option<OpenAiStreamDeltaToolCallFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDeltaToolCallFunction {
    name: Option<String>,
    arguments: Option<String>,
}
