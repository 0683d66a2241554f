//! LLM abstraction: two streaming backends (Ollama, OpenAI-style) behind one contract.
//!
//! Callers go through [`ClientFactory`], which picks the adapter for a request category from a
//! [`DetectionCache`] and normalizes results into [`ChatResult`] / [`Generation`].

pub mod accumulator;
mod detect;
mod factory;
pub mod normalize;
mod ollama;
mod openai;
pub mod stream;
mod tokens;
mod types;

use async_trait::async_trait;

pub use accumulator::{FragmentPolicy, StreamAccumulator, ToolCallFragment};
pub use detect::{detect_backend, detect_context_length, BackendKind, DetectionCache, Detected};
pub use factory::{check_headroom, Backend, ClientFactory, RequestCategory};
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;
pub use tokens::{CharacterEstimator, TokenCounter};
pub use types::{
    ChatRequest, ChatResult, Endpoint, GenerateRequest, Generation, LlmError, ModelOptions,
    RequestSettings, StopTokens, ToolCallRequest, ToolDefinition, ToolFunctionDefinition,
};

pub const DEFAULT_OLLAMA_URL: &str = ollama::DEFAULT_BASE_URL;
pub const DEFAULT_OPENAI_URL: &str = openai::DEFAULT_BASE_URL;

/// One backend wire protocol. Implementations hold no conversation state.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Stream a chat turn. `on_chunk` receives each new text fragment, in order, never cumulative.
    async fn chat(
        &self,
        request: ChatRequest<'_>,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<ChatResult, LlmError>;

    /// Single-turn generation; the returned text is already normalized.
    async fn generate(&self, request: GenerateRequest<'_>) -> Result<Generation, LlmError>;
}

fn authorized(builder: reqwest::RequestBuilder, endpoint: &Endpoint) -> reqwest::RequestBuilder {
    match endpoint.token.as_deref() {
        Some(token) => builder.bearer_auth(token),
        None => builder,
    }
}

async fn ensure_success(res: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    Err(LlmError::Api(format!("{} {}", status, body)))
}

/// Transport failures mid-stream are fatal; log everything needed to diagnose them.
fn log_stream_failure(
    backend: &str,
    settings: &RequestSettings,
    message_count: usize,
    partial: &str,
    err: &reqwest::Error,
) {
    log::error!(
        "{}: stream failed url={} model={} messages={} options={:?} partial_chars={} partial={:?}: {}",
        backend,
        settings.endpoint.url,
        settings.model,
        message_count,
        settings.options,
        partial.len(),
        partial,
        err
    );
}
