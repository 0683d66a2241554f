//! Client factory: one normalized entry point over the detected backend for a request category.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    BackendKind, CharacterEstimator, ChatRequest, ChatResult, Detected, DetectionCache, Endpoint,
    GenerateRequest, Generation, LlmBackend, LlmError, OllamaClient, OpenAiClient, TokenCounter,
};

/// Estimated provider overhead per request, in tokens.
const HIDDEN_OVERHEAD_TOKENS: u64 = 20;

/// Fast inline completion vs. deliberate instruction following (chat, agent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestCategory {
    Completion,
    Instruction,
}

impl std::fmt::Display for RequestCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completion => write!(f, "completion"),
            Self::Instruction => write!(f, "instruction"),
        }
    }
}

/// The two wire protocols behind one contract. A new protocol is a new variant.
#[derive(Clone)]
pub enum Backend {
    Ollama(OllamaClient),
    OpenAi(OpenAiClient),
}

impl Backend {
    pub fn for_detected(client: reqwest::Client, detected: &Detected) -> Self {
        match detected.backend {
            BackendKind::Ollama => Self::Ollama(OllamaClient::new(client)),
            BackendKind::OpenAi => Self::OpenAi(OpenAiClient::new(client, detected.fragment_policy)),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Ollama(_) => BackendKind::Ollama,
            Self::OpenAi(_) => BackendKind::OpenAi,
        }
    }
}

#[async_trait]
impl LlmBackend for Backend {
    async fn chat(
        &self,
        request: ChatRequest<'_>,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<ChatResult, LlmError> {
        match self {
            Self::Ollama(c) => c.chat(request, on_chunk).await,
            Self::OpenAi(c) => c.chat(request, on_chunk).await,
        }
    }

    async fn generate(&self, request: GenerateRequest<'_>) -> Result<Generation, LlmError> {
        match self {
            Self::Ollama(c) => c.generate(request).await,
            Self::OpenAi(c) => c.generate(request).await,
        }
    }
}

/// Fail unless the window leaves room for the requested output plus safety margins:
/// `ceil(predict * 1.01) + 20 <= context_window - prompt_tokens`, and `predict < context_window`.
pub fn check_headroom(
    predict_tokens: u32,
    prompt_tokens: usize,
    context_window: u32,
) -> Result<(), LlmError> {
    let predict = u64::from(predict_tokens);
    let window = u64::from(context_window);
    let required = (predict * 101).div_ceil(100) + HIDDEN_OVERHEAD_TOKENS;
    let available = window.saturating_sub(prompt_tokens as u64);
    if predict >= window || required > available {
        return Err(LlmError::ContextOverflow {
            required,
            available,
        });
    }
    Ok(())
}

/// Stateless front door for one request category. Backend selection is read from the
/// cache on every call, so invalidating the cache takes effect immediately.
#[derive(Clone)]
pub struct ClientFactory {
    category: RequestCategory,
    cache: Arc<DetectionCache>,
    http: reqwest::Client,
    counter: Arc<dyn TokenCounter>,
}

impl ClientFactory {
    pub fn new(category: RequestCategory, cache: Arc<DetectionCache>) -> Self {
        Self {
            category,
            cache,
            http: reqwest::Client::new(),
            counter: Arc::new(CharacterEstimator::default()),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn category(&self) -> RequestCategory {
        self.category
    }

    fn detected(&self) -> Result<Detected, LlmError> {
        self.cache
            .get(self.category)
            .ok_or(LlmError::BackendNotDetected(self.category))
    }

    pub fn backend(&self) -> Result<Backend, LlmError> {
        Ok(Backend::for_detected(self.http.clone(), &self.detected()?))
    }

    /// Probe `endpoint` with this factory's HTTP client and record the result for its category.
    pub async fn detect(&self, endpoint: &Endpoint, model: &str) -> Result<Detected, LlmError> {
        self.cache
            .detect(&self.http, self.category, endpoint, model)
            .await
    }
}

#[async_trait]
impl LlmBackend for ClientFactory {
    async fn chat(
        &self,
        request: ChatRequest<'_>,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<ChatResult, LlmError> {
        self.backend()?.chat(request, on_chunk).await
    }

    /// Pre-flight headroom check, then delegate. Overflow never reaches the network.
    async fn generate(&self, request: GenerateRequest<'_>) -> Result<Generation, LlmError> {
        let detected = self.detected()?;
        let options = &request.settings.options;
        let context_window = detected
            .context_length
            .map_or(options.num_ctx, |n| n.min(options.num_ctx));
        let prompt_tokens = self.counter.count(request.prompt)
            + request.system.map_or(0, |s| self.counter.count(s));
        if let Err(e) = check_headroom(options.num_predict, prompt_tokens, context_window) {
            log::warn!(
                "{}: {} (prompt_tokens={} num_predict={} context_window={})",
                self.category,
                e,
                prompt_tokens,
                options.num_predict,
                context_window
            );
            return Err(e);
        }
        Backend::for_detected(self.http.clone(), &detected)
            .generate(request)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Endpoint, ModelOptions, RequestSettings};

    struct FixedCount(usize);

    impl TokenCounter for FixedCount {
        fn count(&self, _text: &str) -> usize {
            self.0
        }
    }

    #[test]
    fn headroom_inequality() {
        assert!(matches!(
            check_headroom(100, 900, 1000),
            Err(LlmError::ContextOverflow {
                required: 121,
                available: 100
            })
        ));
        assert!(check_headroom(100, 900, 1200).is_ok());
        assert!(check_headroom(1000, 0, 1000).is_err());
        assert!(check_headroom(100, 2000, 1000).is_err());
    }

    #[tokio::test]
    async fn generate_without_detection_fails() {
        let factory = ClientFactory::new(RequestCategory::Completion, Arc::new(DetectionCache::new()));
        let settings = RequestSettings::default();
        let err = factory
            .generate(GenerateRequest {
                settings: &settings,
                prompt: "x",
                system: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::BackendNotDetected(RequestCategory::Completion)));
    }

    #[tokio::test]
    async fn overflow_is_reported_before_any_request() {
        let cache = Arc::new(DetectionCache::new());
        cache.set(RequestCategory::Completion, Detected::new(BackendKind::Ollama));
        let factory = ClientFactory::new(RequestCategory::Completion, cache)
            .with_token_counter(Arc::new(FixedCount(900)));
        // Nothing listens here; reaching the network would produce a Request error instead.
        let settings = RequestSettings {
            endpoint: Endpoint::new("http://127.0.0.1:9"),
            model: "m".into(),
            options: ModelOptions {
                num_ctx: 1000,
                num_predict: 100,
                ..ModelOptions::default()
            },
            ..RequestSettings::default()
        };
        let err = factory
            .generate(GenerateRequest {
                settings: &settings,
                prompt: "long prompt",
                system: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::ContextOverflow { .. }));
    }

    #[test]
    fn factory_selects_backend_from_cache() {
        let cache = Arc::new(DetectionCache::new());
        cache.set(
            RequestCategory::Instruction,
            Detected {
                context_length: Some(512),
                ..Detected::new(BackendKind::OpenAi)
            },
        );
        let factory = ClientFactory::new(RequestCategory::Instruction, cache);
        assert_eq!(factory.backend().unwrap().kind(), BackendKind::OpenAi);
    }
}
