//! Backend identity and context-window detection, kept in an explicitly owned cache.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use super::{authorized, ensure_success, Endpoint, FragmentPolicy, LlmError, RequestCategory};

/// Wire protocol family spoken by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    #[serde(rename = "ollama")]
    Ollama,
    #[serde(rename = "openai")]
    OpenAi,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ollama => write!(f, "ollama"),
            Self::OpenAi => write!(f, "openai"),
        }
    }
}

/// What is known about the endpoint serving one request category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detected {
    pub backend: BackendKind,
    /// Model context window as reported by the server, when it reports one.
    pub context_length: Option<u32>,
    pub fragment_policy: FragmentPolicy,
}

impl Detected {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            context_length: None,
            fragment_policy: FragmentPolicy::default(),
        }
    }
}

/// Detection results per request category. Owned by the caller and passed to each
/// [`super::ClientFactory`]; tests can seed it with fixed values.
#[derive(Debug, Default)]
pub struct DetectionCache {
    entries: RwLock<HashMap<RequestCategory, Detected>>,
}

impl DetectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, category: RequestCategory) -> Option<Detected> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&category)
            .copied()
    }

    pub fn set(&self, category: RequestCategory, detected: Detected) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(category, detected);
    }

    /// Forget one category, e.g. after its endpoint or model setting changed.
    pub fn invalidate(&self, category: RequestCategory) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&category);
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Probe the endpoint and store the result for the category.
    pub async fn detect(
        &self,
        client: &reqwest::Client,
        category: RequestCategory,
        endpoint: &Endpoint,
        model: &str,
    ) -> Result<Detected, LlmError> {
        let backend = detect_backend(client, endpoint).await?;
        let context_length = match detect_context_length(client, backend, endpoint, model).await {
            Ok(n) => n,
            Err(e) => {
                log::warn!("detect: context length unavailable for {}: {}", model, e);
                None
            }
        };
        let detected = Detected {
            context_length,
            ..Detected::new(backend)
        };
        log::info!(
            "detect: {} endpoint {} is {} (context_length={:?})",
            category,
            endpoint.url,
            backend,
            context_length
        );
        self.set(category, detected);
        Ok(detected)
    }
}

/// Ollama answers GET /api/version; OpenAI-style servers answer GET {base}/models.
pub async fn detect_backend(
    client: &reqwest::Client,
    endpoint: &Endpoint,
) -> Result<BackendKind, LlmError> {
    let version_url = format!("{}/api/version", endpoint.url);
    if let Ok(res) = authorized(client.get(&version_url), endpoint).send().await {
        if res.status().is_success() {
            if let Ok(v) = res.json::<serde_json::Value>().await {
                if v.get("version").is_some() {
                    return Ok(BackendKind::Ollama);
                }
            }
        }
    }
    let models_url = format!("{}/models", endpoint.url);
    let res = authorized(client.get(&models_url), endpoint).send().await?;
    if res.status().is_success() {
        return Ok(BackendKind::OpenAi);
    }
    Err(LlmError::Api(format!(
        "{} answered neither /api/version nor /models ({})",
        endpoint.url,
        res.status()
    )))
}

/// Context window of `model` as reported by the server, if any.
pub async fn detect_context_length(
    client: &reqwest::Client,
    backend: BackendKind,
    endpoint: &Endpoint,
    model: &str,
) -> Result<Option<u32>, LlmError> {
    match backend {
        BackendKind::Ollama => {
            let url = format!("{}/api/show", endpoint.url);
            let res = authorized(client.post(&url), endpoint)
                .json(&serde_json::json!({ "model": model }))
                .send()
                .await?;
            let body: serde_json::Value = ensure_success(res).await?.json().await?;
            Ok(ollama_context_length(&body))
        }
        BackendKind::OpenAi => {
            let url = format!("{}/models", endpoint.url);
            let res = authorized(client.get(&url), endpoint).send().await?;
            let body: serde_json::Value = ensure_success(res).await?.json().await?;
            Ok(openai_context_length(&body, model))
        }
    }
}

/// `model_info` holds e.g. `"llama.context_length": 131072`.
fn ollama_context_length(show: &serde_json::Value) -> Option<u32> {
    show.get("model_info")?
        .as_object()?
        .iter()
        .find(|(k, _)| k.ends_with(".context_length"))
        .and_then(|(_, v)| v.as_u64())
        .map(|n| n.min(u32::MAX as u64) as u32)
}

fn openai_context_length(models: &serde_json::Value, model: &str) -> Option<u32> {
    let entry = models
        .get("data")?
        .as_array()?
        .iter()
        .find(|m| m.get("id").and_then(|id| id.as_str()) == Some(model))?;
    ["context_length", "max_model_len", "max_context_length"]
        .iter()
        .find_map(|k| entry.get(*k).and_then(|v| v.as_u64()))
        .map(|n| n.min(u32::MAX as u64) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_set_get_invalidate() {
        let cache = DetectionCache::new();
        assert!(cache.get(RequestCategory::Completion).is_none());
        cache.set(RequestCategory::Completion, Detected::new(BackendKind::Ollama));
        cache.set(RequestCategory::Instruction, Detected::new(BackendKind::OpenAi));
        assert_eq!(
            cache.get(RequestCategory::Completion).map(|d| d.backend),
            Some(BackendKind::Ollama)
        );
        cache.invalidate(RequestCategory::Completion);
        assert!(cache.get(RequestCategory::Completion).is_none());
        assert!(cache.get(RequestCategory::Instruction).is_some());
        cache.clear();
        assert!(cache.get(RequestCategory::Instruction).is_none());
    }

    #[test]
    fn reads_ollama_model_info_context_length() {
        let show = serde_json::json!({
            "model_info": {"general.architecture": "qwen2", "qwen2.context_length": 32768}
        });
        assert_eq!(ollama_context_length(&show), Some(32768));
        assert_eq!(ollama_context_length(&serde_json::json!({})), None);
    }

    #[test]
    fn reads_openai_style_model_window() {
        let models = serde_json::json!({
            "data": [
                {"id": "other", "context_length": 1},
                {"id": "qwen-coder", "max_model_len": 16384}
            ]
        });
        assert_eq!(openai_context_length(&models, "qwen-coder"), Some(16384));
        assert_eq!(openai_context_length(&models, "missing"), None);
    }
}
