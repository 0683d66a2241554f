//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.codepilot/config.json`) and environment.
//! Each request category has its own endpoint section; bearer tokens may come from env.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::agent::{AgentConfig, DEFAULT_MAX_ROUNDS};
use crate::llm::{
    BackendKind, Detected, Endpoint, FragmentPolicy, ModelOptions, RequestCategory,
    RequestSettings, StopTokens, DEFAULT_OLLAMA_URL,
};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Inline completion endpoint (fast model, small budget).
    #[serde(default = "default_completion")]
    pub completion: EndpointConfig,

    /// Chat and agent endpoint (instruction model).
    #[serde(default = "default_instruction")]
    pub instruction: EndpointConfig,

    #[serde(default)]
    pub agent: AgentSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            completion: default_completion(),
            instruction: default_instruction(),
            agent: AgentSettings::default(),
        }
    }
}

/// One LLM server and the model/options used against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Base URL. Ollama: server root (http://127.0.0.1:11434). OpenAI-style: API base (…/v1).
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default)]
    pub model: String,

    /// Skip detection and use this protocol ("ollama" or "openai").
    #[serde(default)]
    pub backend: Option<BackendKind>,

    /// Bearer token. Overridden by CODEPILOT_COMPLETION_TOKEN / CODEPILOT_INSTRUCTION_TOKEN.
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub options: ModelOptions,

    /// Stop tokens from the model's prompt template.
    #[serde(default)]
    pub model_stop: Vec<String>,

    /// Extra stop tokens chosen by the user.
    #[serde(default)]
    pub user_stop: Vec<String>,

    /// How anonymous tool-call argument fragments are merged (OpenAI-style streams).
    #[serde(default)]
    pub fragment_policy: FragmentPolicy,
}

/// Agent loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSettings {
    /// Maximum model requests per agent run.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,

    /// Ask reasoning models to think before answering.
    #[serde(default)]
    pub think: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            think: false,
        }
    }
}

impl AgentSettings {
    pub fn to_agent_config(&self) -> AgentConfig {
        AgentConfig {
            max_rounds: self.max_rounds,
            think: self.think,
        }
    }
}

fn default_url() -> String {
    DEFAULT_OLLAMA_URL.to_string()
}

fn default_max_rounds() -> usize {
    DEFAULT_MAX_ROUNDS
}

fn default_completion() -> EndpointConfig {
    EndpointConfig {
        url: default_url(),
        model: String::new(),
        backend: None,
        token: None,
        options: ModelOptions {
            num_ctx: 4096,
            num_predict: 256,
            temperature: 0.1,
            ..ModelOptions::default()
        },
        model_stop: Vec::new(),
        user_stop: Vec::new(),
        fragment_policy: FragmentPolicy::default(),
    }
}

fn default_instruction() -> EndpointConfig {
    EndpointConfig {
        options: ModelOptions {
            num_ctx: 8192,
            num_predict: 2048,
            temperature: 0.3,
            ..ModelOptions::default()
        },
        ..default_completion()
    }
}

impl Config {
    pub fn endpoint(&self, category: RequestCategory) -> &EndpointConfig {
        match category {
            RequestCategory::Completion => &self.completion,
            RequestCategory::Instruction => &self.instruction,
        }
    }

    /// Request settings for a category, with the token resolved from env or config.
    pub fn request_settings(&self, category: RequestCategory) -> RequestSettings {
        let ep = self.endpoint(category);
        RequestSettings {
            endpoint: Endpoint::new(&ep.url).with_token(resolve_token(self, category)),
            model: ep.model.trim().to_string(),
            options: ep.options,
            stop: StopTokens {
                model_stop: ep.model_stop.clone(),
                user_stop: ep.user_stop.clone(),
            },
        }
    }

    /// Detection entry for a category whose backend is fixed in config.
    pub fn configured_backend(&self, category: RequestCategory) -> Option<Detected> {
        let ep = self.endpoint(category);
        ep.backend.map(|backend| Detected {
            fragment_policy: ep.fragment_policy,
            ..Detected::new(backend)
        })
    }
}

fn token_env_var(category: RequestCategory) -> &'static str {
    match category {
        RequestCategory::Completion => "CODEPILOT_COMPLETION_TOKEN",
        RequestCategory::Instruction => "CODEPILOT_INSTRUCTION_TOKEN",
    }
}

/// Resolve the bearer token for a category: env overrides config.
pub fn resolve_token(config: &Config, category: RequestCategory) -> Option<String> {
    std::env::var(token_env_var(category))
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .endpoint(category)
                .token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CODEPILOT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".codepilot").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, or the default path. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s).with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
