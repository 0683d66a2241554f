//! Codepilot core library: streaming LLM clients for Ollama and OpenAI-style servers,
//! conversation history, tool dispatch and the agent loop used by the editor plugin.

pub mod agent;
pub mod config;
pub mod history;
pub mod llm;
pub mod tools;
