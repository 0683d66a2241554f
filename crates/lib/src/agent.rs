//! Agent loop: call the LLM with the conversation and tool schemas; when the model requests
//! tools, run them in order, append their results and call again, until the model answers
//! without tools, the round budget runs out, or the caller cancels.

use std::collections::HashSet;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::history::{Conversation, HistoryError};
use crate::llm::accumulator::synthesize_call_id;
use crate::llm::{ChatRequest, ChatResult, LlmBackend, LlmError, RequestSettings, ToolCallRequest};
use crate::tools::{error_payload, ToolRegistry};

pub const DEFAULT_MAX_ROUNDS: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct AgentConfig {
    /// Maximum model requests per run; tool requests beyond it are dropped.
    pub max_rounds: usize,
    pub think: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            think: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model replied without tool calls.
    Answered,
    /// The model still wanted tools when the last permitted round ended.
    RoundBudgetExhausted,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub rounds: usize,
    pub tool_calls_made: usize,
    /// Text of the last model response (already streamed to the caller).
    pub content: String,
    pub stop: StopReason,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Run the agent over `history`, streaming model text and tool announcements to `on_chunk`.
/// Tool failures are recovered into tool turns; backend failures end the run.
pub async fn run_turn<B: LlmBackend + ?Sized>(
    backend: &B,
    settings: &RequestSettings,
    history: &mut Conversation,
    tools: &ToolRegistry,
    config: AgentConfig,
    on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    cancel: &CancellationToken,
) -> Result<AgentOutcome, AgentError> {
    let definitions = tools.definitions();
    let max_rounds = config.max_rounds.max(1);
    let mut rounds = 0;
    let mut tool_calls_made = 0;
    let mut last_content = String::new();

    loop {
        if cancel.is_cancelled() {
            log::info!("agent: cancelled after {} round(s)", rounds);
            return Ok(AgentOutcome {
                rounds,
                tool_calls_made,
                content: last_content,
                stop: StopReason::Cancelled,
            });
        }

        rounds += 1;
        log::debug!(
            "agent: round {}/{} model={} turns={}",
            rounds,
            max_rounds,
            settings.model,
            history.len()
        );
        let ChatResult {
            content,
            mut tool_calls,
            truncated,
            ..
        } = backend
            .chat(
                ChatRequest {
                    settings,
                    messages: history.turns(),
                    tools: &definitions,
                    think: config.think,
                },
                &mut *on_chunk,
            )
            .await?;
        if truncated {
            log::info!("agent: response in round {} hit num_predict", rounds);
        }
        last_content = content.clone();

        if tool_calls.is_empty() {
            history.push_assistant(content, Vec::new());
            return Ok(AgentOutcome {
                rounds,
                tool_calls_made,
                content: last_content,
                stop: StopReason::Answered,
            });
        }

        if rounds >= max_rounds {
            log::info!(
                "agent: round budget of {} exhausted, dropping {} pending tool call(s)",
                max_rounds,
                tool_calls.len()
            );
            history.push_assistant(content, Vec::new());
            return Ok(AgentOutcome {
                rounds,
                tool_calls_made,
                content: last_content,
                stop: StopReason::RoundBudgetExhausted,
            });
        }

        ensure_unique_ids(&mut tool_calls);
        history.push_assistant(content, tool_calls.clone());
        for call in &tool_calls {
            let output = execute_call(tools, call, on_chunk).await;
            history.push_tool_result(call.id.as_str(), output)?;
            tool_calls_made += 1;
        }
    }
}

/// Each result must link to exactly one call, so empty or repeated ids get fresh ones.
fn ensure_unique_ids(calls: &mut [ToolCallRequest]) {
    let mut seen = HashSet::new();
    for call in calls.iter_mut() {
        if call.id.is_empty() || !seen.insert(call.id.clone()) {
            let fresh = synthesize_call_id();
            log::debug!("agent: tool call id {:?} reassigned to {}", call.id, fresh);
            call.id = fresh;
            seen.insert(call.id.clone());
        }
    }
}

/// Announce the call, then dispatch it. Malformed arguments become an error payload.
async fn execute_call(
    tools: &ToolRegistry,
    call: &ToolCallRequest,
    on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
) -> String {
    let raw = if call.arguments_json.trim().is_empty() {
        "{}"
    } else {
        call.arguments_json.as_str()
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(args) => {
            let pretty = serde_json::to_string_pretty(&args).unwrap_or_else(|_| raw.to_string());
            on_chunk(&format_tool_use(&call.name, &pretty));
            tools.execute(&call.name, args).await
        }
        Err(e) => {
            on_chunk(&format_tool_use(&call.name, raw));
            log::warn!("agent: tool {} called with malformed arguments: {}", call.name, e);
            error_payload(&format!("invalid JSON arguments: {}", e))
        }
    }
}

/// Markdown announcement shown to the user while a tool runs.
pub fn format_tool_use(name: &str, arguments: &str) -> String {
    format!("\n\n**Tool use:** `{}`\n```json\n{}\n```\n\n", name, arguments)
}
