//! Conversation history: an ordered log of typed turns.
//!
//! Owned by the caller (the agent loop, or the plain chat path). Clients never keep
//! history between calls, so callers may truncate and resend freely.

use serde::{Deserialize, Serialize};

use crate::llm::ToolCallRequest;

/// A single turn, discriminated by role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ConversationTurn {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(default)]
        content: String,
        #[serde(default, rename = "toolCalls", skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRequest>,
    },
    Tool {
        content: String,
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
    },
}

impl ConversationTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::Tool { .. } => "tool",
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::System { content }
            | Self::User { content }
            | Self::Assistant { content, .. }
            | Self::Tool { content, .. } => content,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("tool result for {0} does not answer a call in the preceding assistant turn")]
    UnmatchedToolResult(String),
    #[error("duplicate tool result for {0}")]
    DuplicateToolResult(String),
}

/// Append-only turn log with tool linkage checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    turns: Vec<ConversationTurn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system(content: impl Into<String>) -> Self {
        Self {
            turns: vec![ConversationTurn::system(content)],
        }
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.turns.push(ConversationTurn::user(content));
    }

    pub fn push_system(&mut self, content: impl Into<String>) {
        self.turns.push(ConversationTurn::system(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) {
        self.turns.push(ConversationTurn::Assistant {
            content: content.into(),
            tool_calls,
        });
    }

    /// Append a tool result. The id must answer a call of the assistant turn that
    /// directly precedes the current run of tool turns, and may be answered once.
    pub fn push_tool_result(
        &mut self,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<(), HistoryError> {
        let tool_call_id = tool_call_id.into();
        check_tool_link(&self.turns, &tool_call_id)?;
        self.turns.push(ConversationTurn::Tool {
            content: content.into(),
            tool_call_id,
        });
        Ok(())
    }

    /// Drop every turn from `len` on, e.g. to edit and resend an earlier message.
    pub fn truncate(&mut self, len: usize) {
        self.turns.truncate(len);
    }

    /// Check the tool linkage invariant over the whole history.
    pub fn validate(&self) -> Result<(), HistoryError> {
        for (i, turn) in self.turns.iter().enumerate() {
            if let ConversationTurn::Tool { tool_call_id, .. } = turn {
                check_tool_link(&self.turns[..i], tool_call_id)?;
            }
        }
        Ok(())
    }
}

impl From<Vec<ConversationTurn>> for Conversation {
    fn from(turns: Vec<ConversationTurn>) -> Self {
        Self { turns }
    }
}

/// Walk back over the trailing tool turns to the assistant turn they answer.
fn check_tool_link(prior: &[ConversationTurn], id: &str) -> Result<(), HistoryError> {
    for turn in prior.iter().rev() {
        match turn {
            ConversationTurn::Tool { tool_call_id, .. } => {
                if tool_call_id == id {
                    return Err(HistoryError::DuplicateToolResult(id.to_string()));
                }
            }
            ConversationTurn::Assistant { tool_calls, .. } => {
                return if tool_calls.iter().any(|c| c.id == id) {
                    Ok(())
                } else {
                    Err(HistoryError::UnmatchedToolResult(id.to_string()))
                };
            }
            _ => break,
        }
    }
    Err(HistoryError::UnmatchedToolResult(id.to_string()))
}
