//! Reassembly of tool calls that arrive as index-keyed fragments (OpenAI-style streams).
//!
//! Entries are only complete once the stream has ended; read them through [`StreamAccumulator::finish`].

use std::collections::BTreeMap;

use super::ToolCallRequest;

/// How a fragment without an id but with arguments is merged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FragmentPolicy {
    /// An anonymous fragment carrying arguments is the provider's consolidated
    /// argument string: it replaces what was accumulated for that index.
    #[default]
    ReplaceOnAnonymous,
    /// Every argument fragment is appended, anonymous or not.
    AlwaysAppend,
}

/// One tool-call delta as found in a stream chunk.
#[derive(Debug, Clone, Default)]
pub struct ToolCallFragment<'a> {
    pub index: u32,
    pub id: Option<&'a str>,
    pub name: Option<&'a str>,
    pub arguments: Option<&'a str>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Partially built tool calls keyed by stream index. One per in-flight request.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    policy: FragmentPolicy,
    calls: BTreeMap<u32, PartialCall>,
}

impl StreamAccumulator {
    pub fn new(policy: FragmentPolicy) -> Self {
        Self {
            policy,
            calls: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn push(&mut self, fragment: ToolCallFragment<'_>) {
        let entry = self.calls.entry(fragment.index).or_default();
        let anonymous = fragment.id.map_or(true, str::is_empty);
        if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
            if entry.id.is_empty() {
                entry.id = id.to_string();
            }
        }
        if let Some(name) = fragment.name {
            entry.name.push_str(name);
        }
        if let Some(args) = fragment.arguments.filter(|a| !a.is_empty()) {
            if anonymous && self.policy == FragmentPolicy::ReplaceOnAnonymous {
                entry.arguments.clear();
            }
            entry.arguments.push_str(args);
        }
    }

    /// Finalize in index order. Calls without a name are dropped; missing ids are synthesized.
    pub fn finish(self) -> Vec<ToolCallRequest> {
        self.calls
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| ToolCallRequest {
                id: if c.id.is_empty() {
                    synthesize_call_id()
                } else {
                    c.id
                },
                name: c.name,
                arguments_json: if c.arguments.trim().is_empty() {
                    "{}".to_string()
                } else {
                    c.arguments
                },
            })
            .collect()
    }
}

pub(crate) fn synthesize_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}
