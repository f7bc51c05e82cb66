//! Reassembly of streamed tool calls.
//!
//! Vendors send a tool call as a start event carrying the id and name, followed
//! by argument fragments that only form valid JSON once concatenated. Several
//! calls may be open at once, keyed by their position in the response.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::models::tool::ToolCall;

/// A fully received tool call. `arguments` is the exact concatenation of every
/// fragment received for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCallRequest {
    /// Parsed arguments. An empty buffer is `{}`; so is one that does not parse,
    /// in which case the handler sees empty arguments and a warning is logged.
    pub fn parsed_arguments(&self) -> Value {
        if self.arguments.trim().is_empty() {
            return json!({});
        }
        match serde_json::from_str(&self.arguments) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    tool = %self.name,
                    id = %self.id,
                    error = %e,
                    "tool call arguments are not valid JSON, using empty arguments"
                );
                json!({})
            }
        }
    }

    pub fn to_tool_call(&self) -> ToolCall {
        ToolCall::new(self.name.clone(), self.parsed_arguments())
    }
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    buffer: String,
    ready: bool,
}

#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    pending: BTreeMap<usize, PendingToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the call at `index`. A repeated start for the same index fills in
    /// the id or name if they were missing but keeps any buffered arguments.
    pub fn start(&mut self, index: usize, id: impl Into<String>, name: impl Into<String>) {
        let slot = self.pending.entry(index).or_default();
        let (id, name) = (id.into(), name.into());
        if slot.id.is_empty() {
            slot.id = id;
        }
        if slot.name.is_empty() {
            slot.name = name;
        }
    }

    /// Append an argument fragment. A fragment for an index that never saw a
    /// start opens the slot anyway so no bytes are lost.
    pub fn push_delta(&mut self, index: usize, delta: &str) {
        self.pending.entry(index).or_default().buffer.push_str(delta);
    }

    pub fn finish(&mut self, index: usize) {
        match self.pending.get_mut(&index) {
            Some(slot) => slot.ready = true,
            None => tracing::warn!(index, "finish for a tool call that was never started"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take every finished call in index order and reset. Calls that never
    /// finished, or never received a name, are dropped with a warning.
    pub fn drain_ready(&mut self) -> Vec<ToolCallRequest> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .filter_map(|(index, slot)| {
                if !slot.ready {
                    tracing::warn!(index, tool = %slot.name, "dropping unfinished tool call");
                    return None;
                }
                if slot.name.is_empty() {
                    tracing::warn!(index, "dropping tool call without a name");
                    return None;
                }
                let id = if slot.id.is_empty() {
                    format!("call_{}", uuid::Uuid::new_v4().simple())
                } else {
                    slot.id
                };
                Some(ToolCallRequest {
                    id,
                    name: slot.name,
                    arguments: slot.buffer,
                })
            })
            .collect()
    }
}
