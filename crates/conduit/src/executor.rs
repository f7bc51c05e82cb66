//! Execution of model-requested tool calls against the external tool sink.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::accumulator::ToolCallRequest;
use crate::context::ConversationContext;
use crate::errors::{ToolError, ToolResult};
use crate::models::tool::Tool;
use crate::notification::{Notification, NotificationType};
use crate::providers::utils::sanitize_function_name;

pub const DEFAULT_MAX_TOOL_OUTPUT_BYTES: usize = 50 * 1024;

/// Structured side effect a tool reports alongside its text result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolNotice {
    /// Free-form channel name; mapped onto [`NotificationType`].
    pub category: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_to_agent: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<ToolNotice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl ToolOutput {
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_notice(mut self, notice: ToolNotice) -> Self {
        self.notice = Some(notice);
        self
    }
}

/// The external side that actually implements tools.
#[async_trait]
pub trait ToolSink: Send + Sync {
    async fn call_tool(
        &self,
        name: &str,
        arguments: &Value,
        context: &ConversationContext,
    ) -> ToolResult<ToolOutput>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolAuditRecord {
    pub call_id: String,
    pub tool_name: String,
    pub input: Value,
    pub output: String,
    pub is_error: bool,
    #[serde(flatten)]
    pub context: ConversationContext,
    pub created: DateTime<Utc>,
}

/// Append-only audit trail of every tool invocation.
#[async_trait]
pub trait ToolHistory: Send + Sync {
    async fn record(&self, record: ToolAuditRecord) -> anyhow::Result<()>;
}

pub struct NoopToolHistory;

#[async_trait]
impl ToolHistory for NoopToolHistory {
    async fn record(&self, _record: ToolAuditRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Result of one tool call, ready to become a tool-result message.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub call_id: String,
    pub tool_name: String,
    pub output: String,
    pub is_error: bool,
    pub notification: Option<Notification>,
    pub explanation: Option<String>,
}

impl ToolOutcome {
    pub fn message_to_agent(&self) -> Option<&str> {
        self.notification
            .as_ref()
            .and_then(|n| n.message_to_agent.as_deref())
            .filter(|m| !m.trim().is_empty())
    }
}

pub struct ToolExecutor {
    sink: Arc<dyn ToolSink>,
    history: Arc<dyn ToolHistory>,
    max_output_bytes: usize,
}

impl ToolExecutor {
    pub fn new(sink: Arc<dyn ToolSink>, history: Arc<dyn ToolHistory>) -> Self {
        Self {
            sink,
            history,
            max_output_bytes: DEFAULT_MAX_TOOL_OUTPUT_BYTES,
        }
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    /// Text the model put in an `explanation` argument, streamed to the reader
    /// before the tool runs.
    pub fn explanation_for(call: &ToolCallRequest) -> Option<String> {
        call.parsed_arguments()
            .get("explanation")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(String::from)
    }

    /// Run every call concurrently. Outcomes are returned in request order no
    /// matter which call finishes first.
    pub async fn execute_all(
        &self,
        calls: &[ToolCallRequest],
        tools: &[Tool],
        context: &ConversationContext,
    ) -> Vec<ToolOutcome> {
        join_all(calls.iter().map(|call| self.execute(call, tools, context))).await
    }

    pub async fn execute(
        &self,
        call: &ToolCallRequest,
        tools: &[Tool],
        context: &ConversationContext,
    ) -> ToolOutcome {
        let arguments = call.parsed_arguments();
        let result = match resolve_tool(&call.name, tools) {
            Some(name) => self.invoke(name, &arguments, context).await,
            None => Err(ToolError::NotFound(call.name.clone())),
        };

        let outcome = match result {
            Ok(output) => ToolOutcome {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                output: truncate_output(output.text, self.max_output_bytes),
                is_error: false,
                notification: output
                    .notice
                    .and_then(|notice| notice_to_notification(&call.name, notice)),
                explanation: output.explanation,
            },
            Err(e) => {
                tracing::warn!(tool = %call.name, id = %call.id, error = %e, "tool call failed");
                ToolOutcome {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    output: format!("Error: {}", e),
                    is_error: true,
                    notification: None,
                    explanation: None,
                }
            }
        };

        let record = ToolAuditRecord {
            call_id: outcome.call_id.clone(),
            tool_name: outcome.tool_name.clone(),
            input: arguments,
            output: outcome.output.clone(),
            is_error: outcome.is_error,
            context: context.clone(),
            created: Utc::now(),
        };
        if let Err(e) = self.history.record(record).await {
            tracing::error!(tool = %call.name, error = %e, "failed to record tool history");
        }
        outcome
    }

    async fn invoke(
        &self,
        name: &str,
        arguments: &Value,
        context: &ConversationContext,
    ) -> ToolResult<ToolOutput> {
        match AssertUnwindSafe(self.sink.call_tool(name, arguments, context))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ToolError::Internal(format!("handler for {} panicked", name))),
        }
    }
}

/// Map the name the model used back to the declared tool. Vendors that require
/// sanitized names see `save_prd` for a tool declared as `save prd`.
fn resolve_tool<'a>(requested: &str, tools: &'a [Tool]) -> Option<&'a str> {
    tools
        .iter()
        .find(|tool| tool.name == requested)
        .or_else(|| {
            tools
                .iter()
                .find(|tool| sanitize_function_name(&tool.name) == requested)
        })
        .map(|tool| tool.name.as_str())
}

fn notice_to_notification(tool_name: &str, notice: ToolNotice) -> Option<Notification> {
    let notification_type = NotificationType::from_category(&notice.category);
    let mut fields = notice.payload;
    fields.insert("is_notification".into(), Value::Bool(true));
    fields.insert(
        "notification_type".into(),
        Value::String(notification_type.as_ref().to_string()),
    );
    fields
        .entry("function_name")
        .or_insert_with(|| Value::String(tool_name.to_string()));
    if let Some(message) = notice.message_to_agent {
        fields.insert("message_to_agent".into(), Value::String(message));
    }

    match serde_json::from_value(Value::Object(fields)) {
        Ok(notification) => Some(notification),
        Err(e) => {
            tracing::warn!(tool = tool_name, error = %e, "dropping malformed tool notification");
            None
        }
    }
}

/// Cut `output` to at most `max_bytes` on a character boundary and say how much
/// was left out.
pub fn truncate_output(output: String, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output;
    }
    let mut cut = max_bytes;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    let omitted = output.len() - cut;
    format!(
        "{}\n\n[Output truncated: {} bytes omitted]",
        &output[..cut],
        omitted
    )
}
