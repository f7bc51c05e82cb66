use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures raised by a tool handler. These never escape the executor: they are
/// rendered into a textual tool result so the model can react to them.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ToolResult<T> = Result<T, ToolError>;

/// Failures raised while talking to an LLM vendor.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// HTTP 5xx or a network failure; retried with backoff before surfacing.
    #[error("Provider temporarily unavailable ({status:?}): {message}")]
    Transient {
        status: Option<u16>,
        message: String,
    },

    /// Authentication, configuration or request errors; surfaced immediately.
    #[error("Provider request failed: {0}")]
    Fatal(String),

    #[error("No API key configured for {provider}")]
    MissingApiKey { provider: String },

    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),

    /// The response stream broke after it had started.
    #[error("Provider stream interrupted: {0}")]
    Stream(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }

    /// Text safe to show to the end user: no bodies beyond a short prefix, no
    /// debug formatting of nested errors.
    pub fn user_message(&self) -> String {
        match self {
            ProviderError::Transient { .. } | ProviderError::Stream(_) => {
                "The model provider is temporarily unavailable. Please try again in a moment."
                    .to_string()
            }
            ProviderError::MissingApiKey { provider } => format!(
                "No API key is configured for {}. Add a key in your settings to use this model.",
                provider
            ),
            ProviderError::ContextLengthExceeded(_) => {
                "This conversation is too long for the selected model. Start a new conversation or choose a model with a larger context window."
                    .to_string()
            }
            ProviderError::Fatal(message) => {
                format!("The model provider rejected the request: {}", truncate_for_display(message))
            }
        }
    }
}

const MAX_DISPLAY_CHARS: usize = 300;

fn truncate_for_display(message: &str) -> String {
    if message.chars().count() <= MAX_DISPLAY_CHARS {
        message.to_string()
    } else {
        let prefix: String = message.chars().take(MAX_DISPLAY_CHARS).collect();
        format!("{}…", prefix)
    }
}
