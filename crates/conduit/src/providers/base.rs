use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, EnumIter};

use crate::errors::ProviderError;
use crate::models::message::Message;
use crate::models::tool::Tool;

/// The vendors we can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Xai,
    Google,
}

impl ProviderKind {
    /// Pick the vendor serving a model from its name.
    pub fn from_model(model: &str) -> Option<Self> {
        let model = model.trim().to_lowercase();
        let bare = model.rsplit('/').next().unwrap_or(&model);
        if bare.starts_with("claude") {
            Some(ProviderKind::Anthropic)
        } else if bare.starts_with("gpt")
            || bare.starts_with("chatgpt")
            || ["o1", "o3", "o4"].iter().any(|p| bare.starts_with(p))
        {
            Some(ProviderKind::OpenAi)
        } else if bare.starts_with("grok") {
            Some(ProviderKind::Xai)
        } else if bare.starts_with("gemini") {
            Some(ProviderKind::Google)
        } else {
            None
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "Anthropic",
            ProviderKind::OpenAi => "OpenAI",
            ProviderKind::Xai => "xAI",
            ProviderKind::Google => "Google",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Other(String),
}

/// One normalized event from a vendor stream.
///
/// Within a round an adapter emits exactly one `UsageInfo` followed by
/// `Finish`, unless the round ends with an `Error`, which is always the last
/// event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    ToolCallArgumentDelta {
        index: usize,
        delta: String,
    },
    ToolCallDone {
        index: usize,
    },
    /// The vendor's raw usage object, or None when it sent nothing usable.
    UsageInfo(Option<Value>),
    /// The vendor ran its built-in web search.
    WebSearch {
        query: String,
    },
    Finish(FinishReason),
    Error(ProviderError),
}

/// Base trait for the LLM vendors.
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn model(&self) -> &str;

    /// Start one round. The stream never fails as a whole; problems arrive as a
    /// final [`StreamEvent::Error`].
    fn stream<'a>(&'a self, messages: &'a [Message], tools: &'a [Tool]) -> BoxStream<'a, StreamEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_from_model() {
        assert_eq!(
            ProviderKind::from_model("claude-sonnet-4-20250514"),
            Some(ProviderKind::Anthropic)
        );
        assert_eq!(ProviderKind::from_model("gpt-4o-mini"), Some(ProviderKind::OpenAi));
        assert_eq!(ProviderKind::from_model("o3"), Some(ProviderKind::OpenAi));
        assert_eq!(ProviderKind::from_model("grok-3-latest"), Some(ProviderKind::Xai));
        assert_eq!(
            ProviderKind::from_model("models/gemini-2.5-pro"),
            Some(ProviderKind::Google)
        );
        assert_eq!(ProviderKind::from_model("llama3"), None);
    }

    #[test]
    fn test_kind_names() {
        let names: Vec<_> = ProviderKind::iter().map(|k| k.as_ref().to_string()).collect();
        assert_eq!(names, vec!["anthropic", "openai", "xai", "google"]);
        assert_eq!(
            serde_json::to_value(ProviderKind::OpenAi).unwrap(),
            serde_json::json!("openai")
        );
    }
}
