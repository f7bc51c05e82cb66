//! Structured side-channel events delivered inline with the text stream.
//!
//! A notification travels as `__NOTIFICATION__{json}__NOTIFICATION__` inside the
//! same string channel as display text. Everything that knows about that framing
//! lives in [`NotificationCodec`]; the orchestration loop only deals in typed
//! [`Notification`] values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, EnumIter};

pub const NOTIFICATION_SENTINEL: &str = "__NOTIFICATION__";

/// The sentinel re-spelled with a JSON unicode escape. The sentinel can only
/// occur inside JSON strings, where this spelling decodes to the same text.
const ESCAPED_SENTINEL: &str = "__\\u004eOTIFICATION__";

/// Channels a notification can be delivered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationType {
    Checklist,
    Prd,
    Implementation,
    Design,
    Apps,
    #[serde(rename = "toolhistory")]
    #[strum(serialize = "toolhistory")]
    ToolHistory,
    Codebase,
    FileStream,
    WebSearch,
}

impl NotificationType {
    /// Map a free-form category reported by a tool onto the fixed set of
    /// channels. Anything unrecognised lands on the tool history channel.
    pub fn from_category(category: &str) -> Self {
        match category.trim().to_ascii_lowercase().as_str() {
            "checklist" => NotificationType::Checklist,
            "prd" => NotificationType::Prd,
            "implementation" => NotificationType::Implementation,
            "design" => NotificationType::Design,
            "apps" => NotificationType::Apps,
            "codebase" => NotificationType::Codebase,
            "file_stream" => NotificationType::FileStream,
            "web_search" => NotificationType::WebSearch,
            _ => NotificationType::ToolHistory,
        }
    }
}

fn always_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default = "always_true")]
    pub is_notification: bool,
    pub notification_type: NotificationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_notification: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_chunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_complete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    /// Follow-up the loop re-injects into the conversation as a system turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_to_agent: Option<String>,
    /// Channel specific fields we pass through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Notification {
    pub fn new(notification_type: NotificationType) -> Self {
        Self {
            is_notification: true,
            notification_type,
            early_notification: None,
            function_name: None,
            content_chunk: None,
            is_complete: None,
            file_id: None,
            file_name: None,
            file_type: None,
            message_to_agent: None,
            extra: Map::new(),
        }
    }

    pub fn early(mut self) -> Self {
        self.early_notification = Some(true);
        self
    }

    pub fn with_function_name<S: Into<String>>(mut self, name: S) -> Self {
        self.function_name = Some(name.into());
        self
    }

    pub fn with_content_chunk<S: Into<String>>(mut self, chunk: S) -> Self {
        self.content_chunk = Some(chunk.into());
        self
    }

    pub fn with_complete(mut self, is_complete: bool) -> Self {
        self.is_complete = Some(is_complete);
        self
    }

    pub fn with_file<I, N, T>(mut self, file_id: Option<I>, file_name: N, file_type: T) -> Self
    where
        I: Into<String>,
        N: Into<String>,
        T: Into<String>,
    {
        self.file_id = file_id.map(Into::into);
        self.file_name = Some(file_name.into());
        self.file_type = Some(file_type.into());
        self
    }

    pub fn with_message_to_agent<S: Into<String>>(mut self, message: S) -> Self {
        self.message_to_agent = Some(message.into());
        self
    }

    pub fn with_extra<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// One piece of a decoded text stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Notification(Notification),
}

pub struct NotificationCodec;

impl NotificationCodec {
    /// Serialize a notification into its self-delimited wire form.
    pub fn encode(notification: &Notification) -> String {
        match serde_json::to_string(notification) {
            Ok(mut json) => {
                // Overlapping occurrences survive a single pass.
                while json.contains(NOTIFICATION_SENTINEL) {
                    json = json.replace(NOTIFICATION_SENTINEL, ESCAPED_SENTINEL);
                }
                format!("{}{}{}", NOTIFICATION_SENTINEL, json, NOTIFICATION_SENTINEL)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize notification");
                String::new()
            }
        }
    }

    /// Decode a single frame. Surrounding whitespace is tolerated; anything else
    /// that is not exactly one well-formed frame yields None.
    pub fn decode(frame: &str) -> Option<Notification> {
        let inner = frame
            .trim()
            .strip_prefix(NOTIFICATION_SENTINEL)?
            .strip_suffix(NOTIFICATION_SENTINEL)?;
        if inner.contains(NOTIFICATION_SENTINEL) {
            return None;
        }
        serde_json::from_str(inner).ok()
    }

    pub fn is_frame(text: &str) -> bool {
        text.contains(NOTIFICATION_SENTINEL)
    }

    /// Split arbitrary text into ordered text and notification pieces. A sentinel
    /// pair whose payload does not parse is passed through verbatim as text.
    pub fn split(text: &str) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut pending = String::new();
        let mut rest = text;

        while let Some(start) = rest.find(NOTIFICATION_SENTINEL) {
            let after_open = &rest[start + NOTIFICATION_SENTINEL.len()..];
            let Some(len) = after_open.find(NOTIFICATION_SENTINEL) else {
                break;
            };
            pending.push_str(&rest[..start]);
            let payload = &after_open[..len];
            let consumed = start + 2 * NOTIFICATION_SENTINEL.len() + len;

            match serde_json::from_str::<Notification>(payload) {
                Ok(notification) => {
                    if !pending.is_empty() {
                        frames.push(Frame::Text(std::mem::take(&mut pending)));
                    }
                    frames.push(Frame::Notification(notification));
                }
                Err(_) => pending.push_str(&rest[start..consumed]),
            }
            rest = &rest[consumed..];
        }

        pending.push_str(rest);
        if !pending.is_empty() {
            frames.push(Frame::Text(pending));
        }
        frames
    }
}
