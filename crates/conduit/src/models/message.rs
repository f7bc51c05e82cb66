use super::content::{DocumentContent, ImageContent, TextContent};
use super::role::Role;
use super::tool::ToolCall;
use chrono::Utc;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolRequest {
    pub id: String,
    pub tool_call: ToolCall,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolResponse {
    pub id: String,
    pub output: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
/// Content passed inside a message, which can be both simple content and tool content
pub enum MessageContent {
    Text(TextContent),
    Image(ImageContent),
    Document(DocumentContent),
    ToolRequest(ToolRequest),
    ToolResponse(ToolResponse),
}

impl MessageContent {
    pub fn text<S: Into<String>>(text: S) -> Self {
        MessageContent::Text(TextContent { text: text.into() })
    }

    pub fn image<S: Into<String>, T: Into<String>>(data: S, mime_type: T) -> Self {
        MessageContent::Image(ImageContent {
            data: data.into(),
            mime_type: mime_type.into(),
        })
    }

    pub fn document<S: Into<String>, T: Into<String>>(
        data: S,
        mime_type: T,
        name: Option<String>,
    ) -> Self {
        MessageContent::Document(DocumentContent {
            data: data.into(),
            mime_type: mime_type.into(),
            name,
        })
    }

    pub fn tool_request<S: Into<String>>(id: S, tool_call: ToolCall) -> Self {
        MessageContent::ToolRequest(ToolRequest {
            id: id.into(),
            tool_call,
        })
    }

    pub fn tool_response<S: Into<String>, O: Into<String>>(id: S, output: O, is_error: bool) -> Self {
        MessageContent::ToolResponse(ToolResponse {
            id: id.into(),
            output: output.into(),
            is_error,
        })
    }

    pub fn as_tool_request(&self) -> Option<&ToolRequest> {
        if let MessageContent::ToolRequest(ref tool_request) = self {
            Some(tool_request)
        } else {
            None
        }
    }

    pub fn as_tool_response(&self) -> Option<&ToolResponse> {
        if let MessageContent::ToolResponse(ref tool_response) = self {
            Some(tool_response)
        } else {
            None
        }
    }

    /// Get the text content if this is a TextContent variant
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(text) => Some(&text.text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
/// A message to or from an LLM
pub struct Message {
    pub role: Role,
    pub created: i64,
    pub content: Vec<MessageContent>,
}

impl Message {
    fn with_role(role: Role) -> Self {
        Message {
            role,
            created: Utc::now().timestamp(),
            content: Vec::new(),
        }
    }

    pub fn system() -> Self {
        Self::with_role(Role::System)
    }

    /// Create a new user message with the current timestamp
    pub fn user() -> Self {
        Self::with_role(Role::User)
    }

    /// Create a new assistant message with the current timestamp
    pub fn assistant() -> Self {
        Self::with_role(Role::Assistant)
    }

    /// Tool results are carried by messages with the tool role
    pub fn tool() -> Self {
        Self::with_role(Role::Tool)
    }

    /// Add any MessageContent to the message
    pub fn with_content(mut self, content: MessageContent) -> Self {
        self.content.push(content);
        self
    }

    /// Add text content to the message
    pub fn with_text<S: Into<String>>(self, text: S) -> Self {
        self.with_content(MessageContent::text(text))
    }

    /// Add image content to the message
    pub fn with_image<S: Into<String>, T: Into<String>>(self, data: S, mime_type: T) -> Self {
        self.with_content(MessageContent::image(data, mime_type))
    }

    /// Add a tool request to the message
    pub fn with_tool_request<S: Into<String>>(self, id: S, tool_call: ToolCall) -> Self {
        self.with_content(MessageContent::tool_request(id, tool_call))
    }

    /// Add a tool response to the message
    pub fn with_tool_response<S: Into<String>, O: Into<String>>(
        self,
        id: S,
        output: O,
        is_error: bool,
    ) -> Self {
        self.with_content(MessageContent::tool_response(id, output, is_error))
    }

    /// Concatenation of every text part
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_requests(&self) -> impl Iterator<Item = &ToolRequest> {
        self.content.iter().filter_map(|c| c.as_tool_request())
    }

    pub fn tool_responses(&self) -> impl Iterator<Item = &ToolResponse> {
        self.content.iter().filter_map(|c| c.as_tool_response())
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Read a caller-supplied `{role, content}` object. `content` may be a string or
    /// an ordered list of typed parts (`text`, `image`, `document`, `tool_use`,
    /// `tool_result`). Returns None for unknown roles.
    pub fn from_value(value: &Value) -> Option<Self> {
        let role = match value.get("role")?.as_str()? {
            "system" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            _ => return None,
        };
        let mut message = Self::with_role(role);

        match value.get("content") {
            Some(Value::String(text)) => {
                if role == Role::Tool {
                    let id = value
                        .get("tool_call_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    message = message.with_tool_response(id, text.as_str(), false);
                } else {
                    message = message.with_text(text.as_str());
                }
            }
            Some(Value::Array(parts)) => {
                for part in parts {
                    if let Some(content) = part_from_value(part) {
                        message = message.with_content(content);
                    }
                }
            }
            _ => {}
        }

        // OpenAI-style tool calls attached next to the content
        if let Some(calls) = value.get("tool_calls").and_then(|v| v.as_array()) {
            for call in calls {
                let id = call.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                let function = call.get("function").unwrap_or(call);
                let name = function
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let arguments = match function.get("arguments") {
                    Some(Value::String(raw)) => {
                        serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({}))
                    }
                    Some(other) => other.clone(),
                    None => serde_json::json!({}),
                };
                message = message.with_tool_request(id, ToolCall::new(name, arguments));
            }
        }

        Some(message)
    }
}

fn part_from_value(part: &Value) -> Option<MessageContent> {
    let str_field = |key: &str| part.get(key).and_then(|v| v.as_str());
    match str_field("type")? {
        "text" => Some(MessageContent::text(str_field("text")?)),
        "image" => Some(MessageContent::image(
            str_field("data")?,
            str_field("mime_type").unwrap_or("image/png"),
        )),
        "document" => Some(MessageContent::document(
            str_field("data")?,
            str_field("mime_type").unwrap_or("application/pdf"),
            str_field("name").map(String::from),
        )),
        "tool_use" => Some(MessageContent::tool_request(
            str_field("id")?,
            ToolCall::new(
                str_field("name")?,
                part.get("input").cloned().unwrap_or_else(|| serde_json::json!({})),
            ),
        )),
        "tool_result" => {
            let output = match part.get("content") {
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            Some(MessageContent::tool_response(
                str_field("tool_use_id")?,
                output,
                part.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false),
            ))
        }
        other => {
            tracing::warn!(part_type = other, "ignoring unknown message part");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_plain_text() {
        let message = Message::from_value(&json!({"role": "user", "content": "hi"})).unwrap();
        assert_eq!(message.role, Role::User);
        assert_eq!(message.text(), "hi");
    }

    #[test]
    fn test_from_value_typed_parts() {
        let message = Message::from_value(&json!({
            "role": "assistant",
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "call_1", "name": "lookup", "input": {"q": "x"}},
                {"type": "hologram"}
            ]
        }))
        .unwrap();

        assert_eq!(message.content.len(), 2);
        let request = message.tool_requests().next().unwrap();
        assert_eq!(request.id, "call_1");
        assert_eq!(request.tool_call.arguments, json!({"q": "x"}));
    }

    #[test]
    fn test_from_value_tool_role_string() {
        let message = Message::from_value(&json!({
            "role": "tool",
            "tool_call_id": "call_9",
            "content": "42"
        }))
        .unwrap();
        let response = message.tool_responses().next().unwrap();
        assert_eq!(response.id, "call_9");
        assert_eq!(response.output, "42");
        assert!(!response.is_error);
    }

    #[test]
    fn test_from_value_openai_tool_calls() {
        let message = Message::from_value(&json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_2",
                "type": "function",
                "function": {"name": "lookup", "arguments": "{\"a\":1}"}
            }]
        }))
        .unwrap();
        let request = message.tool_requests().next().unwrap();
        assert_eq!(request.tool_call.name, "lookup");
        assert_eq!(request.tool_call.arguments, json!({"a": 1}));
    }

    #[test]
    fn test_from_value_unknown_role() {
        assert!(Message::from_value(&json!({"role": "narrator", "content": "x"})).is_none());
    }
}
