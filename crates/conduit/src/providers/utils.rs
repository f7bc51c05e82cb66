use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::models::content::{DocumentContent, ImageContent};
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::{dedup_tools, Tool};

lazy_static! {
    static ref INVALID_FUNCTION_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub enum ImageFormat {
    OpenAi,
    Anthropic,
}

/// Convert internal Message format to the OpenAI chat completions message list.
/// Tool results become standalone `role: "tool"` messages following the turn
/// that carried them.
pub fn messages_to_openai_spec(messages: &[Message]) -> Vec<Value> {
    let mut messages_spec = Vec::new();

    for message in messages {
        let mut parts = Vec::new();
        let mut tool_calls = Vec::new();
        let mut output = Vec::new();

        for content in &message.content {
            match content {
                MessageContent::Text(text) => {
                    if !text.text.is_empty() {
                        parts.push(json!({"type": "text", "text": text.text}));
                    }
                }
                MessageContent::Image(image) => {
                    parts.push(convert_image(image, &ImageFormat::OpenAi));
                }
                MessageContent::Document(document) => {
                    parts.push(convert_document_openai(document));
                }
                MessageContent::ToolRequest(request) => {
                    tool_calls.push(json!({
                        "id": request.id,
                        "type": "function",
                        "function": {
                            "name": sanitize_function_name(&request.tool_call.name),
                            "arguments": request.tool_call.arguments.to_string(),
                        }
                    }));
                }
                MessageContent::ToolResponse(response) => {
                    let content = if response.is_error {
                        format!("The tool call returned the following error:\n{}", response.output)
                    } else {
                        response.output.clone()
                    };
                    output.push(json!({
                        "role": "tool",
                        "content": content,
                        "tool_call_id": response.id
                    }));
                }
            }
        }

        let role = match message.role {
            // Tool results have been split out above.
            Role::Tool => Role::User,
            role => role,
        };
        let mut converted = json!({ "role": role.as_str() });

        let only_text = parts.iter().all(|p| p["type"] == "text");
        if only_text && !parts.is_empty() {
            let text: Vec<&str> = parts.iter().filter_map(|p| p["text"].as_str()).collect();
            converted["content"] = json!(text.join("\n"));
        } else if !parts.is_empty() {
            converted["content"] = json!(parts);
        }
        if !tool_calls.is_empty() {
            converted["tool_calls"] = json!(tool_calls);
        }

        if converted.get("content").is_some() || converted.get("tool_calls").is_some() {
            output.insert(0, converted);
        }
        messages_spec.extend(output);
    }

    messages_spec
}

/// Convert an image content into an image json based on format
pub fn convert_image(image: &ImageContent, image_format: &ImageFormat) -> Value {
    match image_format {
        ImageFormat::OpenAi => json!({
            "type": "image_url",
            "image_url": {
                "url": format!("data:{};base64,{}", image.mime_type, image.data)
            }
        }),
        ImageFormat::Anthropic => json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": image.mime_type,
                "data": image.data,
            }
        }),
    }
}

fn convert_document_openai(document: &DocumentContent) -> Value {
    json!({
        "type": "file",
        "file": {
            "filename": document.file_name(),
            "file_data": format!("data:{};base64,{}", document.mime_type, document.data),
        }
    })
}

/// Convert internal Tool format to OpenAI's tool specification. Names are
/// sanitized and repeated names keep their first definition.
pub fn tools_to_openai_spec(tools: &[Tool]) -> Vec<Value> {
    dedup_tools(tools)
        .into_iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": sanitize_function_name(&tool.name),
                    "description": tool.description,
                    "parameters": tool.parameters,
                }
            })
        })
        .collect()
}

pub fn sanitize_function_name(name: &str) -> String {
    INVALID_FUNCTION_CHARS.replace_all(name, "_").to_string()
}

/// Insert `value` under `key` when the payload is an object.
pub fn set_field(payload: &mut Value, key: &str, value: Value) {
    if let Some(object) = payload.as_object_mut() {
        object.insert(key.to_string(), value);
    }
}
