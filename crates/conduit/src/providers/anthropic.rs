use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use futures::stream::BoxStream;
use reqwest::{Client, Response};
use serde_json::{json, Value};

use super::base::{FinishReason, Provider, ProviderKind, StreamEvent};
use super::configs::{AnthropicProviderConfig, DEFAULT_MAX_TOKENS};
use super::retry::{check_status, classify_request_error, with_backoff};
use super::sse::{decode_stream, error_stream, EventDecoder};
use super::utils::{convert_image, sanitize_function_name, set_field, ImageFormat};
use crate::errors::ProviderError;
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::{dedup_tools, Tool};

pub const ANTHROPIC_API_VERSION: &str = "2023-06-01";
const WEB_SEARCH_TOOL: &str = "web_search";
const WEB_SEARCH_MAX_USES: u32 = 5;

pub struct AnthropicProvider {
    client: Client,
    config: AnthropicProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    /// Leading system turns become the top-level system prompt. Anything else
    /// is folded into alternating user/assistant turns, with tool results as
    /// `tool_result` blocks inside a user turn.
    fn messages_to_anthropic_spec(messages: &[Message]) -> (String, Vec<Value>) {
        let leading = messages
            .iter()
            .take_while(|m| m.role == Role::System)
            .count();
        let system = messages[..leading]
            .iter()
            .map(|m| m.text())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut turns: Vec<(&'static str, Vec<Value>)> = Vec::new();
        for message in &messages[leading..] {
            let mut blocks = Vec::new();
            let mut results = Vec::new();

            for content in &message.content {
                match content {
                    MessageContent::Text(text) => {
                        if !text.text.trim().is_empty() {
                            blocks.push(json!({"type": "text", "text": text.text}));
                        }
                    }
                    MessageContent::Image(image) => {
                        blocks.push(convert_image(image, &ImageFormat::Anthropic));
                    }
                    MessageContent::Document(document) => {
                        blocks.push(json!({
                            "type": "document",
                            "source": {
                                "type": "base64",
                                "media_type": document.mime_type,
                                "data": document.data,
                            },
                            "title": document.file_name(),
                        }));
                    }
                    MessageContent::ToolRequest(request) => {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": request.id,
                            "name": sanitize_function_name(&request.tool_call.name),
                            "input": request.tool_call.arguments,
                        }));
                    }
                    MessageContent::ToolResponse(response) => {
                        results.push(json!({
                            "type": "tool_result",
                            "tool_use_id": response.id,
                            "content": response.output,
                            "is_error": response.is_error,
                        }));
                    }
                }
            }

            let role = match message.role {
                Role::Assistant => "assistant",
                _ => "user",
            };
            if !results.is_empty() {
                // Results must open the user turn that answers the tool calls.
                push_turn(&mut turns, "user", results);
            }
            push_turn(&mut turns, role, blocks);
        }

        let messages = turns
            .into_iter()
            .map(|(role, content)| json!({"role": role, "content": content}))
            .collect();
        (system, messages)
    }

    fn tools_to_anthropic_spec(&self, tools: &[Tool]) -> Vec<Value> {
        let mut names = HashSet::new();
        let mut spec: Vec<Value> = dedup_tools(tools)
            .into_iter()
            .map(|tool| {
                let name = sanitize_function_name(&tool.name);
                names.insert(name.clone());
                json!({
                    "name": name,
                    "description": tool.description,
                    "input_schema": tool.parameters,
                })
            })
            .collect();

        if self.config.web_search && !names.contains(WEB_SEARCH_TOOL) {
            spec.push(json!({
                "type": "web_search_20250305",
                "name": WEB_SEARCH_TOOL,
                "max_uses": WEB_SEARCH_MAX_USES,
            }));
        }
        spec
    }

    fn create_request(&self, messages: &[Message], tools: &[Tool]) -> Value {
        let (system, messages) = Self::messages_to_anthropic_spec(messages);
        let mut payload = json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": self.config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": true,
        });
        if !system.is_empty() {
            set_field(&mut payload, "system", json!(system));
        }
        let tools_spec = self.tools_to_anthropic_spec(tools);
        if !tools_spec.is_empty() {
            set_field(&mut payload, "tools", json!(tools_spec));
        }
        if let Some(temp) = self.config.temperature {
            set_field(&mut payload, "temperature", json!(temp));
        }
        payload
    }

    async fn post(&self, payload: &Value) -> Result<Response, ProviderError> {
        let url = format!("{}/v1/messages", self.config.host.trim_end_matches('/'));
        let url = &url;

        with_backoff(&self.config.retry, || async move {
            let response = self
                .client
                .post(url)
                .header("x-api-key", &self.config.api_key)
                .header("anthropic-version", ANTHROPIC_API_VERSION)
                .json(payload)
                .send()
                .await
                .map_err(classify_request_error)?;
            check_status(response).await
        })
        .await
    }
}

/// Append blocks to the conversation, merging into the previous turn when it
/// has the same role.
fn push_turn(turns: &mut Vec<(&'static str, Vec<Value>)>, role: &'static str, blocks: Vec<Value>) {
    if blocks.is_empty() {
        return;
    }
    match turns.last_mut() {
        Some((last_role, content)) if *last_role == role => content.extend(blocks),
        _ => turns.push((role, blocks)),
    }
}

impl Provider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn stream<'a>(&'a self, messages: &'a [Message], tools: &'a [Tool]) -> BoxStream<'a, StreamEvent> {
        if self.config.api_key.trim().is_empty() {
            return error_stream(ProviderError::MissingApiKey {
                provider: ProviderKind::Anthropic.display_name().to_string(),
            });
        }
        let payload = self.create_request(messages, tools);
        tracing::debug!(
            provider = "anthropic",
            model = %self.config.model,
            messages = messages.len(),
            tools = tools.len(),
            "starting messages stream"
        );
        decode_stream(
            async move { self.post(&payload).await },
            AnthropicDecoder::default(),
        )
    }
}

/// Decoder for the Messages API event stream.
#[derive(Debug, Default)]
struct AnthropicDecoder {
    tool_blocks: BTreeSet<usize>,
    /// Input JSON of server-side tool calls, keyed by block index.
    server_tools: HashMap<usize, String>,
    usage: Option<Value>,
    finish: Option<FinishReason>,
}

impl AnthropicDecoder {
    fn merge_usage(&mut self, usage: &Value) {
        let Some(fields) = usage.as_object() else {
            return;
        };
        let merged = self.usage.get_or_insert_with(|| json!({}));
        for (key, value) in fields.iter().filter(|(_, v)| !v.is_null()) {
            set_field(merged, key, value.clone());
        }
    }

    fn block_start(&mut self, index: usize, block: &Value) -> Vec<StreamEvent> {
        match block["type"].as_str() {
            Some("text") => block["text"]
                .as_str()
                .filter(|t| !t.is_empty())
                .map(|t| StreamEvent::TextDelta(t.to_string()))
                .into_iter()
                .collect(),
            Some("tool_use") => {
                self.tool_blocks.insert(index);
                vec![StreamEvent::ToolCallStart {
                    index,
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                }]
            }
            Some("server_tool_use") => {
                self.server_tools.insert(index, String::new());
                vec![]
            }
            _ => vec![],
        }
    }

    fn block_delta(&mut self, index: usize, delta: &Value) -> Vec<StreamEvent> {
        match delta["type"].as_str() {
            Some("text_delta") => delta["text"]
                .as_str()
                .filter(|t| !t.is_empty())
                .map(|t| StreamEvent::TextDelta(t.to_string()))
                .into_iter()
                .collect(),
            Some("input_json_delta") => {
                let partial = delta["partial_json"].as_str().unwrap_or_default();
                if let Some(buffer) = self.server_tools.get_mut(&index) {
                    buffer.push_str(partial);
                    return vec![];
                }
                if self.tool_blocks.contains(&index) && !partial.is_empty() {
                    return vec![StreamEvent::ToolCallArgumentDelta {
                        index,
                        delta: partial.to_string(),
                    }];
                }
                vec![]
            }
            _ => vec![],
        }
    }

    fn block_stop(&mut self, index: usize) -> Vec<StreamEvent> {
        if self.tool_blocks.remove(&index) {
            return vec![StreamEvent::ToolCallDone { index }];
        }
        if let Some(input) = self.server_tools.remove(&index) {
            let query = serde_json::from_str::<Value>(&input)
                .ok()
                .and_then(|v| v["query"].as_str().map(String::from))
                .unwrap_or_default();
            return vec![StreamEvent::WebSearch { query }];
        }
        vec![]
    }
}

impl EventDecoder for AnthropicDecoder {
    fn on_data(&mut self, data: &str) -> Vec<StreamEvent> {
        let event: Value = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable stream event");
                return vec![];
            }
        };
        let index = event["index"].as_u64().map(|i| i as usize);

        match (event["type"].as_str().unwrap_or_default(), index) {
            ("message_start", _) => {
                let usage = event["message"]["usage"].clone();
                self.merge_usage(&usage);
                vec![]
            }
            ("content_block_start", Some(index)) => self.block_start(index, &event["content_block"]),
            ("content_block_delta", Some(index)) => self.block_delta(index, &event["delta"]),
            ("content_block_stop", Some(index)) => self.block_stop(index),
            ("message_delta", _) => {
                if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                    self.finish = Some(stop_reason(reason));
                }
                let usage = event["usage"].clone();
                self.merge_usage(&usage);
                vec![]
            }
            ("error", _) => vec![StreamEvent::Error(stream_error(&event["error"]))],
            _ => vec![],
        }
    }

    fn on_end(&mut self) -> Vec<StreamEvent> {
        vec![
            StreamEvent::UsageInfo(self.usage.take()),
            StreamEvent::Finish(self.finish.take().unwrap_or(FinishReason::Stop)),
        ]
    }
}

fn stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "tool_use" => FinishReason::ToolCalls,
        "max_tokens" => FinishReason::Length,
        "refusal" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

fn stream_error(error: &Value) -> ProviderError {
    let message = error["message"].as_str().unwrap_or("unknown error").to_string();
    match error["type"].as_str() {
        Some("overloaded_error") | Some("api_error") | Some("rate_limit_error") => {
            ProviderError::Transient {
                status: None,
                message,
            }
        }
        Some("invalid_request_error") if message.contains("prompt is too long") => {
            ProviderError::ContextLengthExceeded(message)
        }
        _ => ProviderError::Fatal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tool::ToolCall;
    use crate::providers::retry::RetryConfig;
    use futures::StreamExt;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse(events: &[Value]) -> String {
        events
            .iter()
            .map(|e| format!("event: {}\ndata: {}\n\n", e["type"].as_str().unwrap_or(""), e))
            .collect()
    }

    fn provider(host: String) -> AnthropicProvider {
        let mut config = AnthropicProviderConfig::new("test_api_key", "claude-sonnet-4-20250514");
        config.host = host;
        config.retry = RetryConfig::new(3, Duration::from_millis(5));
        AnthropicProvider::new(config).unwrap()
    }

    #[test]
    fn test_messages_to_anthropic_spec() {
        let messages = vec![
            Message::system().with_text("You are terse."),
            Message::user().with_text("Look up two things."),
            Message::assistant()
                .with_text("Sure.")
                .with_tool_request("t1", ToolCall::new("lookup", json!({"q": "a"})))
                .with_tool_request("t2", ToolCall::new("lookup", json!({"q": "b"}))),
            Message::tool().with_tool_response("t1", "A", false),
            Message::tool().with_tool_response("t2", "boom", true),
            Message::system().with_text("Now summarise."),
        ];

        let (system, spec) = AnthropicProvider::messages_to_anthropic_spec(&messages);

        assert_eq!(system, "You are terse.");
        assert_eq!(spec.len(), 3);
        assert_eq!(spec[1]["role"], "assistant");
        assert_eq!(spec[1]["content"][1]["type"], "tool_use");
        assert_eq!(spec[1]["content"][2]["input"], json!({"q": "b"}));

        // Both results and the follow-up share one user turn.
        assert_eq!(spec[2]["role"], "user");
        let content = spec[2]["content"].as_array().unwrap();
        assert_eq!(content.len(), 3);
        assert_eq!(content[0]["tool_use_id"], "t1");
        assert_eq!(content[1]["is_error"], true);
        assert_eq!(content[2]["text"], "Now summarise.");
    }

    #[test]
    fn test_tools_spec_adds_web_search_once() {
        let provider = provider("http://localhost".into());
        let tools = vec![
            Tool::new("save prd", "Save", json!({"type": "object"})),
            Tool::new("save prd", "Duplicate", json!({})),
        ];
        let spec = provider.tools_to_anthropic_spec(&tools);
        assert_eq!(spec.len(), 2);
        assert_eq!(spec[0]["name"], "save_prd");
        assert_eq!(spec[0]["input_schema"]["type"], "object");
        assert_eq!(spec[1]["type"], "web_search_20250305");
        assert_eq!(spec[1]["max_uses"], 5);

        let own = vec![Tool::new("web_search", "Mine", json!({}))];
        assert_eq!(provider.tools_to_anthropic_spec(&own).len(), 1);
    }

    #[tokio::test]
    async fn test_stream_text_tool_and_usage() -> Result<()> {
        let body = sse(&[
            json!({"type": "message_start", "message": {"usage": {"input_tokens": 25, "output_tokens": 1, "cache_read_input_tokens": 0}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "ping"}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Checking"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "lookup", "input": {}}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"q\": "}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "\"x\"}"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 40}}),
            json!({"type": "message_stop"}),
        ]);

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test_api_key"))
            .and(header("anthropic-version", ANTHROPIC_API_VERSION))
            .and(body_partial_json(json!({"system": "Be brief.", "stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let provider = provider(mock_server.uri());
        let messages = vec![
            Message::system().with_text("Be brief."),
            Message::user().with_text("find x"),
        ];
        let events: Vec<_> = provider.stream(&messages, &[]).collect().await;

        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("Checking".into()),
                StreamEvent::ToolCallStart {
                    index: 1,
                    id: "toolu_1".into(),
                    name: "lookup".into()
                },
                StreamEvent::ToolCallArgumentDelta {
                    index: 1,
                    delta: "{\"q\": ".into()
                },
                StreamEvent::ToolCallArgumentDelta {
                    index: 1,
                    delta: "\"x\"}".into()
                },
                StreamEvent::ToolCallDone { index: 1 },
                StreamEvent::UsageInfo(Some(
                    json!({"input_tokens": 25, "output_tokens": 40, "cache_read_input_tokens": 0})
                )),
                StreamEvent::Finish(FinishReason::ToolCalls),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_overloaded_mid_stream() -> Result<()> {
        let body = sse(&[
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hi"}}),
            json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "never"}}),
        ]);
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&mock_server)
            .await;

        let provider = provider(mock_server.uri());
        let messages = vec![Message::user().with_text("hi")];
        let events: Vec<_> = provider.stream(&messages, &[]).collect().await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::TextDelta("Hi".into()));
        assert!(matches!(&events[1], StreamEvent::Error(e) if e.is_transient()));
        Ok(())
    }

    #[test]
    fn test_server_web_search_is_reported() {
        let mut decoder = AnthropicDecoder::default();
        let events: Vec<_> = [
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "server_tool_use", "id": "srvtoolu_1", "name": "web_search"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"query\": \"rust 2024\"}"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "web_search_tool_result", "content": []}}),
            json!({"type": "content_block_stop", "index": 1}),
        ]
        .iter()
        .flat_map(|e| decoder.on_data(&e.to_string()))
        .collect();

        assert_eq!(
            events,
            vec![StreamEvent::WebSearch {
                query: "rust 2024".into()
            }]
        );
    }
}
