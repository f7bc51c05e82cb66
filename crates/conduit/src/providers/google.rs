use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use futures::stream::BoxStream;
use reqwest::{Client, Response};
use serde_json::{json, Map, Value};

use super::base::{FinishReason, Provider, ProviderKind, StreamEvent};
use super::configs::GoogleProviderConfig;
use super::retry::{check_status, classify_request_error, with_backoff};
use super::sse::{decode_stream, error_stream, EventDecoder};
use super::utils::{sanitize_function_name, set_field};
use crate::errors::ProviderError;
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::{dedup_tools, Tool};

/// JSON-Schema keywords the Gemini function declaration schema rejects.
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["$schema", "additionalProperties", "$defs", "definitions", "examples"];

pub struct GoogleProvider {
    client: Client,
    config: GoogleProviderConfig,
}

impl GoogleProvider {
    pub fn new(config: GoogleProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    /// Returns the system instruction and the `contents` list. Function
    /// responses travel in a user turn and must repeat the function name, which
    /// is recovered from the call id.
    fn messages_to_google_spec(messages: &[Message]) -> (Option<Value>, Vec<Value>) {
        let leading = messages
            .iter()
            .take_while(|m| m.role == Role::System)
            .count();
        let system: Vec<Value> = messages[..leading]
            .iter()
            .map(|m| m.text())
            .filter(|t| !t.is_empty())
            .map(|text| json!({"text": text}))
            .collect();
        let system = (!system.is_empty()).then(|| json!({"parts": system}));

        let mut call_names: HashMap<&str, &str> = HashMap::new();
        let mut contents: Vec<(&'static str, Vec<Value>)> = Vec::new();

        for message in &messages[leading..] {
            let role = match message.role {
                Role::Assistant => "model",
                _ => "user",
            };
            let mut parts = Vec::new();
            for content in &message.content {
                match content {
                    MessageContent::Text(text) => {
                        if !text.text.trim().is_empty() {
                            parts.push(json!({"text": text.text}));
                        }
                    }
                    MessageContent::Image(image) => parts.push(json!({
                        "inlineData": {"mimeType": image.mime_type, "data": image.data}
                    })),
                    MessageContent::Document(document) => parts.push(json!({
                        "inlineData": {"mimeType": document.mime_type, "data": document.data}
                    })),
                    MessageContent::ToolRequest(request) => {
                        call_names.insert(&request.id, &request.tool_call.name);
                        parts.push(json!({
                            "functionCall": {
                                "name": sanitize_function_name(&request.tool_call.name),
                                "args": request.tool_call.arguments,
                            }
                        }));
                    }
                    MessageContent::ToolResponse(response) => {
                        let name = call_names.get(response.id.as_str()).copied().unwrap_or_else(|| {
                            tracing::warn!(id = %response.id, "function response without a matching call");
                            "unknown"
                        });
                        let key = if response.is_error { "error" } else { "result" };
                        let part = json!({
                            "functionResponse": {
                                "name": sanitize_function_name(name),
                                "response": {key: response.output},
                            }
                        });
                        push_parts(&mut contents, "user", vec![part]);
                    }
                }
            }
            push_parts(&mut contents, role, parts);
        }

        let contents = contents
            .into_iter()
            .map(|(role, parts)| json!({"role": role, "parts": parts}))
            .collect();
        (system, contents)
    }

    fn tools_to_google_spec(&self, tools: &[Tool]) -> Vec<Value> {
        let declarations: Vec<Value> = dedup_tools(tools)
            .into_iter()
            .map(|tool| {
                let mut declaration = json!({
                    "name": sanitize_function_name(&tool.name),
                    "description": tool.description,
                });
                let has_properties = tool.parameters["properties"]
                    .as_object()
                    .is_some_and(|p| !p.is_empty());
                if has_properties {
                    set_field(&mut declaration, "parameters", clean_schema(&tool.parameters));
                }
                declaration
            })
            .collect();

        if !declarations.is_empty() {
            vec![json!({"functionDeclarations": declarations})]
        } else if self.config.web_search {
            // Search grounding cannot be combined with function calling.
            vec![json!({"google_search": {}})]
        } else {
            vec![]
        }
    }

    fn create_request(&self, messages: &[Message], tools: &[Tool]) -> Value {
        let (system, contents) = Self::messages_to_google_spec(messages);
        let mut payload = json!({ "contents": contents });
        if let Some(system) = system {
            set_field(&mut payload, "systemInstruction", system);
        }
        let tools_spec = self.tools_to_google_spec(tools);
        if !tools_spec.is_empty() {
            set_field(&mut payload, "tools", json!(tools_spec));
        }

        let mut generation = Map::new();
        if let Some(temp) = self.config.temperature {
            generation.insert("temperature".into(), json!(temp));
        }
        if let Some(tokens) = self.config.max_tokens {
            generation.insert("maxOutputTokens".into(), json!(tokens));
        }
        if !generation.is_empty() {
            set_field(&mut payload, "generationConfig", Value::Object(generation));
        }
        payload
    }

    async fn post(&self, payload: &Value) -> Result<Response, ProviderError> {
        let model = self.config.model.trim_start_matches("models/");
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.config.host.trim_end_matches('/'),
            model
        );
        let url = &url;

        with_backoff(&self.config.retry, || async move {
            let response = self
                .client
                .post(url)
                .header("x-goog-api-key", &self.config.api_key)
                .json(payload)
                .send()
                .await
                .map_err(classify_request_error)?;
            check_status(response).await
        })
        .await
    }
}

fn push_parts(contents: &mut Vec<(&'static str, Vec<Value>)>, role: &'static str, parts: Vec<Value>) {
    if parts.is_empty() {
        return;
    }
    match contents.last_mut() {
        Some((last_role, existing)) if *last_role == role => existing.extend(parts),
        _ => contents.push((role, parts)),
    }
}

/// Drop schema keywords Gemini does not accept, at any depth.
fn clean_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), clean_schema(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(clean_schema).collect()),
        other => other.clone(),
    }
}

impl Provider for GoogleProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn stream<'a>(&'a self, messages: &'a [Message], tools: &'a [Tool]) -> BoxStream<'a, StreamEvent> {
        if self.config.api_key.trim().is_empty() {
            return error_stream(ProviderError::MissingApiKey {
                provider: ProviderKind::Google.display_name().to_string(),
            });
        }
        let payload = self.create_request(messages, tools);
        tracing::debug!(
            provider = "google",
            model = %self.config.model,
            messages = messages.len(),
            tools = tools.len(),
            "starting generate content stream"
        );
        decode_stream(
            async move { self.post(&payload).await },
            GoogleDecoder::default(),
        )
    }
}

/// Gemini sends whole function calls in one part, so each becomes a complete
/// start/arguments/done triple with a generated id.
#[derive(Debug, Default)]
struct GoogleDecoder {
    next_index: usize,
    saw_function_calls: bool,
    searches: HashSet<String>,
    usage: Option<Value>,
    finish: Option<FinishReason>,
}

impl EventDecoder for GoogleDecoder {
    fn on_data(&mut self, data: &str) -> Vec<StreamEvent> {
        let chunk: Value = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable stream chunk");
                return vec![];
            }
        };
        if let Some(error) = chunk.get("error") {
            let message = error["message"].as_str().unwrap_or("unknown error").to_string();
            let status = error["code"].as_u64().map(|c| c as u16);
            return vec![StreamEvent::Error(match status {
                Some(code) if code >= 500 || code == 429 => ProviderError::Transient {
                    status: Some(code),
                    message,
                },
                _ => ProviderError::Fatal(message),
            })];
        }
        if let Some(reason) = chunk["promptFeedback"]["blockReason"].as_str() {
            return vec![StreamEvent::Error(ProviderError::Fatal(format!(
                "prompt blocked: {}",
                reason
            )))];
        }
        if let Some(usage) = chunk.get("usageMetadata").filter(|u| u.is_object()) {
            self.usage = Some(usage.clone());
        }

        let mut events = Vec::new();
        let candidate = &chunk["candidates"][0];
        for part in candidate["content"]["parts"].as_array().into_iter().flatten() {
            if let Some(text) = part["text"].as_str() {
                if !text.is_empty() && !part["thought"].as_bool().unwrap_or(false) {
                    events.push(StreamEvent::TextDelta(text.to_string()));
                }
            } else if let Some(call) = part.get("functionCall") {
                let index = self.next_index;
                self.next_index += 1;
                self.saw_function_calls = true;
                let arguments = match &call["args"] {
                    Value::Null => "{}".to_string(),
                    args => args.to_string(),
                };
                events.push(StreamEvent::ToolCallStart {
                    index,
                    id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                    name: call["name"].as_str().unwrap_or_default().to_string(),
                });
                events.push(StreamEvent::ToolCallArgumentDelta {
                    index,
                    delta: arguments,
                });
                events.push(StreamEvent::ToolCallDone { index });
            }
        }

        for query in candidate["groundingMetadata"]["webSearchQueries"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
        {
            if self.searches.insert(query.to_string()) {
                events.push(StreamEvent::WebSearch {
                    query: query.to_string(),
                });
            }
        }

        if let Some(reason) = candidate["finishReason"].as_str() {
            self.finish = Some(finish_reason(reason));
        }
        events
    }

    fn on_end(&mut self) -> Vec<StreamEvent> {
        let finish = match self.finish.take() {
            Some(FinishReason::Stop) | None if self.saw_function_calls => FinishReason::ToolCalls,
            Some(reason) => reason,
            None => FinishReason::Stop,
        };
        vec![
            StreamEvent::UsageInfo(self.usage.take()),
            StreamEvent::Finish(finish),
        ]
    }
}

fn finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            FinishReason::ContentFilter
        }
        other => FinishReason::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tool::ToolCall;
    use crate::providers::retry::RetryConfig;
    use futures::StreamExt;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(host: String) -> GoogleProvider {
        let mut config = GoogleProviderConfig::new("goog-key", "gemini-2.5-flash");
        config.host = host;
        config.retry = RetryConfig::new(3, Duration::from_millis(5));
        GoogleProvider::new(config).unwrap()
    }

    #[test]
    fn test_messages_to_google_spec() {
        let messages = vec![
            Message::system().with_text("Answer in French."),
            Message::user().with_text("Weather?").with_image("aW1n", "image/jpeg"),
            Message::assistant()
                .with_tool_request("call_a", ToolCall::new("get weather", json!({"city": "Paris"}))),
            Message::tool().with_tool_response("call_a", "sunny", false),
        ];

        let (system, contents) = GoogleProvider::messages_to_google_spec(&messages);

        assert_eq!(system.unwrap()["parts"][0]["text"], "Answer in French.");
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["parts"][1]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "get_weather");
        assert_eq!(contents[2]["role"], "user");
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"],
            json!({"name": "get_weather", "response": {"result": "sunny"}})
        );
    }

    #[test]
    fn test_search_only_without_function_tools() {
        let provider = provider("http://localhost".into());
        assert_eq!(provider.tools_to_google_spec(&[]), vec![json!({"google_search": {}})]);

        let tools = vec![
            Tool::new(
                "lookup",
                "Find",
                json!({
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {"q": {"type": "string", "additionalProperties": false}}
                }),
            ),
            Tool::new("ping", "No arguments", json!({"type": "object", "properties": {}})),
        ];
        let spec = provider.tools_to_google_spec(&tools);
        assert_eq!(spec.len(), 1);
        let declarations = &spec[0]["functionDeclarations"];
        assert_eq!(
            declarations[0]["parameters"],
            json!({"type": "object", "properties": {"q": {"type": "string"}}})
        );
        assert!(declarations[1].get("parameters").is_none());
    }

    #[tokio::test]
    async fn test_stream_function_call_and_usage() -> Result<()> {
        let chunks = [
            json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "Let me check. "}]}}],
                   "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 2, "totalTokenCount": 12}}),
            json!({"candidates": [{"content": {"role": "model", "parts": [
                      {"functionCall": {"name": "lookup", "args": {"q": "tides"}}}
                  ]}, "finishReason": "STOP"}],
                   "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 9, "totalTokenCount": 19}}),
        ];
        let body: String = chunks.iter().map(|c| format!("data: {}\r\n\r\n", c)).collect();

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.5-flash:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .and(header("x-goog-api-key", "goog-key"))
            .and(body_partial_json(json!({"systemInstruction": {"parts": [{"text": "Be nice."}]}})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let provider = provider(mock_server.uri());
        let messages = vec![
            Message::system().with_text("Be nice."),
            Message::user().with_text("tides?"),
        ];
        let tools = vec![Tool::new("lookup", "", json!({"type": "object"}))];
        let events: Vec<_> = provider.stream(&messages, &tools).collect().await;

        assert_eq!(events.len(), 6);
        assert_eq!(events[0], StreamEvent::TextDelta("Let me check. ".into()));
        let StreamEvent::ToolCallStart { index, id, name } = &events[1] else {
            panic!("expected tool call start, got {:?}", events[1]);
        };
        assert_eq!((*index, name.as_str()), (0, "lookup"));
        assert!(id.starts_with("call_"));
        assert_eq!(
            events[2],
            StreamEvent::ToolCallArgumentDelta {
                index: 0,
                delta: "{\"q\":\"tides\"}".into()
            }
        );
        assert_eq!(events[3], StreamEvent::ToolCallDone { index: 0 });
        assert_eq!(
            events[4],
            StreamEvent::UsageInfo(Some(
                json!({"promptTokenCount": 10, "candidatesTokenCount": 9, "totalTokenCount": 19})
            ))
        );
        assert_eq!(events[5], StreamEvent::Finish(FinishReason::ToolCalls));
        Ok(())
    }

    #[tokio::test]
    async fn test_service_unavailable_is_retried() -> Result<()> {
        let body = format!(
            "data: {}\n\n",
            json!({"candidates": [{"content": {"parts": [{"text": "ok"}]}, "finishReason": "STOP"}]})
        );
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let provider = provider(mock_server.uri());
        let messages = vec![Message::user().with_text("hi")];
        let events: Vec<_> = provider.stream(&messages, &[]).collect().await;
        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("ok".into()),
                StreamEvent::UsageInfo(None),
                StreamEvent::Finish(FinishReason::Stop),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_grounding_queries_and_thoughts() {
        let mut decoder = GoogleDecoder::default();
        let chunk = json!({"candidates": [{
            "content": {"parts": [{"text": "thinking...", "thought": true}, {"text": "Answer"}]},
            "groundingMetadata": {"webSearchQueries": ["tide tables", "tide tables"]}
        }]});
        let mut events = decoder.on_data(&chunk.to_string());
        events.extend(decoder.on_data(&chunk.to_string()));
        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("Answer".into()),
                StreamEvent::WebSearch {
                    query: "tide tables".into()
                },
                StreamEvent::TextDelta("Answer".into()),
            ]
        );
    }
}
