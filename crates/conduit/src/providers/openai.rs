use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Result;
use futures::stream::BoxStream;
use reqwest::{Client, Response};
use serde_json::{json, Value};

use super::base::{FinishReason, Provider, ProviderKind, StreamEvent};
use super::configs::OpenAiProviderConfig;
use super::retry::{check_status, classify_request_error, with_backoff};
use super::sse::{decode_stream, error_stream, EventDecoder};
use super::utils::{messages_to_openai_spec, set_field, tools_to_openai_spec};
use crate::errors::ProviderError;
use crate::models::message::Message;
use crate::models::tool::Tool;

pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn is_reasoning_model(&self) -> bool {
        let model = self.config.model.to_lowercase();
        ["o1", "o3", "o4"].iter().any(|p| model.starts_with(p))
    }

    fn create_request(&self, messages: &[Message], tools: &[Tool]) -> Value {
        let mut payload = json!({
            "model": self.config.model,
            "messages": messages_to_openai_spec(messages),
            "stream": true,
            "stream_options": {"include_usage": true},
        });

        let tools_spec = tools_to_openai_spec(tools);
        if !tools_spec.is_empty() {
            set_field(&mut payload, "tools", json!(tools_spec));
        }
        if let Some(temp) = self.config.temperature.filter(|_| !self.is_reasoning_model()) {
            set_field(&mut payload, "temperature", json!(temp));
        }
        if let Some(tokens) = self.config.max_tokens {
            let key = if self.is_reasoning_model() {
                "max_completion_tokens"
            } else {
                "max_tokens"
            };
            set_field(&mut payload, key, json!(tokens));
        }
        if self.config.web_search && self.config.model.contains("search") {
            set_field(&mut payload, "web_search_options", json!({}));
        }
        payload
    }

    async fn post(&self, payload: &Value) -> Result<Response, ProviderError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        );

        let url = &url;
        with_backoff(&self.config.retry, || async move {
            let response = self
                .client
                .post(url)
                .header("Authorization", format!("Bearer {}", self.config.api_key))
                .json(payload)
                .send()
                .await
                .map_err(classify_request_error)?;
            check_status(response).await
        })
        .await
    }
}

impl Provider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn stream<'a>(&'a self, messages: &'a [Message], tools: &'a [Tool]) -> BoxStream<'a, StreamEvent> {
        if self.config.api_key.trim().is_empty() {
            return error_stream(ProviderError::MissingApiKey {
                provider: ProviderKind::OpenAi.display_name().to_string(),
            });
        }
        let payload = self.create_request(messages, tools);
        tracing::debug!(
            provider = "openai",
            model = %self.config.model,
            messages = messages.len(),
            tools = tools.len(),
            "starting chat completions stream"
        );
        decode_stream(
            async move { self.post(&payload).await },
            ChatCompletionsDecoder::default(),
        )
    }
}

/// Decoder for the OpenAI chat completions stream, also spoken by xAI.
#[derive(Debug, Default)]
pub(crate) struct ChatCompletionsDecoder {
    open_calls: BTreeSet<usize>,
    saw_tool_calls: bool,
    usage: Option<Value>,
    finish: Option<FinishReason>,
}

impl ChatCompletionsDecoder {
    fn close_calls(&mut self) -> Vec<StreamEvent> {
        std::mem::take(&mut self.open_calls)
            .into_iter()
            .map(|index| StreamEvent::ToolCallDone { index })
            .collect()
    }
}

impl EventDecoder for ChatCompletionsDecoder {
    fn on_data(&mut self, data: &str) -> Vec<StreamEvent> {
        if data.trim() == "[DONE]" {
            return vec![];
        }
        let chunk: Value = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable stream chunk");
                return vec![];
            }
        };
        if let Some(error) = chunk.get("error") {
            return vec![StreamEvent::Error(stream_error(error))];
        }
        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(usage.clone());
        }

        let mut events = Vec::new();
        for choice in chunk["choices"].as_array().into_iter().flatten() {
            let delta = &choice["delta"];
            for key in ["content", "refusal"] {
                if let Some(text) = delta[key].as_str().filter(|t| !t.is_empty()) {
                    events.push(StreamEvent::TextDelta(text.to_string()));
                }
            }

            for (position, call) in delta["tool_calls"].as_array().into_iter().flatten().enumerate() {
                let index = call["index"]
                    .as_u64()
                    .map(|i| i as usize)
                    .unwrap_or(position);
                let function = &call["function"];
                if self.open_calls.insert(index) {
                    self.saw_tool_calls = true;
                    events.push(StreamEvent::ToolCallStart {
                        index,
                        id: call["id"].as_str().unwrap_or_default().to_string(),
                        name: function["name"].as_str().unwrap_or_default().to_string(),
                    });
                }
                if let Some(arguments) = function["arguments"].as_str().filter(|a| !a.is_empty()) {
                    events.push(StreamEvent::ToolCallArgumentDelta {
                        index,
                        delta: arguments.to_string(),
                    });
                }
            }

            if let Some(reason) = choice["finish_reason"].as_str() {
                events.extend(self.close_calls());
                self.finish = Some(finish_reason(reason));
            }
        }
        events
    }

    fn on_end(&mut self) -> Vec<StreamEvent> {
        let mut events = self.close_calls();
        events.push(StreamEvent::UsageInfo(self.usage.take()));
        let fallback = if self.saw_tool_calls {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        };
        events.push(StreamEvent::Finish(self.finish.take().unwrap_or(fallback)));
        events
    }
}

fn finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "length" => FinishReason::Length,
        "content_filter" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

/// An error object delivered inside an otherwise successful stream.
pub(crate) fn stream_error(error: &Value) -> ProviderError {
    let message = error["message"]
        .as_str()
        .map(String::from)
        .unwrap_or_else(|| error.to_string());
    let code = error["code"].as_str().or(error["type"].as_str()).unwrap_or("");
    match code {
        "server_error" | "internal_error" | "overloaded" | "rate_limit_exceeded" => {
            ProviderError::Transient {
                status: None,
                message,
            }
        }
        "context_length_exceeded" | "string_above_max_length" => {
            ProviderError::ContextLengthExceeded(message)
        }
        _ => ProviderError::Fatal(message),
    }
}
