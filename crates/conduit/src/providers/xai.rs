use std::time::Duration;

use anyhow::Result;
use futures::stream::BoxStream;
use reqwest::{Client, Response};
use serde_json::{json, Value};

use super::base::{Provider, ProviderKind, StreamEvent};
use super::configs::XaiProviderConfig;
use super::openai::ChatCompletionsDecoder;
use super::retry::{check_status, classify_request_error, with_backoff};
use super::sse::{decode_stream, error_stream};
use super::utils::{messages_to_openai_spec, set_field, tools_to_openai_spec};
use crate::errors::ProviderError;
use crate::models::message::Message;
use crate::models::tool::Tool;

/// Grok models, served through an OpenAI compatible chat completions API.
pub struct XaiProvider {
    client: Client,
    config: XaiProviderConfig,
}

impl XaiProvider {
    pub fn new(config: XaiProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
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
            set_field(&mut payload, "tool_choice", json!("auto"));
        }
        if let Some(temp) = self.config.temperature {
            set_field(&mut payload, "temperature", json!(temp));
        }
        if let Some(tokens) = self.config.max_tokens {
            set_field(&mut payload, "max_tokens", json!(tokens));
        }
        if self.config.web_search {
            set_field(
                &mut payload,
                "search_parameters",
                json!({"mode": "auto", "return_citations": true}),
            );
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
                .bearer_auth(&self.config.api_key)
                .json(payload)
                .send()
                .await
                .map_err(classify_request_error)?;
            check_status(response).await
        })
        .await
    }
}

impl Provider for XaiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Xai
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn stream<'a>(&'a self, messages: &'a [Message], tools: &'a [Tool]) -> BoxStream<'a, StreamEvent> {
        if self.config.api_key.trim().is_empty() {
            return error_stream(ProviderError::MissingApiKey {
                provider: ProviderKind::Xai.display_name().to_string(),
            });
        }
        let payload = self.create_request(messages, tools);
        tracing::debug!(
            provider = "xai",
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::base::FinishReason;
    use crate::providers::retry::RetryConfig;
    use futures::StreamExt;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_stream_with_live_search() -> Result<()> {
        let body = [
            json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": "Grok"}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
                   "usage": {"prompt_tokens": 4, "completion_tokens": 1, "total_tokens": 5}}),
        ]
        .iter()
        .map(|c| format!("data: {}\n\n", c))
        .collect::<String>()
            + "data: [DONE]\n\n";

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer xai-key"))
            .and(body_partial_json(json!({
                "model": "grok-3",
                "search_parameters": {"mode": "auto"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut config = XaiProviderConfig::new("xai-key", "grok-3");
        config.host = mock_server.uri();
        config.retry = RetryConfig::new(0, Duration::from_millis(1));
        let provider = XaiProvider::new(config)?;

        let messages = vec![Message::user().with_text("news?")];
        let events: Vec<_> = provider.stream(&messages, &[]).collect().await;
        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("Grok".into()),
                StreamEvent::UsageInfo(Some(
                    json!({"prompt_tokens": 4, "completion_tokens": 1, "total_tokens": 5})
                )),
                StreamEvent::Finish(FinishReason::Stop),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_request_without_search() {
        let mut config = XaiProviderConfig::new("k", "grok-3-mini");
        config.web_search = false;
        let tools = vec![Tool::new("lookup", "", json!({"type": "object"}))];
        let request = XaiProvider::new(config).unwrap().create_request(&[], &tools);
        assert!(request.get("search_parameters").is_none());
        assert_eq!(request["tool_choice"], "auto");
        assert_eq!(request["tools"][0]["function"]["name"], "lookup");
    }
}
