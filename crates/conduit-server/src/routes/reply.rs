use crate::state::AppState;
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use conduit::{
    agent::Agent,
    context::{CancelFlag, ConversationContext},
    models::{message::Message, tool::Tool},
    providers::{base::ProviderKind, configs::ProviderConfig, factory},
    usage::UsageAccountant,
};
use futures::stream::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

// Types matching the incoming JSON structure
#[derive(Debug, Deserialize)]
struct ReplyRequest {
    model: String,
    messages: Vec<Value>,
    #[serde(default)]
    tools: Vec<Value>,
    /// The caller's own key for the model's vendor.
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

// Convert incoming messages to our internal Message type
fn convert_messages(incoming: &[Value]) -> Vec<Message> {
    incoming
        .iter()
        .filter_map(|value| {
            let message = Message::from_value(value);
            if message.is_none() {
                tracing::warn!("dropping message with unknown role: {}", value["role"]);
            }
            message
        })
        .collect()
}

fn convert_tools(incoming: &[Value]) -> Vec<Tool> {
    incoming
        .iter()
        .filter_map(|value| {
            let tool = Tool::from_function_spec(value);
            if tool.is_none() {
                tracing::warn!("dropping tool definition without a name");
            }
            tool
        })
        .collect()
}

fn build_agent(state: &AppState, request: &ReplyRequest) -> Result<Agent, Response> {
    let kind = ProviderKind::from_model(&request.model)
        .ok_or_else(|| bad_request(format!("unsupported model: {}", request.model)))?;

    let mut keys = state.keys.clone();
    if let Some(key) = request.api_key.clone().filter(|k| !k.trim().is_empty()) {
        keys = keys.with_key(kind, key);
    }
    let mut config = ProviderConfig::for_model(&request.model, &keys)
        .map_err(|e| bad_request(e.to_string()))?
        .with_retry(state.retry.clone());
    if let Some(host) = state.hosts.for_kind(kind) {
        config = config.with_host(host);
    }

    let provider = factory::get_provider(config).map_err(|e| {
        tracing::error!(provider = kind.as_ref(), "failed to build provider: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })?;

    Ok(Agent::new(provider, state.tool_sink.clone())
        .with_tool_history(state.tool_history.clone())
        .with_accountant(UsageAccountant::new(
            state.counter.clone(),
            state.usage_sink.clone(),
        ))
        .with_store(state.store.clone())
        .with_config(state.agent.clone()))
}

async fn handler(State(state): State<AppState>, Json(request): Json<ReplyRequest>) -> Response {
    let agent = match build_agent(&state, &request) {
        Ok(agent) => agent,
        Err(response) => return response,
    };
    let messages = convert_messages(&request.messages);
    let tools = convert_tools(&request.tools);
    let context = ConversationContext {
        user_id: request.user_id,
        project_id: request.project_id,
        conversation_id: request.conversation_id,
    };

    // Create channel for streaming
    let (tx, rx) = mpsc::channel::<String>(100);
    let cancel = CancelFlag::new();

    // Spawn task to handle streaming
    tokio::spawn(async move {
        let mut stream = agent.reply(&messages, &tools, context, cancel.clone());

        loop {
            tokio::select! {
                piece = stream.next() => match piece {
                    Some(piece) => {
                        if tx.send(piece).await.is_err() && !cancel.is_cancelled() {
                            tracing::info!("client disconnected, cancelling reply");
                            cancel.cancel();
                        }
                    }
                    None => break,
                },
                // Notice a disconnect while a tool or the provider is still busy
                _ = tx.closed(), if !cancel.is_cancelled() => {
                    tracing::info!("client disconnected, cancelling reply");
                    cancel.cancel();
                }
            }
        }
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        body,
    )
        .into_response()
}

// Configure routes for this module
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/reply", post(handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::Request;
    use conduit::agent::AgentConfig;
    use conduit::errors::{ToolError, ToolResult};
    use conduit::executor::{NoopToolHistory, ToolOutput, ToolSink};
    use conduit::providers::configs::ApiKeys;
    use conduit::providers::retry::RetryConfig;
    use conduit::store::NoopConversationStore;
    use conduit::token_counter::TokenCounter;
    use conduit::usage::NoopUsageSink;
    use crate::configuration::HostSettings;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;
    use wiremock::matchers::{header as header_matcher, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct NoTools;

    #[async_trait]
    impl ToolSink for NoTools {
        async fn call_tool(
            &self,
            name: &str,
            _arguments: &Value,
            _context: &ConversationContext,
        ) -> ToolResult<ToolOutput> {
            Err(ToolError::NotFound(name.to_string()))
        }
    }

    fn state(keys: ApiKeys, openai_host: Option<String>) -> AppState {
        AppState {
            keys,
            hosts: HostSettings {
                openai: openai_host,
                ..Default::default()
            },
            retry: RetryConfig::new(0, Duration::from_millis(1)),
            agent: AgentConfig::default(),
            tool_sink: Arc::new(NoTools),
            tool_history: Arc::new(NoopToolHistory),
            usage_sink: Arc::new(NoopUsageSink),
            store: Arc::new(NoopConversationStore),
            counter: Arc::new(TokenCounter::new()),
        }
    }

    fn reply_request(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/reply")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_reply_streams_provider_text() {
        let body = [
            json!({"choices": [{"index": 0, "delta": {"content": "Hel"}}]}),
            json!({"choices": [{"index": 0, "delta": {"content": "lo"}, "finish_reason": "stop"}]}),
        ]
        .iter()
        .map(|c| format!("data: {}\n\n", c))
        .collect::<String>()
            + "data: [DONE]\n\n";

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header_matcher("authorization", "Bearer user-key"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let keys = ApiKeys {
            openai: Some("platform-key".into()),
            ..Default::default()
        };
        let app = routes(state(keys, Some(mock_server.uri())));
        let response = app
            .oneshot(reply_request(json!({
                "model": "gpt-4o",
                "api_key": "user-key",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert_eq!(body_text(response).await, "Hello");
    }

    #[tokio::test]
    async fn test_missing_key_is_reported_in_stream() {
        let app = routes(state(ApiKeys::default(), None));
        let response = app
            .oneshot(reply_request(json!({
                "model": "claude-sonnet-4-20250514",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_text(response).await,
            "No API key is configured for Anthropic. Add a key in your settings to use this model."
        );
    }

    #[tokio::test]
    async fn test_unknown_model_is_rejected() {
        let app = routes(state(ApiKeys::default(), None));
        let response = app
            .oneshot(reply_request(json!({
                "model": "llama-3-70b",
                "messages": []
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("unsupported model"));
    }

    #[test]
    fn test_convert_skips_unknown_entries() {
        let messages = convert_messages(&[
            json!({"role": "user", "content": "hi"}),
            json!({"role": "narrator", "content": "..."}),
        ]);
        assert_eq!(messages.len(), 1);

        let tools = convert_tools(&[
            json!({"type": "function", "function": {"name": "lookup", "parameters": {"type": "object"}}}),
            json!({"type": "function"}),
        ]);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "lookup");
    }
}
