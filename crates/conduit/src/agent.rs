use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::json;

use crate::accumulator::ToolCallAccumulator;
use crate::context::{CancelFlag, ConversationContext};
use crate::executor::{NoopToolHistory, ToolExecutor, ToolHistory, ToolSink, DEFAULT_MAX_TOOL_OUTPUT_BYTES};
use crate::models::message::Message;
use crate::models::tool::Tool;
use crate::notification::{Notification, NotificationCodec, NotificationType};
use crate::providers::base::{FinishReason, Provider, StreamEvent};
use crate::store::{ConversationStore, NoopConversationStore};
use crate::tag_parser::{CapturedDocument, TagEvent, TagStreamParser};
use crate::token_counter::TokenCounter;
use crate::usage::{NoopUsageSink, UsageAccountant};

pub const DEFAULT_MAX_ROUNDS: usize = 80;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Provider rounds allowed in one reply, follow-up rounds included.
    pub max_rounds: usize,
    pub max_tool_output_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            max_tool_output_bytes: DEFAULT_MAX_TOOL_OUTPUT_BYTES,
        }
    }
}

/// What a reply produces, in the order it happens.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Text for the reader.
    Text(String),
    Notification(Notification),
    /// A turn appended to the conversation history.
    Message(Message),
}

/// Agent integrates a foundational LLM with the tools the caller offers it
pub struct Agent {
    provider: Box<dyn Provider>,
    tool_sink: Arc<dyn ToolSink>,
    tool_history: Arc<dyn ToolHistory>,
    accountant: UsageAccountant,
    store: Arc<dyn ConversationStore>,
    config: AgentConfig,
}

impl Agent {
    /// Create a new Agent with the specified provider and tool sink
    pub fn new(provider: Box<dyn Provider>, tool_sink: Arc<dyn ToolSink>) -> Self {
        Self {
            provider,
            tool_sink,
            tool_history: Arc::new(NoopToolHistory),
            accountant: UsageAccountant::new(Arc::new(TokenCounter::new()), Arc::new(NoopUsageSink)),
            store: Arc::new(NoopConversationStore),
            config: AgentConfig::default(),
        }
    }

    pub fn with_tool_history(mut self, history: Arc<dyn ToolHistory>) -> Self {
        self.tool_history = history;
        self
    }

    pub fn with_accountant(mut self, accountant: UsageAccountant) -> Self {
        self.accountant = accountant;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// The reply as display strings, with notifications encoded inline.
    pub fn reply<'a>(
        &'a self,
        messages: &[Message],
        tools: &'a [Tool],
        context: ConversationContext,
        cancel: CancelFlag,
    ) -> BoxStream<'a, String> {
        self.reply_events(messages, tools, context, cancel)
            .filter_map(|event| {
                futures::future::ready(match event {
                    AgentEvent::Text(text) => Some(text),
                    AgentEvent::Notification(notification) => {
                        Some(NotificationCodec::encode(&notification))
                    }
                    AgentEvent::Message(_) => None,
                })
            })
            .boxed()
    }

    /// Create a stream that yields everything the agent produces while it
    /// drives the provider through as many tool rounds as the model asks for.
    pub fn reply_events<'a>(
        &'a self,
        messages: &[Message],
        tools: &'a [Tool],
        context: ConversationContext,
        cancel: CancelFlag,
    ) -> BoxStream<'a, AgentEvent> {
        let mut history = messages.to_vec();
        let executor = ToolExecutor::new(self.tool_sink.clone(), self.tool_history.clone())
            .with_max_output_bytes(self.config.max_tool_output_bytes);
        let kind = self.provider.kind();
        let model = self.provider.model().to_string();

        Box::pin(async_stream::stream! {
            let mut parser = TagStreamParser::new();
            let mut follow_ups: Vec<String> = Vec::new();
            // Assistant text across every round of this reply.
            let mut reply_text = String::new();
            let mut round = 0;

            loop {
                if cancel.is_cancelled() {
                    self.save_partial(&context, &reply_text).await;
                    tracing::info!(provider = kind.as_ref(), model = %model, round, "reply cancelled");
                    break;
                }
                if round >= self.config.max_rounds {
                    tracing::error!(
                        provider = kind.as_ref(),
                        model = %model,
                        round,
                        "round limit reached, stopping reply"
                    );
                    yield AgentEvent::Text(format!(
                        "\n\nStopped after reaching the limit of {} model rounds for a single reply.",
                        self.config.max_rounds
                    ));
                    break;
                }
                round += 1;
                tracing::info!(provider = kind.as_ref(), model = %model, round, "starting provider round");

                let mut round_text = String::new();
                let mut documents: Vec<CapturedDocument> = Vec::new();
                let mut accumulator = ToolCallAccumulator::new();
                let mut reported_usage = None;
                let mut finish = None;
                let mut failure = None;
                let mut cancelled = false;

                {
                    let mut events = self.provider.stream(&history, tools);
                    while let Some(event) = events.next().await {
                        if cancel.is_cancelled() {
                            cancelled = true;
                            break;
                        }
                        match event {
                            StreamEvent::TextDelta(text) => {
                                round_text.push_str(&text);
                                for tag_event in parser.process(&text) {
                                    if let TagEvent::DocumentCompleted(document) = &tag_event {
                                        documents.push(document.clone());
                                    }
                                    yield tag_event_to_agent_event(tag_event);
                                }
                            }
                            StreamEvent::ToolCallStart { index, id, name } => {
                                accumulator.start(index, id, name)
                            }
                            StreamEvent::ToolCallArgumentDelta { index, delta } => {
                                accumulator.push_delta(index, &delta)
                            }
                            StreamEvent::ToolCallDone { index } => accumulator.finish(index),
                            StreamEvent::UsageInfo(usage) => reported_usage = usage,
                            StreamEvent::WebSearch { query } => {
                                tracing::debug!(provider = kind.as_ref(), round, query = %query, "provider web search");
                                yield AgentEvent::Notification(
                                    Notification::new(NotificationType::WebSearch)
                                        .with_extra("query", json!(query)),
                                );
                            }
                            StreamEvent::Finish(reason) => finish = Some(reason),
                            StreamEvent::Error(e) => {
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                }

                reply_text.push_str(&round_text);

                if cancelled {
                    if let Some((doc_type, name)) = parser.current_document() {
                        tracing::info!(
                            round,
                            document = %name,
                            doc_type = doc_type.as_ref(),
                            "closing document left open by cancellation"
                        );
                    }
                    for tag_event in parser.flush() {
                        if let TagEvent::DocumentCompleted(document) = tag_event {
                            documents.push(document);
                        }
                    }
                    self.persist_documents(&context, &documents).await;
                    self.save_partial(&context, &reply_text).await;
                    self.accountant
                        .account(&context, kind, &model, reported_usage.as_ref(), &history, tools, &round_text)
                        .await;
                    tracing::info!(provider = kind.as_ref(), model = %model, round, "reply cancelled mid-round");
                    break;
                }

                if parser.is_capturing() {
                    tracing::warn!(provider = kind.as_ref(), round, "document still open at end of round, closing it");
                }
                for tag_event in parser.flush() {
                    if let TagEvent::DocumentCompleted(document) = &tag_event {
                        documents.push(document.clone());
                    }
                    yield tag_event_to_agent_event(tag_event);
                }
                self.persist_documents(&context, &documents).await;

                if let Some(e) = failure {
                    tracing::error!(
                        provider = kind.as_ref(),
                        model = %model,
                        round,
                        error = %e,
                        "provider round failed"
                    );
                    let message = e.user_message();
                    yield AgentEvent::Text(if round_text.is_empty() {
                        message
                    } else {
                        format!("\n\n{}", message)
                    });
                    break;
                }

                match &finish {
                    Some(FinishReason::Length) => {
                        tracing::warn!(provider = kind.as_ref(), round, "response cut off at the output token limit")
                    }
                    Some(FinishReason::ContentFilter) => {
                        tracing::warn!(provider = kind.as_ref(), round, "response stopped by the provider's content filter")
                    }
                    _ => {}
                }

                let calls = accumulator.drain_ready();
                let mut produced = round_text.clone();
                for call in &calls {
                    produced.push_str(&call.name);
                    produced.push_str(&call.arguments);
                }
                self.accountant
                    .account(&context, kind, &model, reported_usage.as_ref(), &history, tools, &produced)
                    .await;

                let mut assistant = Message::assistant();
                if !round_text.is_empty() {
                    assistant = assistant.with_text(round_text.as_str());
                }
                for call in &calls {
                    assistant = assistant.with_tool_request(call.id.as_str(), call.to_tool_call());
                }
                if !assistant.is_empty() {
                    history.push(assistant.clone());
                    yield AgentEvent::Message(assistant);
                }

                if calls.is_empty() {
                    if follow_ups.is_empty() {
                        tracing::info!(provider = kind.as_ref(), model = %model, round, "reply complete");
                        break;
                    }
                    // Follow-ups run as extra rounds under the same cap.
                    for follow_up in follow_ups.drain(..) {
                        let turn = Message::system().with_text(follow_up);
                        history.push(turn.clone());
                        yield AgentEvent::Message(turn);
                    }
                    continue;
                }

                for call in &calls {
                    if let Some(explanation) = ToolExecutor::explanation_for(call) {
                        yield AgentEvent::Text(format!("{}\n\n", explanation));
                    }
                }
                tracing::info!(round, tools = calls.len(), "executing tool calls");
                let outcomes = executor.execute_all(&calls, tools, &context).await;
                if cancel.is_cancelled() {
                    self.save_partial(&context, &reply_text).await;
                    tracing::info!(provider = kind.as_ref(), model = %model, round, "reply cancelled during tool execution");
                    break;
                }

                let mut results = Message::tool();
                for outcome in outcomes {
                    if let Some(follow_up) = outcome.message_to_agent() {
                        follow_ups.push(follow_up.to_string());
                    }
                    if let Some(explanation) = outcome.explanation {
                        yield AgentEvent::Text(format!("{}\n\n", explanation));
                    }
                    if let Some(notification) = outcome.notification {
                        yield AgentEvent::Notification(notification);
                    }
                    results = results.with_tool_response(outcome.call_id, outcome.output, outcome.is_error);
                }
                history.push(results.clone());
                yield AgentEvent::Message(results);
            }
        })
    }

    async fn save_partial(&self, context: &ConversationContext, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Err(e) = self.store.save_partial_response(context, text).await {
            tracing::error!(error = %e, "failed to save partial response");
        }
    }

    async fn persist_documents(&self, context: &ConversationContext, documents: &[CapturedDocument]) {
        for document in documents {
            if let Err(e) = self.store.save_document(context, document).await {
                tracing::error!(document = %document.name, error = %e, "failed to save document");
            }
        }
    }
}

fn tag_event_to_agent_event(event: TagEvent) -> AgentEvent {
    match event {
        TagEvent::Text(text) => AgentEvent::Text(text),
        TagEvent::DocumentStarted { id, doc_type, name } => AgentEvent::Notification(
            Notification::new(doc_type.notification_type())
                .early()
                .with_file(Some(id), name, doc_type.as_ref())
                .with_complete(false),
        ),
        TagEvent::DocumentChunk {
            id,
            doc_type,
            name,
            chunk,
        } => AgentEvent::Notification(
            Notification::new(doc_type.notification_type())
                .with_file(Some(id), name, doc_type.as_ref())
                .with_content_chunk(chunk)
                .with_complete(false),
        ),
        TagEvent::DocumentCompleted(document) => {
            let mut notification = Notification::new(document.doc_type.notification_type())
                .with_file(Some(document.id), document.name, document.doc_type.as_ref())
                .with_content_chunk(document.content)
                .with_complete(true);
            if document.force_closed {
                notification = notification.with_extra("force_closed", json!(true));
            }
            AgentEvent::Notification(notification)
        }
    }
}
