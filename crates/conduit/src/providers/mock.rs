use std::sync::{Arc, Mutex};

use futures::stream::{self, BoxStream, StreamExt};

use crate::models::message::Message;
use crate::models::tool::Tool;
use crate::providers::base::{FinishReason, Provider, ProviderKind, StreamEvent};

/// A mock provider that replays pre-configured rounds for testing
pub struct MockProvider {
    rounds: Mutex<Vec<Vec<StreamEvent>>>,
    /// Played for every round once `rounds` runs out.
    repeat: Option<Vec<StreamEvent>>,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of rounds
    pub fn new(rounds: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            rounds: Mutex::new(rounds),
            repeat: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// A provider that answers every round the same way
    pub fn repeating(round: Vec<StreamEvent>) -> Self {
        Self {
            repeat: Some(round),
            ..Self::new(vec![])
        }
    }

    /// The history handed to each round, in call order
    pub fn seen(&self) -> Vec<Vec<Message>> {
        self.seen.lock().unwrap().clone()
    }

    pub fn rounds_played(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

/// A round that streams `text` and stops.
pub fn text_round(text: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::TextDelta(text.to_string()),
        StreamEvent::UsageInfo(None),
        StreamEvent::Finish(FinishReason::Stop),
    ]
}

/// A round that requests each `(id, name, arguments)` call.
pub fn tool_round(calls: &[(&str, &str, &str)]) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    for (index, (id, name, arguments)) in calls.iter().enumerate() {
        events.push(StreamEvent::ToolCallStart {
            index,
            id: id.to_string(),
            name: name.to_string(),
        });
        events.push(StreamEvent::ToolCallArgumentDelta {
            index,
            delta: arguments.to_string(),
        });
        events.push(StreamEvent::ToolCallDone { index });
    }
    events.push(StreamEvent::UsageInfo(None));
    events.push(StreamEvent::Finish(FinishReason::ToolCalls));
    events
}

impl Provider for MockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn model(&self) -> &str {
        "gpt-4o"
    }

    fn stream<'a>(&'a self, messages: &'a [Message], _tools: &'a [Tool]) -> BoxStream<'a, StreamEvent> {
        self.seen.lock().unwrap().push(messages.to_vec());
        let mut rounds = self.rounds.lock().unwrap();
        let events = if rounds.is_empty() {
            // Return an empty round if nothing else is configured
            self.repeat.clone().unwrap_or_else(|| text_round(""))
        } else {
            rounds.remove(0)
        };
        stream::iter(events).boxed()
    }
}

impl Provider for Arc<MockProvider> {
    fn kind(&self) -> ProviderKind {
        self.as_ref().kind()
    }

    fn model(&self) -> &str {
        self.as_ref().model()
    }

    fn stream<'a>(&'a self, messages: &'a [Message], tools: &'a [Tool]) -> BoxStream<'a, StreamEvent> {
        self.as_ref().stream(messages, tools)
    }
}
