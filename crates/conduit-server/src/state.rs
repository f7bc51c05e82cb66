use std::sync::Arc;
use std::time::Duration;

use conduit::agent::AgentConfig;
use conduit::executor::{ToolHistory, ToolSink};
use conduit::providers::configs::ApiKeys;
use conduit::providers::retry::RetryConfig;
use conduit::store::ConversationStore;
use conduit::token_counter::TokenCounter;
use conduit::usage::UsageSink;

use crate::configuration::{HostSettings, Settings};
use crate::sinks::{FsConversationStore, JsonlLedger, WebhookToolSink};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub keys: ApiKeys,
    pub hosts: HostSettings,
    pub retry: RetryConfig,
    pub agent: AgentConfig,
    pub tool_sink: Arc<dyn ToolSink>,
    pub tool_history: Arc<dyn ToolHistory>,
    pub usage_sink: Arc<dyn UsageSink>,
    pub store: Arc<dyn ConversationStore>,
    pub counter: Arc<TokenCounter>,
}

impl AppState {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let data_dir = &settings.storage.data_dir;
        let counter = match &settings.storage.tokenizer_dir {
            Some(dir) => TokenCounter::from_dir(dir),
            None => TokenCounter::new(),
        };
        if !counter.has_tokenizers() {
            tracing::info!("no tokenizer files loaded, usage estimates use the character heuristic");
        }

        Ok(Self {
            keys: settings.keys.api_keys(),
            hosts: settings.hosts.clone(),
            retry: settings.retry.retry_config(),
            agent: settings.agent.clone(),
            tool_sink: Arc::new(WebhookToolSink::new(
                settings.webhook_url(),
                Duration::from_secs(settings.tools.timeout_secs),
            )?),
            tool_history: Arc::new(JsonlLedger::new(data_dir.join("tool_history.jsonl"))),
            usage_sink: Arc::new(JsonlLedger::new(data_dir.join("usage.jsonl"))),
            store: Arc::new(FsConversationStore::new(data_dir.join("conversations"))),
            counter: Arc::new(counter),
        })
    }
}
