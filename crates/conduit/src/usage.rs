//! Token accounting across vendor usage formats.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ConversationContext;
use crate::models::message::Message;
use crate::models::tool::Tool;
use crate::providers::base::ProviderKind;
use crate::token_counter::TokenCounter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
    /// Portion of `input_tokens` served from the vendor's prompt cache.
    #[serde(default)]
    pub cache_read_tokens: usize,
    /// Portion of `input_tokens` written to the vendor's prompt cache.
    #[serde(default)]
    pub cache_write_tokens: usize,
}

impl Usage {
    pub fn new(input_tokens: usize, output_tokens: usize) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    Reported,
    Estimated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub provider: ProviderKind,
    pub model: String,
    #[serde(flatten)]
    pub usage: Usage,
    /// USD
    pub cost: f64,
    pub source: UsageSource,
    #[serde(flatten)]
    pub context: ConversationContext,
    pub created: DateTime<Utc>,
}

/// Append-only destination for usage records.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record_usage(&self, record: UsageRecord) -> anyhow::Result<()>;
}

/// Sink that drops every record.
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record_usage(&self, _record: UsageRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

fn count(raw: &Value, key: &str) -> Option<usize> {
    raw.get(key).and_then(Value::as_u64).map(|n| n as usize)
}

/// Normalize a vendor usage object. Returns None when it carries no token
/// counts at all.
pub fn normalize(kind: ProviderKind, raw: &Value) -> Option<Usage> {
    match kind {
        ProviderKind::Anthropic => {
            let input = count(raw, "input_tokens");
            let output = count(raw, "output_tokens");
            if input.is_none() && output.is_none() {
                return None;
            }
            let cache_read = count(raw, "cache_read_input_tokens").unwrap_or(0);
            let cache_write = count(raw, "cache_creation_input_tokens").unwrap_or(0);
            let input = input.unwrap_or(0) + cache_read + cache_write;
            let output = output.unwrap_or(0);
            Some(Usage {
                cache_read_tokens: cache_read,
                cache_write_tokens: cache_write,
                ..Usage::new(input, output)
            })
        }
        ProviderKind::OpenAi | ProviderKind::Xai => {
            let input = count(raw, "prompt_tokens");
            let output = count(raw, "completion_tokens");
            if input.is_none() && output.is_none() {
                return None;
            }
            let (input, output) = (input.unwrap_or(0), output.unwrap_or(0));
            let cached = raw
                .get("prompt_tokens_details")
                .and_then(|d| count(d, "cached_tokens"))
                .unwrap_or(0);
            Some(Usage {
                total_tokens: count(raw, "total_tokens").unwrap_or(input + output),
                cache_read_tokens: cached,
                ..Usage::new(input, output)
            })
        }
        ProviderKind::Google => {
            let input = count(raw, "promptTokenCount");
            let candidates = count(raw, "candidatesTokenCount");
            let total = count(raw, "totalTokenCount");
            if input.is_none() && candidates.is_none() && total.is_none() {
                return None;
            }
            let input = input.unwrap_or(0);
            let output = candidates.unwrap_or(0) + count(raw, "thoughtsTokenCount").unwrap_or(0);
            Some(Usage {
                total_tokens: total.unwrap_or(input + output),
                cache_read_tokens: count(raw, "cachedContentTokenCount").unwrap_or(0),
                ..Usage::new(input, output)
            })
        }
    }
}

/// USD per million tokens as (model prefix, input, cached input, output).
const PRICES: &[(&str, f64, f64, f64)] = &[
    ("claude-opus-4", 15.0, 1.5, 75.0),
    ("claude-sonnet-4", 3.0, 0.3, 15.0),
    ("claude-3-7-sonnet", 3.0, 0.3, 15.0),
    ("claude-3-5-sonnet", 3.0, 0.3, 15.0),
    ("claude-3-5-haiku", 0.8, 0.08, 4.0),
    ("claude-3-haiku", 0.25, 0.03, 1.25),
    ("gpt-4o", 2.5, 1.25, 10.0),
    ("gpt-4o-mini", 0.15, 0.075, 0.6),
    ("gpt-4.1", 2.0, 0.5, 8.0),
    ("gpt-4.1-mini", 0.4, 0.1, 1.6),
    ("gpt-4.1-nano", 0.1, 0.025, 0.4),
    ("o3", 2.0, 0.5, 8.0),
    ("o4-mini", 1.1, 0.275, 4.4),
    ("grok-3", 3.0, 0.75, 15.0),
    ("grok-3-mini", 0.3, 0.075, 0.5),
    ("grok-4", 3.0, 0.75, 15.0),
    ("gemini-2.5-pro", 1.25, 0.31, 10.0),
    ("gemini-2.5-flash", 0.3, 0.075, 2.5),
    ("gemini-2.0-flash", 0.1, 0.025, 0.4),
];

/// Cache writes bill at a premium over fresh input. Only Anthropic reports
/// them.
const CACHE_WRITE_MULTIPLIER: f64 = 1.25;

/// Cost in USD, priced by the longest matching model prefix. Cache reads and
/// writes are priced apart from the rest of the input. Unknown models cost
/// nothing.
pub fn cost(model: &str, usage: &Usage) -> f64 {
    let model = model.to_lowercase();
    let Some((_, input, cached, output)) = PRICES
        .iter()
        .filter(|(prefix, _, _, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _, _, _)| prefix.len())
    else {
        tracing::debug!(model = %model, "no price for model");
        return 0.0;
    };
    let fresh = usage
        .input_tokens
        .saturating_sub(usage.cache_read_tokens + usage.cache_write_tokens);
    (fresh as f64 * input
        + usage.cache_read_tokens as f64 * cached
        + usage.cache_write_tokens as f64 * input * CACHE_WRITE_MULTIPLIER
        + usage.output_tokens as f64 * output)
        / 1_000_000.0
}

/// Turns whatever usage a round produced into a persisted [`UsageRecord`].
pub struct UsageAccountant {
    counter: Arc<TokenCounter>,
    sink: Arc<dyn UsageSink>,
}

impl UsageAccountant {
    pub fn new(counter: Arc<TokenCounter>, sink: Arc<dyn UsageSink>) -> Self {
        Self { counter, sink }
    }

    /// Reported usage when the vendor sent it, otherwise an estimate over the
    /// conversation the model saw plus everything it produced.
    pub fn resolve(
        &self,
        kind: ProviderKind,
        model: &str,
        reported: Option<&Value>,
        history: &[Message],
        tools: &[Tool],
        output: &str,
    ) -> (Usage, UsageSource) {
        if let Some(usage) = reported.and_then(|raw| normalize(kind, raw)) {
            tracing::info!(
                provider = kind.as_ref(),
                model,
                input = usage.input_tokens,
                output = usage.output_tokens,
                "usage reported by provider"
            );
            return (usage, UsageSource::Reported);
        }

        let input = self.counter.count_chat_tokens(history, tools, model);
        let output = self.counter.count_tokens(output, model);
        tracing::info!(
            provider = kind.as_ref(),
            model,
            input,
            output,
            "usage not reported, estimated with tokenizer"
        );
        (Usage::new(input, output), UsageSource::Estimated)
    }

    /// Resolve and persist usage for one round. Failures are logged and never
    /// interrupt the conversation.
    #[allow(clippy::too_many_arguments)]
    pub async fn account(
        &self,
        context: &ConversationContext,
        kind: ProviderKind,
        model: &str,
        reported: Option<&Value>,
        history: &[Message],
        tools: &[Tool],
        output: &str,
    ) -> UsageRecord {
        let (usage, source) = self.resolve(kind, model, reported, history, tools, output);
        let record = UsageRecord {
            provider: kind,
            model: model.to_string(),
            cost: cost(model, &usage),
            usage,
            source,
            context: context.clone(),
            created: Utc::now(),
        };
        if let Err(e) = self.sink.record_usage(record.clone()).await {
            tracing::error!(provider = kind.as_ref(), model, error = %e, "failed to record usage");
        }
        record
    }
}
