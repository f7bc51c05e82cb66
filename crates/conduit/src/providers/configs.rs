use serde::{Deserialize, Serialize};

use super::base::ProviderKind;
use super::retry::RetryConfig;
use crate::errors::ProviderError;

pub const ANTHROPIC_DEFAULT_HOST: &str = "https://api.anthropic.com";
pub const OPENAI_DEFAULT_HOST: &str = "https://api.openai.com";
pub const XAI_DEFAULT_HOST: &str = "https://api.x.ai";
pub const GOOGLE_DEFAULT_HOST: &str = "https://generativelanguage.googleapis.com";

pub const DEFAULT_MAX_TOKENS: i32 = 8_192;

// Unified enum to wrap different provider configurations
#[derive(Clone)]
pub enum ProviderConfig {
    Anthropic(AnthropicProviderConfig),
    OpenAi(OpenAiProviderConfig),
    Xai(XaiProviderConfig),
    Google(GoogleProviderConfig),
}

impl ProviderConfig {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderConfig::Anthropic(_) => ProviderKind::Anthropic,
            ProviderConfig::OpenAi(_) => ProviderKind::OpenAi,
            ProviderConfig::Xai(_) => ProviderKind::Xai,
            ProviderConfig::Google(_) => ProviderKind::Google,
        }
    }

    /// Config for `model` using the key the request supplied. A missing key is
    /// not an error here; the adapter reports it when the round starts.
    pub fn for_model(model: &str, keys: &ApiKeys) -> Result<Self, ProviderError> {
        let kind = ProviderKind::from_model(model)
            .ok_or_else(|| ProviderError::Fatal(format!("unsupported model: {}", model)))?;
        let api_key = keys.for_kind(kind).unwrap_or_default();
        Ok(match kind {
            ProviderKind::Anthropic => {
                ProviderConfig::Anthropic(AnthropicProviderConfig::new(api_key, model))
            }
            ProviderKind::OpenAi => ProviderConfig::OpenAi(OpenAiProviderConfig::new(api_key, model)),
            ProviderKind::Xai => ProviderConfig::Xai(XaiProviderConfig::new(api_key, model)),
            ProviderKind::Google => ProviderConfig::Google(GoogleProviderConfig::new(api_key, model)),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        match &mut self {
            ProviderConfig::Anthropic(c) => c.retry = retry,
            ProviderConfig::OpenAi(c) => c.retry = retry,
            ProviderConfig::Xai(c) => c.retry = retry,
            ProviderConfig::Google(c) => c.retry = retry,
        }
        self
    }

    /// Point the adapter at a different base URL, e.g. a proxy.
    pub fn with_host<S: Into<String>>(mut self, host: S) -> Self {
        let host = host.into();
        match &mut self {
            ProviderConfig::Anthropic(c) => c.host = host,
            ProviderConfig::OpenAi(c) => c.host = host,
            ProviderConfig::Xai(c) => c.host = host,
            ProviderConfig::Google(c) => c.host = host,
        }
        self
    }
}

/// Provider keys for one request. Platform keys come from configuration and a
/// user's own key (BYOK) replaces the one for its vendor.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ApiKeys {
    pub anthropic: Option<String>,
    pub openai: Option<String>,
    pub xai: Option<String>,
    pub google: Option<String>,
}

impl ApiKeys {
    pub fn for_kind(&self, kind: ProviderKind) -> Option<String> {
        let key = match kind {
            ProviderKind::Anthropic => &self.anthropic,
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Xai => &self.xai,
            ProviderKind::Google => &self.google,
        };
        key.clone().filter(|k| !k.trim().is_empty())
    }

    pub fn with_key(mut self, kind: ProviderKind, key: String) -> Self {
        let slot = match kind {
            ProviderKind::Anthropic => &mut self.anthropic,
            ProviderKind::OpenAi => &mut self.openai,
            ProviderKind::Xai => &mut self.xai,
            ProviderKind::Google => &mut self.google,
        };
        *slot = Some(key);
        self
    }
}

#[derive(Clone)]
pub struct AnthropicProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
    pub web_search: bool,
    pub retry: RetryConfig,
}

impl AnthropicProviderConfig {
    pub fn new<K: Into<String>, M: Into<String>>(api_key: K, model: M) -> Self {
        Self {
            host: ANTHROPIC_DEFAULT_HOST.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: None,
            max_tokens: Some(DEFAULT_MAX_TOKENS),
            web_search: true,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct OpenAiProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
    /// Only honoured by the `*-search-*` models.
    pub web_search: bool,
    pub retry: RetryConfig,
}

impl OpenAiProviderConfig {
    pub fn new<K: Into<String>, M: Into<String>>(api_key: K, model: M) -> Self {
        Self {
            host: OPENAI_DEFAULT_HOST.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
            web_search: true,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct XaiProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
    /// Enables live search (`search_parameters.mode = "auto"`).
    pub web_search: bool,
    pub retry: RetryConfig,
}

impl XaiProviderConfig {
    pub fn new<K: Into<String>, M: Into<String>>(api_key: K, model: M) -> Self {
        Self {
            host: XAI_DEFAULT_HOST.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
            web_search: true,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct GoogleProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
    /// Adds the `google_search` tool when no function tools are declared.
    pub web_search: bool,
    pub retry: RetryConfig,
}

impl GoogleProviderConfig {
    pub fn new<K: Into<String>, M: Into<String>>(api_key: K, model: M) -> Self {
        Self {
            host: GOOGLE_DEFAULT_HOST.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
            web_search: true,
            retry: RetryConfig::default(),
        }
    }
}
