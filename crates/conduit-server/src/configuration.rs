use crate::error::{to_env_var, ConfigError, ENV_PREFIX};
use conduit::agent::AgentConfig;
use conduit::providers::base::ProviderKind;
use conduit::providers::configs::ApiKeys;
use conduit::providers::retry::RetryConfig;
use config::{Config, Environment};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerSettings {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

/// Platform keys, one per vendor. A request can still bring its own.
#[derive(Default, Deserialize)]
pub struct KeySettings {
    pub anthropic: Option<String>,
    pub openai: Option<String>,
    pub xai: Option<String>,
    pub google: Option<String>,
}

impl KeySettings {
    pub fn api_keys(&self) -> ApiKeys {
        ApiKeys {
            anthropic: self.anthropic.clone(),
            openai: self.openai.clone(),
            xai: self.xai.clone(),
            google: self.google.clone(),
        }
    }
}

// Never print the keys themselves
impl std::fmt::Debug for KeySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySettings")
            .field("anthropic", &self.anthropic.is_some())
            .field("openai", &self.openai.is_some())
            .field("xai", &self.xai.is_some())
            .field("google", &self.google.is_some())
            .finish()
    }
}

/// Base URL overrides, e.g. for a proxy in front of a vendor.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct HostSettings {
    pub anthropic: Option<String>,
    pub openai: Option<String>,
    pub xai: Option<String>,
    pub google: Option<String>,
}

impl HostSettings {
    pub fn for_kind(&self, kind: ProviderKind) -> Option<&str> {
        match kind {
            ProviderKind::Anthropic => self.anthropic.as_deref(),
            ProviderKind::OpenAi => self.openai.as_deref(),
            ProviderKind::Xai => self.xai.as_deref(),
            ProviderKind::Google => self.google.as_deref(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetrySettings {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries, Duration::from_millis(self.base_delay_ms))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ToolSettings {
    /// Where tool calls are forwarded. Required.
    pub webhook_url: Option<String>,
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory holding `<name>/tokenizer.json` files for usage estimation.
    #[serde(default)]
    pub tokenizer_dir: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            tokenizer_dir: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub keys: KeySettings,
    #[serde(default)]
    pub hosts: HostSettings,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load_and_validate()
    }

    /// The configured webhook; `Settings::new` has already checked it is set.
    pub fn webhook_url(&self) -> &str {
        self.tools.webhook_url.as_deref().unwrap_or_default()
    }

    fn load_and_validate() -> Result<Self, ConfigError> {
        // Start with default configuration
        let config = Config::builder()
            // Server defaults
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            // Layer on the environment variables
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = match config.try_deserialize() {
            Ok(settings) => settings,
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);

                // Handle both NotFound and missing field message variants
                let error_str = err.to_string();
                return Err(if error_str.starts_with("missing field") {
                    // Extract field name from error message "missing field `port`"
                    let field = error_str
                        .trim_start_matches("missing field `")
                        .trim_end_matches('`');
                    ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    }
                } else if let config::ConfigError::NotFound(field) = &err {
                    ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    }
                } else {
                    ConfigError::Other(err)
                });
            }
        };

        if settings
            .tools
            .webhook_url
            .as_deref()
            .map_or(true, |url| url.trim().is_empty())
        {
            return Err(ConfigError::MissingEnvVar {
                env_var: to_env_var("tools.webhook_url"),
            });
        }
        Ok(settings)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_tool_timeout_secs() -> u64 {
    120
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clean_env() {
        for (key, _) in env::vars() {
            if key.starts_with("CONDUIT_") {
                env::remove_var(&key);
            }
        }
    }

    #[test]
    #[serial]
    fn test_default_settings() {
        clean_env();
        env::set_var("CONDUIT_TOOLS__WEBHOOK_URL", "http://localhost:9000/tools");

        let settings = Settings::new().unwrap();
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 3000);
        assert_eq!(settings.webhook_url(), "http://localhost:9000/tools");
        assert_eq!(settings.tools.timeout_secs, 120);
        assert_eq!(settings.agent, AgentConfig::default());
        assert_eq!(settings.retry.retry_config(), RetryConfig::default());
        assert_eq!(settings.storage.data_dir, PathBuf::from("data"));
        assert!(settings.keys.api_keys().for_kind(ProviderKind::Anthropic).is_none());

        clean_env();
    }

    #[test]
    #[serial]
    fn test_missing_webhook_names_the_variable() {
        clean_env();

        match Settings::new() {
            Err(ConfigError::MissingEnvVar { env_var }) => {
                assert_eq!(env_var, "CONDUIT_TOOLS__WEBHOOK_URL")
            }
            other => panic!("expected a missing variable error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    #[serial]
    fn test_environment_override() {
        clean_env();
        env::set_var("CONDUIT_SERVER__PORT", "8080");
        env::set_var("CONDUIT_TOOLS__WEBHOOK_URL", "http://tools.internal/call");
        env::set_var("CONDUIT_KEYS__ANTHROPIC", "sk-ant-test");
        env::set_var("CONDUIT_HOSTS__OPENAI", "http://proxy.internal");
        env::set_var("CONDUIT_AGENT__MAX_ROUNDS", "12");
        env::set_var("CONDUIT_RETRY__BASE_DELAY_MS", "500");

        let settings = Settings::new().unwrap();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(
            settings.keys.api_keys().for_kind(ProviderKind::Anthropic).as_deref(),
            Some("sk-ant-test")
        );
        assert_eq!(
            settings.hosts.for_kind(ProviderKind::OpenAi),
            Some("http://proxy.internal")
        );
        assert_eq!(settings.agent.max_rounds, 12);
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(
            settings.retry.retry_config().delay_for(1),
            Duration::from_millis(1_000)
        );
        assert!(!format!("{:?}", settings.keys).contains("sk-ant-test"));

        clean_env();
    }

    #[test]
    fn test_socket_addr_conversion() {
        let server_settings = ServerSettings {
            host: "127.0.0.1".to_string(),
            port: 3000,
        };
        let addr = server_settings.socket_addr().unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:3000");

        let bad = ServerSettings {
            host: "not a host".to_string(),
            port: 3000,
        };
        assert!(matches!(bad.socket_addr(), Err(ConfigError::InvalidAddress(_))));
    }
}
