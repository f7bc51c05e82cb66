use thiserror::Error;

pub const ENV_PREFIX: &str = "CONDUIT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {env_var}")]
    MissingEnvVar { env_var: String },

    #[error("Invalid server address: {0}")]
    InvalidAddress(#[from] std::net::AddrParseError),

    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
}

/// Environment variable that sets a dotted configuration key, e.g.
/// `tools.webhook_url` -> `CONDUIT_TOOLS__WEBHOOK_URL`.
pub fn to_env_var(field: &str) -> String {
    format!("{}_{}", ENV_PREFIX, field.replace('.', "__").to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_env_var() {
        assert_eq!(to_env_var("tools.webhook_url"), "CONDUIT_TOOLS__WEBHOOK_URL");
        assert_eq!(to_env_var("model"), "CONDUIT_MODEL");
    }
}
