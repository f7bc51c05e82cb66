use std::future::Future;
use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;

const MAX_ERROR_BODY: usize = 2_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Delay before the first retry; doubled for every retry after it.
    #[serde(with = "millis")]
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt`, counting from zero.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of
/// retries. Only transient errors are retried.
pub async fn with_backoff<T, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                let delay = config.delay_for(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient provider error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::error!(retries = attempt, error = %e, "provider still failing, giving up");
                }
                return Err(e);
            }
        }
    }
}

/// Classify a failed `send()`.
pub fn classify_request_error(error: reqwest::Error) -> ProviderError {
    if error.is_builder() {
        ProviderError::Fatal(format!("invalid request: {}", error))
    } else {
        ProviderError::Transient {
            status: error.status().map(|s| s.as_u16()),
            message: error.to_string(),
        }
    }
}

/// Pass successful responses through and turn everything else into a typed
/// error.
pub async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

pub fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let message = truncate(body);
    if is_context_length_error(body) {
        return ProviderError::ContextLengthExceeded(message);
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return ProviderError::Transient {
            status: Some(status.as_u16()),
            message,
        };
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Fatal(format!("authentication failed ({}): {}", status, message))
        }
        _ => ProviderError::Fatal(format!("{}: {}", status, message)),
    }
}

fn is_context_length_error(body: &str) -> bool {
    let body = body.to_lowercase();
    [
        "context_length_exceeded",
        "string_above_max_length",
        "prompt is too long",
        "exceeds the maximum number of tokens",
        "input token count",
    ]
    .iter()
    .any(|needle| body.contains(needle))
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((cut, _)) => format!("{}…", &body[..cut]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> ProviderError {
        ProviderError::Transient {
            status: Some(500),
            message: "boom".into(),
        }
    }

    #[test]
    fn test_delays_double() {
        let config = RetryConfig::default();
        let delays: Vec<_> = (0..3).map(|a| config.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_wait_two_then_four_seconds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let start = tokio::time::Instant::now();

        let result = with_backoff(&RetryConfig::default(), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(transient())
            } else {
                Ok("ok")
            }
        })
        .await;

        assert_eq!(result, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_backoff(&RetryConfig::default(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(transient())
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_backoff(&RetryConfig::default(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::Fatal("bad key".into()))
        })
        .await;

        assert_eq!(result, Err(ProviderError::Fatal("bad key".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down").is_transient());
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "nope"),
            ProviderError::Fatal(m) if m.contains("authentication failed")
        ));
        assert!(matches!(
            classify_status(
                StatusCode::BAD_REQUEST,
                r#"{"error":{"code":"context_length_exceeded"}}"#
            ),
            ProviderError::ContextLengthExceeded(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "no such model"),
            ProviderError::Fatal(_)
        ));
    }
}
