use aiops_core::error::extract_retry_seconds;
use aiops_core::{ClassifiedError, ErrorCategory};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<u64>,
    },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Circuit breaker open: provider unavailable")]
    CircuitOpen,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

impl ProviderError {
    /// Map a non-success HTTP response.
    pub fn from_status(status: u16, body: String, retry_after_header: Option<u64>) -> Self {
        match status {
            401 | 403 => ProviderError::Auth(body),
            429 => {
                let retry_after = retry_after_header.or_else(|| extract_retry_seconds(&body));
                ProviderError::RateLimited {
                    message: body,
                    retry_after,
                }
            }
            _ => ProviderError::Http { status, body },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. }
            | ProviderError::Network(_)
            | ProviderError::Timeout => true,
            ProviderError::Http { status, .. } => *status >= 500 || *status == 408,
            _ => false,
        }
    }

    pub fn classify(&self) -> ClassifiedError {
        let message = self.to_string();
        match self {
            ProviderError::Auth(_) => ClassifiedError::new(ErrorCategory::Auth, message),
            ProviderError::RateLimited { retry_after, .. } => {
                ClassifiedError::new(ErrorCategory::RateLimited, message)
                    .with_retry_after(*retry_after)
            }
            ProviderError::Http { status, .. } if *status >= 500 => {
                ClassifiedError::new(ErrorCategory::Transient, message)
            }
            ProviderError::Http { status: 408, .. } | ProviderError::Timeout => {
                ClassifiedError::new(ErrorCategory::Timeout, message)
            }
            ProviderError::Http { .. } => ClassifiedError::new(ErrorCategory::Deterministic, message),
            ProviderError::Network(_) => ClassifiedError::new(ErrorCategory::Connection, message),
            ProviderError::CircuitOpen => ClassifiedError::new(ErrorCategory::Transient, message)
                .with_code("CIRCUIT_OPEN"),
            ProviderError::Config(_) => ClassifiedError::new(ErrorCategory::Deterministic, message),
            ProviderError::Cancelled => ClassifiedError::new(ErrorCategory::Cancelled, message),
            ProviderError::Stream(_) | ProviderError::Parse(_) => {
                ClassifiedError::from_message(message)
            }
        }
    }
}
