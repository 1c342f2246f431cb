//! Error taxonomy surfaced at the orchestrator boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse failure class used to pick a recovery strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Handshake or network failure.
    Connection,
    /// Malformed remote-protocol exchange; treated as misconfiguration.
    Protocol,
    /// Tool-level semantic failure.
    Tool,
    Timeout,
    /// Externally aborted.
    Cancelled,
    /// Credential or permission failure. Never retried.
    Auth,
    RateLimited,
    /// Temporary backend condition, including an open circuit breaker.
    Transient,
    /// Configuration or state problem that needs operator action.
    Deterministic,
    /// Could not be classified.
    Ambiguous,
}

impl ErrorCategory {
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ErrorCategory::Protocol | ErrorCategory::Auth | ErrorCategory::Deterministic
        )
    }

    pub fn default_code(&self) -> &'static str {
        match self {
            ErrorCategory::Connection => "CONNECTION_ERROR",
            ErrorCategory::Protocol => "PROTOCOL_ERROR",
            ErrorCategory::Tool => "TOOL_ERROR",
            ErrorCategory::Timeout => "TIMEOUT",
            ErrorCategory::Cancelled => "CANCELLED",
            ErrorCategory::Auth => "AUTH_ERROR",
            ErrorCategory::RateLimited => "RATE_LIMITED",
            ErrorCategory::Transient => "TRANSIENT_ERROR",
            ErrorCategory::Deterministic => "CONFIGURATION_ERROR",
            ErrorCategory::Ambiguous => "UNKNOWN_ERROR",
        }
    }

    fn default_action(&self) -> Option<&'static str> {
        match self {
            ErrorCategory::Connection => Some("Check network connectivity and retry."),
            ErrorCategory::Protocol => Some("Verify the remote tool server configuration."),
            ErrorCategory::Timeout => Some("Retry; the backend may be slow."),
            ErrorCategory::Auth => Some("Check the configured credentials."),
            ErrorCategory::RateLimited => Some("Wait before retrying or switch to another model."),
            ErrorCategory::Transient => Some("Retry shortly or switch to another model."),
            ErrorCategory::Deterministic => Some("Fix the configuration before retrying."),
            ErrorCategory::Ambiguous => Some("Retry the request."),
            ErrorCategory::Tool | ErrorCategory::Cancelled => None,
        }
    }
}

/// Terminal error as delivered to the caller.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq)]
#[error("[{code}] {message}")]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ClassifiedError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            code: category.default_code().to_string(),
            message: message.into(),
            recoverable: category.is_recoverable(),
            suggested_action: category.default_action().map(str::to_string),
            retry_after_secs: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_retry_after(mut self, secs: Option<u64>) -> Self {
        self.retry_after_secs = secs;
        self
    }

    pub fn with_suggested_action(mut self, action: impl Into<String>) -> Self {
        self.suggested_action = Some(action.into());
        self
    }

    /// Classify a free-form message by keyword. Unknown shapes are `Ambiguous`.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let category = categorize_message(&message);
        let retry_after = if category == ErrorCategory::RateLimited {
            extract_retry_seconds(&message)
        } else {
            None
        };
        Self::new(category, message).with_retry_after(retry_after)
    }
}

fn categorize_message(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["cancelled", "canceled", "aborted"]) {
        ErrorCategory::Cancelled
    } else if has(&["rate limit", "429", "too many requests", "quota"]) {
        ErrorCategory::RateLimited
    } else if has(&["unauthorized", "forbidden", "401", "403", "api key", "permission denied"]) {
        ErrorCategory::Auth
    } else if has(&["circuit breaker", "overloaded", "503", "502", "529", "unavailable"]) {
        ErrorCategory::Transient
    } else if has(&["timed out", "timeout", "deadline"]) {
        ErrorCategory::Timeout
    } else if has(&["connection refused", "connection reset", "dns", "network", "connect"]) {
        ErrorCategory::Connection
    } else if has(&["invalid json", "malformed", "protocol"]) {
        ErrorCategory::Protocol
    } else if has(&["not configured", "missing", "invalid config", "not found"]) {
        ErrorCategory::Deterministic
    } else {
        ErrorCategory::Ambiguous
    }
}

/// Pull a `<n>s` style retry hint out of a provider message.
pub fn extract_retry_seconds(msg: &str) -> Option<u64> {
    for token in msg.split(|ch: char| !ch.is_ascii_alphanumeric() && ch != '.') {
        if let Some(stripped) = token.strip_suffix('s') {
            if let Ok(v) = stripped.parse::<u64>() {
                if v > 0 {
                    return Some(v);
                }
            }
        }
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_classification() {
        assert_eq!(
            ClassifiedError::from_message("HTTP 429: rate limit exceeded, retry in 12s").category,
            ErrorCategory::RateLimited
        );
        assert_eq!(
            ClassifiedError::from_message("401 Unauthorized").category,
            ErrorCategory::Auth
        );
        assert_eq!(
            ClassifiedError::from_message("Circuit breaker open").category,
            ErrorCategory::Transient
        );
        assert_eq!(
            ClassifiedError::from_message("request timed out").category,
            ErrorCategory::Timeout
        );
    }

    #[test]
    fn test_unknown_defaults_to_ambiguous() {
        let err = ClassifiedError::from_message("something odd happened");
        assert_eq!(err.category, ErrorCategory::Ambiguous);
        assert!(err.recoverable);
        assert_eq!(err.code, "UNKNOWN_ERROR");
        assert!(err.suggested_action.is_some());
    }

    #[test]
    fn test_retry_after_extracted_for_rate_limits() {
        let err = ClassifiedError::from_message("rate limit hit, please retry after 30s");
        assert_eq!(err.retry_after_secs, Some(30));
    }

    #[test]
    fn test_display_carries_code_and_message() {
        let err = ClassifiedError::new(ErrorCategory::Auth, "invalid api key");
        assert_eq!(err.to_string(), "[AUTH_ERROR] invalid api key");
        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert!(boxed.source().is_none());
    }

    #[test]
    fn test_auth_not_recoverable() {
        let err = ClassifiedError::new(ErrorCategory::Auth, "bad key");
        assert!(!err.recoverable);
        assert_eq!(err.to_string(), "[AUTH_ERROR] bad key");
    }
}
