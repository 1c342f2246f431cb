use aiops_core::{ClassifiedError, ErrorCategory};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("Failed to connect to {url}: primary transport failed ({primary}); fallback transport failed ({fallback})")]
    Connection {
        url: String,
        primary: String,
        fallback: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Handshake timed out after {0}ms")]
    HandshakeTimeout(u64),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("{}", timeout_message(.tool, .timeout_ms, .cancelled))]
    Timeout {
        tool: String,
        timeout_ms: u64,
        cancelled: bool,
    },

    #[error("Not connected")]
    NotConnected,
}

fn timeout_message(tool: &str, timeout_ms: &u64, cancelled: &bool) -> String {
    if *cancelled {
        format!("Tool call '{tool}' was cancelled (timeout {timeout_ms}ms)")
    } else {
        format!("Tool call '{tool}' timed out after {timeout_ms}ms")
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        McpError::Transport(err.to_string())
    }
}

impl McpError {
    pub fn classify(&self) -> ClassifiedError {
        let message = self.to_string();
        match self {
            McpError::Connection { .. } | McpError::Transport(_) | McpError::HandshakeTimeout(_) => {
                ClassifiedError::new(ErrorCategory::Connection, message)
            }
            McpError::Http { status: 401 | 403, .. } => {
                ClassifiedError::new(ErrorCategory::Auth, message)
            }
            McpError::Http { .. } => ClassifiedError::new(ErrorCategory::Connection, message),
            McpError::Protocol(_) => ClassifiedError::new(ErrorCategory::Protocol, message),
            McpError::Rpc { .. } => ClassifiedError::new(ErrorCategory::Tool, message),
            McpError::Timeout {
                cancelled: true, ..
            } => ClassifiedError::new(ErrorCategory::Cancelled, message),
            // Remote call timeouts are surfaced as connection-class failures.
            McpError::Timeout { .. } => {
                ClassifiedError::new(ErrorCategory::Connection, message).with_code("TIMEOUT")
            }
            McpError::NotConnected => ClassifiedError::new(ErrorCategory::Deterministic, message)
                .with_suggested_action("Connect the client before issuing requests."),
        }
    }
}
