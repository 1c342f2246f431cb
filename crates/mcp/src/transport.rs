use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::McpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Single-endpoint POST transport; responses may be JSON or an event stream.
    StreamableHttp,
    /// Legacy transport: GET event stream plus a POST endpoint announced on it.
    Sse,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::StreamableHttp => write!(f, "streamable-http"),
            TransportKind::Sse => write!(f, "sse"),
        }
    }
}

/// A live JSON-RPC channel to one server.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Send a request and wait for its `result`. RPC errors come back as [`McpError::Rpc`].
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError>;

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError>;

    async fn close(&self) -> Result<(), McpError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        kind: TransportKind,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Box<dyn Transport>, McpError>;
}
