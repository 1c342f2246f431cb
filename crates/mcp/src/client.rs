use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aiops_core::CancellationToken;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::McpError;
use crate::transport::{Transport, TransportFactory, TransportKind};
use crate::types::{CallToolResult, ListToolsPage, RemoteToolInfo, PROTOCOL_VERSION};

/// What the server reported during the handshake.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub protocol_version: String,
}

enum ConnectionState {
    Idle,
    Connected {
        transport: Arc<dyn Transport>,
        server: ServerInfo,
    },
    Closed,
}

/// One client per server. Connect once, use, then close.
pub struct McpClient {
    factory: Arc<dyn TransportFactory>,
    state: RwLock<ConnectionState>,
}

impl McpClient {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            state: RwLock::new(ConnectionState::Idle),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(&*self.state.read(), ConnectionState::Connected { .. })
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        match &*self.state.read() {
            ConnectionState::Connected { server, .. } => Some(server.clone()),
            _ => None,
        }
    }

    pub fn transport_kind(&self) -> Option<TransportKind> {
        match &*self.state.read() {
            ConnectionState::Connected { transport, .. } => Some(transport.kind()),
            _ => None,
        }
    }

    pub async fn connect(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        handshake_timeout: Duration,
    ) -> Result<(), McpError> {
        self.connect_cancellable(url, headers, handshake_timeout, None)
            .await
    }

    /// Streamable HTTP first; on any failure a fresh fallback attempt over SSE.
    /// Both attempts are bounded by `handshake_timeout` and by `cancel`.
    pub async fn connect_cancellable(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        handshake_timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), McpError> {
        match &*self.state.read() {
            ConnectionState::Connected { .. } => return Ok(()),
            ConnectionState::Closed => return Err(McpError::NotConnected),
            ConnectionState::Idle => {}
        }

        let primary = match self
            .attempt(TransportKind::StreamableHttp, url, headers, handshake_timeout, cancel)
            .await
        {
            Ok(connected) => return self.install(url, connected),
            Err(err) => err,
        };
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(primary);
        }
        warn!(
            "Streamable HTTP connect to {} failed ({}), falling back to SSE",
            url, primary
        );

        match self
            .attempt(TransportKind::Sse, url, headers, handshake_timeout, cancel)
            .await
        {
            Ok(connected) => self.install(url, connected),
            Err(fallback) => Err(McpError::Connection {
                url: url.to_string(),
                primary: primary.to_string(),
                fallback: fallback.to_string(),
            }),
        }
    }

    fn install(
        &self,
        url: &str,
        (transport, server): (Arc<dyn Transport>, ServerInfo),
    ) -> Result<(), McpError> {
        info!(
            "Connected to remote tool server {} ({} v{}) over {}",
            url,
            server.name,
            server.version,
            transport.kind()
        );
        let mut state = self.state.write();
        if matches!(&*state, ConnectionState::Closed) {
            return Err(McpError::NotConnected);
        }
        *state = ConnectionState::Connected { transport, server };
        Ok(())
    }

    async fn attempt(
        &self,
        kind: TransportKind,
        url: &str,
        headers: &HashMap<String, String>,
        handshake_timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<(Arc<dyn Transport>, ServerInfo), McpError> {
        let handshake = async {
            let transport: Arc<dyn Transport> =
                Arc::from(self.factory.open(kind, url, headers).await?);
            match initialize(transport.as_ref()).await {
                Ok(server) => Ok((transport, server)),
                Err(err) => {
                    if let Err(close_err) = transport.close().await {
                        debug!("Closing failed {} transport: {}", kind, close_err);
                    }
                    Err(err)
                }
            }
        };

        let timeout_ms = handshake_timeout.as_millis() as u64;
        tokio::select! {
            result = tokio::time::timeout(handshake_timeout, handshake) => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(McpError::HandshakeTimeout(timeout_ms)),
            },
            _ = cancelled(cancel) => Err(McpError::Transport("connect cancelled".into())),
        }
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, McpError> {
        match &*self.state.read() {
            ConnectionState::Connected { transport, .. } => Ok(transport.clone()),
            _ => Err(McpError::NotConnected),
        }
    }

    /// All tools the server offers, following pagination cursors to the end.
    pub async fn list_tools(&self) -> Result<Vec<RemoteToolInfo>, McpError> {
        let transport = self.transport()?;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let value = transport.request("tools/list", Some(params)).await?;
            let page: ListToolsPage = serde_json::from_value(value)
                .map_err(|e| McpError::Protocol(format!("invalid tools/list result: {e}")))?;
            tools.extend(page.tools);

            match page.next_cursor.filter(|next| !next.is_empty()) {
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    return Err(McpError::Protocol(format!(
                        "tools/list returned the same cursor twice: {next}"
                    )));
                }
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!("Remote server listed {} tools", tools.len());
        Ok(tools)
    }

    /// Invoke one tool, bounded by `timeout` and by `cancel`.
    pub async fn call_tool(
        &self,
        name: &str,
        args: Value,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<CallToolResult, McpError> {
        let transport = self.transport()?;
        let params = json!({ "name": name, "arguments": args });
        let timeout_ms = timeout.as_millis() as u64;

        let value = tokio::select! {
            result = transport.request("tools/call", Some(params)) => result?,
            _ = tokio::time::sleep(timeout) => {
                return Err(McpError::Timeout { tool: name.to_string(), timeout_ms, cancelled: false });
            }
            _ = cancelled(cancel) => {
                return Err(McpError::Timeout { tool: name.to_string(), timeout_ms, cancelled: true });
            }
        };

        serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("invalid tools/call result: {e}")))
    }

    /// Release the connection. Safe to call repeatedly; failures are logged.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.write(), ConnectionState::Closed);
        if let ConnectionState::Connected { transport, .. } = previous {
            if let Err(e) = transport.close().await {
                warn!("Error while closing remote tool connection: {}", e);
            }
        }
    }
}

async fn initialize(transport: &dyn Transport) -> Result<ServerInfo, McpError> {
    let params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "aiops-assistant",
            "version": env!("CARGO_PKG_VERSION"),
        }
    });
    let result = transport.request("initialize", Some(params)).await?;
    if !result.is_object() {
        return Err(McpError::Protocol(format!(
            "initialize returned a non-object result: {result}"
        )));
    }

    let server_info = result.get("serverInfo");
    let field = |key: &str| {
        server_info
            .and_then(|info| info.get(key))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    };
    let server = ServerInfo {
        name: field("name"),
        version: field("version"),
        protocol_version: result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or(PROTOCOL_VERSION)
            .to_string(),
    };

    transport.notify("notifications/initialized", None).await?;
    Ok(server)
}

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
