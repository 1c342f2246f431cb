//! Tools hosted on remote servers, exposed under `mcp__<slug>__<name>`.

use crate::traits::{Tool, ToolError};
use aiops_core::{CancellationToken, SafetyLevel, ToolCategory, ToolErrorCode, ToolResult};
use aiops_mcp::{McpClient, McpError, RemoteToolInfo, TransportFactory};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const PREFIX: &str = "mcp__";
const SEPARATOR: &str = "__";

/// Connection details for one remote tool server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteToolServer {
    /// Short identifier used inside qualified tool names.
    pub slug: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Per-call timeout overriding the session default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Tool list captured at configuration time, if any.
    #[serde(default)]
    pub cached_tools: Option<Vec<RemoteToolInfo>>,
}

pub fn remote_tool_name(slug: &str, tool: &str) -> String {
    format!("{PREFIX}{slug}{SEPARATOR}{tool}")
}

/// Split `mcp__<slug>__<name>` into its slug and tool name.
pub fn split_remote_tool_name(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(PREFIX)?;
    let (slug, tool) = rest.split_once(SEPARATOR)?;
    if slug.is_empty() || tool.is_empty() {
        return None;
    }
    Some((slug, tool))
}

#[derive(Debug, Clone, Copy)]
pub struct RemoteTimeouts {
    pub handshake: Duration,
    pub call: Duration,
}

impl Default for RemoteTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_millis(10_000),
            call: Duration::from_millis(60_000),
        }
    }
}

/// Fetch a server's tool list over a short-lived connection.
pub async fn discover_tools(
    server: &RemoteToolServer,
    factory: Arc<dyn TransportFactory>,
    handshake_timeout: Duration,
) -> Result<Vec<RemoteToolInfo>, McpError> {
    let client = McpClient::new(factory);
    client
        .connect(&server.url, &server.headers, handshake_timeout)
        .await?;
    let tools = client.list_tools().await;
    client.close().await;
    let tools = tools?;
    info!(
        "Discovered {} tools on remote server '{}'",
        tools.len(),
        server.slug
    );
    Ok(tools)
}

/// Adapter presenting one remote tool through the local [`Tool`] trait.
///
/// Every invocation opens its own connection and closes it afterwards, so no
/// connection outlives the call.
pub struct RemoteTool {
    server: Arc<RemoteToolServer>,
    info: RemoteToolInfo,
    qualified_name: String,
    description: String,
    safety: SafetyLevel,
    factory: Arc<dyn TransportFactory>,
    timeouts: RemoteTimeouts,
}

impl RemoteTool {
    pub fn new(
        server: Arc<RemoteToolServer>,
        info: RemoteToolInfo,
        factory: Arc<dyn TransportFactory>,
        timeouts: RemoteTimeouts,
    ) -> Self {
        let safety = if info.is_destructive() {
            SafetyLevel::Dangerous
        } else if info.is_read_only() {
            SafetyLevel::Safe
        } else {
            SafetyLevel::Cautious
        };
        let description = match safety {
            SafetyLevel::Dangerous => format!("[DANGEROUS] {}", info.description),
            SafetyLevel::Safe => format!("[SAFE] {}", info.description),
            SafetyLevel::Cautious => info.description.clone(),
        };
        Self {
            qualified_name: remote_tool_name(&server.slug, &info.name),
            server,
            info,
            description,
            safety,
            factory,
            timeouts,
        }
    }

    /// One adapter per advertised tool.
    pub fn for_server(
        server: Arc<RemoteToolServer>,
        tools: &[RemoteToolInfo],
        factory: Arc<dyn TransportFactory>,
        timeouts: RemoteTimeouts,
    ) -> Vec<Arc<dyn Tool>> {
        tools
            .iter()
            .map(|info| {
                Arc::new(Self::new(
                    server.clone(),
                    info.clone(),
                    factory.clone(),
                    timeouts,
                )) as Arc<dyn Tool>
            })
            .collect()
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.qualified_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> serde_json::Value {
        self.info.input_schema.clone()
    }

    fn safety_level(&self) -> SafetyLevel {
        self.safety
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Remote
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let client = McpClient::new(self.factory.clone());
        if let Err(e) = client
            .connect_cancellable(
                &self.server.url,
                &self.server.headers,
                self.timeouts.handshake,
                Some(&cancel),
            )
            .await
        {
            if cancel.is_cancelled() {
                return Err(ToolError::Cancelled);
            }
            let classified = e.classify();
            return Ok(ToolResult::failure(
                ToolErrorCode::ToolExecutionError,
                format!(
                    "Could not reach remote tool server '{}': {}",
                    self.server.slug, e
                ),
                classified.recoverable,
            ));
        }

        debug!("Calling remote tool {}", self.qualified_name);
        let call_timeout = self
            .server
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.timeouts.call);
        let outcome = client
            .call_tool(&self.info.name, args, call_timeout, Some(&cancel))
            .await;
        client.close().await;

        match outcome {
            Ok(result) if result.is_error => Ok(ToolResult::failure(
                ToolErrorCode::RemoteToolError,
                result.text(),
                true,
            )),
            Ok(result) => Ok(ToolResult::ok(result.text())),
            Err(McpError::Timeout {
                cancelled: true, ..
            }) => Err(ToolError::Cancelled),
            Err(e @ McpError::Timeout { .. }) => Ok(ToolResult::failure(
                ToolErrorCode::Timeout,
                e.to_string(),
                true,
            )),
            Err(e) => {
                let recoverable = e.classify().recoverable;
                Ok(ToolResult::failure(
                    ToolErrorCode::ToolExecutionError,
                    e.to_string(),
                    recoverable,
                ))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use aiops_mcp::{ToolAnnotations, Transport, TransportKind};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubTransport {
        is_error: bool,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for StubTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::StreamableHttp
        }

        async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
            match method {
                "initialize" => Ok(json!({"serverInfo": {"name": "stub", "version": "0"}})),
                "tools/call" => {
                    let params = params.unwrap();
                    Ok(json!({
                        "content": [{"type": "text", "text": format!("ran {}", params["name"].as_str().unwrap())}],
                        "isError": self.is_error
                    }))
                }
                _ => Ok(json!({})),
            }
        }

        async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), McpError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), McpError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StubFactory {
        is_error: bool,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TransportFactory for StubFactory {
        async fn open(
            &self,
            _kind: TransportKind,
            _url: &str,
            _headers: &HashMap<String, String>,
        ) -> Result<Box<dyn Transport>, McpError> {
            Ok(Box::new(StubTransport {
                is_error: self.is_error,
                closes: self.closes.clone(),
            }))
        }
    }

    fn server() -> Arc<RemoteToolServer> {
        Arc::new(RemoteToolServer {
            slug: "github".into(),
            url: "http://stub".into(),
            headers: HashMap::new(),
            timeout_ms: None,
            cached_tools: None,
        })
    }

    fn info(name: &str, annotations: Option<ToolAnnotations>) -> RemoteToolInfo {
        RemoteToolInfo {
            name: name.into(),
            description: "does things".into(),
            input_schema: json!({"type": "object"}),
            annotations,
        }
    }

    #[test]
    fn test_name_round_trip_and_rejects() {
        let name = remote_tool_name("github", "get_file_contents");
        assert_eq!(name, "mcp__github__get_file_contents");
        assert_eq!(
            split_remote_tool_name(&name),
            Some(("github", "get_file_contents"))
        );
        assert_eq!(split_remote_tool_name("read_file"), None);
        assert_eq!(split_remote_tool_name("mcp____x"), None);
    }

    #[test]
    fn test_safety_from_annotations() {
        let factory: Arc<dyn TransportFactory> = Arc::new(StubFactory {
            is_error: false,
            closes: Arc::new(AtomicUsize::new(0)),
        });
        let destructive = RemoteTool::new(
            server(),
            info(
                "delete_branch",
                Some(ToolAnnotations {
                    destructive_hint: Some(true),
                    ..Default::default()
                }),
            ),
            factory.clone(),
            RemoteTimeouts::default(),
        );
        assert_eq!(destructive.safety_level(), SafetyLevel::Dangerous);
        assert!(destructive.description().starts_with("[DANGEROUS]"));

        let read_only = RemoteTool::new(
            server(),
            info(
                "list_commits",
                Some(ToolAnnotations {
                    read_only_hint: Some(true),
                    ..Default::default()
                }),
            ),
            factory.clone(),
            RemoteTimeouts::default(),
        );
        assert_eq!(read_only.safety_level(), SafetyLevel::Safe);
        assert!(read_only.description().starts_with("[SAFE]"));

        let plain = RemoteTool::new(server(), info("x", None), factory, RemoteTimeouts::default());
        assert_eq!(plain.safety_level(), SafetyLevel::Cautious);
        assert_eq!(plain.description(), "does things");
    }

    #[tokio::test]
    async fn test_each_call_opens_and_closes_a_connection() {
        let closes = Arc::new(AtomicUsize::new(0));
        let tool = RemoteTool::new(
            server(),
            info("list_commits", None),
            Arc::new(StubFactory {
                is_error: false,
                closes: closes.clone(),
            }),
            RemoteTimeouts::default(),
        );
        let first = tool.execute(json!({}), CancellationToken::new()).await.unwrap();
        let second = tool.execute(json!({}), CancellationToken::new()).await.unwrap();
        assert_eq!(first.agent_content.as_deref(), Some("ran list_commits"));
        assert!(second.success);
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_remote_error_flag_maps_to_remote_tool_error() {
        let tool = RemoteTool::new(
            server(),
            info("delete_branch", None),
            Arc::new(StubFactory {
                is_error: true,
                closes: Arc::new(AtomicUsize::new(0)),
            }),
            RemoteTimeouts::default(),
        );
        let result = tool.execute(json!({}), CancellationToken::new()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_code(), Some(ToolErrorCode::RemoteToolError));
        assert!(result.error.unwrap().message.contains("ran delete_branch"));
    }
}
