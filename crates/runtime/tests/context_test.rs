#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aiops_core::{AgentMode, CancellationToken, Message, SafetyLevel, ToolResult};
use aiops_mcp::{McpError, Transport, TransportFactory, TransportKind};
use aiops_memory::InMemoryConversationStore;
use aiops_providers::{CompletionRequest, ProviderAdapter, ProviderError, ProviderStream};
use aiops_runtime::{AgentConfig, AgentContext};
use aiops_tools::{FnTool, RemoteToolServer, Tool};
use async_trait::async_trait;
use serde_json::{json, Value};

struct IdleProvider;

#[async_trait]
impl ProviderAdapter for IdleProvider {
    fn name(&self) -> &str {
        "idle"
    }

    fn format_history(&self, _messages: &[Message]) -> Vec<Value> {
        Vec::new()
    }

    async fn stream_completion(
        &self,
        _request: CompletionRequest,
        _cancel: CancellationToken,
    ) -> Result<ProviderStream, ProviderError> {
        Err(ProviderError::Network("not used".into()))
    }
}

/// Serves a fixed tool list; counts every connection it opens.
#[derive(Default)]
struct ListingFactory {
    opens: AtomicUsize,
    unreachable: bool,
}

struct ListingTransport {
    kind: TransportKind,
}

#[async_trait]
impl Transport for ListingTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn request(&self, method: &str, _params: Option<Value>) -> Result<Value, McpError> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": "2025-03-26",
                "serverInfo": {"name": "github", "version": "1.0"}
            })),
            "tools/list" => Ok(json!({
                "tools": [
                    {
                        "name": "get_file_contents",
                        "description": "Read a file",
                        "inputSchema": {"type": "object"},
                        "annotations": {"readOnlyHint": true}
                    },
                    {
                        "name": "delete_branch",
                        "description": "Delete a branch",
                        "inputSchema": {"type": "object"},
                        "annotations": {"destructiveHint": true}
                    }
                ]
            })),
            other => Err(McpError::Protocol(format!("unexpected {other}"))),
        }
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), McpError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), McpError> {
        Ok(())
    }
}

#[async_trait]
impl TransportFactory for ListingFactory {
    async fn open(
        &self,
        kind: TransportKind,
        url: &str,
        _headers: &HashMap<String, String>,
    ) -> Result<Box<dyn Transport>, McpError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.unreachable {
            return Err(McpError::Transport(format!("{url} unreachable")));
        }
        Ok(Box::new(ListingTransport { kind }))
    }
}

fn context(factory: Arc<ListingFactory>) -> AgentContext {
    AgentContext::new(
        AgentConfig::default(),
        Arc::new(IdleProvider),
        Arc::new(InMemoryConversationStore::new(Duration::from_secs(60))),
        factory,
    )
}

fn builtin(name: &str, safety: SafetyLevel) -> Arc<dyn Tool> {
    Arc::new(
        FnTool::new(name, name, json!({"type": "object"}), |_args, _cancel| async {
            Ok(ToolResult::ok("ok"))
        })
        .with_safety(safety),
    )
}

fn github() -> RemoteToolServer {
    RemoteToolServer {
        slug: "github".into(),
        url: "http://github-mcp.local/mcp".into(),
        headers: HashMap::new(),
        timeout_ms: None,
        cached_tools: None,
    }
}

#[tokio::test]
async fn test_investigate_mode_hides_dangerous_tools() {
    let factory = Arc::new(ListingFactory::default());
    let ctx = context(factory.clone());
    let builtins = vec![
        builtin("get_pods", SafetyLevel::Safe),
        builtin("restart_service", SafetyLevel::Dangerous),
    ];

    let registry = tokio_test::assert_ok!(
        ctx.build_registry(AgentMode::Investigate, builtins, &[github()])
            .await
    );
    assert_eq!(registry.mode(), AgentMode::Investigate);
    assert!(registry.get("get_pods").is_some());
    assert!(registry.get("restart_service").is_none());
    assert!(registry.get("mcp__github__get_file_contents").is_some());
    assert!(registry.get("mcp__github__delete_branch").is_none());
}

#[tokio::test]
async fn test_fix_mode_offers_dangerous_tools() {
    let ctx = context(Arc::new(ListingFactory::default()));
    let registry = ctx
        .build_registry(
            AgentMode::Fix,
            vec![builtin("restart_service", SafetyLevel::Dangerous)],
            &[github()],
        )
        .await
        .unwrap();
    assert_eq!(registry.mode(), AgentMode::Fix);
    assert!(registry.get("restart_service").is_some());
    assert_eq!(
        registry
            .get("mcp__github__delete_branch")
            .unwrap()
            .safety_level(),
        SafetyLevel::Dangerous
    );
}

#[tokio::test]
async fn test_remote_tool_list_is_cached() {
    let factory = Arc::new(ListingFactory::default());
    let ctx = context(factory.clone());

    ctx.build_registry(AgentMode::Investigate, vec![], &[github()])
        .await
        .unwrap();
    let after_first = factory.opens.load(Ordering::SeqCst);
    assert!(after_first >= 1);

    let registry = ctx
        .build_registry(AgentMode::Investigate, vec![], &[github()])
        .await
        .unwrap();
    assert_eq!(factory.opens.load(Ordering::SeqCst), after_first);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_unreachable_server_is_skipped() {
    let factory = Arc::new(ListingFactory {
        unreachable: true,
        ..Default::default()
    });
    let ctx = context(factory);
    let registry = ctx
        .build_registry(
            AgentMode::Investigate,
            vec![builtin("get_pods", SafetyLevel::Safe)],
            &[github()],
        )
        .await
        .unwrap();
    assert_eq!(registry.len(), 1);
}
