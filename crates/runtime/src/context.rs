//! Constructed-once state shared by every turn of a process.

use crate::config::AgentConfig;
use crate::error::RuntimeError;
use aiops_core::{AgentMode, SafetyLevel};
use aiops_mcp::{HttpTransportFactory, RemoteToolInfo, TransportFactory};
use aiops_memory::{ConversationStore, InMemoryConversationStore, TwoTierCache};
use aiops_providers::{ProviderAdapter, ProviderClient};
use aiops_tools::{discover_tools, RemoteTool, RemoteToolServer, Tool, ToolRegistry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct AgentContext {
    config: AgentConfig,
    provider: Arc<dyn ProviderAdapter>,
    cache: TwoTierCache,
    store: Arc<dyn ConversationStore>,
    transport_factory: Arc<dyn TransportFactory>,
}

impl AgentContext {
    pub fn new(
        config: AgentConfig,
        provider: Arc<dyn ProviderAdapter>,
        store: Arc<dyn ConversationStore>,
        transport_factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let cache = TwoTierCache::local_only(
            config.cache.capacity,
            Duration::from_secs(config.cache.ttl_secs),
        );
        Self {
            config,
            provider,
            cache,
            store,
            transport_factory,
        }
    }

    /// Replace the cache, typically to put an external tier behind it.
    pub fn with_cache(mut self, cache: TwoTierCache) -> Self {
        self.cache = cache;
        self
    }

    /// Production wiring: HTTP provider, in-memory conversations, HTTP tool transports.
    pub fn from_config(config: AgentConfig) -> Result<Self, RuntimeError> {
        let provider = Arc::new(ProviderClient::from_config(&config.provider)?);
        let store = Arc::new(InMemoryConversationStore::new(Duration::from_secs(
            config.conversation.ttl_secs,
        )));
        Ok(Self::new(
            config,
            provider,
            store,
            Arc::new(HttpTransportFactory::new()),
        ))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn provider(&self) -> &dyn ProviderAdapter {
        self.provider.as_ref()
    }

    pub fn store(&self) -> &dyn ConversationStore {
        self.store.as_ref()
    }

    pub fn cache(&self) -> &TwoTierCache {
        &self.cache
    }

    /// Compose the tool set for one session. Dangerous tools, built-in or
    /// remote, are only offered in fix mode. Servers that cannot be reached
    /// are skipped with a warning.
    pub async fn build_registry(
        &self,
        mode: AgentMode,
        builtins: Vec<Arc<dyn Tool>>,
        remote_servers: &[RemoteToolServer],
    ) -> Result<ToolRegistry, RuntimeError> {
        let mut registry =
            ToolRegistry::with_options(self.config.turn.execution_options()).with_mode(mode);
        let allowed = |tool: &Arc<dyn Tool>| {
            mode == AgentMode::Fix || tool.safety_level() != SafetyLevel::Dangerous
        };

        for tool in builtins.into_iter().filter(|t| allowed(t)) {
            registry.register(tool)?;
        }

        let timeouts = self.config.remote_tools.timeouts();
        for server in remote_servers {
            let Some(tools) = self.remote_tool_list(server).await else {
                continue;
            };
            let server = Arc::new(server.clone());
            for tool in RemoteTool::for_server(server, &tools, self.transport_factory.clone(), timeouts)
            {
                if allowed(&tool) {
                    registry.register(tool)?;
                }
            }
        }

        info!("Tool registry ready: {} tools ({:?} mode)", registry.len(), mode);
        Ok(registry)
    }

    async fn remote_tool_list(&self, server: &RemoteToolServer) -> Option<Vec<RemoteToolInfo>> {
        if let Some(tools) = &server.cached_tools {
            return Some(tools.clone());
        }
        let key = remote_tools_cache_key(server);
        if let Some(tools) = self.cache.get_json::<Vec<RemoteToolInfo>>(&key).await {
            debug!("Remote tool list for '{}' served from cache", server.slug);
            return Some(tools);
        }
        match discover_tools(
            server,
            self.transport_factory.clone(),
            self.config.remote_tools.timeouts().handshake,
        )
        .await
        {
            Ok(tools) => {
                self.cache.set_json(&key, &tools).await;
                Some(tools)
            }
            Err(e) => {
                warn!("Skipping remote tool server '{}': {}", server.slug, e);
                None
            }
        }
    }
}

fn remote_tools_cache_key(server: &RemoteToolServer) -> String {
    format!("remote-tools:{}:{}", server.url, server.slug)
}
