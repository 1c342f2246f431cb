//! Agent configuration loader.

use aiops_memory::MaskingPolicy;
use aiops_providers::{ProviderConfig, ProviderKind};
use aiops_tools::{ExecutionOptions, RemoteTimeouts};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Per-turn limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TurnConfig {
    /// Tool calls executed per turn before the turn is finalized.
    pub max_tool_calls: usize,
    /// Provider rounds per turn.
    pub max_iterations: usize,
    pub tool_timeout_secs: u64,
    pub max_tool_output_chars: usize,
    /// Emit `on_debug` records.
    pub verbose: bool,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: 25,
            max_iterations: 30,
            tool_timeout_secs: 120,
            max_tool_output_chars: 30_000,
            verbose: false,
        }
    }
}

impl TurnConfig {
    pub fn execution_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            timeout: Some(Duration::from_secs(self.tool_timeout_secs)),
            max_output_chars: Some(self.max_tool_output_chars),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteToolsConfig {
    pub handshake_timeout_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for RemoteToolsConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            call_timeout_ms: 60_000,
        }
    }
}

impl RemoteToolsConfig {
    pub fn timeouts(&self) -> RemoteTimeouts {
        RemoteTimeouts {
            handshake: Duration::from_millis(self.handshake_timeout_ms),
            call: Duration::from_millis(self.call_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConversationConfig {
    pub ttl_secs: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self { ttl_secs: 86_400 }
    }
}

/// Agent configuration. Every section has defaults, so an empty file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub provider: ProviderConfig,
    pub turn: TurnConfig,
    pub masking: MaskingPolicy,
    pub remote_tools: RemoteToolsConfig,
    pub cache: CacheConfig,
    pub conversation: ConversationConfig,
}

impl AgentConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `AIOPS_PROVIDER`, `AIOPS_MODEL` and `AIOPS_BASE_URL` as returned by `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(provider) = non_empty("AIOPS_PROVIDER") {
            self.provider.kind = provider
                .parse::<ProviderKind>()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if let Some(model) = non_empty("AIOPS_MODEL") {
            self.provider.model = model.trim().to_string();
        }
        if let Some(base_url) = non_empty("AIOPS_BASE_URL") {
            self.provider.base_url = Some(base_url.trim().to_string());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(bool, &str); 8] = [
            (self.provider.max_tokens > 0, "provider.max_tokens must be positive"),
            (
                self.provider.request_timeout_secs > 0,
                "provider.request_timeout_secs must be positive",
            ),
            (self.turn.max_tool_calls > 0, "turn.max_tool_calls must be positive"),
            (self.turn.max_iterations > 0, "turn.max_iterations must be positive"),
            (self.turn.tool_timeout_secs > 0, "turn.tool_timeout_secs must be positive"),
            (
                self.masking.token_threshold > 0,
                "masking.token_threshold must be positive",
            ),
            (
                self.remote_tools.handshake_timeout_ms > 0 && self.remote_tools.call_timeout_ms > 0,
                "remote_tools timeouts must be positive",
            ),
            (self.cache.capacity > 0, "cache.capacity must be positive"),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(ConfigError::Invalid(message.to_string())),
            None => Ok(()),
        }
    }
}

/// Load, apply environment overrides, and validate.
pub fn load_agent_config<P: AsRef<Path>>(config_path: P) -> Result<AgentConfig, ConfigError> {
    let path = config_path.as_ref();
    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }
    let content = std::fs::read_to_string(path)?;
    let mut config = AgentConfig::from_yaml_str(&content)?;
    config.apply_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    info!(
        "Loaded agent config from {} (provider: {})",
        path.display(),
        config.provider.kind.as_str()
    );
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_empty_file_is_default() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("agent.yaml");
        fs::write(&path, "\n").unwrap();

        let config = AgentConfig::from_yaml_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.turn.max_tool_calls, 25);
        assert_eq!(config.masking.token_threshold, 60_000);
        assert_eq!(config.masking.recency_window, 5);
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let yaml = "provider:\n  kind: gemini\n  model: gemini-2.5-flash\nturn:\n  max_tool_calls: 5\nmasking:\n  recency_window: 2\n";
        let config = AgentConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.provider.kind, ProviderKind::Gemini);
        assert_eq!(config.provider.model, "gemini-2.5-flash");
        assert_eq!(config.provider.max_retries, 2);
        assert_eq!(config.turn.max_tool_calls, 5);
        assert_eq!(config.turn.max_iterations, 30);
        assert_eq!(config.masking.recency_window, 2);
        assert_eq!(config.masking.token_threshold, 60_000);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("AIOPS_PROVIDER", "openai"),
            ("AIOPS_MODEL", " gpt-4.1 "),
            ("AIOPS_BASE_URL", "http://localhost:8080/v1"),
        ]
        .into_iter()
        .collect();

        let mut config = AgentConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.provider.kind, ProviderKind::OpenAi);
        assert_eq!(config.provider.model, "gpt-4.1");
        assert_eq!(
            config.provider.base_url.as_deref(),
            Some("http://localhost:8080/v1")
        );

        let result = config.apply_overrides(|key| (key == "AIOPS_PROVIDER").then(|| "bedrock".into()));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_rejects_zero_budgets() {
        let mut config = AgentConfig::default();
        assert!(config.validate().is_ok());
        config.turn.max_tool_calls = 0;
        match config.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("max_tool_calls")),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_file_and_bad_yaml() {
        assert!(matches!(
            load_agent_config("/nonexistent/agent.yaml"),
            Err(ConfigError::NotFound(_))
        ));

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("agent.yaml");
        fs::write(&path, "turn: [not, a, map]\n").unwrap();
        assert!(matches!(load_agent_config(&path), Err(ConfigError::Yaml(_))));
    }
}
