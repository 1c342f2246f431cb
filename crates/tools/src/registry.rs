use crate::traits::{Tool, ToolError};
use aiops_core::{
    AgentMode, CancellationToken, ToolCategory, ToolErrorCode, ToolResult, ToolSpec,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// How long a signalled tool gets to release its resources before it is aborted.
const CLEANUP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("Tool already registered: {0}")]
    AlreadyRegistered(String),
}

/// Limits applied to every execution going through the registry.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub timeout: Option<Duration>,
    /// Agent-facing content longer than this is cut and marked as truncated.
    pub max_output_chars: Option<usize>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(120)),
            max_output_chars: Some(30_000),
        }
    }
}

enum Outcome {
    Finished(Result<Result<ToolResult, ToolError>, tokio::task::JoinError>),
    TimedOut(Duration),
    Cancelled,
}

/// Name-keyed tool set for one turn. Names are unique; iteration follows
/// registration order so the model sees a stable tool list. The registry
/// remembers which [`AgentMode`] its tool set was filtered for.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
    options: ExecutionOptions,
    mode: AgentMode,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ExecutionOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: AgentMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.order.push(name.clone());
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn get_all(&self) -> Vec<Arc<dyn Tool>> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name).cloned())
            .collect()
    }

    pub fn get_by_category(&self, category: ToolCategory) -> Vec<Arc<dyn Tool>> {
        self.get_all()
            .into_iter()
            .filter(|tool| tool.category() == category)
            .collect()
    }

    pub fn list(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn schemas(&self) -> Vec<ToolSpec> {
        self.get_all()
            .iter()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.schema(),
            })
            .collect()
    }

    /// Run a tool by name. Never fails: every problem becomes a failed [`ToolResult`].
    pub async fn execute(
        &self,
        name: &str,
        args: serde_json::Value,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let Some(tool) = self.get(name) else {
            warn!("Unknown tool requested: {}", name);
            return ToolResult::failure(
                ToolErrorCode::ToolNotFound,
                format!("Tool not found: {name}"),
                false,
            )
            .with_suggested_action(format!("Use one of: {}", self.order.join(", ")));
        };

        if cancel.is_cancelled() {
            return cancelled_result(name);
        }

        let tool_cancel = cancel.child_token();
        let task_cancel = tool_cancel.clone();
        // Spawned so a panicking tool cannot take the turn down with it.
        let mut handle = tokio::spawn(async move { tool.execute(args, task_cancel).await });

        let outcome = match self.options.timeout {
            Some(limit) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Outcome::Cancelled,
                joined = tokio::time::timeout(limit, &mut handle) => match joined {
                    Ok(joined) => Outcome::Finished(joined),
                    Err(_) => Outcome::TimedOut(limit),
                },
            },
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => Outcome::Cancelled,
                joined = &mut handle => Outcome::Finished(joined),
            },
        };

        let result = match outcome {
            Outcome::Finished(Ok(Ok(result))) => result,
            Outcome::Finished(Ok(Err(ToolError::Cancelled))) => cancelled_result(name),
            Outcome::Finished(Ok(Err(e))) => {
                debug!("Tool {} failed: {}", name, e);
                ToolResult::failure(ToolErrorCode::ToolExecutionError, e.to_string(), true)
            }
            Outcome::Finished(Err(join_err)) => {
                if join_err.is_panic() {
                    error!("Tool {} panicked", name);
                    ToolResult::failure(
                        ToolErrorCode::ToolExecutionError,
                        format!("Tool {name} panicked during execution"),
                        true,
                    )
                } else {
                    cancelled_result(name)
                }
            }
            Outcome::TimedOut(limit) => {
                wind_down(name, &tool_cancel, handle).await;
                warn!("Tool {} timed out after {}ms", name, limit.as_millis());
                ToolResult::failure(
                    ToolErrorCode::Timeout,
                    format!("Tool {name} timed out after {}ms", limit.as_millis()),
                    true,
                )
            }
            Outcome::Cancelled => {
                wind_down(name, &tool_cancel, handle).await;
                cancelled_result(name)
            }
        };

        match self.options.max_output_chars {
            Some(limit) => truncate_output(result, limit),
            None => result,
        }
    }
}

/// Signal the tool and let it finish its own cleanup, aborting only if it
/// overstays [`CLEANUP_GRACE`].
async fn wind_down<T>(name: &str, tool_cancel: &CancellationToken, mut handle: JoinHandle<T>) {
    tool_cancel.cancel();
    if tokio::time::timeout(CLEANUP_GRACE, &mut handle).await.is_err() {
        warn!("Tool {} ignored cancellation, aborting", name);
        handle.abort();
    }
}

fn cancelled_result(name: &str) -> ToolResult {
    ToolResult::failure(
        ToolErrorCode::Cancelled,
        format!("Tool {name} was cancelled"),
        false,
    )
}

fn truncate_output(mut result: ToolResult, limit: usize) -> ToolResult {
    if let Some(content) = result.agent_content.as_mut() {
        let total = content.chars().count();
        if total > limit {
            let cut: String = content.chars().take(limit).collect();
            *content = format!("{cut}\n\n[output truncated: showing {limit} of {total} characters]");
        }
    }
    result
}
