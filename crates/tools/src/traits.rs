use aiops_core::{CancellationToken, SafetyLevel, ToolCategory, ToolResult};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("Operation timed out")]
    Timeout,
    #[error("Operation cancelled")]
    Cancelled,
}

/// A named capability the model may invoke.
///
/// Implementations should observe `cancel` for long-running work; the
/// registry also aborts the task when the token fires.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the arguments object.
    fn schema(&self) -> serde_json::Value;

    fn safety_level(&self) -> SafetyLevel {
        SafetyLevel::Safe
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::General
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError>;
}

/// Fetch a required string argument.
pub fn required_str<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::Validation(format!("missing required argument '{key}'")))
}
