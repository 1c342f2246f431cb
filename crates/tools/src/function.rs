use crate::traits::{Tool, ToolError};
use aiops_core::{CancellationToken, SafetyLevel, ToolCategory, ToolResult};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

type Handler = Arc<
    dyn Fn(serde_json::Value, CancellationToken) -> BoxFuture<'static, Result<ToolResult, ToolError>>
        + Send
        + Sync,
>;

/// Tool backed by an async closure. Used for locally defined tools.
pub struct FnTool {
    name: String,
    description: String,
    schema: serde_json::Value,
    safety: SafetyLevel,
    category: ToolCategory,
    handler: Handler,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: serde_json::Value,
        handler: F,
    ) -> Self
    where
        F: Fn(serde_json::Value, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolResult, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            safety: SafetyLevel::Safe,
            category: ToolCategory::General,
            handler: Arc::new(move |args, cancel| Box::pin(handler(args, cancel))),
        }
    }

    pub fn with_safety(mut self, safety: SafetyLevel) -> Self {
        self.safety = safety;
        self
    }

    pub fn with_category(mut self, category: ToolCategory) -> Self {
        self.category = category;
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    fn safety_level(&self) -> SafetyLevel {
        self.safety
    }

    fn category(&self) -> ToolCategory {
        self.category
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        (self.handler)(args, cancel).await
    }
}
