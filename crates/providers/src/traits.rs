use crate::error::ProviderError;
use aiops_core::{CancellationToken, Message, ToolCall, ToolSpec};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// One model invocation.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// Delivered through the backend's instruction channel, never as history.
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolUse,
    Length,
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    /// Complete batch of tool calls; arguments are fully assembled.
    ToolCalls(Vec<ToolCall>),
    Finished {
        reason: FinishReason,
        usage: Option<Usage>,
    },
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ProviderError>> + Send>>;

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Render generic history into the backend's native turn list.
    fn format_history(&self, messages: &[Message]) -> Vec<serde_json::Value>;

    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderStream, ProviderError>;
}
