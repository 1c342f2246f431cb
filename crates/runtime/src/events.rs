//! Caller-facing event stream of a turn.

use crate::evidence::EvidenceEvent;
use crate::orchestrator::TurnOutcome;
use aiops_core::{ClassifiedError, ToolCall, ToolResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Pending,
    Completed,
    Failed,
}

/// Progress of one tool call as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub call_id: String,
    pub tool: String,
    pub status: ActivityStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Receiver of everything a turn produces. Text chunks arrive in provider
/// order; events about a tool call arrive after that call has completed,
/// except its `Pending` activity.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_text_chunk(&self, text: &str);

    async fn on_tool_call(&self, call: &ToolCall);

    async fn on_activity(&self, activity: &ActivityEvent);

    async fn on_tool_result(&self, call: &ToolCall, result: &ToolResult);

    async fn on_evidence(&self, call_id: &str, evidence: &EvidenceEvent);

    /// Verbose diagnostics; only emitted when the turn runs verbose.
    async fn on_debug(&self, _label: &str, _detail: &Value) {}

    /// Terminal. Nothing follows it.
    async fn on_error(&self, error: &ClassifiedError);

    async fn on_turn_complete(&self, _outcome: &TurnOutcome) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    TextChunk(String),
    ToolCall(ToolCall),
    Activity(ActivityEvent),
    ToolResult { call_id: String, tool: String, result: ToolResult },
    Evidence { call_id: String, evidence: EvidenceEvent },
    Debug { label: String, detail: Value },
    Error(ClassifiedError),
    TurnComplete(TurnOutcome),
}

/// Forwards every callback as an [`AgentEvent`] over an unbounded channel,
/// for transports that consume events on another task.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: AgentEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn on_text_chunk(&self, text: &str) {
        self.send(AgentEvent::TextChunk(text.to_string()));
    }

    async fn on_tool_call(&self, call: &ToolCall) {
        self.send(AgentEvent::ToolCall(call.clone()));
    }

    async fn on_activity(&self, activity: &ActivityEvent) {
        self.send(AgentEvent::Activity(activity.clone()));
    }

    async fn on_tool_result(&self, call: &ToolCall, result: &ToolResult) {
        self.send(AgentEvent::ToolResult {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            result: result.clone(),
        });
    }

    async fn on_evidence(&self, call_id: &str, evidence: &EvidenceEvent) {
        self.send(AgentEvent::Evidence {
            call_id: call_id.to_string(),
            evidence: evidence.clone(),
        });
    }

    async fn on_debug(&self, label: &str, detail: &Value) {
        self.send(AgentEvent::Debug {
            label: label.to_string(),
            detail: detail.clone(),
        });
    }

    async fn on_error(&self, error: &ClassifiedError) {
        self.send(AgentEvent::Error(error.clone()));
    }

    async fn on_turn_complete(&self, outcome: &TurnOutcome) {
        self.send(AgentEvent::TurnComplete(outcome.clone()));
    }
}
