use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a message in the generic conversation model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Atomic content unit within a message.
///
/// A `ToolCall` and the `ToolResult` answering it share the same `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        args: Value,
    },
    ToolResult {
        id: String,
        name: String,
        result: ToolResult,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn tool_call(call: &ToolCall) -> Self {
        Part::ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            args: call.args.clone(),
        }
    }

    pub fn tool_result(call: &ToolCall, result: ToolResult) -> Self {
        Part::ToolResult {
            id: call.id.clone(),
            name: call.name.clone(),
            result,
        }
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, Part::ToolResult { .. })
    }
}

/// One role-tagged turn unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub timestamp: i64,
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            role,
            parts,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn system_text(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![Part::text(text)])
    }

    /// Assistant turn carrying optional prose followed by the tool calls it requested.
    pub fn assistant(text: Option<String>, calls: &[ToolCall]) -> Self {
        let mut parts = Vec::with_capacity(calls.len() + 1);
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            parts.push(Part::Text { text });
        }
        parts.extend(calls.iter().map(Part::tool_call));
        Self::new(Role::Assistant, parts)
    }

    /// Tool results travel back to the model in a user-role message.
    pub fn tool_results(results: Vec<Part>) -> Self {
        Self::new(Role::User, results)
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::ToolCall { id, name, args } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    args: args.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Machine-readable reason attached to a failed [`ToolResult`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolErrorCode {
    ToolNotFound,
    ToolExecutionError,
    InvalidArguments,
    AuthorizationDenied,
    Timeout,
    Cancelled,
    RemoteToolError,
    BudgetExceeded,
}

impl ToolErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorCode::ToolNotFound => "TOOL_NOT_FOUND",
            ToolErrorCode::ToolExecutionError => "TOOL_EXECUTION_ERROR",
            ToolErrorCode::InvalidArguments => "INVALID_ARGUMENTS",
            ToolErrorCode::AuthorizationDenied => "AUTHORIZATION_DENIED",
            ToolErrorCode::Timeout => "TIMEOUT",
            ToolErrorCode::Cancelled => "CANCELLED",
            ToolErrorCode::RemoteToolError => "REMOTE_TOOL_ERROR",
            ToolErrorCode::BudgetExceeded => "BUDGET_EXCEEDED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolErrorInfo {
    pub message: String,
    pub code: ToolErrorCode,
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

/// Outcome of one tool execution. Produced once per tool call and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorInfo>,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            agent_content: Some(content.into()),
            error: None,
        }
    }

    pub fn failure(code: ToolErrorCode, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            success: false,
            agent_content: None,
            error: Some(ToolErrorInfo {
                message: message.into(),
                code,
                recoverable,
                suggested_action: None,
            }),
        }
    }

    pub fn with_suggested_action(mut self, action: impl Into<String>) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.suggested_action = Some(action.into());
        }
        self
    }

    pub fn error_code(&self) -> Option<ToolErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }

    /// Text the model sees for this result.
    pub fn observation(&self) -> &str {
        if let Some(content) = self.agent_content.as_deref() {
            return content;
        }
        self.error.as_ref().map(|e| e.message.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyLevel {
    Safe,
    Cautious,
    Dangerous,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Cluster,
    Logs,
    Repository,
    Database,
    Remote,
    General,
}

/// Whether the turn only investigates or may also apply a fix.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    #[default]
    Investigate,
    Fix,
}

/// Restriction for mutating tool calls in fix mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FixTargetScope {
    pub service_name: String,
    #[serde(default)]
    pub suggested_fix: String,
    #[serde(default)]
    pub file_paths: Vec<String>,
}

/// Backend-neutral description of a tool offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}
