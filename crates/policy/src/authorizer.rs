//! Scope gate for mutating tool calls made in fix mode.

use aiops_core::{AgentMode, FixTargetScope, SafetyLevel, ToolErrorCode, ToolResult};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

const SERVICE_KEYS: &[&str] = &["service", "serviceName", "service_name", "deployment"];
const PATH_KEYS: &[&str] = &["path", "file_path", "filePath", "paths", "files"];

#[derive(Debug, Clone, PartialEq)]
pub enum AuthorizationDecision {
    Allowed,
    Denied(String),
}

impl AuthorizationDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthorizationDecision::Allowed)
    }

    /// The failed result handed back to the model for a denial.
    pub fn into_denial(self) -> Option<ToolResult> {
        match self {
            AuthorizationDecision::Allowed => None,
            AuthorizationDecision::Denied(reason) => Some(
                ToolResult::failure(ToolErrorCode::AuthorizationDenied, reason, true)
                    .with_suggested_action(
                        "Restrict the change to the approved service and files, or ask the user to confirm.",
                    ),
            ),
        }
    }
}

/// Per-turn authorizer. Only DANGEROUS calls in fix mode are inspected.
#[derive(Debug, Clone, Default)]
pub struct FixTargetAuthorizer {
    mode: AgentMode,
    scope: Option<FixTargetScope>,
    confirmed: HashSet<String>,
}

impl FixTargetAuthorizer {
    pub fn new(mode: AgentMode, scope: Option<FixTargetScope>) -> Self {
        Self {
            mode,
            scope,
            confirmed: HashSet::new(),
        }
    }

    /// Tools the user explicitly confirmed for this turn.
    pub fn with_confirmed<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.confirmed.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn authorize(&self, tool: &str, safety: SafetyLevel, args: &Value) -> AuthorizationDecision {
        if self.mode != AgentMode::Fix || safety != SafetyLevel::Dangerous {
            return AuthorizationDecision::Allowed;
        }
        if self.confirmed.contains(tool) {
            debug!("Dangerous tool {} allowed by explicit confirmation", tool);
            return AuthorizationDecision::Allowed;
        }

        let decision = match &self.scope {
            None => AuthorizationDecision::Denied(format!(
                "{tool} is a mutating tool and no fix target has been approved"
            )),
            Some(scope) => check_scope(tool, scope, args),
        };
        if let AuthorizationDecision::Denied(reason) = &decision {
            warn!("Authorization denied for {}: {}", tool, reason);
        }
        decision
    }
}

fn check_scope(tool: &str, scope: &FixTargetScope, args: &Value) -> AuthorizationDecision {
    let services: Vec<&str> = SERVICE_KEYS
        .iter()
        .filter_map(|key| args.get(*key).and_then(Value::as_str))
        .collect();
    let paths = target_paths(args);

    if services.is_empty() && paths.is_empty() {
        return AuthorizationDecision::Denied(format!(
            "{tool} call names no service or file, so it cannot be checked against the approved target"
        ));
    }

    for service in services {
        if !service.trim().eq_ignore_ascii_case(scope.service_name.trim()) {
            return AuthorizationDecision::Denied(format!(
                "service '{service}' is outside the approved target '{}'",
                scope.service_name
            ));
        }
    }

    if !paths.is_empty() {
        let allowed: Vec<String> = scope.file_paths.iter().map(|p| normalize(p)).collect();
        for path in &paths {
            let path = normalize(path);
            if path.split('/').any(|segment| segment == "..") {
                return AuthorizationDecision::Denied(format!(
                    "file '{path}' escapes its directory"
                ));
            }
            if !allowed.iter().any(|root| path_within(&path, root)) {
                return AuthorizationDecision::Denied(format!(
                    "file '{path}' is outside the approved files [{}]",
                    scope.file_paths.join(", ")
                ));
            }
        }
    }

    AuthorizationDecision::Allowed
}

fn target_paths(args: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    for key in PATH_KEYS {
        match args.get(*key) {
            Some(Value::String(path)) => paths.push(path.clone()),
            Some(Value::Array(items)) => {
                paths.extend(items.iter().filter_map(Value::as_str).map(str::to_string))
            }
            _ => {}
        }
    }
    paths
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim();
    let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
    trimmed.trim_start_matches('/').trim_end_matches('/').to_string()
}

fn path_within(path: &str, root: &str) -> bool {
    if root.is_empty() {
        return false;
    }
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn scope() -> FixTargetScope {
        FixTargetScope {
            service_name: "checkout".into(),
            suggested_fix: "raise the pool size".into(),
            file_paths: vec!["services/checkout/config.yaml".into(), "services/checkout/src".into()],
        }
    }

    #[test]
    fn test_investigate_mode_bypasses_gate() {
        let authorizer = FixTargetAuthorizer::new(AgentMode::Investigate, None);
        assert!(authorizer
            .authorize("delete_pod", SafetyLevel::Dangerous, &json!({}))
            .is_allowed());
    }

    #[test]
    fn test_non_dangerous_allowed_in_fix_mode() {
        let authorizer = FixTargetAuthorizer::new(AgentMode::Fix, None);
        assert!(authorizer
            .authorize("get_pods", SafetyLevel::Cautious, &json!({}))
            .is_allowed());
    }

    #[test]
    fn test_missing_scope_denied() {
        let authorizer = FixTargetAuthorizer::new(AgentMode::Fix, None);
        let decision =
            authorizer.authorize("update_file", SafetyLevel::Dangerous, &json!({"path": "a.rs"}));
        let denial = decision.into_denial().unwrap();
        assert_eq!(denial.error_code(), Some(ToolErrorCode::AuthorizationDenied));
    }

    #[test]
    fn test_confirmation_overrides() {
        let authorizer =
            FixTargetAuthorizer::new(AgentMode::Fix, None).with_confirmed(["restart_service"]);
        assert!(authorizer
            .authorize("restart_service", SafetyLevel::Dangerous, &json!({}))
            .is_allowed());
    }

    #[test]
    fn test_paths_and_service_checked_against_scope() {
        let authorizer = FixTargetAuthorizer::new(AgentMode::Fix, Some(scope()));
        assert!(authorizer
            .authorize(
                "update_file",
                SafetyLevel::Dangerous,
                &json!({"path": "./services/checkout/src/pool.rs", "service": "checkout"})
            )
            .is_allowed());
        assert!(!authorizer
            .authorize(
                "update_file",
                SafetyLevel::Dangerous,
                &json!({"files": ["services/checkout/config.yaml", "services/payments/main.rs"]})
            )
            .is_allowed());
        assert!(!authorizer
            .authorize("restart_service", SafetyLevel::Dangerous, &json!({"service": "payments"}))
            .is_allowed());
    }

    #[test]
    fn test_sibling_prefix_is_not_within_scope() {
        assert!(!path_within("services/checkout/srcx/a.rs", "services/checkout/src"));
        assert!(path_within("services/checkout/src", "services/checkout/src"));
    }

    #[test]
    fn test_every_service_key_checked() {
        let authorizer = FixTargetAuthorizer::new(AgentMode::Fix, Some(scope()));
        let decision = authorizer.authorize(
            "scale_deployment",
            SafetyLevel::Dangerous,
            &json!({"service": "checkout", "deployment": "payments"}),
        );
        assert!(matches!(
            decision,
            AuthorizationDecision::Denied(reason) if reason.contains("payments")
        ));

        let both_in_scope = authorizer.authorize(
            "scale_deployment",
            SafetyLevel::Dangerous,
            &json!({"service": "checkout", "deployment": "Checkout"}),
        );
        assert!(both_in_scope.is_allowed());
    }

    #[test]
    fn test_parent_traversal_denied() {
        let authorizer = FixTargetAuthorizer::new(AgentMode::Fix, Some(scope()));
        let decision = authorizer.authorize(
            "write_file",
            SafetyLevel::Dangerous,
            &json!({"path": "services/checkout/src/../../billing/db.yaml"}),
        );
        assert!(!decision.is_allowed());
    }

    #[test]
    fn test_untargeted_call_denied() {
        let authorizer = FixTargetAuthorizer::new(AgentMode::Fix, Some(scope()));
        assert!(!authorizer
            .authorize("run_migration", SafetyLevel::Dangerous, &json!({"sql": "drop table"}))
            .is_allowed());
    }

    proptest! {
        #[test]
        fn prop_dangerous_without_scope_always_denied(tool in "[a-z_]{1,20}", key in "[a-z]{1,8}", value in ".*") {
            let authorizer = FixTargetAuthorizer::new(AgentMode::Fix, None);
            let args = json!({ key: value });
            prop_assert!(!authorizer.authorize(&tool, SafetyLevel::Dangerous, &args).is_allowed());
        }
    }
}
