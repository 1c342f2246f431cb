//! System prompt for each agent mode.

use aiops_core::{AgentMode, FixTargetScope, ToolSpec};

const INVESTIGATE_ROLE: &str = "You are an AIOps investigation assistant for ephemeral deployment environments. \
A deployment is misbehaving. Find the root cause by gathering evidence with the tools available to you: \
cluster state, pod logs, the source repository and database records.";

const FIX_ROLE: &str = "You are an AIOps remediation assistant for ephemeral deployment environments. \
The root cause has been identified. Apply the approved fix, touching only the approved target.";

const GUIDELINES: &str = "Guidelines:
- Prefer read-only tools. Gather evidence before drawing conclusions.
- Batch independent tool calls in one response so they can run together.
- When a tool fails, read its error and adapt instead of repeating the same call.
- Cite the resources, files and commits your conclusion rests on.";

const INVESTIGATE_PAYLOAD: &str = "When the investigation is complete, reply with a single JSON object in a ```json fenced block, \
optionally preceded by one short sentence:
{\"type\": \"investigation_report\", \"summary\": string, \"root_cause\": string, \"affected_services\": [string], \
\"evidence\": [string], \"suggested_fix\": string, \"confidence\": \"low\" | \"medium\" | \"high\"}
If you need more information from the user, reply in plain prose instead.";

const FIX_PAYLOAD: &str = "When the fix is applied, reply with a single JSON object in a ```json fenced block:
{\"type\": \"fix_result\", \"summary\": string, \"changed_files\": [string], \"verification\": string}
If the fix cannot be applied within the approved target, explain why in plain prose.";

pub fn build_system_prompt(
    mode: AgentMode,
    scope: Option<&FixTargetScope>,
    tools: &[ToolSpec],
) -> String {
    let mut sections = Vec::new();
    match mode {
        AgentMode::Investigate => sections.push(INVESTIGATE_ROLE.to_string()),
        AgentMode::Fix => {
            sections.push(FIX_ROLE.to_string());
            sections.push(render_scope(scope));
        }
    }
    sections.push(GUIDELINES.to_string());

    if !tools.is_empty() {
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        sections.push(format!("Available tools: {}", names.join(", ")));
    }

    sections.push(
        match mode {
            AgentMode::Investigate => INVESTIGATE_PAYLOAD,
            AgentMode::Fix => FIX_PAYLOAD,
        }
        .to_string(),
    );
    sections.join("\n\n")
}

fn render_scope(scope: Option<&FixTargetScope>) -> String {
    let Some(scope) = scope else {
        return "No fix target has been approved. Mutating tools will be denied; \
explain what approval is needed."
            .to_string();
    };
    let mut lines = vec![
        "Approved fix target:".to_string(),
        format!("- Service: {}", scope.service_name),
    ];
    if !scope.file_paths.is_empty() {
        lines.push(format!("- Files: {}", scope.file_paths.join(", ")));
    }
    if !scope.suggested_fix.trim().is_empty() {
        lines.push(format!("- Suggested fix: {}", scope.suggested_fix.trim()));
    }
    lines.push("Mutating tool calls outside this target are denied.".to_string());
    lines.join("\n")
}
