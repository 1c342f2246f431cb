//! Structured references derived from successful tool results.

use aiops_core::ToolResult;
use aiops_tools::split_remote_tool_name;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound on records derived from one result.
const MAX_EVIDENCE: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvidenceEvent {
    File {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repository: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
    },
    Commit {
        sha: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repository: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Resource {
        kind: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
    },
}

const RESOURCE_HINTS: &[(&str, &str)] = &[
    ("pod", "Pod"),
    ("deployment", "Deployment"),
    ("service", "Service"),
    ("ingress", "Ingress"),
    ("configmap", "ConfigMap"),
    ("statefulset", "StatefulSet"),
    ("job", "Job"),
    ("node", "Node"),
    ("namespace", "Namespace"),
    ("log", "Pod"),
];

/// Never fails: unrecognized tools, failed results and unexpected shapes all
/// yield no evidence.
pub fn extract_evidence(tool_name: &str, args: &Value, result: &ToolResult) -> Vec<EvidenceEvent> {
    if !result.success {
        return Vec::new();
    }
    let base = split_remote_tool_name(tool_name)
        .map(|(_, tool)| tool)
        .unwrap_or(tool_name)
        .to_ascii_lowercase();
    let payload = result
        .agent_content
        .as_deref()
        .and_then(|content| serde_json::from_str::<Value>(content).ok());

    let mut evidence = if base.contains("commit") {
        commits(args, payload.as_ref())
    } else if base.contains("file") || base.contains("blob") {
        files(args, payload.as_ref())
    } else if base.contains("search") && base.contains("code") {
        payload.as_ref().map(search_hits).unwrap_or_default()
    } else if let Some(kind) = resource_kind(&base) {
        resources(kind, args, payload.as_ref())
    } else {
        Vec::new()
    };
    evidence.truncate(MAX_EVIDENCE);
    evidence
}

fn string_arg(args: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| args.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn repository(args: &Value) -> Option<String> {
    if let Some(repo) = string_arg(args, &["repository", "repo_full_name", "full_name"]) {
        return Some(repo);
    }
    match (string_arg(args, &["owner"]), string_arg(args, &["repo"])) {
        (Some(owner), Some(repo)) => Some(format!("{owner}/{repo}")),
        (None, Some(repo)) => Some(repo),
        _ => None,
    }
}

fn items(payload: &Value) -> Vec<&Value> {
    match payload {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => match map.get("items").and_then(Value::as_array) {
            Some(items) => items.iter().collect(),
            None => vec![payload],
        },
        _ => Vec::new(),
    }
}

fn files(args: &Value, payload: Option<&Value>) -> Vec<EvidenceEvent> {
    let path = string_arg(args, &["path", "file_path", "filePath"])
        .or_else(|| payload.and_then(|p| p.get("path")).and_then(Value::as_str).map(str::to_string));
    match path {
        Some(path) => vec![EvidenceEvent::File {
            path,
            repository: repository(args),
            reference: string_arg(args, &["ref", "branch", "sha"]),
        }],
        None => Vec::new(),
    }
}

fn commits(args: &Value, payload: Option<&Value>) -> Vec<EvidenceEvent> {
    let repo = repository(args);
    let from_payload: Vec<EvidenceEvent> = payload
        .map(items)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|item| {
            let sha = ["sha", "hash", "id"]
                .iter()
                .find_map(|key| item.get(*key).and_then(Value::as_str))?;
            let message = item
                .get("message")
                .or_else(|| item.get("commit").and_then(|c| c.get("message")))
                .and_then(Value::as_str)
                .map(|m| m.lines().next().unwrap_or_default().to_string());
            Some(EvidenceEvent::Commit {
                sha: sha.to_string(),
                repository: repo.clone(),
                message,
            })
        })
        .collect();
    if !from_payload.is_empty() {
        return from_payload;
    }
    string_arg(args, &["sha", "commit_sha", "commit"])
        .map(|sha| {
            vec![EvidenceEvent::Commit {
                sha,
                repository: repo,
                message: None,
            }]
        })
        .unwrap_or_default()
}

fn search_hits(payload: &Value) -> Vec<EvidenceEvent> {
    items(payload)
        .into_iter()
        .filter_map(|item| {
            let path = item.get("path").and_then(Value::as_str)?;
            Some(EvidenceEvent::File {
                path: path.to_string(),
                repository: item
                    .get("repository")
                    .and_then(|r| r.get("full_name").or(Some(r)))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                reference: None,
            })
        })
        .collect()
}

fn resource_kind(base: &str) -> Option<&'static str> {
    RESOURCE_HINTS
        .iter()
        .find(|(hint, _)| base.contains(*hint))
        .map(|(_, kind)| *kind)
}

fn resources(kind: &str, args: &Value, payload: Option<&Value>) -> Vec<EvidenceEvent> {
    let namespace = string_arg(args, &["namespace", "ns"]);
    let from_payload: Vec<EvidenceEvent> = payload
        .map(items)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|item| {
            let metadata = item.get("metadata").unwrap_or(item);
            let name = metadata.get("name").and_then(Value::as_str)?;
            Some(EvidenceEvent::Resource {
                kind: item
                    .get("kind")
                    .and_then(Value::as_str)
                    .unwrap_or(kind)
                    .to_string(),
                name: name.to_string(),
                namespace: metadata
                    .get("namespace")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| namespace.clone()),
            })
        })
        .collect();
    if !from_payload.is_empty() {
        return from_payload;
    }

    let key = kind.to_ascii_lowercase();
    let named = format!("{key}_name");
    let name = string_arg(
        args,
        &[key.as_str(), named.as_str(), "name", "pod", "pod_name", "resource"],
    );
    name.map(|name| {
        vec![EvidenceEvent::Resource {
            kind: kind.to_string(),
            name,
            namespace,
        }]
    })
    .unwrap_or_default()
}
