//! Anthropic Messages API.

use crate::error::ProviderError;
use crate::streaming::{parse_arguments, parse_data, StreamDecoder};
use crate::traits::{CompletionRequest, FinishReason, StreamEvent, Usage};
use aiops_core::sse::SseEvent;
use aiops_core::{Message, Part, Role, ToolCall};
use serde_json::{json, Value};
use std::collections::BTreeMap;

const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicBackend {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl AnthropicBackend {
    pub fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("x-api-key", self.api_key.clone()),
            ("anthropic-version", API_VERSION.to_string()),
        ]
    }

    /// Consecutive same-role messages are merged; the API requires alternation.
    pub fn format_history(&self, messages: &[Message]) -> Vec<Value> {
        let mut turns: Vec<(Role, Vec<Value>)> = Vec::new();
        for message in messages {
            if message.role == Role::System {
                continue;
            }
            let blocks: Vec<Value> = message.parts.iter().filter_map(content_block).collect();
            if blocks.is_empty() {
                continue;
            }
            match turns.last_mut() {
                Some((role, existing)) if *role == message.role => existing.extend(blocks),
                _ => turns.push((message.role, blocks)),
            }
        }
        turns
            .into_iter()
            .map(|(role, content)| {
                let role = if role == Role::Assistant { "assistant" } else { "user" };
                json!({ "role": role, "content": content })
            })
            .collect()
    }

    pub fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": self.format_history(&request.messages),
            "stream": true,
        });
        if let Some(system) = system_text(request) {
            body["system"] = json!(system);
        }
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.parameters,
                    })
                })
                .collect();
        }
        body
    }
}

/// Explicit system prompt plus any system-role messages in history.
pub(crate) fn system_text(request: &CompletionRequest) -> Option<String> {
    let mut sections: Vec<String> = request.system.iter().cloned().collect();
    sections.extend(
        request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(Message::text)
            .filter(|t| !t.is_empty()),
    );
    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

fn content_block(part: &Part) -> Option<Value> {
    match part {
        Part::Text { text } if text.is_empty() => None,
        Part::Text { text } => Some(json!({ "type": "text", "text": text })),
        Part::ToolCall { id, name, args } => Some(json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": args,
        })),
        Part::ToolResult { id, result, .. } => Some(json!({
            "type": "tool_result",
            "tool_use_id": id,
            "content": result.observation(),
            "is_error": !result.success,
        })),
    }
}

struct PendingToolUse {
    id: String,
    name: String,
    json: String,
}

#[derive(Default)]
pub struct AnthropicDecoder {
    tools: BTreeMap<u64, PendingToolUse>,
    stop_reason: Option<String>,
    usage: Usage,
    done: bool,
}

impl AnthropicDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn complete(&mut self) -> Result<Vec<StreamEvent>, ProviderError> {
        self.done = true;
        let mut events = Vec::new();
        let pending = std::mem::take(&mut self.tools);
        if !pending.is_empty() {
            let calls = pending
                .into_values()
                .map(|tool| {
                    Ok(ToolCall {
                        id: tool.id,
                        name: tool.name,
                        args: parse_arguments(&tool.json)?,
                    })
                })
                .collect::<Result<Vec<_>, ProviderError>>()?;
            events.push(StreamEvent::ToolCalls(calls));
        }
        let reason = match self.stop_reason.as_deref() {
            Some("tool_use") => FinishReason::ToolUse,
            Some("max_tokens") => FinishReason::Length,
            Some("end_turn") | Some("stop_sequence") | None => FinishReason::Stop,
            Some(other) => FinishReason::Other(other.to_string()),
        };
        events.push(StreamEvent::Finished {
            reason,
            usage: Some(self.usage),
        });
        Ok(events)
    }
}

impl StreamDecoder for AnthropicDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<StreamEvent>, ProviderError> {
        match event.event_name() {
            "ping" => Ok(Vec::new()),
            "message_start" => {
                let data = parse_data(event)?;
                if let Some(tokens) = data["message"]["usage"]["input_tokens"].as_u64() {
                    self.usage.input_tokens = tokens;
                }
                Ok(Vec::new())
            }
            "content_block_start" => {
                let data = parse_data(event)?;
                let block = &data["content_block"];
                if block["type"] == "tool_use" {
                    let index = data["index"].as_u64().unwrap_or(0);
                    self.tools.insert(
                        index,
                        PendingToolUse {
                            id: block["id"].as_str().unwrap_or_default().to_string(),
                            name: block["name"].as_str().unwrap_or_default().to_string(),
                            json: String::new(),
                        },
                    );
                }
                Ok(Vec::new())
            }
            "content_block_delta" => {
                let data = parse_data(event)?;
                let delta = &data["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default();
                        if text.is_empty() {
                            Ok(Vec::new())
                        } else {
                            Ok(vec![StreamEvent::TextDelta(text.to_string())])
                        }
                    }
                    Some("input_json_delta") => {
                        let index = data["index"].as_u64().unwrap_or(0);
                        if let Some(tool) = self.tools.get_mut(&index) {
                            tool.json
                                .push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                        Ok(Vec::new())
                    }
                    _ => Ok(Vec::new()),
                }
            }
            "message_delta" => {
                let data = parse_data(event)?;
                if let Some(reason) = data["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(tokens) = data["usage"]["output_tokens"].as_u64() {
                    self.usage.output_tokens = tokens;
                }
                Ok(Vec::new())
            }
            "message_stop" => self.complete(),
            "error" => {
                let data = parse_data(event)?;
                let kind = data["error"]["type"].as_str().unwrap_or("error");
                let message = data["error"]["message"].as_str().unwrap_or("unknown error");
                Err(ProviderError::Stream(format!("{kind}: {message}")))
            }
            _ => Ok(Vec::new()),
        }
    }

    fn finish(&mut self) -> Result<Vec<StreamEvent>, ProviderError> {
        if self.done {
            return Ok(Vec::new());
        }
        Err(ProviderError::Stream(
            "stream ended before message_stop".to_string(),
        ))
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::streaming::decode_all;
    use aiops_core::{ToolErrorCode, ToolResult, ToolSpec};

    fn backend() -> AnthropicBackend {
        AnthropicBackend {
            base_url: "https://api.anthropic.com".into(),
            api_key: "k".into(),
            model: "claude".into(),
            max_tokens: 1024,
            temperature: None,
        }
    }

    #[test]
    fn test_history_mapping() {
        let call = ToolCall {
            id: "toolu_1".into(),
            name: "get_pods".into(),
            args: json!({"namespace": "pr-1"}),
        };
        let messages = vec![
            Message::system_text("be terse"),
            Message::user_text("what broke?"),
            Message::assistant(Some("Checking pods.".into()), std::slice::from_ref(&call)),
            Message::tool_results(vec![Part::tool_result(
                &call,
                ToolResult::failure(ToolErrorCode::Timeout, "timed out", true),
            )]),
            Message::user_text("and now?"),
        ];
        let history = backend().format_history(&messages);
        assert_eq!(history.len(), 3);
        assert_eq!(history[1]["role"], "assistant");
        assert_eq!(history[1]["content"][1]["type"], "tool_use");
        assert_eq!(history[2]["content"][0]["tool_use_id"], "toolu_1");
        assert_eq!(history[2]["content"][0]["is_error"], true);
        assert_eq!(history[2]["content"][1]["text"], "and now?");
    }

    #[test]
    fn test_system_goes_to_instruction_channel() {
        let request = CompletionRequest {
            system: Some("You investigate outages.".into()),
            messages: vec![Message::user_text("hi")],
            tools: vec![ToolSpec {
                name: "get_pods".into(),
                description: "List pods".into(),
                parameters: json!({"type": "object"}),
            }],
        };
        let body = backend().request_body(&request);
        assert_eq!(body["system"], "You investigate outages.");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_decodes_text_and_tool_batch() {
        let stream = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":12}}}\n\n",
            "event: content_block_start\n",
            "data: {\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Looking\"}}\n\n",
            "event: content_block_start\n",
            "data: {\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_9\",\"name\":\"get_logs\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"pod\\\":\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"\\\"api-0\\\"}\"}}\n\n",
            "event: message_delta\n",
            "data: {\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":30}}\n\n",
            "event: message_stop\n",
            "data: {}\n\n",
        );
        let events = decode_all(&mut AnthropicDecoder::new(), stream).unwrap();
        assert_eq!(events[0], StreamEvent::TextDelta("Looking".into()));
        match &events[1] {
            StreamEvent::ToolCalls(calls) => {
                assert_eq!(calls[0].id, "toolu_9");
                assert_eq!(calls[0].args["pod"], "api-0");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(
            events[2],
            StreamEvent::Finished {
                reason: FinishReason::ToolUse,
                usage: Some(Usage {
                    input_tokens: 12,
                    output_tokens: 30
                }),
            }
        );
    }

    #[test]
    fn test_error_event_and_truncation() {
        let err = decode_all(
            &mut AnthropicDecoder::new(),
            "event: error\ndata: {\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("overloaded_error"));

        let truncated = decode_all(
            &mut AnthropicDecoder::new(),
            "event: content_block_delta\ndata: {\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n",
        );
        assert!(truncated.is_err());
    }
}
