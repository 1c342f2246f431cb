//! OpenAI Chat Completions API.

use crate::anthropic::system_text;
use crate::error::ProviderError;
use crate::streaming::{parse_arguments, parse_data, StreamDecoder};
use crate::traits::{CompletionRequest, FinishReason, StreamEvent, Usage};
use aiops_core::sse::SseEvent;
use aiops_core::{Message, Part, Role, ToolCall};
use serde_json::{json, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl OpenAiBackend {
    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![("Authorization", format!("Bearer {}", self.api_key))]
    }

    pub fn format_history(&self, messages: &[Message]) -> Vec<Value> {
        let mut out = Vec::new();
        for message in messages {
            match message.role {
                Role::System => {}
                Role::Assistant => {
                    let text = message.text();
                    let calls: Vec<Value> = message
                        .parts
                        .iter()
                        .filter_map(|part| match part {
                            Part::ToolCall { id, name, args } => Some(json!({
                                "id": id,
                                "type": "function",
                                "function": { "name": name, "arguments": args.to_string() },
                            })),
                            _ => None,
                        })
                        .collect();
                    let mut entry = json!({
                        "role": "assistant",
                        "content": if text.is_empty() { Value::Null } else { json!(text) },
                    });
                    if !calls.is_empty() {
                        entry["tool_calls"] = Value::Array(calls);
                    }
                    out.push(entry);
                }
                Role::User => {
                    // Tool answers must directly follow the assistant turn that asked.
                    for part in &message.parts {
                        if let Part::ToolResult { id, result, .. } = part {
                            out.push(json!({
                                "role": "tool",
                                "tool_call_id": id,
                                "content": result.observation(),
                            }));
                        }
                    }
                    let text = message.text();
                    if !text.is_empty() {
                        out.push(json!({ "role": "user", "content": text }));
                    }
                }
            }
        }
        out
    }

    pub fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = system_text(request) {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.extend(self.format_history(&request.messages));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect();
        }
        body
    }
}

#[derive(Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Default)]
pub struct OpenAiDecoder {
    calls: BTreeMap<u64, PendingCall>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    done: bool,
}

impl OpenAiDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn complete(&mut self) -> Result<Vec<StreamEvent>, ProviderError> {
        self.done = true;
        let mut events = Vec::new();
        let pending = std::mem::take(&mut self.calls);
        if !pending.is_empty() {
            let calls = pending
                .into_values()
                .map(|call| {
                    Ok(ToolCall {
                        id: call.id,
                        name: call.name,
                        args: parse_arguments(&call.arguments)?,
                    })
                })
                .collect::<Result<Vec<_>, ProviderError>>()?;
            events.push(StreamEvent::ToolCalls(calls));
        }
        let reason = match self.finish_reason.as_deref() {
            Some("tool_calls") | Some("function_call") => FinishReason::ToolUse,
            Some("length") => FinishReason::Length,
            Some("stop") | None => FinishReason::Stop,
            Some(other) => FinishReason::Other(other.to_string()),
        };
        events.push(StreamEvent::Finished {
            reason,
            usage: self.usage,
        });
        Ok(events)
    }
}

impl StreamDecoder for OpenAiDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<StreamEvent>, ProviderError> {
        if event.data.trim() == "[DONE]" {
            return self.complete();
        }
        let data = parse_data(event)?;
        if let Some(error) = data.get("error") {
            let message = error["message"].as_str().unwrap_or("unknown error");
            return Err(ProviderError::Stream(message.to_string()));
        }
        if let Some(usage) = data.get("usage").filter(|u| u.is_object()) {
            self.usage = Some(Usage {
                input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
                output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            });
        }

        let mut events = Vec::new();
        let Some(choice) = data["choices"].as_array().and_then(|c| c.first()) else {
            return Ok(events);
        };
        let delta = &choice["delta"];
        if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
            events.push(StreamEvent::TextDelta(text.to_string()));
        }
        if let Some(fragments) = delta["tool_calls"].as_array() {
            for fragment in fragments {
                let index = fragment["index"].as_u64().unwrap_or(0);
                let call = self.calls.entry(index).or_default();
                if let Some(id) = fragment["id"].as_str() {
                    call.id = id.to_string();
                }
                if let Some(name) = fragment["function"]["name"].as_str() {
                    call.name.push_str(name);
                }
                if let Some(arguments) = fragment["function"]["arguments"].as_str() {
                    call.arguments.push_str(arguments);
                }
            }
        }
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_string());
        }
        Ok(events)
    }

    fn finish(&mut self) -> Result<Vec<StreamEvent>, ProviderError> {
        if self.done {
            return Ok(Vec::new());
        }
        if self.finish_reason.is_none() {
            return Err(ProviderError::Stream(
                "stream ended without a finish reason".to_string(),
            ));
        }
        self.complete()
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
    use aiops_core::ToolResult;

    fn backend() -> OpenAiBackend {
        OpenAiBackend {
            base_url: "https://api.openai.com/v1".into(),
            api_key: "k".into(),
            model: "gpt-4o".into(),
            max_tokens: 1024,
            temperature: Some(0.2),
        }
    }

    #[test]
    fn test_history_uses_tool_role_and_system_message() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "get_pods".into(),
            args: json!({}),
        };
        let request = CompletionRequest {
            system: Some("sys".into()),
            messages: vec![
                Message::user_text("hi"),
                Message::assistant(None, std::slice::from_ref(&call)),
                Message::tool_results(vec![Part::tool_result(&call, ToolResult::ok("3 pods"))]),
            ],
            tools: vec![],
        };
        let body = backend().request_body(&request);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["content"], Value::Null);
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], "{}");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["content"], "3 pods");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_tool_call_fragments_assembled() {
        let stream = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"function\":{\"name\":\"get_logs\",\"arguments\":\"{\\\"po\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"d\\\":\\\"x\\\"}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":7}}\n\n",
            "data: [DONE]\n\n",
        );
        let events = decode_all(&mut OpenAiDecoder::new(), stream).unwrap();
        assert_eq!(events[0], StreamEvent::TextDelta("Hi".into()));
        match &events[1] {
            StreamEvent::ToolCalls(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].name, "get_logs");
                assert_eq!(calls[0].args, json!({"pod": "x"}));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(
            events[2],
            StreamEvent::Finished {
                reason: FinishReason::ToolUse,
                usage: Some(Usage {
                    input_tokens: 5,
                    output_tokens: 7
                }),
            }
        );
    }

    #[test]
    fn test_missing_done_still_completes_after_finish_reason() {
        let stream = "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"},\"finish_reason\":\"stop\"}]}\n\n";
        let events = decode_all(&mut OpenAiDecoder::new(), stream).unwrap();
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Finished {
                reason: FinishReason::Stop,
                ..
            })
        ));
    }
}
