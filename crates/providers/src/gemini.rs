//! Google Gemini `streamGenerateContent` API.

use crate::anthropic::system_text;
use crate::error::ProviderError;
use crate::streaming::{parse_data, StreamDecoder};
use crate::traits::{CompletionRequest, FinishReason, StreamEvent, Usage};
use aiops_core::sse::SseEvent;
use aiops_core::{Message, Part, Role, ToolCall};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone)]
pub struct GeminiBackend {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl GeminiBackend {
    pub fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        )
    }

    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![("x-goog-api-key", self.api_key.clone())]
    }

    /// Consecutive same-role turns are merged; Gemini rejects repeated roles.
    pub fn format_history(&self, messages: &[Message]) -> Vec<Value> {
        let mut turns: Vec<(&'static str, Vec<Value>)> = Vec::new();
        for message in messages {
            let role = match message.role {
                Role::System => continue,
                Role::User => "user",
                Role::Assistant => "model",
            };
            let parts: Vec<Value> = message.parts.iter().filter_map(native_part).collect();
            if parts.is_empty() {
                continue;
            }
            match turns.last_mut() {
                Some((last, existing)) if *last == role => existing.extend(parts),
                _ => turns.push((role, parts)),
            }
        }
        turns
            .into_iter()
            .map(|(role, parts)| json!({ "role": role, "parts": parts }))
            .collect()
    }

    pub fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut generation = json!({ "maxOutputTokens": self.max_tokens });
        if let Some(temperature) = self.temperature {
            generation["temperature"] = json!(temperature);
        }
        let mut body = json!({
            "contents": self.format_history(&request.messages),
            "generationConfig": generation,
        });
        if let Some(system) = system_text(request) {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        if !request.tools.is_empty() {
            let declarations: Vec<Value> = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": clean_schema(&tool.parameters),
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }
        body
    }
}

fn native_part(part: &Part) -> Option<Value> {
    match part {
        Part::Text { text } if text.is_empty() => None,
        Part::Text { text } => Some(json!({ "text": text })),
        Part::ToolCall { name, args, .. } => Some(json!({
            "functionCall": { "name": name, "args": args }
        })),
        Part::ToolResult { name, result, .. } => Some(json!({
            "functionResponse": { "name": name, "response": function_response(result.observation()) }
        })),
    }
}

/// `functionResponse.response` must be an object; anything else is wrapped.
fn function_response(observation: &str) -> Value {
    match serde_json::from_str::<Value>(observation) {
        Ok(value @ Value::Object(_)) => value,
        _ => json!({ "content": observation }),
    }
}

/// Gemini's schema dialect rejects `$schema` and `additionalProperties`.
fn clean_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .iter()
                .filter(|(key, _)| key.as_str() != "$schema" && key.as_str() != "additionalProperties")
                .map(|(key, value)| (key.clone(), clean_schema(value)))
                .collect();
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.iter().map(clean_schema).collect()),
        other => other.clone(),
    }
}

/// Gemini has no terminal frame; everything buffered is emitted at end of body.
#[derive(Default)]
pub struct GeminiDecoder {
    calls: Vec<ToolCall>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    done: bool,
}

impl GeminiDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamDecoder for GeminiDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<StreamEvent>, ProviderError> {
        let data = parse_data(event)?;
        if let Some(error) = data.get("error") {
            let message = error["message"].as_str().unwrap_or("unknown error");
            return Err(ProviderError::Stream(message.to_string()));
        }
        if let Some(usage) = data.get("usageMetadata") {
            self.usage = Some(Usage {
                input_tokens: usage["promptTokenCount"].as_u64().unwrap_or(0),
                output_tokens: usage["candidatesTokenCount"].as_u64().unwrap_or(0),
            });
        }

        let mut events = Vec::new();
        let Some(candidate) = data["candidates"].as_array().and_then(|c| c.first()) else {
            return Ok(events);
        };
        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                if let Some(text) = part["text"].as_str().filter(|t| !t.is_empty()) {
                    events.push(StreamEvent::TextDelta(text.to_string()));
                }
                if let Some(call) = part.get("functionCall") {
                    self.calls.push(ToolCall {
                        id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                        name: call["name"].as_str().unwrap_or_default().to_string(),
                        args: call
                            .get("args")
                            .filter(|a| a.is_object())
                            .cloned()
                            .unwrap_or_else(|| json!({})),
                    });
                }
            }
        }
        if let Some(reason) = candidate["finishReason"].as_str() {
            self.finish_reason = Some(reason.to_string());
        }
        Ok(events)
    }

    fn finish(&mut self) -> Result<Vec<StreamEvent>, ProviderError> {
        if self.done {
            return Ok(Vec::new());
        }
        self.done = true;
        let mut events = Vec::new();
        let has_calls = !self.calls.is_empty();
        if has_calls {
            events.push(StreamEvent::ToolCalls(std::mem::take(&mut self.calls)));
        }
        let reason = match self.finish_reason.as_deref() {
            _ if has_calls => FinishReason::ToolUse,
            Some("STOP") | None => FinishReason::Stop,
            Some("MAX_TOKENS") => FinishReason::Length,
            Some(other) => FinishReason::Other(other.to_lowercase()),
        };
        events.push(StreamEvent::Finished {
            reason,
            usage: self.usage,
        });
        Ok(events)
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
    use aiops_core::{ToolResult, ToolSpec};

    fn backend() -> GeminiBackend {
        GeminiBackend {
            base_url: "https://generativelanguage.googleapis.com".into(),
            api_key: "k".into(),
            model: "gemini-2.5-pro".into(),
            max_tokens: 2048,
            temperature: None,
        }
    }

    #[test]
    fn test_endpoint_and_roles() {
        let backend = backend();
        assert!(backend
            .endpoint()
            .ends_with("/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse"));

        let call = ToolCall {
            id: "c1".into(),
            name: "get_pods".into(),
            args: json!({"namespace": "prod"}),
        };
        let history = backend.format_history(&[
            Message::system_text("ignored here"),
            Message::user_text("why is checkout down?"),
            Message::assistant(Some("Looking.".into()), std::slice::from_ref(&call)),
            Message::tool_results(vec![Part::tool_result(&call, ToolResult::ok("pod crashed"))]),
            Message::tool_results(vec![Part::tool_result(&call, ToolResult::ok("{\"restarts\":4}"))]),
        ]);
        assert_eq!(history.len(), 3);
        assert_eq!(history[1]["role"], "model");
        assert_eq!(history[1]["parts"][1]["functionCall"]["name"], "get_pods");
        let results = history[2]["parts"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(
            results[0]["functionResponse"]["response"],
            json!({"content": "pod crashed"})
        );
        assert_eq!(results[1]["functionResponse"]["response"], json!({"restarts": 4}));
    }

    #[test]
    fn test_request_body_system_instruction_and_clean_schema() {
        let request = CompletionRequest {
            system: Some("be careful".into()),
            messages: vec![Message::user_text("hi")],
            tools: vec![ToolSpec {
                name: "get_logs".into(),
                description: "logs".into(),
                parameters: json!({
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "additionalProperties": false,
                    "properties": { "pod": { "type": "string" } }
                }),
            }],
        };
        let body = backend().request_body(&request);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be careful");
        let params = &body["tools"][0]["functionDeclarations"][0]["parameters"];
        assert!(params.get("$schema").is_none());
        assert!(params.get("additionalProperties").is_none());
        assert_eq!(params["properties"]["pod"]["type"], "string");
        assert!(body["generationConfig"].get("temperature").is_none());
    }

    #[test]
    fn test_function_calls_emitted_at_end_of_body() {
        let stream = concat!(
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Checking\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"functionCall\":{\"name\":\"get_pods\",\"args\":{\"ns\":\"prod\"}}}]},\"finishReason\":\"STOP\"}],",
            "\"usageMetadata\":{\"promptTokenCount\":11,\"candidatesTokenCount\":3}}\n\n",
        );
        let events = decode_all(&mut GeminiDecoder::new(), stream).unwrap();
        assert_eq!(events[0], StreamEvent::TextDelta("Checking".into()));
        match &events[1] {
            StreamEvent::ToolCalls(calls) => {
                assert_eq!(calls[0].name, "get_pods");
                assert!(calls[0].id.starts_with("call_"));
                assert_eq!(calls[0].args, json!({"ns": "prod"}));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(
            events[2],
            StreamEvent::Finished {
                reason: FinishReason::ToolUse,
                usage: Some(Usage {
                    input_tokens: 11,
                    output_tokens: 3
                }),
            }
        );
    }
}
