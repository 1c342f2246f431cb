//! Metrics instrumentation for runtime observability.

use std::time::Instant;

pub const LLM_STREAM_LATENCY: &str = "llm_stream_latency";
pub const TOOL_EXECUTION_LATENCY: &str = "tool_execution_latency";

/// Record time from request to end of one provider stream.
pub fn record_llm_latency(duration_ms: f64) {
    metrics::histogram!(LLM_STREAM_LATENCY, duration_ms);
}

/// Record tool execution latency.
pub fn record_tool_latency(duration_ms: f64) {
    metrics::histogram!(TOOL_EXECUTION_LATENCY, duration_ms);
}

pub fn increment_tool_calls(tool: &str, outcome: &'static str) {
    metrics::counter!("tool_calls_total", 1, "tool" => tool.to_string(), "outcome" => outcome);
}

pub fn increment_masking_count() {
    metrics::counter!("observation_masking_total", 1);
}

pub fn increment_authorization_denials() {
    metrics::counter!("authorization_denials_total", 1);
}

pub fn increment_turns(outcome: &'static str) {
    metrics::counter!("turns_total", 1, "outcome" => outcome);
}

/// RAII timer for automatic metric recording.
pub struct MetricTimer {
    start: Instant,
    metric_name: &'static str,
}

impl MetricTimer {
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
        }
    }
}

impl Drop for MetricTimer {
    fn drop(&mut self) {
        let duration_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        match self.metric_name {
            LLM_STREAM_LATENCY => record_llm_latency(duration_ms),
            TOOL_EXECUTION_LATENCY => record_tool_latency(duration_ms),
            _ => {}
        }
    }
}
