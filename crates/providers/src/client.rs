//! Backend dispatch plus the shared retry and circuit-breaker loop.

use crate::anthropic::{AnthropicBackend, AnthropicDecoder};
use crate::breaker::{retry_delay_for_error, CircuitBreaker};
use crate::config::{ProviderConfig, ProviderKind};
use crate::error::ProviderError;
use crate::gemini::{GeminiBackend, GeminiDecoder};
use crate::openai::{OpenAiBackend, OpenAiDecoder};
use crate::streaming::{drive, StreamDecoder};
use crate::traits::{CompletionRequest, ProviderAdapter, ProviderStream};
use aiops_core::{CancellationToken, Message};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Wire format of one model vendor.
#[derive(Debug, Clone)]
pub enum Backend {
    Anthropic(AnthropicBackend),
    OpenAi(OpenAiBackend),
    Gemini(GeminiBackend),
}

impl Backend {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let base_url = config.effective_base_url();
        let api_key = config.resolve_api_key()?;
        let model = config.effective_model();
        let max_tokens = config.max_tokens;
        let temperature = config.temperature;

        Ok(match config.kind {
            ProviderKind::Anthropic => Backend::Anthropic(AnthropicBackend {
                base_url,
                api_key,
                model,
                max_tokens,
                temperature,
            }),
            ProviderKind::OpenAi => Backend::OpenAi(OpenAiBackend {
                base_url,
                api_key,
                model,
                max_tokens,
                temperature,
            }),
            ProviderKind::Gemini => Backend::Gemini(GeminiBackend {
                base_url,
                api_key,
                model,
                max_tokens,
                temperature,
            }),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Anthropic(_) => ProviderKind::Anthropic.as_str(),
            Backend::OpenAi(_) => ProviderKind::OpenAi.as_str(),
            Backend::Gemini(_) => ProviderKind::Gemini.as_str(),
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Backend::Anthropic(b) => &b.model,
            Backend::OpenAi(b) => &b.model,
            Backend::Gemini(b) => &b.model,
        }
    }

    pub fn endpoint(&self) -> String {
        match self {
            Backend::Anthropic(b) => b.endpoint(),
            Backend::OpenAi(b) => b.endpoint(),
            Backend::Gemini(b) => b.endpoint(),
        }
    }

    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Backend::Anthropic(b) => b.headers(),
            Backend::OpenAi(b) => b.headers(),
            Backend::Gemini(b) => b.headers(),
        }
    }

    pub fn format_history(&self, messages: &[Message]) -> Vec<serde_json::Value> {
        match self {
            Backend::Anthropic(b) => b.format_history(messages),
            Backend::OpenAi(b) => b.format_history(messages),
            Backend::Gemini(b) => b.format_history(messages),
        }
    }

    pub fn request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        match self {
            Backend::Anthropic(b) => b.request_body(request),
            Backend::OpenAi(b) => b.request_body(request),
            Backend::Gemini(b) => b.request_body(request),
        }
    }

    pub fn decoder(&self) -> Box<dyn StreamDecoder> {
        match self {
            Backend::Anthropic(_) => Box::new(AnthropicDecoder::new()),
            Backend::OpenAi(_) => Box::new(OpenAiDecoder::new()),
            Backend::Gemini(_) => Box::new(GeminiDecoder::new()),
        }
    }
}

/// Streaming model client shared by every turn of a process.
#[derive(Clone)]
pub struct ProviderClient {
    backend: Backend,
    http: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
    max_retries: u32,
    request_timeout: Duration,
}

impl ProviderClient {
    pub fn new(backend: Backend, config: &ProviderConfig) -> Self {
        Self {
            backend,
            http: reqwest::Client::new(),
            breaker: Arc::new(CircuitBreaker::new(
                config.breaker_threshold,
                Duration::from_secs(config.breaker_cooldown_secs),
            )),
            max_retries: config.max_retries,
            request_timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let backend = Backend::from_config(config)?;
        info!(
            "Provider configured: {} ({})",
            backend.name(),
            backend.model()
        );
        Ok(Self::new(backend, config))
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn send_once(
        &self,
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut builder = self
            .http
            .post(self.backend.endpoint())
            .header("content-type", "application/json")
            .header("accept", "text/event-stream")
            .json(body);
        for (name, value) in self.backend.headers() {
            builder = builder.header(name, value);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            sent = tokio::time::timeout(self.request_timeout, builder.send()) => match sent {
                Ok(result) => result?,
                Err(_) => return Err(ProviderError::Timeout),
            },
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = response.text().await.unwrap_or_default();
        Err(ProviderError::from_status(status.as_u16(), text, retry_after))
    }
}

#[async_trait]
impl ProviderAdapter for ProviderClient {
    fn name(&self) -> &str {
        self.backend.name()
    }

    fn format_history(&self, messages: &[Message]) -> Vec<serde_json::Value> {
        self.backend.format_history(messages)
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderStream, ProviderError> {
        self.breaker.should_allow_request()?;
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let body = self.backend.request_body(&request);
        let mut last_error = ProviderError::Network("no attempt made".to_string());

        for attempt in 0..=self.max_retries {
            debug!(
                "Provider call attempt {}/{}",
                attempt + 1,
                self.max_retries + 1
            );
            match self.send_once(&body, &cancel).await {
                Ok(response) => {
                    self.breaker.record_success();
                    return Ok(drive(response, self.backend.decoder(), cancel));
                }
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                Err(e) if e.is_retryable() => {
                    warn!("Provider call failed (attempt {}): {}", attempt + 1, e);
                    if attempt < self.max_retries {
                        let delay = retry_delay_for_error(attempt, &e);
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    last_error = e;
                }
                Err(e) => {
                    warn!("Provider call failed: {}", e);
                    return Err(e);
                }
            }
        }

        self.breaker.record_failure();
        Err(last_error)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn config(kind: ProviderKind) -> ProviderConfig {
        ProviderConfig {
            kind,
            api_key: Some("test-key".into()),
            // Nothing listens here; tests never reach the network.
            base_url: Some("http://127.0.0.1:9".into()),
            max_retries: 0,
            breaker_threshold: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_backend_selected_by_kind() {
        let client = ProviderClient::from_config(&config(ProviderKind::OpenAi)).unwrap();
        assert_eq!(client.name(), "openai");
        assert_eq!(client.backend().model(), "gpt-4o");
        assert_eq!(
            client.backend().endpoint(),
            "http://127.0.0.1:9/chat/completions"
        );

        let client = ProviderClient::from_config(&config(ProviderKind::Anthropic)).unwrap();
        assert_eq!(client.name(), "anthropic");
        assert!(client
            .backend()
            .headers()
            .iter()
            .any(|(name, _)| *name == "anthropic-version"));
    }

    #[test]
    fn test_format_history_dispatches() {
        let client = ProviderClient::from_config(&config(ProviderKind::Gemini)).unwrap();
        let history = client.format_history(&[Message::user_text("hello")]);
        assert_eq!(history[0]["parts"][0]["text"], "hello");
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_network() {
        let client = ProviderClient::from_config(&config(ProviderKind::Anthropic)).unwrap();
        client.breaker().record_failure();
        let result = client
            .stream_completion(CompletionRequest::default(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ProviderError::CircuitOpen)));
    }

    #[test]
    fn test_cancelled_before_send() {
        let client = ProviderClient::from_config(&config(ProviderKind::OpenAi)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result =
            tokio_test::block_on(client.stream_completion(CompletionRequest::default(), cancel));
        assert!(matches!(result, Err(ProviderError::Cancelled)));
    }
}
