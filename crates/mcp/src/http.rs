//! HTTP transports: streamable HTTP and the legacy HTTP+SSE pair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aiops_core::sse::{SseDecoder, SseEvent};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::{RequestBuilder, Response, Url};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::McpError;
use crate::transport::{Transport, TransportFactory, TransportKind};
use crate::types::{JsonRpcRequest, JsonRpcResponse};

const SESSION_HEADER: &str = "mcp-session-id";

/// Opens real network transports with a shared `reqwest` client.
#[derive(Clone, Default)]
pub struct HttpTransportFactory {
    client: reqwest::Client,
}

impl HttpTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TransportFactory for HttpTransportFactory {
    async fn open(
        &self,
        kind: TransportKind,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Box<dyn Transport>, McpError> {
        match kind {
            TransportKind::StreamableHttp => Ok(Box::new(StreamableHttpTransport::new(
                self.client.clone(),
                url,
                headers.clone(),
            ))),
            TransportKind::Sse => {
                let transport = SseTransport::open(self.client.clone(), url, headers.clone()).await?;
                Ok(Box::new(transport))
            }
        }
    }
}

fn with_headers(mut builder: RequestBuilder, headers: &HashMap<String, String>) -> RequestBuilder {
    for (key, value) in headers {
        builder = builder.header(key.as_str(), value.as_str());
    }
    builder
}

async fn ensure_success(response: Response) -> Result<Response, McpError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    Err(McpError::Http {
        status: status.as_u16(),
        body,
    })
}

fn parse_response(data: &str) -> Result<JsonRpcResponse, McpError> {
    serde_json::from_str(data)
        .map_err(|e| McpError::Protocol(format!("Failed to parse JSON-RPC response: {e}")))
}

/// Single-endpoint transport. Each request is a POST whose reply is either a
/// JSON body or a short event stream carrying the response.
pub struct StreamableHttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl StreamableHttpTransport {
    pub fn new(client: reqwest::Client, url: &str, headers: HashMap<String, String>) -> Self {
        Self {
            client,
            url: url.to_string(),
            headers,
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    async fn post(&self, message: &JsonRpcRequest) -> Result<Response, McpError> {
        let mut builder = with_headers(self.client.post(&self.url), &self.headers)
            .header("Accept", "application/json, text/event-stream")
            .json(message);
        if let Some(session) = self.session_id.lock().clone() {
            builder = builder.header(SESSION_HEADER, session);
        }
        let response = ensure_success(builder.send().await?).await?;
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(session.to_string());
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self.post(&JsonRpcRequest::call(id, method, params)).await?;

        let is_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if !is_stream {
            let text = response.text().await?;
            return parse_response(&text)?.into_result();
        }

        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for event in decoder.push_bytes(&chunk) {
                if let Some(reply) = match_reply(&event, id) {
                    return reply.into_result();
                }
            }
        }
        if let Some(reply) = decoder.finish().as_ref().and_then(|e| match_reply(e, id)) {
            return reply.into_result();
        }
        Err(McpError::Protocol(format!(
            "event stream ended without a response to '{method}'"
        )))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.post(&JsonRpcRequest::notification(method, params))
            .await
            .map(|_| ())
    }

    async fn close(&self) -> Result<(), McpError> {
        let Some(session) = self.session_id.lock().take() else {
            return Ok(());
        };
        let builder = with_headers(self.client.delete(&self.url), &self.headers)
            .header(SESSION_HEADER, session);
        let response = builder.send().await?;
        // Servers may refuse explicit session termination.
        if !response.status().is_success() && response.status().as_u16() != 405 {
            return Err(McpError::Http {
                status: response.status().as_u16(),
                body: String::new(),
            });
        }
        Ok(())
    }
}

fn match_reply(event: &SseEvent, id: u64) -> Option<JsonRpcResponse> {
    if event.event_name() != "message" {
        return None;
    }
    serde_json::from_str::<JsonRpcResponse>(&event.data)
        .ok()
        .filter(|reply| reply.matches(id))
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Owns the stream reader until the transport takes it over.
struct ReaderGuard(Option<JoinHandle<()>>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        if let Some(reader) = self.0.take() {
            reader.abort();
        }
    }
}

/// Legacy transport: a long-lived GET event stream delivers responses, while
/// requests are POSTed to the endpoint the server announces first.
pub struct SseTransport {
    client: reqwest::Client,
    post_url: Url,
    headers: HashMap<String, String>,
    pending: Pending,
    next_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    pub async fn open(
        client: reqwest::Client,
        url: &str,
        headers: HashMap<String, String>,
    ) -> Result<Self, McpError> {
        let base = Url::parse(url).map_err(|e| McpError::Transport(format!("invalid url: {e}")))?;
        let response = with_headers(client.get(base.clone()), &headers)
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        // Aborted on every exit from here on, including the caller dropping
        // this future while the endpoint is still outstanding.
        let mut reader = ReaderGuard(Some(tokio::spawn(read_event_stream(
            response,
            pending.clone(),
            endpoint_tx,
        ))));

        let endpoint = endpoint_rx.await.map_err(|_| {
            McpError::Protocol("event stream closed before announcing an endpoint".into())
        })?;
        let post_url = base
            .join(&endpoint)
            .map_err(|e| McpError::Protocol(format!("invalid endpoint '{endpoint}': {e}")))?;
        debug!("SSE transport endpoint: {}", post_url);

        Ok(Self {
            client,
            post_url,
            headers,
            pending,
            next_id: AtomicU64::new(1),
            reader: Mutex::new(reader.0.take()),
        })
    }

    async fn post(&self, message: &JsonRpcRequest) -> Result<(), McpError> {
        let builder =
            with_headers(self.client.post(self.post_url.clone()), &self.headers).json(message);
        ensure_success(builder.send().await?).await.map(|_| ())
    }
}

async fn read_event_stream(
    response: Response,
    pending: Pending,
    endpoint_tx: oneshot::Sender<String>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("SSE stream error: {}", e);
                break;
            }
        };
        for event in decoder.push_bytes(&chunk) {
            match event.event_name() {
                "endpoint" => {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(event.data.trim().to_string());
                    }
                }
                "message" => match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                    Ok(reply) => {
                        let id = reply.id.as_ref().and_then(Value::as_u64);
                        let waiter = id.and_then(|id| pending.lock().remove(&id));
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(reply);
                            }
                            None => debug!("Dropping unsolicited SSE message"),
                        }
                    }
                    Err(e) => warn!("Ignoring malformed SSE message: {}", e),
                },
                other => debug!("Ignoring SSE event '{}'", other),
            }
        }
    }

    // Dropping the senders wakes every waiter with a closed-channel error.
    pending.lock().clear();
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(e) = self.post(&JsonRpcRequest::call(id, method, params)).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(reply) => reply.into_result(),
            Err(_) => Err(McpError::Transport(format!(
                "event stream closed while waiting for '{method}'"
            ))),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.post(&JsonRpcRequest::notification(method, params)).await
    }

    async fn close(&self) -> Result<(), McpError> {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.pending.lock().clear();
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}
