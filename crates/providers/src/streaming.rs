//! Turns a backend's `text/event-stream` body into [`StreamEvent`]s.

use crate::error::ProviderError;
use crate::traits::{ProviderStream, StreamEvent};
use aiops_core::sse::{SseDecoder, SseEvent};
use aiops_core::CancellationToken;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Backend-specific interpretation of SSE frames. Pure and synchronous so it
/// can be exercised without a network.
pub trait StreamDecoder: Send {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<StreamEvent>, ProviderError>;

    /// Called once at end of body. Emits anything still buffered.
    fn finish(&mut self) -> Result<Vec<StreamEvent>, ProviderError>;

    /// True once a terminal event has been produced.
    fn is_done(&self) -> bool;
}

/// Run `decoder` over every frame of `sse_text`. Used by decoder tests.
pub fn decode_all(
    decoder: &mut dyn StreamDecoder,
    sse_text: &str,
) -> Result<Vec<StreamEvent>, ProviderError> {
    let mut frames = SseDecoder::new();
    let mut out = Vec::new();
    for event in frames.push_str(sse_text) {
        out.extend(decoder.decode(&event)?);
        if decoder.is_done() {
            return Ok(out);
        }
    }
    if let Some(event) = frames.finish() {
        out.extend(decoder.decode(&event)?);
        if decoder.is_done() {
            return Ok(out);
        }
    }
    out.extend(decoder.finish()?);
    Ok(out)
}

/// Spawn a reader task feeding a bounded channel. The task stops when the
/// body ends, the consumer drops the stream, or `cancel` fires.
pub fn drive(
    response: reqwest::Response,
    mut decoder: Box<dyn StreamDecoder>,
    cancel: CancellationToken,
) -> ProviderStream {
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut frames = SseDecoder::new();
        let mut body = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Provider stream cancelled");
                    let _ = tx.send(Err(ProviderError::Cancelled)).await;
                    return;
                }
                chunk = body.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    for event in frames.push_bytes(&bytes) {
                        if !forward(&tx, decoder.decode(&event)).await || decoder.is_done() {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    let _ = tx.send(Err(ProviderError::from(e))).await;
                    return;
                }
                None => break,
            }
        }

        if let Some(event) = frames.finish() {
            if !forward(&tx, decoder.decode(&event)).await || decoder.is_done() {
                return;
            }
        }
        forward(&tx, decoder.finish()).await;
    });

    Box::pin(ReceiverStream::new(rx))
}

async fn forward(
    tx: &mpsc::Sender<Result<StreamEvent, ProviderError>>,
    decoded: Result<Vec<StreamEvent>, ProviderError>,
) -> bool {
    match decoded {
        Ok(events) => {
            for event in events {
                if tx.send(Ok(event)).await.is_err() {
                    return false;
                }
            }
            true
        }
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            false
        }
    }
}

/// Parse one frame's JSON payload.
pub(crate) fn parse_data(event: &SseEvent) -> Result<serde_json::Value, ProviderError> {
    serde_json::from_str(&event.data)
        .map_err(|e| ProviderError::Parse(format!("invalid stream payload: {e}")))
}

/// Tool arguments arrive as a JSON string; empty means no arguments.
pub(crate) fn parse_arguments(raw: &str) -> Result<serde_json::Value, ProviderError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(raw)
        .map_err(|e| ProviderError::Parse(format!("invalid tool arguments: {e}")))
}
