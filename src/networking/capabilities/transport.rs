//! HTTP transport used by the event queue
//!
//! The event queue only needs "POST these bytes, give me status and body".
//! Keeping that behind a trait lets the long-poll loop run against reqwest in
//! production and against scripted transports in tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::task::Poll;
use thiserror::Error;
use tracing::debug;

use super::CapabilityError;

/// Transport-level failure (no HTTP status was received)
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

/// Raw HTTP response; any status code counts as a response
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One-shot notification that a request's connection is open.
///
/// Transports fire it once the request is on the wire, before the response
/// body arrives. Firing more than once is a no-op.
pub struct OpenSignal {
    notify: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl OpenSignal {
    pub fn new<F>(notify: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            notify: Some(Box::new(notify)),
        }
    }

    pub fn fire(&mut self) {
        if let Some(notify) = self.notify.take() {
            notify();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.notify.is_some()
    }
}

impl fmt::Debug for OpenSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenSignal")
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// POST transport for capability endpoints
#[async_trait]
pub trait EventQueueTransport: Send + Sync {
    /// Send `body` to `url` and wait for the complete response.
    ///
    /// Implementations call `opened.fire()` once the connection is
    /// established. Timeouts are enforced by the caller.
    async fn post(
        &self,
        url: &str,
        body: Bytes,
        opened: OpenSignal,
    ) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, CapabilityError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("slv-net/{}", crate::VERSION))
            .build()
            .map_err(|e| CapabilityError::HttpError(e.to_string()))?;
        Ok(Self { client })
    }

    /// Use an already configured client (proxy, TLS roots, pool settings)
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventQueueTransport for ReqwestTransport {
    async fn post(
        &self,
        url: &str,
        body: Bytes,
        opened: OpenSignal,
    ) -> Result<TransportResponse, TransportError> {
        // Streamed as a single chunk: hyper only polls the body once the
        // connection is up and the request head is written.
        let mut pending = Some((opened, body));
        let stream = futures::stream::poll_fn(move |_cx| {
            Poll::Ready(pending.take().map(|(mut opened, body)| {
                opened.fire();
                Ok::<Bytes, std::io::Error>(body)
            }))
        });

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.bytes().await?;

        debug!("🌐 EVENT QUEUE: HTTP {} ({} bytes) from {}", status, body.len(), url);

        Ok(TransportResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_open_signal_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut signal = OpenSignal::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(signal.is_pending());
        signal.fire();
        signal.fire();
        assert!(!signal.is_pending());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_response_success_range() {
        assert!(TransportResponse::new(200, Bytes::new()).is_success());
        assert!(TransportResponse::new(204, Bytes::new()).is_success());
        assert!(!TransportResponse::new(502, Bytes::new()).is_success());
        assert!(!TransportResponse::new(404, "gone").is_success());
    }
}
