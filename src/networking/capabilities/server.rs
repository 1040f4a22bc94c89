//! Server side of an EventQueueGet capability
//!
//! Holds queued events for one agent and answers its long-poll requests: a
//! request waits until events are queued or `poll_timeout` passes, in which
//! case it gets the 502 a simulator's proxy would produce. Delivered events
//! form a numbered batch that stays outstanding until the client echoes its id
//! back as `ack`; a request with any other ack gets the same batch again.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::event_queue::EventQueueEvent;
use super::CapabilityError;
use crate::networking::NetworkResult;

/// Server-side queue settings
#[derive(Debug, Clone)]
pub struct EventQueueServerConfig {
    /// How long a poll is held open without events
    pub poll_timeout: Duration,
    /// Maximum events per response
    pub max_batch: usize,
}

impl Default for EventQueueServerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(30),
            max_batch: 100,
        }
    }
}

/// Incoming poll body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollRequest {
    #[serde(default)]
    pub ack: Option<i64>,
    #[serde(default)]
    pub done: bool,
}

/// A batch handed to the client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollBatch {
    pub events: Vec<EventQueueEvent>,
    pub id: i64,
}

/// Result of a single poll
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// 200 with a batch
    Events(PollBatch),
    /// Nothing arrived in time; 502
    Timeout,
    /// Queue closed; 404
    Closed,
}

impl IntoResponse for PollOutcome {
    fn into_response(self) -> Response {
        match self {
            PollOutcome::Events(batch) => Json(batch).into_response(),
            PollOutcome::Timeout => {
                (StatusCode::BAD_GATEWAY, "Upstream error: timed out").into_response()
            }
            PollOutcome::Closed => StatusCode::NOT_FOUND.into_response(),
        }
    }
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<EventQueueEvent>,
    /// Sent but not yet acknowledged
    outstanding: Option<PollBatch>,
    next_id: i64,
    closed: bool,
}

struct ServerInner {
    config: EventQueueServerConfig,
    queue: Mutex<QueueState>,
    /// Bumped whenever the queue changes so waiting polls re-check it
    changes: watch::Sender<u64>,
}

/// One agent's event queue
#[derive(Clone)]
pub struct EventQueueServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for EventQueueServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueueServer")
            .field("config", &self.inner.config)
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl EventQueueServer {
    pub fn new(config: EventQueueServerConfig) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(ServerInner {
                config,
                queue: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    outstanding: None,
                    next_id: 1,
                    closed: false,
                }),
                changes,
            }),
        }
    }

    /// Queue an event for delivery
    pub fn enqueue(&self, message: impl Into<String>, body: Value) -> Result<(), CapabilityError> {
        let message = message.into();
        {
            let mut queue = self.inner.queue.lock();
            if queue.closed {
                return Err(CapabilityError::QueueClosed);
            }
            debug!("📨 EVENT QUEUE SERVER: Queued {}", message);
            queue.pending.push_back(EventQueueEvent { message, body });
        }
        self.notify_change();
        Ok(())
    }

    /// Events queued and not yet handed out
    pub fn pending_count(&self) -> usize {
        self.inner.queue.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.queue.lock().closed
    }

    /// Close the queue; waiting and future polls get 404
    pub fn close(&self) {
        {
            let mut queue = self.inner.queue.lock();
            if queue.closed {
                return;
            }
            queue.closed = true;
            queue.pending.clear();
            queue.outstanding = None;
        }
        info!("📨 EVENT QUEUE SERVER: Queue closed");
        self.notify_change();
    }

    /// Answer one poll request
    pub async fn poll(&self, request: PollRequest) -> PollOutcome {
        let mut changes = self.inner.changes.subscribe();

        {
            let mut queue = self.inner.queue.lock();
            if queue.closed {
                return PollOutcome::Closed;
            }
            let acked = matches!(
                (&queue.outstanding, request.ack),
                (Some(batch), Some(ack)) if batch.id == ack
            );
            if acked {
                queue.outstanding = None;
            }
        }

        if request.done {
            info!("📨 EVENT QUEUE SERVER: Client finished with queue");
            self.close();
            return PollOutcome::Closed;
        }

        let deadline = tokio::time::Instant::now() + self.inner.config.poll_timeout;
        loop {
            if let Some(outcome) = self.take_batch() {
                return outcome;
            }

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return PollOutcome::Timeout;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return self.take_batch().unwrap_or(PollOutcome::Timeout);
                }
            }
        }
    }

    fn take_batch(&self) -> Option<PollOutcome> {
        let mut queue = self.inner.queue.lock();
        if queue.closed {
            return Some(PollOutcome::Closed);
        }
        if let Some(batch) = &queue.outstanding {
            debug!("📨 EVENT QUEUE SERVER: Re-sending unacknowledged batch {}", batch.id);
            return Some(PollOutcome::Events(batch.clone()));
        }
        if queue.pending.is_empty() {
            return None;
        }

        let count = queue.pending.len().min(self.inner.config.max_batch.max(1));
        let events: Vec<EventQueueEvent> = queue.pending.drain(..count).collect();
        let batch = PollBatch {
            events,
            id: queue.next_id,
        };
        queue.next_id += 1;
        queue.outstanding = Some(batch.clone());

        debug!(
            "📨 EVENT QUEUE SERVER: Sending batch {} with {} events",
            batch.id,
            batch.events.len()
        );
        Some(PollOutcome::Events(batch))
    }

    fn notify_change(&self) {
        self.inner.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Router serving this queue at `path`
    pub fn router(&self, path: &str) -> Router {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Router::new()
            .route(&path, post(handle_poll))
            .with_state(self.clone())
    }

    /// Serve the queue on `listener` until the task is dropped
    pub async fn serve(self, listener: TcpListener, path: &str) -> NetworkResult<()> {
        let local_addr = listener.local_addr()?;
        info!("📨 EVENT QUEUE SERVER: Listening on http://{}{}", local_addr, path);
        axum::serve(listener, self.router(path)).await?;
        Ok(())
    }
}

async fn handle_poll(State(server): State<EventQueueServer>, body: Bytes) -> Response {
    let request = if body.is_empty() {
        PollRequest::default()
    } else {
        match serde_json::from_slice::<PollRequest>(&body) {
            Ok(request) => request,
            Err(e) => {
                warn!("❌ EVENT QUEUE SERVER: Malformed poll request: {}", e);
                return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
            }
        }
    };

    server.poll(request).await.into_response()
}
