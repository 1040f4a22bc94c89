//! EventQueueGet long-poll client
//!
//! The simulator pushes asynchronous messages (teleport progress, region
//! handoff, chat sessions) through a single capability URI. The client keeps
//! exactly one POST outstanding against it; the server holds that request until
//! it has events or gives up, the client delivers whatever came back and
//! immediately re-arms with the server's ack token.
//!
//! Failure handling is deliberately lopsided. Only a revoked capability
//! (404/410) or an immediate stop ends the channel. A 502 is what the
//! simulator's fronting proxy returns when its own idle timer beats the long
//! poll, so it is retried silently. Everything else is logged and retried after
//! `retry_delay`.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{debug, error, info, warn};
use url::Url;

use super::transport::{
    EventQueueTransport, OpenSignal, ReqwestTransport, TransportError, TransportResponse,
};
use super::CapabilityError;

/// Ack value the server uses for "nothing to acknowledge"
pub const NO_ACK: i64 = 0;

/// Lifecycle of an event queue channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventQueueState {
    /// Created, not started
    Idle,
    /// First request sent, connection not yet open
    AwaitingFirstResponse,
    /// Steady-state polling
    Open,
    /// Graceful stop requested; the final `done` request is pending
    Closing,
    /// Terminal
    Closed,
}

impl fmt::Display for EventQueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventQueueState::Idle => write!(f, "Idle"),
            EventQueueState::AwaitingFirstResponse => write!(f, "AwaitingFirstResponse"),
            EventQueueState::Open => write!(f, "Open"),
            EventQueueState::Closing => write!(f, "Closing"),
            EventQueueState::Closed => write!(f, "Closed"),
        }
    }
}

/// Event queue timing
#[derive(Debug, Clone)]
pub struct EventQueueConfig {
    /// Upper bound on a single long-poll request
    pub request_timeout: Duration,
    /// Pause before retrying after a generic failure (not applied to 502)
    pub retry_delay: Duration,
}

impl Default for EventQueueConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// A single pushed message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventQueueEvent {
    pub message: String,
    #[serde(default)]
    pub body: Value,
}

/// Request body: `{"ack": <id>|null, "done": <bool>}`
#[derive(Debug, Serialize)]
struct EventQueueRequest {
    ack: Option<i64>,
    done: bool,
}

/// Response body; both fields may be missing
#[derive(Debug, Deserialize)]
struct EventQueueResponse {
    #[serde(default)]
    events: Option<Vec<EventQueueEvent>>,
    #[serde(default)]
    id: Option<i64>,
}

/// Receives channel notifications.
///
/// Both methods run on the channel's driver task. `on_event` is called once
/// per event in server order and the next request is not sent until it
/// returns for every event of the current response.
pub trait EventQueueHandler: Send + Sync {
    /// The first request's connection opened; called once per channel
    fn on_connected(&self) {}

    fn on_event(&self, message: &str, body: &Value);
}

type RequestHandle = JoinHandle<Result<TransportResponse, TransportError>>;

/// What the driver does after a request completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextStep {
    /// Issue the next request right away
    Continue,
    /// Issue the next request after `retry_delay`
    RetryAfterDelay,
    /// Stop polling
    Finish,
}

/// Mutable channel state; one lock covers all of it
#[derive(Debug)]
struct ChannelState {
    state: EventQueueState,
    shutdown_requested: bool,
    final_request_sent: bool,
    connected_fired: bool,
    in_flight: Option<AbortHandle>,
    last_ack: Option<i64>,
    requests_sent: u64,
}

struct Inner {
    endpoint: Url,
    transport: Arc<dyn EventQueueTransport>,
    handler: Arc<dyn EventQueueHandler>,
    config: EventQueueConfig,
    shared: Mutex<ChannelState>,
    /// Cuts a retry pause short when a stop arrives
    wake: Notify,
    closed_tx: watch::Sender<bool>,
}

/// Long-poll client for one EventQueueGet capability.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct EventQueueClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for EventQueueClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueueClient")
            .field("endpoint", &self.inner.endpoint.as_str())
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl EventQueueClient {
    /// Create a client for `endpoint`; nothing is sent until [`start`](Self::start)
    pub fn new(
        endpoint: &str,
        transport: Arc<dyn EventQueueTransport>,
        handler: Arc<dyn EventQueueHandler>,
        config: EventQueueConfig,
    ) -> Result<Self, CapabilityError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| CapabilityError::InvalidUrl(format!("{}: {}", endpoint, e)))?;
        let (closed_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                endpoint,
                transport,
                handler,
                config,
                shared: Mutex::new(ChannelState {
                    state: EventQueueState::Idle,
                    shutdown_requested: false,
                    final_request_sent: false,
                    connected_fired: false,
                    in_flight: None,
                    last_ack: None,
                    requests_sent: 0,
                }),
                wake: Notify::new(),
                closed_tx,
            }),
        })
    }

    /// Create a client that talks HTTP through reqwest
    pub fn with_reqwest(
        endpoint: &str,
        handler: Arc<dyn EventQueueHandler>,
        config: EventQueueConfig,
    ) -> Result<Self, CapabilityError> {
        let transport = Arc::new(ReqwestTransport::new()?);
        Self::new(endpoint, transport, handler, config)
    }

    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    pub fn state(&self) -> EventQueueState {
        self.inner.shared.lock().state
    }

    /// Last ack token received from the server
    pub fn last_ack(&self) -> Option<i64> {
        self.inner.shared.lock().last_ack
    }

    /// Number of requests issued so far
    pub fn requests_sent(&self) -> u64 {
        self.inner.shared.lock().requests_sent
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.state(), EventQueueState::Idle | EventQueueState::Closed)
    }

    /// Dispatch the first request and start the polling task.
    ///
    /// Returns without waiting for a response. Must be called from within a
    /// tokio runtime.
    pub fn start(&self) -> Result<(), CapabilityError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(CapabilityError::NoRuntime);
        }

        {
            let mut shared = self.inner.shared.lock();
            if shared.state != EventQueueState::Idle {
                return Err(CapabilityError::AlreadyStarted);
            }
            shared.state = EventQueueState::AwaitingFirstResponse;
        }

        info!("📨 EVENT QUEUE: Starting on {}", self.inner.endpoint);

        match self.inner.dispatch() {
            Some(first) => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(inner.run(first));
            }
            // A stop raced in between the state change and the dispatch
            None => self.inner.close(),
        }
        Ok(())
    }

    /// Request shutdown.
    ///
    /// Graceful (`immediate == false`): the in-flight request finishes, one
    /// more request carrying `done: true` is sent, then the channel closes.
    /// Immediate: the in-flight request is aborted and nothing else is sent.
    /// Returns without waiting; see [`wait_closed`](Self::wait_closed).
    pub fn stop(&self, immediate: bool) {
        let aborted = {
            let mut shared = self.inner.shared.lock();
            match shared.state {
                EventQueueState::Closed => return,
                EventQueueState::Idle => {
                    shared.shutdown_requested = true;
                    shared.state = EventQueueState::Closed;
                    None
                }
                _ if immediate => {
                    shared.shutdown_requested = true;
                    shared.state = EventQueueState::Closed;
                    shared.in_flight.take()
                }
                _ => {
                    shared.shutdown_requested = true;
                    shared.state = EventQueueState::Closing;
                    None
                }
            }
        };

        if let Some(request) = aborted {
            request.abort();
        }

        info!(
            "📨 EVENT QUEUE: Stop requested (immediate: {}) for {}",
            immediate, self.inner.endpoint
        );

        self.inner.wake.notify_one();
        if self.state() == EventQueueState::Closed {
            self.inner.closed_tx.send_replace(true);
        }
    }

    /// Resolves once the channel is closed
    pub async fn wait_closed(&self) {
        let mut closed_rx = self.inner.closed_tx.subscribe();
        let _ = closed_rx.wait_for(|closed| *closed).await;
    }
}

impl Inner {
    /// Issue the next request unless the channel is closed or the final
    /// request already went out. Checking state and recording the in-flight
    /// handle happen under the same lock hold.
    fn dispatch(self: &Arc<Self>) -> Option<RequestHandle> {
        let mut shared = self.shared.lock();
        if shared.state == EventQueueState::Closed || shared.final_request_sent {
            return None;
        }

        let done = shared.shutdown_requested;
        let request = EventQueueRequest {
            ack: shared.last_ack,
            done,
        };
        let body = match serde_json::to_vec(&request) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                error!("❌ EVENT QUEUE: Failed to encode request: {}", e);
                shared.state = EventQueueState::Closed;
                return None;
            }
        };

        let opened = {
            let inner = Arc::downgrade(self);
            OpenSignal::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.mark_open();
                }
            })
        };

        let transport = Arc::clone(&self.transport);
        let url = self.endpoint.to_string();
        let timeout = self.config.request_timeout;
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(timeout, transport.post(&url, body, opened)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            }
        });

        shared.in_flight = Some(handle.abort_handle());
        shared.requests_sent += 1;
        if done {
            shared.final_request_sent = true;
        }

        debug!(
            "📨 EVENT QUEUE: Request #{} (ack: {:?}, done: {})",
            shared.requests_sent, request.ack, done
        );

        Some(handle)
    }

    /// Driver loop: one iteration per completed request
    async fn run(self: Arc<Self>, mut request: RequestHandle) {
        loop {
            let outcome = request.await;

            match self.complete(outcome) {
                NextStep::Continue => {}
                NextStep::RetryAfterDelay => self.pause(self.config.retry_delay).await,
                NextStep::Finish => break,
            }

            match self.dispatch() {
                Some(next) => request = next,
                None => break,
            }
        }

        self.close();
    }

    fn complete(
        &self,
        outcome: Result<Result<TransportResponse, TransportError>, JoinError>,
    ) -> NextStep {
        let was_final = {
            let mut shared = self.shared.lock();
            shared.in_flight = None;
            if shared.state == EventQueueState::Closed {
                debug!("📨 EVENT QUEUE: Request completed after channel closed");
                return NextStep::Finish;
            }
            shared.final_request_sent
        };

        let step = match outcome {
            Err(join_error) if join_error.is_cancelled() => {
                debug!("📨 EVENT QUEUE: Request cancelled");
                return NextStep::Finish;
            }
            Err(join_error) => {
                error!("❌ EVENT QUEUE: Request task failed: {}", join_error);
                NextStep::RetryAfterDelay
            }
            Ok(Err(transport_error)) => {
                warn!("⚠️ EVENT QUEUE: {} on {}", transport_error, self.endpoint);
                NextStep::RetryAfterDelay
            }
            Ok(Ok(response)) => self.handle_response(response, was_final),
        };

        if was_final {
            info!("📨 EVENT QUEUE: Final request completed, closing {}", self.endpoint);
            return NextStep::Finish;
        }
        step
    }

    fn handle_response(&self, response: TransportResponse, was_final: bool) -> NextStep {
        match response.status {
            _ if response.is_success() => {
                // Transports that cannot observe the connection opening
                // report it with the first successful response instead.
                self.mark_open();

                if response.body.is_empty() {
                    warn!("⚠️ EVENT QUEUE: HTTP {} with empty body", response.status);
                    return NextStep::RetryAfterDelay;
                }

                match serde_json::from_slice::<EventQueueResponse>(&response.body) {
                    Ok(parsed) => {
                        self.deliver(parsed);
                        NextStep::Continue
                    }
                    Err(e) => {
                        warn!("❌ EVENT QUEUE: Failed to parse response: {}", e);
                        debug!("   Response body: {}", String::from_utf8_lossy(&response.body));
                        NextStep::RetryAfterDelay
                    }
                }
            }
            404 | 410 if was_final => {
                debug!("📨 EVENT QUEUE: Server released queue (HTTP {})", response.status);
                NextStep::Finish
            }
            404 | 410 => {
                warn!(
                    "📨 EVENT QUEUE: Capability revoked (HTTP {}), closing {}",
                    response.status, self.endpoint
                );
                let mut shared = self.shared.lock();
                shared.shutdown_requested = true;
                shared.state = EventQueueState::Closed;
                NextStep::Finish
            }
            502 => {
                debug!("📨 EVENT QUEUE: Long-poll timed out upstream (HTTP 502), re-polling");
                NextStep::Continue
            }
            status => {
                warn!("⚠️ EVENT QUEUE: Unexpected HTTP {} from {}", status, self.endpoint);
                if !response.body.is_empty() {
                    debug!("   Response body: {}", String::from_utf8_lossy(&response.body));
                }
                NextStep::RetryAfterDelay
            }
        }
    }

    fn deliver(&self, response: EventQueueResponse) {
        let events = response.events.unwrap_or_default();
        if !events.is_empty() {
            info!("📨 Received {} events from event queue", events.len());
        }

        for event in &events {
            if self.is_closed() {
                debug!("📨 EVENT QUEUE: Channel closed, dropping remaining events");
                return;
            }
            debug!("📨 Event: {}", event.message);
            self.call_handler("on_event", || self.handler.on_event(&event.message, &event.body));
        }

        if let Some(id) = response.id.filter(|id| *id != NO_ACK) {
            self.shared.lock().last_ack = Some(id);
        }
    }

    fn mark_open(&self) {
        let fire = {
            let mut shared = self.shared.lock();
            if shared.connected_fired || shared.state == EventQueueState::Closed {
                false
            } else {
                shared.connected_fired = true;
                if shared.state == EventQueueState::AwaitingFirstResponse {
                    shared.state = EventQueueState::Open;
                }
                true
            }
        };

        if fire {
            info!("✅ EVENT QUEUE: Connected to {}", self.endpoint);
            self.call_handler("on_connected", || self.handler.on_connected());
        }
    }

    /// Run a handler callback, logging a panic instead of letting it unwind
    /// through the driver task
    fn call_handler(&self, callback: &str, f: impl FnOnce()) {
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(f)) {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!("❌ EVENT QUEUE: Handler {} panicked: {}", callback, reason);
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.lock().state == EventQueueState::Closed
    }

    async fn pause(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.wake.notified() => {}
        }
    }

    fn close(&self) {
        {
            let mut shared = self.shared.lock();
            shared.state = EventQueueState::Closed;
            shared.in_flight = None;
        }
        self.closed_tx.send_replace(true);
        info!("📨 EVENT QUEUE: Closed {}", self.endpoint);
    }
}
