//! HTTP capabilities
//!
//! A simulator hands each agent a set of capability URLs (fetched through the
//! seed capability). The one this crate builds on is `EventQueueGet`, the
//! long-poll channel the simulator uses to push asynchronous messages.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub mod dispatch;
pub mod event_queue;
pub mod server;
pub mod transport;

pub use dispatch::EventHandlerRegistry;
pub use event_queue::{
    EventQueueClient, EventQueueConfig, EventQueueEvent, EventQueueHandler, EventQueueState,
};
pub use server::{EventQueueServer, EventQueueServerConfig};
pub use transport::{
    EventQueueTransport, OpenSignal, ReqwestTransport, TransportError, TransportResponse,
};

/// Capability URL and name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// Capability name/identifier
    pub name: String,
    /// The HTTP URL for this capability
    pub url: String,
}

/// Registry of the capabilities granted by a simulator
#[derive(Debug)]
pub struct CapabilitiesManager {
    /// Map of capability name to capability info
    capabilities: Arc<RwLock<HashMap<String, Capability>>>,
    /// HTTP client for the seed request
    http_client: reqwest::Client,
}

impl CapabilitiesManager {
    pub fn new() -> Result<Self, CapabilityError> {
        let http_client = reqwest::Client::builder()
            .user_agent(format!("slv-net/{}", crate::VERSION))
            .build()
            .map_err(|e| CapabilityError::HttpError(e.to_string()))?;
        Ok(Self::with_client(http_client))
    }

    pub fn with_client(http_client: reqwest::Client) -> Self {
        Self {
            capabilities: Arc::new(RwLock::new(HashMap::new())),
            http_client,
        }
    }

    /// Register capabilities from a seed capability response
    pub async fn register_capabilities(&self, capabilities: HashMap<String, String>) {
        let mut caps = self.capabilities.write().await;

        info!("📡 Registering {} capabilities", capabilities.len());

        for (name, url) in capabilities {
            debug!("📋 Capability: {} -> {}", name, url);
            caps.insert(name.clone(), Capability { name, url });
        }
    }

    /// Get a capability by name
    pub async fn get_capability(&self, name: &str) -> Option<Capability> {
        let caps = self.capabilities.read().await;
        caps.get(name).cloned()
    }

    /// List all registered capabilities
    pub async fn list_capabilities(&self) -> Vec<String> {
        let caps = self.capabilities.read().await;
        let mut names: Vec<String> = caps.keys().cloned().collect();
        names.sort();
        names
    }

    /// POST the wanted capability names to the seed capability and register
    /// the returned name -> URL map. Returns how many were granted.
    pub async fn initialize_from_seed(
        &self,
        seed_url: &str,
        requested: &[&str],
    ) -> Result<usize, CapabilityError> {
        url::Url::parse(seed_url)
            .map_err(|e| CapabilityError::InvalidUrl(format!("{}: {}", seed_url, e)))?;

        info!(
            "🌱 SEED CAPABILITY: Requesting {} capabilities from {}",
            requested.len(),
            seed_url
        );

        let response = self
            .http_client
            .post(seed_url)
            .json(&requested)
            .send()
            .await
            .map_err(|e| CapabilityError::HttpError(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| CapabilityError::HttpError(e.to_string()))?;

        if !(200..300).contains(&status) {
            warn!("❌ SEED CAPABILITY: HTTP {}", status);
            return Err(CapabilityError::HttpStatusError(status, body));
        }

        let granted: HashMap<String, String> =
            serde_json::from_str(&body).map_err(|e| CapabilityError::ParseError(e.to_string()))?;
        let count = granted.len();
        self.register_capabilities(granted).await;

        info!("✅ SEED CAPABILITY: {} of {} capabilities granted", count, requested.len());
        Ok(count)
    }

    /// Build an event queue client for the granted `EventQueueGet` capability
    pub async fn event_queue_client(
        &self,
        handler: Arc<dyn EventQueueHandler>,
        config: EventQueueConfig,
    ) -> Result<EventQueueClient, CapabilityError> {
        let name = well_known_capabilities::EVENT_QUEUE_GET;
        let capability = self
            .get_capability(name)
            .await
            .ok_or_else(|| CapabilityError::CapabilityNotFound(name.to_string()))?;

        let transport = Arc::new(ReqwestTransport::with_client(self.http_client.clone()));
        EventQueueClient::new(&capability.url, transport, handler, config)
    }
}

/// Errors that can occur in the capabilities system
#[derive(Debug, Clone, thiserror::Error)]
pub enum CapabilityError {
    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("HTTP status error: {0} - {1}")]
    HttpStatusError(u16, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid capability URL: {0}")]
    InvalidUrl(String),

    #[error("Event queue already started")]
    AlreadyStarted,

    #[error("Event queue must be started inside a tokio runtime")]
    NoRuntime,

    #[error("Event queue is closed")]
    QueueClosed,
}

/// Common capability endpoints used by Second Life
pub mod well_known_capabilities {
    /// Event queue for async notifications
    pub const EVENT_QUEUE_GET: &str = "EventQueueGet";

    pub const SEED: &str = "Seed";
    pub const CHAT_SESSION_REQUEST: &str = "ChatSessionRequest";
    pub const FETCH_INVENTORY: &str = "FetchInventory2";
    pub const GET_DISPLAY_NAMES: &str = "GetDisplayNames";
}
