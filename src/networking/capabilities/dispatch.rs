//! Routing of event queue messages to per-message handlers
//!
//! Session code registers interest in specific message names (a teleport
//! state machine listens for `TeleportFinish`, a chat session for
//! `ChatterBoxInvitation`) and the registry fans each delivered event out to
//! the matching callbacks.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::event_queue::EventQueueHandler;

/// Message names commonly pushed through EventQueueGet
pub mod well_known_events {
    pub const ENABLE_SIMULATOR: &str = "EnableSimulator";
    pub const ESTABLISH_AGENT_COMMUNICATION: &str = "EstablishAgentCommunication";
    pub const TELEPORT_FINISH: &str = "TeleportFinish";
    pub const TELEPORT_FAILED: &str = "TeleportFailed";
    pub const CROSSED_REGION: &str = "CrossedRegion";
    pub const CHATTER_BOX_INVITATION: &str = "ChatterBoxInvitation";
    pub const CHATTER_BOX_SESSION_START_REPLY: &str = "ChatterBoxSessionStartReply";
    pub const CHATTER_BOX_SESSION_AGENT_LIST_UPDATES: &str = "ChatterBoxSessionAgentListUpdates";
    pub const AGENT_GROUP_DATA_UPDATE: &str = "AgentGroupDataUpdate";
    pub const PARCEL_PROPERTIES: &str = "ParcelProperties";
}

type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;
type FallbackCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;
type ConnectedCallback = Arc<dyn Fn() + Send + Sync>;

/// Event handler registry keyed by message name
#[derive(Default)]
pub struct EventHandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<EventCallback>>>,
    fallback: RwLock<Option<FallbackCallback>>,
    connected: RwLock<Vec<ConnectedCallback>>,
}

impl EventHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for `message`; several may share a name
    pub fn register<F>(&self, message: impl Into<String>, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let message = message.into();
        info!("Registering event queue handler for {}", message);
        self.handlers
            .write()
            .entry(message)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Receives every event with no registered handler
    pub fn register_fallback<F>(&self, callback: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        *self.fallback.write() = Some(Arc::new(callback));
    }

    pub fn register_connected<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.connected.write().push(Arc::new(callback));
    }

    /// Remove all callbacks for `message`; returns how many were removed
    pub fn unregister(&self, message: &str) -> usize {
        self.handlers
            .write()
            .remove(message)
            .map(|callbacks| callbacks.len())
            .unwrap_or(0)
    }

    /// Number of message names with at least one callback
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Route one event. Callbacks run after the lock is released so they may
    /// register further handlers.
    pub fn dispatch(&self, message: &str, body: &Value) -> bool {
        let callbacks = self.handlers.read().get(message).cloned();
        match callbacks {
            Some(callbacks) => {
                for callback in callbacks {
                    callback(body);
                }
                true
            }
            None => {
                let fallback = self.fallback.read().clone();
                match fallback {
                    Some(fallback) => fallback(message, body),
                    None => debug!("📨 No handler for event queue message {}", message),
                }
                false
            }
        }
    }
}

impl EventQueueHandler for EventHandlerRegistry {
    fn on_connected(&self) {
        let callbacks = self.connected.read().clone();
        for callback in callbacks {
            callback();
        }
    }

    fn on_event(&self, message: &str, body: &Value) {
        self.dispatch(message, body);
    }
}
