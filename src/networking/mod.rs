//! Second Life networking pieces
//!
//! Duplicate suppression for the reliable UDP circuit and the HTTP
//! capabilities side, chiefly the EventQueueGet long-poll channel and a
//! server that speaks the same protocol.

pub mod capabilities;
pub mod circuit;
pub mod dedup;

// Re-export main types for convenience
pub use capabilities::{
    CapabilitiesManager, CapabilityError, EventHandlerRegistry, EventQueueClient, EventQueueConfig,
    EventQueueHandler, EventQueueServer, EventQueueServerConfig, EventQueueState,
};
pub use circuit::{AckOutcome, Acknowledger};
pub use dedup::{DedupError, DedupWindow};

// Error types
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("Duplicate window: {0}")]
    Dedup(#[from] DedupError),
}

pub type NetworkResult<T> = Result<T, NetworkError>;

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        NetworkError::Transport { reason: err.to_string() }
    }
}
