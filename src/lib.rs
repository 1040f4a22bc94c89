// SLV-Net: Second Life event queue and circuit networking in Rust

pub mod config;
pub mod networking;
pub mod utils;

// Re-export commonly used types for convenience
pub use crate::config::Settings;
pub use networking::{
    DedupError, DedupWindow, EventHandlerRegistry, EventQueueClient, EventQueueConfig,
    EventQueueHandler, EventQueueServer, EventQueueServerConfig, EventQueueState, NetworkError,
    NetworkResult,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
