use crate::networking::capabilities::{EventQueueConfig, EventQueueServerConfig};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const CONFIG_FILE: &str = "settings.toml";
const ENV_PREFIX: &str = "SLV_NET";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("No config directory available on this platform")]
    NoConfigDir,

    #[error("Failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Settings I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Client-side event queue timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventQueueSettings {
    pub request_timeout_secs: u64,
    pub retry_delay_ms: u64,
}

impl Default for EventQueueSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            retry_delay_ms: 1000,
        }
    }
}

impl EventQueueSettings {
    pub fn to_config(&self) -> EventQueueConfig {
        EventQueueConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

/// Companion server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub path: String,
    pub poll_timeout_secs: u64,
    pub max_batch: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:12043".to_string(),
            path: "/cap/event_queue".to_string(),
            poll_timeout_secs: 30,
            max_batch: 100,
        }
    }
}

impl ServerSettings {
    pub fn to_config(&self) -> EventQueueServerConfig {
        EventQueueServerConfig {
            poll_timeout: Duration::from_secs(self.poll_timeout_secs),
            max_batch: self.max_batch,
        }
    }
}

/// Reliable circuit settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    /// Inbound sequence numbers remembered for duplicate detection
    pub received_window: usize,
    pub retry_timeout_ms: u64,
    pub max_retries: u8,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            received_window: crate::networking::circuit::DEFAULT_RECEIVED_WINDOW,
            retry_timeout_ms: 1000,
            max_retries: 3,
        }
    }
}

impl CircuitSettings {
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub event_queue: EventQueueSettings,
    pub server: ServerSettings,
    pub circuit: CircuitSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.event_queue.request_timeout_secs == 0 {
            return Err(SettingsError::Invalid {
                field: "event_queue.request_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.server.max_batch == 0 {
            return Err(SettingsError::Invalid {
                field: "server.max_batch",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.circuit.received_window == 0 {
            return Err(SettingsError::Invalid {
                field: "circuit.received_window",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.server.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(SettingsError::Invalid {
                field: "server.bind_addr",
                reason: format!("'{}' is not a socket address", self.server.bind_addr),
            });
        }
        Ok(())
    }
}

pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "slv", "slv-net")
        .map(|proj_dirs| proj_dirs.config_dir().join(CONFIG_FILE))
}

/// Load settings from the user's config dir, with `SLV_NET__*` overrides
pub fn load_settings() -> Result<Settings, SettingsError> {
    let path = config_path().ok_or(SettingsError::NoConfigDir)?;
    load_settings_from(&path)
}

/// Load settings from `path` (which may not exist) plus environment overrides,
/// e.g. `SLV_NET__SERVER__MAX_BATCH=10`.
pub fn load_settings_from(path: &Path) -> Result<Settings, SettingsError> {
    debug!("⚙️ Loading settings from {}", path.display());

    let settings: Settings = config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Toml).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    settings.validate()?;
    Ok(settings)
}

pub fn save_settings(settings: &Settings) -> Result<(), SettingsError> {
    let path = config_path().ok_or(SettingsError::NoConfigDir)?;
    save_settings_to(settings, &path)
}

pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let toml = toml::to_string_pretty(settings)?;
    fs::write(path, toml)?;
    info!("💾 Saved settings to {}", path.display());
    Ok(())
}
