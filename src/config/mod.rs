pub mod settings;

// Re-export commonly used types
pub use settings::{
    CircuitSettings, EventQueueSettings, ServerSettings, Settings, SettingsError,
    config_path, load_settings, load_settings_from, save_settings, save_settings_to,
};
