//! Follows an EventQueueGet capability and prints every event as a JSON line.
//!
//! Usage: `event_queue_tail <capability-url>`. Ctrl-C performs a graceful
//! stop (one final `done` request) before exiting.

use anyhow::Context;
use slv_net::config::{self, Settings, SettingsError};
use slv_net::networking::capabilities::{EventHandlerRegistry, EventQueueClient};
use slv_net::utils::logging;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging(None)?;

    let url = std::env::args()
        .nth(1)
        .context("usage: event_queue_tail <capability-url>")?;

    let settings = match config::load_settings() {
        Ok(settings) => settings,
        Err(SettingsError::NoConfigDir) => Settings::default(),
        Err(e) => return Err(e.into()),
    };

    let registry = Arc::new(EventHandlerRegistry::new());
    registry.register_connected(|| info!("✅ Event queue connected"));
    registry.register_fallback(|message, body| {
        println!("{}", serde_json::json!({ "message": message, "body": body }));
    });

    let client = EventQueueClient::with_reqwest(&url, registry, settings.event_queue.to_config())?;
    client.start()?;

    tokio::select! {
        _ = client.wait_closed() => {
            info!("📭 Event queue closed by server");
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("🛑 Stopping event queue");
            client.stop(false);
            let grace = settings.event_queue.to_config().request_timeout + Duration::from_secs(1);
            if tokio::time::timeout(grace, client.wait_closed()).await.is_err() {
                warn!("Final request did not finish, stopping immediately");
                client.stop(true);
            }
        }
    }

    Ok(())
}
