//! Serves an event queue and feeds it from stdin.
//!
//! Each input line is `MessageName {json body}` (the body may be omitted).
//! End of input closes the queue, so connected clients see 404 and stop.

use slv_net::config::{self, Settings, SettingsError};
use slv_net::networking::capabilities::EventQueueServer;
use slv_net::utils::logging;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

fn parse_line(line: &str) -> anyhow::Result<(String, serde_json::Value)> {
    let line = line.trim();
    let (message, body) = match line.split_once(char::is_whitespace) {
        Some((message, body)) => (message, serde_json::from_str(body.trim())?),
        None => (line, serde_json::Value::Null),
    };
    Ok((message.to_string(), body))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging(None)?;

    let settings = match config::load_settings() {
        Ok(settings) => settings,
        Err(SettingsError::NoConfigDir) => Settings::default(),
        Err(e) => return Err(e.into()),
    };
    let bind_addr = std::env::args().nth(1).unwrap_or_else(|| settings.server.bind_addr.clone());

    let server = EventQueueServer::new(settings.server.to_config());
    let listener = TcpListener::bind(&bind_addr).await?;
    let local_addr = listener.local_addr()?;
    println!("http://{}{}", local_addr, settings.server.path);

    let serving = {
        let server = server.clone();
        let path = settings.server.path.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener, &path).await {
                error!("❌ Event queue server stopped: {}", e);
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Ok((message, body)) => {
                if let Err(e) = server.enqueue(message, body) {
                    warn!("Dropping event: {}", e);
                    break;
                }
            }
            Err(e) => warn!("❌ Ignoring malformed line '{}': {}", line, e),
        }
    }

    info!("📭 Input finished, closing event queue");
    server.close();

    // Give parked polls a moment to receive their 404
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    serving.abort();
    Ok(())
}
