//! hearth: a single-threaded WebSocket server
//!
//! Speaks RFC 6455 over plain TCP:
//! - HTTP upgrade handshake (protocol versions 7, 8 and 13)
//! - Text frames out, masked client frames in
//! - Idle connections pinged, then evicted
//! - Pluggable message handler (chat room or echo)
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod handlers;
mod runtime;
mod websocket;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        handler = ?config.handler,
        max_connections = config.max_connections,
        idle_secs = config.idle_secs,
        timeout_secs = config.timeout_secs,
        "Starting hearth server"
    );

    runtime::run(config)?;
    Ok(())
}
