//! tether: a framed binary protocol server
//!
//! Features:
//! - Length-prefixed typed payloads (binary, string, initialization)
//! - Handshake-negotiated liveness pings with per-connection deadlines
//! - Bounded worker pool with backpressure on accept
//! - Configuration via CLI arguments or TOML file

use tether::{Config, Server};
use tracing::{info, warn};
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
        workers = config.workers,
        max_connections = config.max_connections,
        default_ping_interval_ms = config.default_ping_interval.as_millis() as u64,
        "Starting tether server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(config)?;
    let shutdown = server.shutdown_token();
    let mut server_task = tokio::spawn(server.run());

    tokio::select! {
        result = &mut server_task => return Ok(result??),
        signal = tokio::signal::ctrl_c() => signal?,
    }

    info!("Shutdown requested, waiting for active sessions");
    shutdown.cancel();

    // A second Ctrl-C abandons sessions that are still running.
    tokio::select! {
        result = &mut server_task => result??,
        _ = tokio::signal::ctrl_c() => warn!("Forced shutdown"),
    }
    Ok(())
}
