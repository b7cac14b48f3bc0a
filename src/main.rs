//! delimiter-server: answers delimiter-terminated messages with a file
//!
//! Clients stream arbitrary bytes; the server replies with a payload
//! framed as `Content-Length: <n>\r\n\r\n<bytes>`.
//!
//! Modes (selected by the single positional argument):
//! - Sequential (default): reply each time the delimiter `$::_$` arrives
//! - Parallel: reply once, as soon as any data arrives
//!
//! On shutdown the server appends a JSON record with its connection
//! statistics to the configured log file.

mod config;
mod response;
mod scanner;
mod server;
mod session;
mod stats;

use config::Config;
use server::Server;
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
        host = %config.host,
        port = config.port,
        strategy = ?config.strategy,
        buffer_size = config.buffer_size,
        workers = config.workers,
        payload = %config.payload_path.display(),
        "Starting delimiter-server"
    );

    let runtime = if config.workers > 1 {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.workers)
            .enable_all()
            .build()?
    } else {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
    };

    runtime.block_on(run(config))
}

/// Serve until interrupted or until the supervisor shuts itself down
async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let strategy = config.strategy;
    let server = Server::new(config).start(strategy).await?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Received interrupt, shutting down");
        }
        _ = server.shutdown_requested() => {
            info!("Shutdown requested after connection error");
        }
    }

    let record = server.stop().await?;
    info!(
        start = %record.start,
        end = %record.end,
        total_conns = record.total_conns,
        conns_until_shutdown = record.conns_until_shutdown,
        "Shutdown complete"
    );
    Ok(())
}
