//! beacond daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;

use beacond::{Config, Daemon, IcmpProbe, LogNotify, MdnsDirectory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting beacond with config: {:?}", cfg);

    let directory = Arc::new(MdnsDirectory::new()?);
    let daemon = Daemon::new(cfg, directory, Arc::new(IcmpProbe), Arc::new(LogNotify));
    let handle = daemon.start().await?;

    // Graceful shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    handle.stop();
    info!("Shutdown complete.");
    Ok(())
}
