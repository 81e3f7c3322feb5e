//! wlf-sync server binary.
//!
//! Configured from the environment (`BIND_ADDR`, `PORT`, `STORAGE_PATH`,
//! `ROOM_MAX_BYTES`, `ROOM_IDLE_SECS`, `ROOM_DEFAULT_PASSWORD`); logging
//! through `RUST_LOG`.

use log::info;

use wlf_sync::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env()?;
    let server = SyncServer::new(config)?;
    info!("Starting wlf-sync on {}", server.bind_addr());

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
    }

    // Flush cached rooms before exiting.
    let stored = server.directory().persist_all().await;
    info!("Flushed {stored} rooms, bye");
    Ok(())
}
