/// kanban-server: hosts the replicated tree for kanban clients.
/// Config loading, snapshot restore, HTTP + WebSocket server, shutdown.
pub mod api;
pub mod config;
pub mod log_bridge;
pub mod persist;
pub mod server;
pub mod state;
pub mod sync_ws;

use kanban_core::remote::memory::MemoryStore;
use std::time::Duration;

use crate::state::AppState;

pub async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Err(e) = log_bridge::init() {
        log_bridge::write_fallback_line(&format!("failed to initialize server logger: {}", e));
    }

    let config_path = config::default_config_path();
    let config = config::load_config(&config_path);
    let snapshot_path = config.snapshot_path();

    let mut root = persist::load_snapshot(&snapshot_path)?;
    if root.is_null() {
        log::info!("No snapshot at {}, starting empty", snapshot_path.display());
    } else {
        let stale = persist::mark_presence_offline(&mut root);
        log::info!(
            "Restored tree from {} ({} stale presence records set offline)",
            snapshot_path.display(),
            stale
        );
    }
    let store = MemoryStore::with_root(root);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let snapshot_task = persist::spawn_snapshot_task(
        store.clone(),
        snapshot_path,
        Duration::from_secs(config.snapshot_interval_secs.max(1)),
        shutdown_rx,
    );

    let state = AppState::new(store, config);
    let (_port, server_task) = server::spawn_server(state).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown requested");
    server_task.abort();
    let _ = shutdown_tx.send(true);
    if let Err(e) = snapshot_task.await {
        log::error!("Snapshot task failed: {}", e);
    }
    Ok(())
}
