/// Snapshot persistence for the in-memory tree.
///
/// The whole tree is written as one JSON document with an atomic write
/// (.tmp + fsync + rename). A background task saves periodically when the
/// tree changed and once more on shutdown.
use std::path::{Path, PathBuf};
use std::time::Duration;

use kanban_core::config::atomic_write;
use kanban_core::remote::memory::MemoryStore;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid snapshot JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Load a snapshot. A missing file is an empty tree.
pub fn load_snapshot(path: &Path) -> Result<Value, PersistError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Null),
        Err(e) => Err(e.into()),
    }
}

/// Flip every restored presence record to offline. No connection from a
/// previous run survives a restart, so nothing else would ever clear them.
/// Returns the number of records changed.
pub fn mark_presence_offline(root: &mut Value) -> usize {
    let Some(presence) = root.get_mut("presence").and_then(Value::as_object_mut) else {
        return 0;
    };
    let mut changed = 0;
    for record in presence.values_mut().filter_map(Value::as_object_mut) {
        if record.get("online") == Some(&Value::Bool(true)) {
            record.insert("online".to_string(), Value::Bool(false));
            changed += 1;
        }
    }
    changed
}

/// Write the current tree. Refuses to replace a non-empty snapshot with an
/// empty tree; returns whether a write happened.
pub fn save_snapshot(store: &MemoryStore, path: &Path) -> Result<bool, PersistError> {
    let tree = store.snapshot();
    if tree.is_null() && !load_snapshot(path).map(|v| v.is_null()).unwrap_or(true) {
        log::warn!(
            "[persist] Tree is empty, keeping existing snapshot at {}",
            path.display()
        );
        return Ok(false);
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    atomic_write(path, &serde_json::to_string(&tree)?)?;
    Ok(true)
}

/// Save every `interval` when the tree changed, and once more when
/// `shutdown` flips to true.
pub fn spawn_snapshot_task(
    store: MemoryStore,
    path: PathBuf,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut last_saved = store.snapshot();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let current = store.snapshot();
                    if current == last_saved {
                        continue;
                    }
                    match save_snapshot(&store, &path) {
                        Ok(_) => {
                            log::debug!("[persist] Snapshot saved to {}", path.display());
                            last_saved = current;
                        }
                        Err(e) => log::error!("[persist] Failed to save snapshot: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    // Run every open connection's deferred writes first so
                    // presence is saved as offline.
                    let deferred = store.disconnect_all();
                    log::info!("[persist] Closed open connections, ran {} deferred writes", deferred);
                    if let Err(e) = save_snapshot(&store, &path) {
                        log::error!("[persist] Final snapshot failed: {}", e);
                    }
                    log::info!("[persist] Final snapshot written, shutting down");
                    break;
                }
            }
        }
    })
}
