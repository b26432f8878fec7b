/// Shared application state passed to axum handlers.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kanban_core::remote::memory::MemoryStore;

use crate::config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub store: MemoryStore,
    pub config: Arc<ServerConfig>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(store: MemoryStore, config: ServerConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            started_at: Utc::now(),
        }
    }
}
