pub mod memory;
pub mod path;
#[cfg(feature = "ws-client")]
pub mod ws;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

pub use path::StorePath;

/// Abstract replicated store the board, presence and label services run on.
/// Implementations: MemoryStore connections (in-process), WsRemoteStore (kanban-server).
///
/// Every write replaces what was there (last writer wins); there is no merge.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read the value at `path` once. `None` when nothing is stored there.
    async fn get(&self, path: &StorePath) -> Result<Option<Value>, RemoteError>;

    /// Continuous subscription. The current value is delivered first, then
    /// every distinct value written at, above or below `path`.
    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, RemoteError>;

    /// Replace the value at `path`. `Value::Null` deletes.
    async fn set(&self, path: &StorePath, value: Value) -> Result<(), RemoteError>;

    /// Write each field below `path`. Keys may be relative paths (`a/b`);
    /// null fields are deleted.
    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<(), RemoteError>;

    async fn remove(&self, path: &StorePath) -> Result<(), RemoteError>;

    /// Register a write the store performs once this client's connection is gone.
    async fn on_disconnect(&self, path: &StorePath, write: WriteOp) -> Result<(), RemoteError>;

    /// Drop every deferred write registered for `path`.
    async fn cancel_on_disconnect(&self, path: &StorePath) -> Result<(), RemoteError>;
}

pub type SharedStore = Arc<dyn RemoteStore>;

/// A single write against the tree, used for deferred writes and on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum WriteOp {
    Set { value: Value },
    Update { fields: Map<String, Value> },
    Remove,
}

/// Key of the server-value placeholder `{".sv": "timestamp"}`.
pub const SERVER_VALUE_KEY: &str = ".sv";

/// Placeholder resolved to the store's clock when the write is applied.
pub fn server_timestamp() -> Value {
    let mut placeholder = Map::new();
    placeholder.insert(SERVER_VALUE_KEY.to_string(), Value::String("timestamp".to_string()));
    Value::Object(placeholder)
}

/// Replace every server-value placeholder inside `value` with `now`.
pub fn resolve_server_values(value: &mut Value, now: &str) {
    match value {
        Value::Object(map) => {
            if map.len() == 1 && map.get(SERVER_VALUE_KEY).and_then(Value::as_str) == Some("timestamp") {
                *value = Value::String(now.to_string());
                return;
            }
            for child in map.values_mut() {
                resolve_server_values(child, now);
            }
        }
        Value::Array(items) => {
            for item in items {
                resolve_server_values(item, now);
            }
        }
        _ => {}
    }
}

/// Live feed of values at one path.
///
/// Dropping the subscription (or calling [`Subscription::cancel`]) deregisters
/// the listener in the store. `recv` returns `None` once the store side is gone.
pub struct Subscription {
    path: StorePath,
    rx: mpsc::UnboundedReceiver<Option<Value>>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        path: StorePath,
        rx: mpsc::UnboundedReceiver<Option<Value>>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            path,
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn path(&self) -> &StorePath {
        &self.path
    }

    /// Next value at the path. `Some(None)` means the path holds no data.
    pub async fn recv(&mut self) -> Option<Option<Value>> {
        self.rx.recv().await
    }

    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("path", &self.path.to_string())
            .finish_non_exhaustive()
    }
}

impl tokio_stream::Stream for Subscription {
    type Item = Option<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Connection to the remote store is closed")]
    Disconnected,

    #[error("Remote store rejected the request: {0}")]
    Rejected(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RemoteError {
    /// Network or write failures the user may simply retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Unavailable(_) | RemoteError::Disconnected | RemoteError::Rejected(_)
        )
    }
}
