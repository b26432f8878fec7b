/// Test doubles shared by the service tests.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::board::{BoardState, BoardStore};
use crate::remote::memory::MemoryConnection;
use crate::remote::{RemoteError, RemoteStore, StorePath, Subscription, WriteOp};
use crate::types::Board;

/// Wraps a memory connection, counting writes and optionally failing them.
pub struct FlakyStore {
    inner: MemoryConnection,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: MemoryConnection) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), RemoteError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("simulated outage".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FlakyStore {
    async fn get(&self, path: &StorePath) -> Result<Option<Value>, RemoteError> {
        self.inner.get(path).await
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, RemoteError> {
        self.inner.subscribe(path).await
    }

    async fn set(&self, path: &StorePath, value: Value) -> Result<(), RemoteError> {
        self.check()?;
        self.inner.set(path, value).await
    }

    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<(), RemoteError> {
        self.check()?;
        self.inner.update(path, fields).await
    }

    async fn remove(&self, path: &StorePath) -> Result<(), RemoteError> {
        self.check()?;
        self.inner.remove(path).await
    }

    async fn on_disconnect(&self, path: &StorePath, write: WriteOp) -> Result<(), RemoteError> {
        self.inner.on_disconnect(path, write).await
    }

    async fn cancel_on_disconnect(&self, path: &StorePath) -> Result<(), RemoteError> {
        self.inner.cancel_on_disconnect(path).await
    }
}

/// Wait until the store publishes a board matching `pred`.
pub async fn wait_for_board(store: &BoardStore, mut pred: impl FnMut(&Board) -> bool) -> Board {
    let mut rx = store.watch();
    let state = tokio::time::timeout(
        Duration::from_secs(2),
        rx.wait_for(|state| match state {
            BoardState::Ready(board) => pred(board),
            _ => false,
        }),
    )
    .await
    .expect("timed out waiting for board")
    .expect("board feed closed");
    state.board().cloned().expect("board is ready")
}
