/// In-process replicated store.
///
/// The whole tree lives behind one mutex. Writes are applied and fanned out
/// to listeners while the lock is held, so every listener observes writes in
/// the same order. Values follow the wire rules of the remote store:
/// - nulls are never stored (writing null deletes)
/// - empty objects and arrays are pruned, including parents left empty
/// - writing below an array turns it into an object keyed by index
///
/// Clients talk to the tree through a [`MemoryConnection`]. Deferred writes
/// registered with `on_disconnect` run when the connection is disconnected
/// or dropped, whichever comes first.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};

use super::{resolve_server_values, RemoteError, RemoteStore, StorePath, Subscription, WriteOp};
use crate::events::StoreEvent;

const EVENT_CAPACITY: usize = 256;

struct Listener {
    connection_id: Option<u64>,
    path: StorePath,
    tx: mpsc::UnboundedSender<Option<Value>>,
    /// Last value delivered, used to suppress duplicate deliveries.
    last: Option<Value>,
}

struct Deferred {
    path: StorePath,
    write: WriteOp,
}

#[derive(Default)]
struct Tree {
    root: Value,
    listeners: BTreeMap<u64, Listener>,
    next_listener: u64,
    deferred: HashMap<u64, Vec<Deferred>>,
    open_connections: HashSet<u64>,
}

impl Tree {
    fn read(&self, path: &StorePath) -> Option<Value> {
        value_at(&self.root, path.segments()).cloned()
    }

    fn apply(&mut self, path: &StorePath, write: WriteOp) -> Result<(), RemoteError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        match write {
            WriteOp::Set { mut value } => {
                resolve_server_values(&mut value, &now);
                write_at(&mut self.root, path.segments(), prune(value));
            }
            WriteOp::Update { fields } => {
                // Resolve every key first so a bad key leaves the tree untouched.
                let mut targets = Vec::with_capacity(fields.len());
                for (key, mut value) in fields {
                    let relative = StorePath::parse(&key)?;
                    if relative.is_root() {
                        return Err(RemoteError::InvalidPath {
                            path: path.to_string(),
                            reason: "update with an empty key".to_string(),
                        });
                    }
                    resolve_server_values(&mut value, &now);
                    targets.push((path.join(&relative), prune(value)));
                }
                for (target, value) in targets {
                    write_at(&mut self.root, target.segments(), value);
                }
            }
            WriteOp::Remove => write_at(&mut self.root, path.segments(), Value::Null),
        }
        if is_empty(&self.root) {
            self.root = Value::Null;
        }
        Ok(())
    }

    /// Push the current value to every listener whose view overlaps `path`.
    fn notify(&mut self, path: &StorePath) {
        let root = &self.root;
        let mut dead = Vec::new();
        for (id, listener) in self.listeners.iter_mut() {
            if !listener.path.overlaps(path) {
                continue;
            }
            let current = value_at(root, listener.path.segments()).cloned();
            if current == listener.last {
                continue;
            }
            if listener.tx.send(current.clone()).is_err() {
                dead.push(*id);
                continue;
            }
            listener.last = current;
        }
        for id in dead {
            self.listeners.remove(&id);
        }
    }
}

struct Shared {
    tree: Mutex<Tree>,
    events: broadcast::Sender<StoreEvent>,
    next_connection: AtomicU64,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, Tree>, RemoteError> {
        self.tree
            .lock()
            .map_err(|_| RemoteError::Unavailable("store lock poisoned".to_string()))
    }

    fn write(
        &self,
        connection_id: Option<u64>,
        path: &StorePath,
        write: WriteOp,
    ) -> Result<(), RemoteError> {
        path.validate()?;
        {
            let mut tree = self.lock()?;
            tree.apply(path, write)?;
            tree.notify(path);
        }
        log::trace!("[memory_store] write {} (connection={:?})", path, connection_id);
        let _ = self.events.send(StoreEvent::ValueChanged {
            path: path.to_string(),
            connection_id,
        });
        Ok(())
    }

    /// Close connection `id` if it is still open: drop its listeners and run
    /// its deferred writes. `None` when it was already closed.
    fn close_connection(&self, id: u64) -> Option<usize> {
        let mut executed = 0;
        {
            let mut tree = self.tree.lock().ok()?;
            if !tree.open_connections.remove(&id) {
                return None;
            }
            tree.listeners.retain(|_, l| l.connection_id != Some(id));
            let deferred = tree.deferred.remove(&id).unwrap_or_default();
            for Deferred { path, write } in deferred {
                match tree.apply(&path, write) {
                    Ok(()) => {
                        tree.notify(&path);
                        executed += 1;
                    }
                    Err(e) => {
                        log::warn!("[memory_store] Deferred write to {} failed: {}", path, e);
                    }
                }
            }
        }
        log::info!(
            "[memory_store] Connection {} closed, ran {} deferred writes",
            id,
            executed
        );
        let _ = self.events.send(StoreEvent::ConnectionClosed {
            connection_id: id,
            deferred_writes: executed,
        });
        Some(executed)
    }

    fn subscribe(
        self: &Arc<Self>,
        connection_id: Option<u64>,
        path: &StorePath,
    ) -> Result<Subscription, RemoteError> {
        path.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut tree = self.lock()?;
            let current = tree.read(path);
            // Initial delivery; the receiver is alive because we hold it.
            let _ = tx.send(current.clone());
            let id = tree.next_listener;
            tree.next_listener += 1;
            tree.listeners.insert(
                id,
                Listener {
                    connection_id,
                    path: path.clone(),
                    tx,
                    last: current,
                },
            );
            id
        };

        let weak = Arc::downgrade(self);
        Ok(Subscription::new(path.clone(), rx, move || {
            if let Some(shared) = weak.upgrade() {
                if let Ok(mut tree) = shared.tree.lock() {
                    tree.listeners.remove(&id);
                }
            }
        }))
    }
}

/// Shared in-memory tree. Cloning is cheap and yields a handle to the same tree.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_root(Value::Null)
    }

    /// Start from an existing tree (e.g. a snapshot loaded from disk).
    pub fn with_root(root: Value) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let tree = Tree {
            root: prune(root),
            ..Tree::default()
        };
        Self {
            shared: Arc::new(Shared {
                tree: Mutex::new(tree),
                events,
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Open a client connection with its own deferred-write queue.
    pub fn connect(&self) -> MemoryConnection {
        let id = self.shared.next_connection.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tree) = self.shared.tree.lock() {
            tree.open_connections.insert(id);
        }
        let _ = self
            .shared
            .events
            .send(StoreEvent::ConnectionOpened { connection_id: id });
        log::debug!("[memory_store] Connection {} opened", id);
        MemoryConnection {
            id,
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.shared.events.subscribe()
    }

    /// Read without a connection (REST access, snapshots).
    pub fn read(&self, path: &StorePath) -> Result<Option<Value>, RemoteError> {
        path.validate()?;
        Ok(self.shared.lock()?.read(path))
    }

    /// Write without a connection (REST access).
    pub fn write(&self, path: &StorePath, write: WriteOp) -> Result<(), RemoteError> {
        self.shared.write(None, path, write)
    }

    /// Subscribe without a connection; the listener lives until dropped.
    pub fn subscribe(&self, path: &StorePath) -> Result<Subscription, RemoteError> {
        self.shared.subscribe(None, path)
    }

    /// The whole tree, `Value::Null` when empty.
    pub fn snapshot(&self) -> Value {
        self.shared
            .tree
            .lock()
            .map(|tree| tree.root.clone())
            .unwrap_or(Value::Null)
    }

    /// Close every open connection as if its client had gone away, running
    /// all deferred writes. Returns the number of deferred writes executed.
    pub fn disconnect_all(&self) -> usize {
        let ids: Vec<u64> = self
            .shared
            .tree
            .lock()
            .map(|tree| tree.open_connections.iter().copied().collect())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.shared.close_connection(id))
            .sum()
    }

    pub fn listener_count(&self) -> usize {
        self.shared
            .tree
            .lock()
            .map(|tree| tree.listeners.len())
            .unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.shared
            .tree
            .lock()
            .map(|tree| tree.open_connections.len())
            .unwrap_or(0)
    }
}

/// One client's view of a [`MemoryStore`].
pub struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True once disconnected here or closed by [`MemoryStore::disconnect_all`].
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || self
                .shared
                .tree
                .lock()
                .map(|tree| !tree.open_connections.contains(&self.id))
                .unwrap_or(true)
    }

    /// End the connection: its subscriptions stop and its deferred writes run.
    /// Idempotent. Returns the number of deferred writes executed.
    pub fn disconnect(&self) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        self.shared.close_connection(self.id).unwrap_or(0)
    }

    fn ensure_open(&self) -> Result<(), RemoteError> {
        if self.is_closed() {
            Err(RemoteError::Disconnected)
        } else {
            Ok(())
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[async_trait]
impl RemoteStore for MemoryConnection {
    async fn get(&self, path: &StorePath) -> Result<Option<Value>, RemoteError> {
        self.ensure_open()?;
        path.validate()?;
        Ok(self.shared.lock()?.read(path))
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, RemoteError> {
        self.ensure_open()?;
        self.shared.subscribe(Some(self.id), path)
    }

    async fn set(&self, path: &StorePath, value: Value) -> Result<(), RemoteError> {
        self.ensure_open()?;
        self.shared.write(Some(self.id), path, WriteOp::Set { value })
    }

    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<(), RemoteError> {
        self.ensure_open()?;
        if fields.is_empty() {
            return Ok(());
        }
        self.shared.write(Some(self.id), path, WriteOp::Update { fields })
    }

    async fn remove(&self, path: &StorePath) -> Result<(), RemoteError> {
        self.ensure_open()?;
        self.shared.write(Some(self.id), path, WriteOp::Remove)
    }

    async fn on_disconnect(&self, path: &StorePath, write: WriteOp) -> Result<(), RemoteError> {
        self.ensure_open()?;
        path.validate()?;
        let mut tree = self.shared.lock()?;
        tree.deferred.entry(self.id).or_default().push(Deferred {
            path: path.clone(),
            write,
        });
        Ok(())
    }

    async fn cancel_on_disconnect(&self, path: &StorePath) -> Result<(), RemoteError> {
        self.ensure_open()?;
        let mut tree = self.shared.lock()?;
        if let Some(entries) = tree.deferred.get_mut(&self.id) {
            entries.retain(|d| &d.path != path);
        }
        Ok(())
    }
}

// ── Tree helpers ────────────────────────────────────────────────────────────

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Drop nulls and empty containers, recursively.
fn prune(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let map: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, prune(v)))
                .filter(|(_, v)| !v.is_null())
                .collect();
            if map.is_empty() {
                Value::Null
            } else {
                Value::Object(map)
            }
        }
        Value::Array(items) => {
            let items: Vec<Value> = items
                .into_iter()
                .map(prune)
                .filter(|v| !v.is_null())
                .collect();
            if items.is_empty() {
                Value::Null
            } else {
                Value::Array(items)
            }
        }
        other => other,
    }
}

fn value_at<'a>(node: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut current = node;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

fn write_at(node: &mut Value, segments: &[String], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    if value.is_null() && !(node.is_object() || node.is_array()) {
        return;
    }
    if node.is_array() {
        let items = match node.take() {
            Value::Array(items) => items,
            _ => Vec::new(),
        };
        *node = Value::Object(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
        );
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        if rest.is_empty() {
            if value.is_null() {
                map.remove(head);
            } else {
                map.insert(head.clone(), value);
            }
        } else {
            let child = map.entry(head.clone()).or_insert(Value::Null);
            write_at(child, rest, value);
            if is_empty(child) {
                map.remove(head);
            }
        }
    }
}
