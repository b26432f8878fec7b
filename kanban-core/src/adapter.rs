/// Remote sync adapter: the only code that knows the persisted board layout.
///
/// Reads go through `normalize`, so callers always see a well-formed
/// [`Board`]. Writes are direct writes against the layout paths; ordered id
/// lists are always written wholesale. Where two paths must change together
/// (a new task and its column's order, a task leaving one column for
/// another) a single multi-path update is used.
use std::collections::HashSet;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::normalize::{board_from_value, coerce_id_list};
use crate::remote::{RemoteError, SharedStore, StorePath, Subscription};
use crate::reorder::remove_id;
use crate::types::{dedup_ids, Board, NewTask, Task, TaskPatch};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Remote(RemoteError::Serialization(e))
    }
}

/// Outcome of [`RemoteSyncAdapter::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Task records no column referenced; deleted.
    pub orphan_tasks_removed: Vec<String>,
    /// Ids stripped from `taskIds` lists because no task record exists.
    pub dangling_task_ids_removed: usize,
    /// Task ids listed by more than one column; later columns lost them.
    pub duplicate_task_refs_removed: usize,
    /// Columns that had a record but were missing from `columnOrder`.
    pub columns_appended: Vec<String>,
    /// `columnOrder` entries without a column record.
    pub order_entries_dropped: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.orphan_tasks_removed.is_empty()
            && self.dangling_task_ids_removed == 0
            && self.duplicate_task_refs_removed == 0
            && self.columns_appended.is_empty()
            && self.order_entries_dropped.is_empty()
    }
}

/// Normalized board snapshots from a live subscription.
///
/// When the store holds no board the default skeleton is written and the
/// subscription continues with the seeded value.
pub struct BoardSubscription {
    inner: Subscription,
    store: SharedStore,
}

impl BoardSubscription {
    /// Next snapshot. `None` once the underlying subscription has ended.
    pub async fn next(&mut self) -> Option<Result<Board, SyncError>> {
        loop {
            match self.inner.recv().await? {
                Some(value) => return Some(Ok(board_from_value(Some(&value)))),
                None => {
                    log::info!("[adapter] Remote store holds no board, seeding default columns");
                    if let Err(e) = seed_default_board(&self.store).await {
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}

async fn seed_default_board(store: &SharedStore) -> Result<(), SyncError> {
    let value = serde_json::to_value(Board::default_board())?;
    store.set(&StorePath::board(), value).await?;
    Ok(())
}

/// Mutation primitives and board subscription over a shared remote store.
#[derive(Clone)]
pub struct RemoteSyncAdapter {
    store: SharedStore,
}

impl RemoteSyncAdapter {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub async fn subscribe_board(&self) -> Result<BoardSubscription, SyncError> {
        let inner = self.store.subscribe(&StorePath::board()).await?;
        Ok(BoardSubscription {
            inner,
            store: self.store.clone(),
        })
    }

    /// One-shot read of the normalized board. Does not seed.
    pub async fn fetch_board(&self) -> Result<Board, SyncError> {
        let value = self.store.get(&StorePath::board()).await?;
        Ok(board_from_value(value.as_ref()))
    }

    // ── Columns ─────────────────────────────────────────────────────────

    /// Create a column and append it to `columnOrder`. Returns the new id.
    pub async fn add_column(&self, title: &str) -> Result<String, SyncError> {
        let column_id = format!("column-{}", Uuid::new_v4());
        let mut order = self.read_id_list(&StorePath::column_order()).await?;
        order.push(column_id.clone());

        let mut column = Map::new();
        column.insert("id".to_string(), Value::String(column_id.clone()));
        column.insert("title".to_string(), Value::String(title.to_string()));

        let mut fields = Map::new();
        fields.insert(format!("columns/{}", column_id), Value::Object(column));
        fields.insert("columnOrder".to_string(), ids_value(order));
        self.store.update(&StorePath::board(), fields).await?;

        log::info!("[adapter] Added column {}", column_id);
        Ok(column_id)
    }

    pub async fn rename_column(&self, column_id: &str, title: &str) -> Result<(), SyncError> {
        StorePath::check_segment(column_id)?;
        let path = StorePath::column(column_id);
        self.require(&path, || SyncError::ColumnNotFound(column_id.to_string()))
            .await?;
        let mut fields = Map::new();
        fields.insert("title".to_string(), Value::String(title.to_string()));
        self.store.update(&path, fields).await?;
        Ok(())
    }

    /// Delete the column, every task it lists, and its `columnOrder` entry.
    ///
    /// Safe to re-run after a partial failure: a missing column record still
    /// gets its order entry removed.
    pub async fn delete_column(&self, column_id: &str) -> Result<(), SyncError> {
        StorePath::check_segment(column_id)?;
        let column_path = StorePath::column(column_id);
        let task_ids = self.read_id_list(&column_path.child("taskIds")).await?;

        for task_id in &task_ids {
            self.store.remove(&StorePath::task(task_id)).await?;
        }
        self.store.remove(&column_path).await?;

        let order = self.read_id_list(&StorePath::column_order()).await?;
        self.store
            .set(&StorePath::column_order(), ids_value(remove_id(order, column_id)))
            .await?;

        log::info!(
            "[adapter] Deleted column {} with {} tasks",
            column_id,
            task_ids.len()
        );
        Ok(())
    }

    pub async fn set_column_order(&self, order: Vec<String>) -> Result<(), SyncError> {
        self.store
            .set(&StorePath::column_order(), ids_value(dedup_ids(order)))
            .await?;
        Ok(())
    }

    // ── Tasks ───────────────────────────────────────────────────────────

    /// Create a task at the end of `column_id`. Returns the new id.
    pub async fn add_task(
        &self,
        column_id: &str,
        new_task: NewTask,
        acting_user: Option<&str>,
    ) -> Result<String, SyncError> {
        StorePath::check_segment(column_id)?;
        let column_path = StorePath::column(column_id);
        let column = self
            .store
            .get(&column_path)
            .await?
            .ok_or_else(|| SyncError::ColumnNotFound(column_id.to_string()))?;

        let task_id = format!("task-{}", Uuid::new_v4());
        let now = Utc::now();
        let task = Task {
            id: task_id.clone(),
            title: new_task.title,
            description: new_task.description.filter(|d| !d.trim().is_empty()),
            created_at: now,
            updated_at: now,
            created_by: acting_user.map(str::to_string),
            last_modified_by: acting_user.map(str::to_string),
            due_date: new_task.due_date,
            priority: new_task.priority,
            labels: dedup_ids(new_task.labels),
        };

        let mut task_ids = dedup_ids(coerce_id_list(column.get("taskIds")));
        task_ids.push(task_id.clone());

        let mut fields = Map::new();
        fields.insert(format!("tasks/{}", task_id), serde_json::to_value(&task)?);
        fields.insert(format!("columns/{}/taskIds", column_id), ids_value(task_ids));
        self.store.update(&StorePath::board(), fields).await?;

        log::info!("[adapter] Added task {} to {}", task_id, column_id);
        Ok(task_id)
    }

    /// Apply a partial update and stamp `updatedAt` / `lastModifiedBy`.
    pub async fn update_task(
        &self,
        task_id: &str,
        patch: TaskPatch,
        acting_user: Option<&str>,
    ) -> Result<(), SyncError> {
        StorePath::check_segment(task_id)?;
        let path = StorePath::task(task_id);
        self.require(&path, || SyncError::TaskNotFound(task_id.to_string()))
            .await?;

        let mut fields = Map::new();
        if let Some(title) = patch.title {
            fields.insert("title".to_string(), Value::String(title));
        }
        if let Some(description) = patch.description {
            // Blank descriptions are removed rather than stored.
            let value = match description {
                Some(d) if !d.trim().is_empty() => Value::String(d),
                _ => Value::Null,
            };
            fields.insert("description".to_string(), value);
        }
        if let Some(due_date) = patch.due_date {
            fields.insert("dueDate".to_string(), serde_json::to_value(due_date)?);
        }
        if let Some(priority) = patch.priority {
            fields.insert("priority".to_string(), serde_json::to_value(priority)?);
        }
        if let Some(labels) = patch.labels {
            fields.insert("labels".to_string(), ids_value(dedup_ids(labels)));
        }
        fields.insert("updatedAt".to_string(), serde_json::to_value(Utc::now())?);
        if let Some(user) = acting_user {
            fields.insert("lastModifiedBy".to_string(), Value::String(user.to_string()));
        }

        self.store.update(&path, fields).await?;
        Ok(())
    }

    /// Delete the task record and drop it from `column_id`'s order.
    /// A missing column is tolerated.
    pub async fn delete_task(&self, task_id: &str, column_id: &str) -> Result<(), SyncError> {
        StorePath::check_segment(task_id)?;
        StorePath::check_segment(column_id)?;
        let task_ids = self
            .read_id_list(&StorePath::column(column_id).child("taskIds"))
            .await?;

        let mut fields = Map::new();
        fields.insert(format!("tasks/{}", task_id), Value::Null);
        fields.insert(
            format!("columns/{}/taskIds", column_id),
            ids_value(remove_id(task_ids, task_id)),
        );
        self.store.update(&StorePath::board(), fields).await?;

        log::info!("[adapter] Deleted task {} from {}", task_id, column_id);
        Ok(())
    }

    pub async fn set_task_order(&self, column_id: &str, task_ids: Vec<String>) -> Result<(), SyncError> {
        StorePath::check_segment(column_id)?;
        let column_path = StorePath::column(column_id);
        self.require(&column_path, || SyncError::ColumnNotFound(column_id.to_string()))
            .await?;
        self.store
            .set(&column_path.child("taskIds"), ids_value(dedup_ids(task_ids)))
            .await?;
        Ok(())
    }

    /// Write both columns' orders in one update.
    pub async fn move_task(
        &self,
        from_column_id: &str,
        to_column_id: &str,
        task_id: &str,
        from_order: Vec<String>,
        to_order: Vec<String>,
    ) -> Result<(), SyncError> {
        for id in [from_column_id, to_column_id, task_id] {
            StorePath::check_segment(id)?;
        }
        let columns = self.store.get(&StorePath::columns()).await?;
        for column_id in [from_column_id, to_column_id] {
            let exists = columns
                .as_ref()
                .and_then(|c| c.get(column_id))
                .is_some_and(Value::is_object);
            if !exists {
                return Err(SyncError::ColumnNotFound(column_id.to_string()));
            }
        }

        let from_order = remove_id(dedup_ids(from_order), task_id);
        let to_order = dedup_ids(to_order);

        let mut fields = Map::new();
        fields.insert(format!("{}/taskIds", from_column_id), ids_value(from_order));
        fields.insert(format!("{}/taskIds", to_column_id), ids_value(to_order));
        self.store.update(&StorePath::columns(), fields).await?;

        log::debug!(
            "[adapter] Moved task {} from {} to {}",
            task_id,
            from_column_id,
            to_column_id
        );
        Ok(())
    }

    // ── Repair ──────────────────────────────────────────────────────────

    /// Repair referential gaps left by interrupted multi-step writes.
    /// Writes nothing when the board is already consistent.
    pub async fn reconcile(&self) -> Result<ReconcileReport, SyncError> {
        let board = self.fetch_board().await?;
        let mut report = ReconcileReport::default();
        let mut fields = Map::new();

        // Walk ordered columns first so the first listing of a task wins.
        let mut column_ids: Vec<String> = board
            .column_order
            .iter()
            .filter(|id| board.columns.contains_key(*id))
            .cloned()
            .collect();
        for id in board.columns.keys() {
            if !column_ids.contains(id) {
                column_ids.push(id.clone());
            }
        }

        let mut referenced: HashSet<String> = HashSet::new();
        for column_id in &column_ids {
            let original = board.task_ids(column_id);
            let mut kept = Vec::with_capacity(original.len());
            for task_id in original {
                if !board.tasks.contains_key(task_id) {
                    report.dangling_task_ids_removed += 1;
                } else if !referenced.insert(task_id.clone()) {
                    report.duplicate_task_refs_removed += 1;
                } else {
                    kept.push(task_id.clone());
                }
            }
            if kept.len() != original.len() {
                fields.insert(format!("columns/{}/taskIds", column_id), ids_value(kept));
            }
        }

        for task_id in board.tasks.keys() {
            if !referenced.contains(task_id) {
                report.orphan_tasks_removed.push(task_id.clone());
                fields.insert(format!("tasks/{}", task_id), Value::Null);
            }
        }

        report.order_entries_dropped = board
            .column_order
            .iter()
            .filter(|id| !board.columns.contains_key(*id))
            .cloned()
            .collect();
        report.columns_appended = board
            .columns
            .keys()
            .filter(|id| !board.column_order.contains(*id))
            .cloned()
            .collect();
        if !report.order_entries_dropped.is_empty() || !report.columns_appended.is_empty() {
            fields.insert("columnOrder".to_string(), ids_value(column_ids));
        }

        if fields.is_empty() {
            log::debug!("[adapter] Reconcile found nothing to repair");
            return Ok(report);
        }
        self.store.update(&StorePath::board(), fields).await?;
        log::info!("[adapter] Reconcile repaired board: {:?}", report);
        Ok(report)
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    async fn read_id_list(&self, path: &StorePath) -> Result<Vec<String>, SyncError> {
        let value = self.store.get(path).await?;
        Ok(dedup_ids(coerce_id_list(value.as_ref())))
    }

    async fn require(
        &self,
        path: &StorePath,
        missing: impl FnOnce() -> SyncError,
    ) -> Result<(), SyncError> {
        match self.store.get(path).await? {
            Some(Value::Object(_)) => Ok(()),
            _ => Err(missing()),
        }
    }
}

/// Id lists are stored as arrays; an empty list becomes a delete.
fn ids_value(ids: Vec<String>) -> Value {
    if ids.is_empty() {
        Value::Null
    } else {
        Value::Array(ids.into_iter().map(Value::String).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::remote::memory::MemoryStore;
    use crate::types::Priority;

    fn adapter_on(store: &MemoryStore) -> RemoteSyncAdapter {
        RemoteSyncAdapter::new(Arc::new(store.connect()))
    }

    fn seeded() -> MemoryStore {
        MemoryStore::with_root(json!({
            "board": {
                "columns": {
                    "a": { "id": "a", "title": "A", "taskIds": ["t1", "t2"] },
                    "b": { "id": "b", "title": "B" },
                },
                "tasks": {
                    "t1": { "id": "t1", "title": "One", "createdAt": "2024-01-01T00:00:00Z" },
                    "t2": { "id": "t2", "title": "Two", "createdAt": "2024-01-01T00:00:00Z" },
                },
                "columnOrder": ["a", "b"],
            }
        }))
    }

    #[tokio::test]
    async fn test_subscribe_seeds_empty_store() {
        let store = MemoryStore::new();
        let adapter = adapter_on(&store);
        let mut sub = adapter.subscribe_board().await.unwrap();
        let board = sub.next().await.unwrap().unwrap();
        assert_eq!(board, Board::default_board());
        assert_eq!(
            store.read(&StorePath::column_order()).unwrap(),
            Some(json!(["column-1", "column-2", "column-3"]))
        );
    }

    #[tokio::test]
    async fn test_subscribe_yields_existing_board_without_seeding() {
        let store = seeded();
        let adapter = adapter_on(&store);
        let mut sub = adapter.subscribe_board().await.unwrap();
        let board = sub.next().await.unwrap().unwrap();
        assert_eq!(board.column_order, vec!["a", "b"]);
        assert!(board.task_ids("b").is_empty());
        assert!(!board.columns.contains_key("column-1"));
    }

    #[tokio::test]
    async fn test_add_column_appends_to_order() {
        let store = seeded();
        let adapter = adapter_on(&store);
        let id = adapter.add_column("Review").await.unwrap();
        assert!(id.starts_with("column-"));
        let board = adapter.fetch_board().await.unwrap();
        assert_eq!(board.column_order, vec!["a".to_string(), "b".to_string(), id.clone()]);
        assert_eq!(board.columns[&id].title, "Review");
        assert!(board.task_ids(&id).is_empty());
    }

    #[tokio::test]
    async fn test_add_task_to_missing_column_writes_nothing() {
        let store = seeded();
        let adapter = adapter_on(&store);
        let before = store.snapshot();
        let err = adapter
            .add_task("ghost", NewTask::titled("Lost"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ColumnNotFound(ref id) if id == "ghost"));
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_add_task_appends_and_stamps() {
        let store = seeded();
        let adapter = adapter_on(&store);
        let new_task = NewTask {
            title: "Three".to_string(),
            description: Some("  ".to_string()),
            priority: Some(Priority::High),
            labels: vec!["bug".to_string(), "bug".to_string()],
            ..Default::default()
        };
        let id = adapter.add_task("b", new_task, Some("u1")).await.unwrap();
        let board = adapter.fetch_board().await.unwrap();
        assert_eq!(board.task_ids("b"), [id.clone()]);
        let task = &board.tasks[&id];
        assert_eq!(task.created_by.as_deref(), Some("u1"));
        assert_eq!(task.last_modified_by.as_deref(), Some("u1"));
        assert_eq!(task.description, None);
        assert_eq!(task.priority, Some(Priority::High));
        assert_eq!(task.labels, vec!["bug"]);
    }

    #[tokio::test]
    async fn test_update_task_clears_blank_description() {
        let store = seeded();
        let adapter = adapter_on(&store);
        adapter
            .update_task(
                "t1",
                TaskPatch {
                    description: Some(Some("details".to_string())),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            store.read(&StorePath::task("t1").child("description")).unwrap(),
            Some(json!("details"))
        );

        adapter
            .update_task(
                "t1",
                TaskPatch {
                    title: Some("Renamed".to_string()),
                    description: Some(Some("   ".to_string())),
                    ..Default::default()
                },
                Some("u2"),
            )
            .await
            .unwrap();
        let task = adapter.fetch_board().await.unwrap().tasks["t1"].clone();
        assert_eq!(task.title, "Renamed");
        assert_eq!(task.description, None);
        assert_eq!(task.last_modified_by.as_deref(), Some("u2"));
        assert!(task.updated_at > task.created_at);
    }

    #[tokio::test]
    async fn test_update_missing_task_is_not_found() {
        let adapter = adapter_on(&seeded());
        let err = adapter
            .update_task("nope", TaskPatch::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_task_tolerates_missing_column() {
        let store = seeded();
        let adapter = adapter_on(&store);
        adapter.delete_task("t1", "ghost").await.unwrap();
        let board = adapter.fetch_board().await.unwrap();
        assert!(!board.tasks.contains_key("t1"));
        assert!(!board.columns.contains_key("ghost"));
        // Still listed in its real column until reconciled.
        assert_eq!(board.task_ids("a"), ["t1".to_string(), "t2".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_task_rejects_empty_id() {
        let store = seeded();
        let adapter = adapter_on(&store);
        let before = store.snapshot();
        let err = adapter.delete_task("", "a").await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(RemoteError::InvalidPath { .. })));
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_ids_with_slashes_cannot_reach_other_records() {
        let store = MemoryStore::with_root(json!({
            "board": {
                "columns": { "a": { "id": "a", "title": "A", "taskIds": ["t1"] } },
                "tasks": {
                    "t1": { "id": "t1", "title": "One", "description": "keep me" },
                },
                "columnOrder": ["a"],
            }
        }));
        let adapter = adapter_on(&store);
        let before = store.snapshot();

        assert!(adapter.delete_task("t1/description", "a").await.is_err());
        assert!(adapter.delete_task("t1", "a/taskIds").await.is_err());
        assert!(adapter.delete_column("a/taskIds").await.is_err());
        assert!(adapter
            .move_task("a", "a/x", "t1", vec![], vec!["t1".to_string()])
            .await
            .is_err());
        assert!(adapter
            .add_task("", NewTask::titled("Lost"), None)
            .await
            .is_err());
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_delete_column_cascades() {
        let store = seeded();
        let adapter = adapter_on(&store);
        adapter.delete_column("a").await.unwrap();
        let board = adapter.fetch_board().await.unwrap();
        assert!(board.tasks.is_empty());
        assert!(!board.columns.contains_key("a"));
        assert_eq!(board.column_order, vec!["b"]);
    }

    #[tokio::test]
    async fn test_delete_column_completes_half_finished_delete() {
        let store = seeded();
        store
            .write(&StorePath::column("a"), crate::remote::WriteOp::Remove)
            .unwrap();
        let adapter = adapter_on(&store);
        adapter.delete_column("a").await.unwrap();
        adapter.delete_column("a").await.unwrap();
        let board = adapter.fetch_board().await.unwrap();
        assert_eq!(board.column_order, vec!["b"]);
    }

    #[tokio::test]
    async fn test_move_task_writes_both_orders() {
        let store = seeded();
        let adapter = adapter_on(&store);
        adapter
            .move_task(
                "a",
                "b",
                "t1",
                vec!["t2".to_string()],
                vec!["t1".to_string()],
            )
            .await
            .unwrap();
        let board = adapter.fetch_board().await.unwrap();
        assert_eq!(board.task_ids("a"), ["t2".to_string()]);
        assert_eq!(board.task_ids("b"), ["t1".to_string()]);
    }

    #[tokio::test]
    async fn test_move_task_to_missing_column() {
        let adapter = adapter_on(&seeded());
        let err = adapter
            .move_task("a", "ghost", "t1", vec![], vec!["t1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ColumnNotFound(ref id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_reconcile_repairs_gaps() {
        let store = MemoryStore::with_root(json!({
            "board": {
                "columns": {
                    "a": { "title": "A", "taskIds": ["t1", "gone"] },
                    "b": { "title": "B", "taskIds": ["t1", "t2"] },
                    "c": { "title": "C" },
                },
                "tasks": {
                    "t1": { "title": "One" },
                    "t2": { "title": "Two" },
                    "orphan": { "title": "Nobody lists me" },
                },
                "columnOrder": ["a", "ghost", "b"],
            }
        }));
        let adapter = adapter_on(&store);
        let report = adapter.reconcile().await.unwrap();
        assert_eq!(report.orphan_tasks_removed, vec!["orphan"]);
        assert_eq!(report.dangling_task_ids_removed, 1);
        assert_eq!(report.duplicate_task_refs_removed, 1);
        assert_eq!(report.columns_appended, vec!["c"]);
        assert_eq!(report.order_entries_dropped, vec!["ghost"]);

        let board = adapter.fetch_board().await.unwrap();
        assert_eq!(board.column_order, vec!["a", "b", "c"]);
        assert_eq!(board.task_ids("a"), ["t1".to_string()]);
        assert_eq!(board.task_ids("b"), ["t2".to_string()]);
        assert!(!board.tasks.contains_key("orphan"));

        assert!(adapter.reconcile().await.unwrap().is_clean());
    }
}
