/// Board store: the canonical client-side view of the board.
///
/// The store is a pure cache. It publishes whatever the last remote
/// delivery contained and forwards every mutation to the sync adapter;
/// nothing is applied locally before the round trip completes.
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::adapter::{BoardSubscription, ReconcileReport, RemoteSyncAdapter, SyncError};
use crate::drag::{DragIntent, TaskMove};
use crate::remote::RemoteError;
use crate::types::{Board, NewTask, TaskPatch};

#[derive(Debug, Clone, PartialEq)]
pub enum BoardState {
    Loading,
    Ready(Board),
    Failed(String),
}

impl BoardState {
    pub fn board(&self) -> Option<&Board> {
        match self {
            BoardState::Ready(board) => Some(board),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, BoardState::Loading)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("Title must not be empty")]
    InvalidTitle,

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Failed to {operation}: {source}")]
    BoardWriteFailed {
        operation: &'static str,
        source: RemoteError,
    },

    #[error("Failed to load board: {0}")]
    LoadFailed(String),

    #[error("Board store is closed")]
    Closed,
}

impl BoardError {
    fn from_sync(operation: &'static str, err: SyncError) -> Self {
        match err {
            SyncError::ColumnNotFound(id) => BoardError::ColumnNotFound(id),
            SyncError::TaskNotFound(id) => BoardError::TaskNotFound(id),
            SyncError::Remote(source) => BoardError::BoardWriteFailed { operation, source },
        }
    }
}

pub struct BoardStore {
    adapter: RemoteSyncAdapter,
    state: watch::Receiver<BoardState>,
    last_error: Arc<Mutex<Option<String>>>,
    feed: Option<JoinHandle<()>>,
}

impl BoardStore {
    /// Subscribe to the board and start publishing snapshots.
    /// A failed subscription leaves the store in `Failed`.
    pub async fn open(adapter: RemoteSyncAdapter) -> Self {
        let (tx, rx) = watch::channel(BoardState::Loading);
        let last_error = Arc::new(Mutex::new(None));

        let feed = match adapter.subscribe_board().await {
            Ok(subscription) => Some(tokio::spawn(feed_board(
                subscription,
                tx,
                last_error.clone(),
            ))),
            Err(e) => {
                log::error!("[board_store] Failed to subscribe to board: {}", e);
                set_error(&last_error, format!("Failed to load board: {}", e));
                tx.send_replace(BoardState::Failed(e.to_string()));
                None
            }
        };

        Self {
            adapter,
            state: rx,
            last_error,
            feed,
        }
    }

    pub fn adapter(&self) -> &RemoteSyncAdapter {
        &self.adapter
    }

    pub fn state(&self) -> BoardState {
        self.state.borrow().clone()
    }

    /// Current snapshot, if loaded.
    pub fn board(&self) -> Option<Board> {
        self.state.borrow().board().cloned()
    }

    pub fn watch(&self) -> watch::Receiver<BoardState> {
        self.state.clone()
    }

    /// Wait for the first load to finish.
    pub async fn loaded(&self) -> Result<Board, BoardError> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|s| !s.is_loading())
            .await
            .map_err(|_| BoardError::Closed)?;
        match &*state {
            BoardState::Ready(board) => Ok(board.clone()),
            BoardState::Failed(message) => Err(BoardError::LoadFailed(message.clone())),
            BoardState::Loading => Err(BoardError::Closed),
        }
    }

    /// Inline message for the most recent failure.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    pub fn clear_error(&self) {
        if let Ok(mut e) = self.last_error.lock() {
            *e = None;
        }
    }

    // ── Columns ─────────────────────────────────────────────────────────

    pub async fn add_column(&self, title: &str) -> Result<String, BoardError> {
        let title = self.checked_title(title)?;
        let result = self.adapter.add_column(&title).await;
        self.settle("add column", result)
    }

    pub async fn rename_column(&self, column_id: &str, title: &str) -> Result<(), BoardError> {
        let title = self.checked_title(title)?;
        let result = self.adapter.rename_column(column_id, &title).await;
        self.settle("rename column", result)
    }

    /// Delete a column and every task it holds.
    pub async fn delete_column(&self, column_id: &str) -> Result<(), BoardError> {
        let result = self.adapter.delete_column(column_id).await;
        self.settle("delete column", result)
    }

    pub async fn reorder_columns(&self, new_order: Vec<String>) -> Result<(), BoardError> {
        let result = self.adapter.set_column_order(new_order).await;
        self.settle("reorder columns", result)
    }

    // ── Tasks ───────────────────────────────────────────────────────────

    pub async fn add_task(
        &self,
        column_id: &str,
        mut new_task: NewTask,
        acting_user: Option<&str>,
    ) -> Result<String, BoardError> {
        new_task.title = self.checked_title(&new_task.title)?;
        let result = self.adapter.add_task(column_id, new_task, acting_user).await;
        self.settle("add task", result)
    }

    pub async fn update_task(
        &self,
        task_id: &str,
        mut patch: TaskPatch,
        acting_user: Option<&str>,
    ) -> Result<(), BoardError> {
        if let Some(title) = patch.title.take() {
            patch.title = Some(self.checked_title(&title)?);
        }
        let result = self.adapter.update_task(task_id, patch, acting_user).await;
        self.settle("update task", result)
    }

    pub async fn delete_task(&self, task_id: &str, column_id: &str) -> Result<(), BoardError> {
        let result = self.adapter.delete_task(task_id, column_id).await;
        self.settle("delete task", result)
    }

    pub async fn reorder_tasks_within_column(
        &self,
        column_id: &str,
        new_task_order: Vec<String>,
    ) -> Result<(), BoardError> {
        let result = self.adapter.set_task_order(column_id, new_task_order).await;
        self.settle("reorder tasks", result)
    }

    pub async fn move_task_across_columns(
        &self,
        from_column_id: &str,
        to_column_id: &str,
        task_id: &str,
        new_from_order: Vec<String>,
        new_to_order: Vec<String>,
    ) -> Result<(), BoardError> {
        let result = self
            .adapter
            .move_task(from_column_id, to_column_id, task_id, new_from_order, new_to_order)
            .await;
        self.settle("move task", result)
    }

    pub async fn apply_intent(&self, intent: DragIntent) -> Result<(), BoardError> {
        match intent {
            DragIntent::ReorderColumns { new_order } => self.reorder_columns(new_order).await,
            DragIntent::MoveTask(TaskMove::WithinColumn {
                column_id,
                new_order,
                ..
            }) => self.reorder_tasks_within_column(&column_id, new_order).await,
            DragIntent::MoveTask(TaskMove::AcrossColumns {
                from_column_id,
                to_column_id,
                task_id,
                new_from_order,
                new_to_order,
            }) => {
                self.move_task_across_columns(
                    &from_column_id,
                    &to_column_id,
                    &task_id,
                    new_from_order,
                    new_to_order,
                )
                .await
            }
        }
    }

    /// Explicit repair pass; see [`RemoteSyncAdapter::reconcile`].
    pub async fn reconcile(&self) -> Result<ReconcileReport, BoardError> {
        let result = self.adapter.reconcile().await;
        self.settle("repair board", result)
    }

    /// Stop the feed and release the remote subscription.
    pub fn close(mut self) {
        self.stop_feed();
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn checked_title(&self, title: &str) -> Result<String, BoardError> {
        let trimmed = title.trim();
        if trimmed.is_empty() {
            let err = BoardError::InvalidTitle;
            set_error(&self.last_error, err.to_string());
            return Err(err);
        }
        Ok(trimmed.to_string())
    }

    fn settle<T>(&self, operation: &'static str, result: Result<T, SyncError>) -> Result<T, BoardError> {
        result.map_err(|e| {
            let err = BoardError::from_sync(operation, e);
            log::warn!("[board_store] {}", err);
            set_error(&self.last_error, err.to_string());
            err
        })
    }

    fn stop_feed(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.abort();
            log::debug!("[board_store] Board feed stopped");
        }
    }
}

impl Drop for BoardStore {
    fn drop(&mut self) {
        self.stop_feed();
    }
}

const CONNECTION_LOST: &str = "Connection to the board was lost";

fn set_error(slot: &Mutex<Option<String>>, message: String) {
    if let Ok(mut e) = slot.lock() {
        *e = Some(message);
    }
}

async fn feed_board(
    mut subscription: BoardSubscription,
    tx: watch::Sender<BoardState>,
    last_error: Arc<Mutex<Option<String>>>,
) {
    while let Some(next) = subscription.next().await {
        match next {
            Ok(board) => {
                tx.send_replace(BoardState::Ready(board));
            }
            Err(e) => {
                log::warn!("[board_store] Board update failed: {}", e);
                set_error(&last_error, format!("Failed to load board: {}", e));
                let loading = tx.borrow().is_loading();
                if loading {
                    tx.send_replace(BoardState::Failed(e.to_string()));
                }
            }
        }
    }
    // Only reached when the remote side ended the subscription; close()
    // and drop abort this task instead.
    log::warn!("[board_store] Board subscription ended, connection lost");
    set_error(&last_error, CONNECTION_LOST.to_string());
    tx.send_replace(BoardState::Failed(CONNECTION_LOST.to_string()));
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::drag::{DragController, DropTarget};
    use crate::remote::memory::MemoryStore;
    use crate::remote::{SharedStore, StorePath};
    use crate::testing::{wait_for_board, FlakyStore};

    #[tokio::test]
    async fn test_lost_connection_fails_the_store() {
        let store = two_columns();
        let connection = Arc::new(store.connect());
        let shared: SharedStore = connection.clone();
        let board_store = BoardStore::open(RemoteSyncAdapter::new(shared)).await;
        board_store.loaded().await.unwrap();
        assert_eq!(board_store.last_error(), None);

        connection.disconnect();
        let mut state = board_store.watch();
        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            state.wait_for(|s| matches!(s, BoardState::Failed(_))),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(board_store.board().is_none());
        assert_eq!(
            board_store.last_error().as_deref(),
            Some("Connection to the board was lost")
        );
    }

    fn two_columns() -> MemoryStore {
        MemoryStore::with_root(json!({
            "board": {
                "columns": {
                    "A": { "id": "A", "title": "A", "taskIds": ["t1", "t2"] },
                    "B": { "id": "B", "title": "B" },
                },
                "tasks": {
                    "t1": { "id": "t1", "title": "One" },
                    "t2": { "id": "t2", "title": "Two" },
                },
                "columnOrder": ["A", "B"],
            }
        }))
    }

    async fn open_on(store: &MemoryStore) -> BoardStore {
        let shared: SharedStore = Arc::new(store.connect());
        BoardStore::open(RemoteSyncAdapter::new(shared)).await
    }

    async fn open_flaky(store: &MemoryStore) -> (BoardStore, Arc<FlakyStore>) {
        let flaky = Arc::new(FlakyStore::new(store.connect()));
        let shared: SharedStore = flaky.clone();
        (BoardStore::open(RemoteSyncAdapter::new(shared)).await, flaky)
    }

    #[tokio::test]
    async fn test_empty_store_loads_default_board() {
        let store = MemoryStore::new();
        let board_store = open_on(&store).await;
        let board = board_store.loaded().await.unwrap();
        let titles: Vec<&str> = board.ordered_columns().iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["To Do", "In Progress", "Done"]);
    }

    #[tokio::test]
    async fn test_add_column_and_task_round_trip() {
        let store = MemoryStore::new();
        let board_store = open_on(&store).await;
        board_store.loaded().await.unwrap();

        let column_id = board_store.add_column("  Review  ").await.unwrap();
        let task_id = board_store
            .add_task(&column_id, NewTask::titled("Check PR"), Some("u1"))
            .await
            .unwrap();

        let board = wait_for_board(&board_store, |b| b.tasks.contains_key(&task_id)).await;
        assert_eq!(board.columns[&column_id].title, "Review");
        assert_eq!(board.column_order.last(), Some(&column_id));
        assert_eq!(board.task_ids(&column_id), [task_id.clone()]);
        assert_eq!(board.tasks[&task_id].created_by.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_blank_title_rejected_before_write() {
        let store = two_columns();
        let (board_store, flaky) = open_flaky(&store).await;
        board_store.loaded().await.unwrap();

        assert!(matches!(board_store.add_column("   ").await, Err(BoardError::InvalidTitle)));
        assert!(matches!(
            board_store.add_task("A", NewTask::titled(""), None).await,
            Err(BoardError::InvalidTitle)
        ));
        let patch = TaskPatch {
            title: Some(" ".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            board_store.update_task("t1", patch, None).await,
            Err(BoardError::InvalidTitle)
        ));
        assert_eq!(flaky.write_count(), 0);
        assert_eq!(board_store.last_error().as_deref(), Some("Title must not be empty"));
    }

    #[tokio::test]
    async fn test_write_failure_leaves_state_and_sets_error() {
        let store = two_columns();
        let (board_store, flaky) = open_flaky(&store).await;
        let before = board_store.loaded().await.unwrap();

        flaky.fail_writes(true);
        let err = board_store.add_column("New").await.unwrap_err();
        match &err {
            BoardError::BoardWriteFailed { operation, source } => {
                assert_eq!(*operation, "add column");
                assert!(source.is_transient());
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(board_store.board(), Some(before));
        let message = board_store.last_error().unwrap();
        assert!(message.starts_with("Failed to add column"));

        board_store.clear_error();
        assert_eq!(board_store.last_error(), None);
    }

    #[tokio::test]
    async fn test_missing_entities_are_reported() {
        let store = two_columns();
        let board_store = open_on(&store).await;
        board_store.loaded().await.unwrap();

        assert!(matches!(
            board_store.rename_column("ghost", "X").await,
            Err(BoardError::ColumnNotFound(_))
        ));
        assert!(matches!(
            board_store.add_task("ghost", NewTask::titled("X"), None).await,
            Err(BoardError::ColumnNotFound(_))
        ));
        assert!(matches!(
            board_store.update_task("ghost", TaskPatch::default(), None).await,
            Err(BoardError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_move_task_scenario() {
        let store = two_columns();
        let board_store = open_on(&store).await;
        board_store.loaded().await.unwrap();

        board_store
            .move_task_across_columns("A", "B", "t1", vec!["t2".to_string()], vec!["t1".to_string()])
            .await
            .unwrap();
        let board = wait_for_board(&board_store, |b| !b.task_ids("B").is_empty()).await;
        assert_eq!(board.task_ids("A"), ["t2".to_string()]);
        assert_eq!(board.task_ids("B"), ["t1".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_column_scenario() {
        let store = two_columns();
        let board_store = open_on(&store).await;
        board_store.loaded().await.unwrap();

        board_store.delete_column("A").await.unwrap();
        let board = wait_for_board(&board_store, |b| !b.columns.contains_key("A")).await;
        assert!(!board.tasks.contains_key("t1"));
        assert!(!board.tasks.contains_key("t2"));
        assert_eq!(board.column_order, vec!["B"]);
    }

    #[tokio::test]
    async fn test_reorder_columns_scenario() {
        let store = MemoryStore::with_root(json!({
            "board": {
                "columns": {
                    "A": { "title": "A" },
                    "B": { "title": "B" },
                    "C": { "title": "C" },
                },
                "columnOrder": ["A", "B", "C"],
            }
        }));
        let board_store = Arc::new(open_on(&store).await);
        board_store.loaded().await.unwrap();

        let mut controller = DragController::new(board_store.clone());
        controller.drag_start("A", &json!({ "type": "column" })).unwrap();
        let intent = controller
            .drag_end(Some(&DropTarget::parse("C", Some(&json!({ "type": "column" })))))
            .await
            .unwrap();
        assert!(intent.is_some());

        let board = wait_for_board(&board_store, |b| b.column_order[0] == "B").await;
        assert_eq!(board.column_order, vec!["B", "C", "A"]);
    }

    #[tokio::test]
    async fn test_drag_without_target_makes_no_call() {
        let store = two_columns();
        let (board_store, flaky) = open_flaky(&store).await;
        board_store.loaded().await.unwrap();

        let mut controller = DragController::new(Arc::new(board_store));
        controller
            .drag_start("t1", &json!({ "type": "task", "columnId": "A" }))
            .unwrap();
        assert_eq!(controller.drag_end(None).await.unwrap(), None);
        assert_eq!(flaky.write_count(), 0);
    }

    #[tokio::test]
    async fn test_drag_task_within_column() {
        let store = two_columns();
        let board_store = Arc::new(open_on(&store).await);
        board_store.loaded().await.unwrap();

        let mut controller = DragController::new(board_store.clone());
        controller
            .drag_start("t2", &json!({ "type": "task", "columnId": "A" }))
            .unwrap();
        let target = DropTarget::parse("t1", Some(&json!({ "type": "task", "columnId": "A" })));
        controller.drag_end(Some(&target)).await.unwrap();

        let board = wait_for_board(&board_store, |b| b.task_ids("A").first().map(String::as_str) == Some("t2")).await;
        assert_eq!(board.task_ids("A"), ["t2".to_string(), "t1".to_string()]);
    }

    #[tokio::test]
    async fn test_remote_changes_from_other_clients_are_published() {
        let store = two_columns();
        let board_store = open_on(&store).await;
        board_store.loaded().await.unwrap();

        let other = RemoteSyncAdapter::new(Arc::new(store.connect()));
        other.rename_column("B", "Blocked").await.unwrap();

        let board = wait_for_board(&board_store, |b| b.columns["B"].title == "Blocked").await;
        assert_eq!(board.ordered_columns().len(), 2);
    }

    #[tokio::test]
    async fn test_close_releases_subscription() {
        let store = two_columns();
        let board_store = open_on(&store).await;
        board_store.loaded().await.unwrap();
        assert_eq!(store.listener_count(), 1);

        board_store.close();
        // Aborted tasks drop their future on the next scheduler pass.
        for _ in 0..10 {
            if store.listener_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.listener_count(), 0);
        assert!(store.read(&StorePath::column_order()).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_subscription_reports_failed_state() {
        let store = MemoryStore::new();
        let connection = store.connect();
        connection.disconnect();
        let board_store = BoardStore::open(RemoteSyncAdapter::new(Arc::new(connection))).await;
        assert!(matches!(board_store.state(), BoardState::Failed(_)));
        assert!(matches!(board_store.loaded().await, Err(BoardError::LoadFailed(_))));
        assert!(board_store.last_error().is_some());
    }
}
