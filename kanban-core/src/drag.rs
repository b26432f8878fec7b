/// Drag interpreter: turns pointer-drag events into board intents.
///
/// Raw events carry an element id and a free-form JSON payload. They are
/// validated once into [`DragPayload`] / [`DropTarget`]; everything after
/// that works on the tagged types and the current board snapshot.
///
/// State machine: Idle -> Dragging (drag start) -> Idle (drag end or cancel,
/// whatever the outcome).
use std::sync::Arc;

use serde_json::Value;

use crate::board::{BoardError, BoardStore};
use crate::reorder::{insert_at, move_item, position, remove_id};
use crate::types::Board;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DragError {
    #[error("Dragged element has no id")]
    EmptyId,

    #[error("Drag payload for '{0}' has no type")]
    MissingKind(String),

    #[error("Unknown drag type '{kind}' for '{id}'")]
    UnknownKind { id: String, kind: String },
}

/// The entity being dragged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DragPayload {
    Column {
        column_id: String,
    },
    Task {
        task_id: String,
        /// Column the task was rendered in when the drag started.
        column_id: Option<String>,
    },
}

impl DragPayload {
    /// Validate the dragged element's id and payload.
    ///
    /// The kind is read from `type` (or `kind`); a task's source column from
    /// `columnId` (or `sourceId`).
    pub fn parse(element_id: &str, data: &Value) -> Result<Self, DragError> {
        if element_id.is_empty() {
            return Err(DragError::EmptyId);
        }
        let kind = payload_kind(data).ok_or_else(|| DragError::MissingKind(element_id.to_string()))?;
        match kind {
            "column" => Ok(DragPayload::Column {
                column_id: element_id.to_string(),
            }),
            "task" => Ok(DragPayload::Task {
                task_id: element_id.to_string(),
                column_id: payload_column(data),
            }),
            other => Err(DragError::UnknownKind {
                id: element_id.to_string(),
                kind: other.to_string(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            DragPayload::Column { column_id } => column_id,
            DragPayload::Task { task_id, .. } => task_id,
        }
    }
}

/// The element under the pointer when the drag ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropTarget {
    Column {
        column_id: String,
    },
    Task {
        task_id: String,
        column_id: Option<String>,
    },
}

impl DropTarget {
    /// Targets without a task kind are column targets keyed by their id.
    pub fn parse(element_id: &str, data: Option<&Value>) -> Self {
        match data.and_then(payload_kind) {
            Some("task") => DropTarget::Task {
                task_id: element_id.to_string(),
                column_id: data.and_then(payload_column),
            },
            _ => DropTarget::Column {
                column_id: element_id.to_string(),
            },
        }
    }

    pub fn id(&self) -> &str {
        match self {
            DropTarget::Column { column_id } => column_id,
            DropTarget::Task { task_id, .. } => task_id,
        }
    }
}

fn payload_kind(data: &Value) -> Option<&str> {
    data.get("type")
        .or_else(|| data.get("kind"))
        .and_then(Value::as_str)
}

fn payload_column(data: &Value) -> Option<String> {
    data.get("columnId")
        .or_else(|| data.get("sourceId"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// High-level board mutation produced by a completed drag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DragIntent {
    ReorderColumns { new_order: Vec<String> },
    MoveTask(TaskMove),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskMove {
    WithinColumn {
        column_id: String,
        task_id: String,
        new_order: Vec<String>,
    },
    AcrossColumns {
        from_column_id: String,
        to_column_id: String,
        task_id: String,
        new_from_order: Vec<String>,
        new_to_order: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DragState {
    #[default]
    Idle,
    Dragging(DragPayload),
}

#[derive(Debug, Default)]
pub struct DragInterpreter {
    state: DragState,
}

impl DragInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &DragState {
        &self.state
    }

    pub fn is_dragging(&self) -> bool {
        matches!(self.state, DragState::Dragging(_))
    }

    /// Record the dragged entity. An invalid payload leaves the interpreter idle.
    pub fn drag_start(&mut self, element_id: &str, data: &Value) -> Result<(), DragError> {
        match DragPayload::parse(element_id, data) {
            Ok(payload) => {
                log::debug!("[drag] Start {:?}", payload);
                self.state = DragState::Dragging(payload);
                Ok(())
            }
            Err(e) => {
                self.state = DragState::Idle;
                Err(e)
            }
        }
    }

    pub fn drag_cancel(&mut self) {
        self.state = DragState::Idle;
    }

    /// Finish the drag against `board`. Always returns to Idle.
    pub fn drag_end(&mut self, target: Option<&DropTarget>, board: &Board) -> Option<DragIntent> {
        match std::mem::take(&mut self.state) {
            DragState::Idle => None,
            DragState::Dragging(payload) => interpret(&payload, target, board),
        }
    }
}

/// Compute the intent for dropping `payload` on `target`. `None` is a no-op.
pub fn interpret(payload: &DragPayload, target: Option<&DropTarget>, board: &Board) -> Option<DragIntent> {
    let target = target?;
    if target.id() == payload.id() {
        return None;
    }
    match payload {
        DragPayload::Column { column_id } => interpret_column(column_id, target, board),
        DragPayload::Task { task_id, column_id } => {
            interpret_task(task_id, column_id.as_deref(), target, board)
        }
    }
}

fn interpret_column(column_id: &str, target: &DropTarget, board: &Board) -> Option<DragIntent> {
    let target_column = match target {
        DropTarget::Column { column_id } => Some(column_id.as_str()),
        DropTarget::Task { task_id, column_id } => column_id
            .as_deref()
            .or_else(|| board.find_task_column(task_id)),
    }?;

    let old_index = position(&board.column_order, column_id);
    let new_index = position(&board.column_order, target_column);
    let (Some(old_index), Some(new_index)) = (old_index, new_index) else {
        log::debug!(
            "[drag] Column {} or target {} not in columnOrder, ignoring",
            column_id,
            target_column
        );
        return None;
    };

    let new_order = move_item(board.column_order.clone(), old_index, new_index);
    if new_order == board.column_order {
        return None;
    }
    Some(DragIntent::ReorderColumns { new_order })
}

fn interpret_task(
    task_id: &str,
    carried_column: Option<&str>,
    target: &DropTarget,
    board: &Board,
) -> Option<DragIntent> {
    let holds_task = |column_id: &str| board.task_ids(column_id).iter().any(|id| id == task_id);

    let source = carried_column
        .filter(|c| holds_task(c))
        .or_else(|| board.find_task_column(task_id));
    let Some(source) = source else {
        log::debug!("[drag] Task {} is in no column, ignoring", task_id);
        return None;
    };
    let source_ids = board.task_ids(source).to_vec();
    let source_index = position(&source_ids, task_id)?;

    let (destination, index) = match target {
        DropTarget::Column { column_id } => {
            if !board.columns.contains_key(column_id) {
                log::debug!("[drag] Unknown destination column {}", column_id);
                return None;
            }
            (column_id.as_str(), None)
        }
        DropTarget::Task {
            task_id: over_id,
            column_id,
        } => {
            let owner = column_id
                .as_deref()
                .filter(|c| board.task_ids(c).iter().any(|id| id == over_id))
                .or_else(|| board.find_task_column(over_id))
                .or_else(|| column_id.as_deref().filter(|c| board.columns.contains_key(*c)));
            let Some(owner) = owner else {
                log::debug!("[drag] Could not determine column for target task {}", over_id);
                return None;
            };
            (owner, position(board.task_ids(owner), over_id))
        }
    };

    if destination == source {
        let index = index.unwrap_or(source_ids.len());
        let new_order = move_item(source_ids.clone(), source_index, index);
        if new_order == source_ids {
            return None;
        }
        return Some(DragIntent::MoveTask(TaskMove::WithinColumn {
            column_id: source.to_string(),
            task_id: task_id.to_string(),
            new_order,
        }));
    }

    let destination_ids = board.task_ids(destination).to_vec();
    let index = index.unwrap_or(destination_ids.len());
    Some(DragIntent::MoveTask(TaskMove::AcrossColumns {
        from_column_id: source.to_string(),
        to_column_id: destination.to_string(),
        task_id: task_id.to_string(),
        new_from_order: remove_id(source_ids, task_id),
        new_to_order: insert_at(destination_ids, task_id, index),
    }))
}

/// Drives a [`DragInterpreter`] against a live [`BoardStore`].
pub struct DragController {
    store: Arc<BoardStore>,
    interpreter: DragInterpreter,
}

impl DragController {
    pub fn new(store: Arc<BoardStore>) -> Self {
        Self {
            store,
            interpreter: DragInterpreter::new(),
        }
    }

    pub fn state(&self) -> &DragState {
        self.interpreter.state()
    }

    pub fn drag_start(&mut self, element_id: &str, data: &Value) -> Result<(), DragError> {
        self.interpreter.drag_start(element_id, data)
    }

    pub fn drag_cancel(&mut self) {
        self.interpreter.drag_cancel();
    }

    /// Interpret the drop against the current snapshot and apply the intent.
    /// Returns the applied intent, or `None` when the drop was a no-op or the
    /// board is not loaded.
    pub async fn drag_end(&mut self, target: Option<&DropTarget>) -> Result<Option<DragIntent>, BoardError> {
        let Some(board) = self.store.board() else {
            self.interpreter.drag_cancel();
            return Ok(None);
        };
        let Some(intent) = self.interpreter.drag_end(target, &board) else {
            return Ok(None);
        };
        self.store.apply_intent(intent.clone()).await?;
        Ok(Some(intent))
    }
}
