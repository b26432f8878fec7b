/// kanban-core: board model, replicated store abstraction and the client
/// services (board store, drag interpreter, presence, labels, users) that
/// run on top of it.
pub mod adapter;
pub mod auth;
pub mod board;
pub mod config;
pub mod drag;
pub mod events;
pub mod labels;
pub mod normalize;
pub mod presence;
pub mod remote;
pub mod reorder;
pub mod sync;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use adapter::{RemoteSyncAdapter, SyncError};
pub use board::{BoardError, BoardState, BoardStore};
pub use drag::{DragController, DragIntent, DropTarget};
pub use remote::{RemoteError, RemoteStore, SharedStore, StorePath};
pub use types::{
    Board, Column, Label, NewTask, Priority, Task, TaskPatch, UnknownPriority, UserPresence,
};
