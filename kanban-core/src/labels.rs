/// Label catalogue under `labels/{id}`, referenced by id from `Task.labels`.
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::normalize::{board_from_value, labels_from_value};
use crate::remote::{RemoteError, SharedStore, StorePath, Subscription};
use crate::reorder::remove_id;
use crate::types::{Label, LabelPatch};

#[derive(Debug, thiserror::Error)]
pub enum LabelError {
    #[error("Label name must not be empty")]
    InvalidName,

    #[error("Invalid label color '{0}', expected #rgb or #rrggbb")]
    InvalidColor(String),

    #[error("Label not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// `#rgb` or `#rrggbb`, case-insensitive.
pub fn is_valid_color(color: &str) -> bool {
    let Some(hex) = color.strip_prefix('#') else {
        return false;
    };
    matches!(hex.len(), 3 | 6) && hex.chars().all(|c| c.is_ascii_hexdigit())
}

fn checked_name(name: &str) -> Result<String, LabelError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(LabelError::InvalidName);
    }
    Ok(name.to_string())
}

fn checked_color(color: &str) -> Result<String, LabelError> {
    let color = color.trim();
    if !is_valid_color(color) {
        return Err(LabelError::InvalidColor(color.to_string()));
    }
    Ok(color.to_ascii_lowercase())
}

/// Live label list; the feed stops when this is dropped.
pub struct LabelFeed {
    labels: watch::Receiver<Vec<Label>>,
    feed: JoinHandle<()>,
}

impl LabelFeed {
    pub fn labels(&self) -> Vec<Label> {
        self.labels.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<Label>> {
        self.labels.clone()
    }
}

impl Drop for LabelFeed {
    fn drop(&mut self) {
        self.feed.abort();
    }
}

async fn feed_labels(mut subscription: Subscription, tx: watch::Sender<Vec<Label>>) {
    while let Some(value) = subscription.recv().await {
        tx.send_replace(labels_from_value(value.as_ref()));
    }
}

#[derive(Clone)]
pub struct LabelService {
    store: SharedStore,
}

impl LabelService {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Labels sorted by name, kept current.
    pub async fn subscribe_labels(&self) -> Result<LabelFeed, LabelError> {
        let subscription = self.store.subscribe(&StorePath::labels()).await?;
        let (tx, rx) = watch::channel(Vec::new());
        Ok(LabelFeed {
            labels: rx,
            feed: tokio::spawn(feed_labels(subscription, tx)),
        })
    }

    pub async fn list_labels(&self) -> Result<Vec<Label>, LabelError> {
        let value = self.store.get(&StorePath::labels()).await?;
        Ok(labels_from_value(value.as_ref()))
    }

    pub async fn create_label(&self, name: &str, color: &str) -> Result<Label, LabelError> {
        let label = Label {
            id: format!("label-{}", Uuid::new_v4()),
            name: checked_name(name)?,
            color: checked_color(color)?,
        };
        let value = serde_json::to_value(&label).map_err(RemoteError::from)?;
        self.store.set(&StorePath::label(&label.id), value).await?;
        log::info!("[labels] Created label {} ({})", label.id, label.name);
        Ok(label)
    }

    pub async fn update_label(&self, label_id: &str, patch: LabelPatch) -> Result<(), LabelError> {
        let path = StorePath::label(label_id);
        if self.store.get(&path).await?.is_none() {
            return Err(LabelError::NotFound(label_id.to_string()));
        }
        let mut fields = Map::new();
        if let Some(name) = patch.name {
            fields.insert("name".to_string(), Value::String(checked_name(&name)?));
        }
        if let Some(color) = patch.color {
            fields.insert("color".to_string(), Value::String(checked_color(&color)?));
        }
        self.store.update(&path, fields).await?;
        Ok(())
    }

    /// Delete the label, then strip its id from every task that carries it.
    /// Returns the number of tasks rewritten.
    pub async fn delete_label(&self, label_id: &str) -> Result<usize, LabelError> {
        self.store.remove(&StorePath::label(label_id)).await?;

        let board = board_from_value(self.store.get(&StorePath::board()).await?.as_ref());
        let mut fields = Map::new();
        for task in board.tasks.values() {
            if !task.labels.iter().any(|l| l == label_id) {
                continue;
            }
            let remaining = remove_id(task.labels.clone(), label_id);
            let value = if remaining.is_empty() {
                Value::Null
            } else {
                Value::Array(remaining.into_iter().map(Value::String).collect())
            };
            fields.insert(format!("{}/labels", task.id), value);
        }

        let rewritten = fields.len();
        if rewritten > 0 {
            self.store.update(&StorePath::tasks(), fields).await?;
        }
        log::info!("[labels] Deleted label {} from {} tasks", label_id, rewritten);
        Ok(rewritten)
    }
}
