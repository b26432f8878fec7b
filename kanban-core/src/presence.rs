/// Presence tracker: one online record per client session.
///
/// `start` writes `presence/{id}` and registers a deferred write that flips
/// the record offline when the connection goes away. The online list is
/// published through a watch channel fed by a subscription on `presence`.
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::auth::AuthUser;
use crate::config::SessionIdentity;
use crate::normalize::presence_from_value;
use crate::remote::{server_timestamp, RemoteError, SharedStore, StorePath, Subscription, WriteOp};
use crate::types::UserPresence;

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("Presence write failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("Presence serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Who this session announces itself as.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceIdentity {
    pub session_id: String,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

impl PresenceIdentity {
    /// The authenticated user when there is one, otherwise the persisted
    /// session identity.
    pub fn resolve(user: Option<&AuthUser>, fallback: &SessionIdentity) -> Self {
        match user {
            Some(user) => Self {
                session_id: user.uid.clone(),
                display_name: user.display_name.clone(),
                photo_url: user.photo_url.clone(),
            },
            None => Self {
                session_id: fallback.id.clone(),
                display_name: None,
                photo_url: None,
            },
        }
    }
}

pub struct PresenceTracker {
    store: SharedStore,
    identity: PresenceIdentity,
    online: watch::Receiver<Vec<UserPresence>>,
    feed: Option<JoinHandle<()>>,
    stopped: bool,
}

impl PresenceTracker {
    /// Announce this session and start following the online list.
    pub async fn start(store: SharedStore, identity: PresenceIdentity) -> Result<Self, PresenceError> {
        let path = StorePath::presence(&identity.session_id);

        let mut offline = Map::new();
        offline.insert("online".to_string(), Value::Bool(false));
        offline.insert("lastActive".to_string(), server_timestamp());
        store
            .on_disconnect(&path, WriteOp::Update { fields: offline })
            .await?;

        let record = UserPresence {
            user_id: identity.session_id.clone(),
            online: true,
            last_active: chrono::Utc::now(),
            display_name: identity.display_name.clone(),
            photo_url: identity.photo_url.clone(),
        };
        store.set(&path, serde_json::to_value(&record)?).await?;

        let subscription = store.subscribe(&StorePath::presence_root()).await?;
        let (tx, rx) = watch::channel(Vec::new());
        let feed = tokio::spawn(feed_presence(subscription, tx));

        log::info!("[presence] Session {} online", identity.session_id);
        Ok(Self {
            store,
            identity,
            online: rx,
            feed: Some(feed),
            stopped: false,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.identity.session_id
    }

    /// Online sessions, sorted by user id.
    pub fn online_users(&self) -> Vec<UserPresence> {
        self.online.borrow().clone()
    }

    pub fn online_count(&self) -> usize {
        self.online.borrow().len()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<UserPresence>> {
        self.online.clone()
    }

    /// Mark the session offline now and stop following the list.
    pub async fn stop(mut self) -> Result<(), PresenceError> {
        self.stop_feed();
        self.stopped = true;
        let path = StorePath::presence(&self.identity.session_id);

        let mut fields = Map::new();
        fields.insert("online".to_string(), Value::Bool(false));
        fields.insert(
            "lastActive".to_string(),
            serde_json::to_value(chrono::Utc::now())?,
        );
        self.store.update(&path, fields).await?;
        self.store.cancel_on_disconnect(&path).await?;
        log::info!("[presence] Session {} offline", self.identity.session_id);
        Ok(())
    }

    fn stop_feed(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.abort();
        }
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.stop_feed();
        if !self.stopped {
            log::debug!(
                "[presence] Tracker for {} dropped without stop, relying on disconnect write",
                self.identity.session_id
            );
        }
    }
}

/// Online records from a `presence` value, sorted by user id.
pub fn online_from_value(value: Option<&Value>) -> Vec<UserPresence> {
    let mut online: Vec<UserPresence> = value
        .and_then(Value::as_object)
        .into_iter()
        .flat_map(|m| m.iter())
        .filter_map(|(key, raw)| presence_from_value(key, raw))
        .filter(|p| p.online)
        .collect();
    online.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    online
}

async fn feed_presence(mut subscription: Subscription, tx: watch::Sender<Vec<UserPresence>>) {
    while let Some(value) = subscription.recv().await {
        let online = online_from_value(value.as_ref());
        log::debug!("[presence] {} online", online.len());
        tx.send_replace(online);
    }
}
