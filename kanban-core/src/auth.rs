/// Authentication seam and the `users/{uid}` profile directory.
///
/// Sign-in itself happens outside this crate; services only need the
/// current user and a stream of changes. `StaticAuthProvider` is the
/// in-process implementation used by tools and tests.
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::remote::{RemoteError, SharedStore, StorePath};
use crate::types::UserProfile;

/// Display name written for users who have none.
pub const ANONYMOUS_NAME: &str = "Anonymous User";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

pub trait AuthProvider: Send + Sync {
    fn current_user(&self) -> Option<AuthUser>;

    /// Receives every sign-in, sign-out and profile change.
    fn watch(&self) -> watch::Receiver<Option<AuthUser>>;
}

pub struct StaticAuthProvider {
    tx: watch::Sender<Option<AuthUser>>,
}

impl Default for StaticAuthProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

impl StaticAuthProvider {
    pub fn new(user: Option<AuthUser>) -> Self {
        let (tx, _) = watch::channel(user);
        Self { tx }
    }

    pub fn sign_in(&self, user: AuthUser) {
        log::info!("[auth] Signed in as {}", user.uid);
        self.tx.send_replace(Some(user));
    }

    pub fn sign_out(&self) {
        if let Some(previous) = self.tx.send_replace(None) {
            log::info!("[auth] Signed out {}", previous.uid);
        }
    }
}

impl AuthProvider for StaticAuthProvider {
    fn current_user(&self) -> Option<AuthUser> {
        self.tx.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<Option<AuthUser>> {
        self.tx.subscribe()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Invalid profile record for {uid}: {source}")]
    InvalidProfile {
        uid: String,
        source: serde_json::Error,
    },
}

/// Profile records under `users/{uid}`.
#[derive(Clone)]
pub struct UserDirectory {
    store: SharedStore,
}

impl UserDirectory {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn profile(&self, uid: &str) -> Result<Option<UserProfile>, DirectoryError> {
        match self.store.get(&StorePath::user(uid)).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| DirectoryError::InvalidProfile {
                    uid: uid.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Return the stored profile, creating it on first sign-in.
    pub async fn ensure_profile(&self, user: &AuthUser) -> Result<UserProfile, DirectoryError> {
        if let Some(existing) = self.profile(&user.uid).await? {
            return Ok(existing);
        }
        let now = Utc::now();
        let profile = UserProfile {
            uid: user.uid.clone(),
            email: user.email.clone(),
            display_name: Some(
                user.display_name
                    .clone()
                    .unwrap_or_else(|| ANONYMOUS_NAME.to_string()),
            ),
            photo_url: user.photo_url.clone(),
            created_at: now,
            updated_at: now,
        };
        let value = serde_json::to_value(&profile).map_err(RemoteError::from)?;
        self.store.set(&StorePath::user(&user.uid), value).await?;
        log::info!("[users] Created profile for {}", user.uid);
        Ok(profile)
    }

    /// Change display name and/or photo URL. Blank values are ignored.
    pub async fn update_profile(
        &self,
        uid: &str,
        display_name: Option<&str>,
        photo_url: Option<&str>,
    ) -> Result<(), DirectoryError> {
        let mut fields = Map::new();
        if let Some(name) = display_name.map(str::trim).filter(|n| !n.is_empty()) {
            fields.insert("displayName".to_string(), Value::String(name.to_string()));
        }
        if let Some(url) = photo_url.map(str::trim).filter(|u| !u.is_empty()) {
            fields.insert("photoURL".to_string(), Value::String(url.to_string()));
        }
        if fields.is_empty() {
            return Ok(());
        }
        fields.insert(
            "updatedAt".to_string(),
            serde_json::to_value(Utc::now()).map_err(RemoteError::from)?,
        );
        self.store.update(&StorePath::user(uid), fields).await?;
        Ok(())
    }
}
