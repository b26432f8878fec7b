/// Client configuration and the persisted session identity.
/// Both live under ~/.config/kanban-sync/ (or platform equivalent).
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON in {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// WebSocket endpoint of kanban-server.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Where the session identity is kept. Defaults next to the config file.
    #[serde(default)]
    pub identity_path: Option<PathBuf>,
}

fn default_server_url() -> String {
    "ws://127.0.0.1:8080/sync".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            identity_path: None,
        }
    }
}

impl ClientConfig {
    pub fn identity_path(&self) -> PathBuf {
        self.identity_path
            .clone()
            .unwrap_or_else(|| config_dir().join("identity.json"))
    }
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kanban-sync")
}

/// Load the client config. Missing or unreadable files yield defaults.
pub fn load_client_config(path: &Path) -> ClientConfig {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            log::warn!("[config] Failed to parse {}: {}", path.display(), e);
            ClientConfig::default()
        }),
        Err(_) => {
            log::info!("[config] No client config at {}, using defaults", path.display());
            ClientConfig::default()
        }
    }
}

/// Stable id for this client when no authenticated user is available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl SessionIdentity {
    pub fn generate() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
        }
    }

    /// Read the identity at `path`, creating and persisting a new one when the
    /// file does not exist. A corrupt file is an error, never silently replaced.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate();
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)?;
                }
                let content = serde_json::to_string_pretty(&identity).map_err(|source| {
                    ConfigError::Parse {
                        path: path.display().to_string(),
                        source,
                    }
                })?;
                atomic_write(path, &content)?;
                log::info!("[config] Created session identity {} at {}", identity.id, path.display());
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Write to a sibling .tmp file, fsync, rename over `path`, fsync the directory.
pub fn atomic_write(path: &Path, content: &str) -> Result<(), std::io::Error> {
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)?;

    if let Some(dir) = path.parent() {
        if let Ok(d) = fs::File::open(dir) {
            let _ = d.sync_all();
        }
    }
    Ok(())
}
