/// Process-wide logger for kanban-server.
///
/// Every record that passes the env_logger filter (`RUST_LOG`, default
/// "info") goes to one [`LogSink`]: echoed to stderr, kept in a bounded ring
/// for `GET /logs`, broadcast to `/logs/stream` subscribers and appended to
/// ~/.config/kanban-sync/logs/server.log.
use env_logger::{Logger, Target};
use log::{Level, Log, Metadata, Record, SetLoggerError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{LazyLock, Mutex};
use tokio::sync::broadcast;

const RING_CAPACITY: usize = 2000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerLogEntry {
    pub timestamp_ms: u64,
    pub level: String,
    pub target: String,
    pub message: String,
}

impl ServerLogEntry {
    fn new(level: Level, target: &str, message: String) -> Self {
        Self {
            timestamp_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
            level: level.as_str().to_lowercase(),
            target: target.to_string(),
            message,
        }
    }

    fn severity(&self) -> Level {
        Level::from_str(&self.level).unwrap_or(Level::Trace)
    }

    fn to_line(&self) -> String {
        format!(
            "{} [{}] [{}] {}",
            self.timestamp_ms,
            self.level.to_uppercase(),
            self.target,
            self.message.replace('\n', "\\n")
        )
    }
}

/// Filter for `GET /logs?level=warn&limit=100`.
#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    /// Least severe level to include.
    pub level: Option<String>,
    /// Keep only the newest `limit` matches.
    pub limit: Option<usize>,
}

struct LogSink {
    ring: Mutex<VecDeque<ServerLogEntry>>,
    tx: broadcast::Sender<ServerLogEntry>,
    file_path: PathBuf,
    file: Mutex<Option<File>>,
}

impl LogSink {
    fn new(file_path: PathBuf) -> Self {
        let (tx, _) = broadcast::channel(512);
        let file = open_append(&file_path).ok();
        Self {
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            tx,
            file_path,
            file: Mutex::new(file),
        }
    }

    fn record(&self, entry: ServerLogEntry) {
        let line = entry.to_line();
        eprintln!("{}", line);
        self.append_line(&line);
        if let Ok(mut ring) = self.ring.lock() {
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(entry.clone());
        }
        let _ = self.tx.send(entry);
    }

    // The file is reopened lazily if it could not be created at startup.
    fn append_line(&self, line: &str) {
        let Ok(mut slot) = self.file.lock() else {
            return;
        };
        if slot.is_none() {
            *slot = open_append(&self.file_path).ok();
        }
        if let Some(file) = slot.as_mut() {
            let _ = writeln!(file, "{}", line);
            let _ = file.flush();
        }
    }

    fn query(&self, query: &LogQuery) -> Vec<ServerLogEntry> {
        let min = query.level.as_deref().and_then(|l| Level::from_str(l).ok());
        let Ok(ring) = self.ring.lock() else {
            return Vec::new();
        };
        let mut matches: Vec<ServerLogEntry> = ring
            .iter()
            .filter(|e| match min {
                Some(min) => e.severity() <= min,
                None => true,
            })
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            let skip = matches.len().saturating_sub(limit);
            matches.drain(..skip);
        }
        matches
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

static SINK: LazyLock<LogSink> = LazyLock::new(|| {
    LogSink::new(
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kanban-sync")
            .join("logs")
            .join("server.log"),
    )
});

struct SinkLogger {
    filter: Logger,
}

impl Log for SinkLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.filter.enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            SINK.record(ServerLogEntry::new(
                record.level(),
                record.target(),
                record.args().to_string(),
            ));
        }
    }

    fn flush(&self) {}
}

/// Install the logger. env_logger only supplies the `RUST_LOG` filter; its
/// own output is discarded.
pub fn init() -> Result<(), SetLoggerError> {
    let filter = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(Target::Pipe(Box::new(io::sink())))
        .build();
    log::set_logger(Box::leak(Box::new(SinkLogger { filter })))?;
    log::set_max_level(log::LevelFilter::Trace);
    Ok(())
}

pub fn recent_entries(query: &LogQuery) -> Vec<ServerLogEntry> {
    SINK.query(query)
}

pub fn subscribe() -> broadcast::Receiver<ServerLogEntry> {
    SINK.tx.subscribe()
}

pub fn log_file_path() -> String {
    SINK.file_path.display().to_string()
}

/// Record a line when the logger itself could not be installed.
pub fn write_fallback_line(message: &str) {
    SINK.record(ServerLogEntry::new(
        Level::Error,
        "kanban_server::log_bridge",
        message.to_string(),
    ));
}
