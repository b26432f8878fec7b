/// Event types emitted by the in-memory replicated store.
use serde::{Deserialize, Serialize};

/// Events broadcast to observers of a MemoryStore (SSE clients, logs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StoreEvent {
    ValueChanged {
        path: String,
        /// Connection that performed the write; `None` for direct writes.
        #[serde(skip_serializing_if = "Option::is_none")]
        connection_id: Option<u64>,
    },
    ConnectionOpened {
        connection_id: u64,
    },
    ConnectionClosed {
        connection_id: u64,
        deferred_writes: usize,
    },
}

impl StoreEvent {
    /// Path touched by the event, when it is a data change.
    pub fn path(&self) -> Option<&str> {
        match self {
            StoreEvent::ValueChanged { path, .. } => Some(path),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_is_type_tagged() {
        let event = StoreEvent::ValueChanged {
            path: "board/columnOrder".to_string(),
            connection_id: Some(3),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ValueChanged");
        assert_eq!(json["path"], "board/columnOrder");
        assert_eq!(json["connection_id"], 3);
    }

    #[test]
    fn test_direct_write_omits_connection() {
        let event = StoreEvent::ValueChanged {
            path: "labels".to_string(),
            connection_id: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("connection_id"));
        assert_eq!(event.path(), Some("labels"));
    }

    #[test]
    fn test_connection_events_have_no_path() {
        let event = StoreEvent::ConnectionClosed {
            connection_id: 1,
            deferred_writes: 2,
        };
        assert_eq!(event.path(), None);
        let back: StoreEvent = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(back, event);
    }
}
