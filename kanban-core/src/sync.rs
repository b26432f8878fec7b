/// Sync protocol message types shared between kanban-server and WsRemoteStore.
///
/// Protocol:
///   Client sends Hello { session_id, user_id } on connect.
///   Server replies Welcome { connection_id }.
///   Requests (Get, Set, Update, Remove, Subscribe, OnDisconnect, ...) carry a
///   client-chosen `req_id`; the server answers each with Ack or Error.
///   Subscriptions are keyed by a client-chosen `sub_id`; the server pushes
///   Value { sub_id, value } for the initial value and every change.
///
/// Paths travel as `/`-separated strings and are validated by the server.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::remote::WriteOp;

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    Hello {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    Get {
        req_id: u64,
        path: String,
    },
    Set {
        req_id: u64,
        path: String,
        value: Value,
    },
    Update {
        req_id: u64,
        path: String,
        fields: Map<String, Value>,
    },
    Remove {
        req_id: u64,
        path: String,
    },
    Subscribe {
        req_id: u64,
        sub_id: u64,
        path: String,
    },
    Unsubscribe {
        sub_id: u64,
    },
    OnDisconnect {
        req_id: u64,
        path: String,
        write: WriteOp,
    },
    CancelOnDisconnect {
        req_id: u64,
        path: String,
    },
}

impl ClientMessage {
    /// Request id to answer, for messages that expect an Ack.
    pub fn req_id(&self) -> Option<u64> {
        match self {
            ClientMessage::Get { req_id, .. }
            | ClientMessage::Set { req_id, .. }
            | ClientMessage::Update { req_id, .. }
            | ClientMessage::Remove { req_id, .. }
            | ClientMessage::Subscribe { req_id, .. }
            | ClientMessage::OnDisconnect { req_id, .. }
            | ClientMessage::CancelOnDisconnect { req_id, .. } => Some(*req_id),
            ClientMessage::Hello { .. } | ClientMessage::Unsubscribe { .. } => None,
        }
    }
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    Welcome {
        connection_id: u64,
    },
    Ack {
        req_id: u64,
        /// Payload for Get; absent for writes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    Value {
        sub_id: u64,
        #[serde(default)]
        value: Option<Value>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        req_id: Option<u64>,
        message: String,
    },
}
