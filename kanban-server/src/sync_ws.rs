/// WebSocket sync handler: the wire side of the replicated store.
///
/// Protocol:
///   Client sends Hello { session_id, user_id } on connect.
///   Server opens a store connection and replies Welcome { connection_id }.
///   Each request is answered with Ack or Error carrying its req_id.
///   Every Subscribe gets a forwarder task pushing Value { sub_id, value }.
///
/// When the socket closes, for any reason, the store connection is
/// disconnected and its deferred writes run.
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use kanban_core::remote::memory::MemoryConnection;
use kanban_core::remote::{RemoteError, RemoteStore, StorePath};
use kanban_core::sync::{ClientMessage, ServerMessage};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::state::AppState;

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

pub fn sync_router() -> Router<AppState> {
    Router::new().route("/sync", get(ws_handler))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_sync_session(socket, state))
}

// ── Session ─────────────────────────────────────────────────────────────────

struct SyncSession {
    connection: MemoryConnection,
    outgoing: mpsc::UnboundedSender<ServerMessage>,
    forwarders: HashMap<u64, JoinHandle<()>>,
}

impl SyncSession {
    fn reply(&self, msg: ServerMessage) {
        let _ = self.outgoing.send(msg);
    }

    async fn handle(&mut self, msg: ClientMessage) {
        let req_id = msg.req_id();
        match (req_id, self.dispatch(msg).await) {
            (Some(req_id), Ok(value)) => self.reply(ServerMessage::Ack { req_id, value }),
            (None, Ok(_)) => {}
            (req_id, Err(e)) => {
                log::debug!(
                    "[sync_ws] Connection {} request {:?} failed: {}",
                    self.connection.id(),
                    req_id,
                    e
                );
                self.reply(ServerMessage::Error {
                    req_id,
                    message: e.to_string(),
                });
            }
        }
    }

    async fn dispatch(&mut self, msg: ClientMessage) -> Result<Option<Value>, RemoteError> {
        match msg {
            ClientMessage::Hello { .. } => {
                Err(RemoteError::Rejected("session already started".to_string()))
            }
            ClientMessage::Get { path, .. } => self.connection.get(&StorePath::parse(&path)?).await,
            ClientMessage::Set { path, value, .. } => {
                self.connection.set(&StorePath::parse(&path)?, value).await?;
                Ok(None)
            }
            ClientMessage::Update { path, fields, .. } => {
                self.connection
                    .update(&StorePath::parse(&path)?, fields)
                    .await?;
                Ok(None)
            }
            ClientMessage::Remove { path, .. } => {
                self.connection.remove(&StorePath::parse(&path)?).await?;
                Ok(None)
            }
            ClientMessage::Subscribe { sub_id, path, .. } => {
                let path = StorePath::parse(&path)?;
                if self.forwarders.contains_key(&sub_id) {
                    return Err(RemoteError::Rejected(format!(
                        "subscription {} already exists",
                        sub_id
                    )));
                }
                let mut subscription = self.connection.subscribe(&path).await?;
                let outgoing = self.outgoing.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(value) = subscription.recv().await {
                        if outgoing.send(ServerMessage::Value { sub_id, value }).is_err() {
                            break;
                        }
                    }
                });
                self.forwarders.insert(sub_id, forwarder);
                Ok(None)
            }
            ClientMessage::Unsubscribe { sub_id } => {
                // Aborting drops the subscription, which removes the listener.
                if let Some(forwarder) = self.forwarders.remove(&sub_id) {
                    forwarder.abort();
                }
                Ok(None)
            }
            ClientMessage::OnDisconnect { path, write, .. } => {
                self.connection
                    .on_disconnect(&StorePath::parse(&path)?, write)
                    .await?;
                Ok(None)
            }
            ClientMessage::CancelOnDisconnect { path, .. } => {
                self.connection
                    .cancel_on_disconnect(&StorePath::parse(&path)?)
                    .await?;
                Ok(None)
            }
        }
    }

    /// Stop forwarding and disconnect. Returns the number of deferred writes run.
    fn close(mut self) -> usize {
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }
        self.connection.disconnect()
    }
}

async fn handle_sync_session(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // 1. Wait for Hello (10s timeout)
    let hello = tokio::time::timeout(HELLO_TIMEOUT, async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if let Message::Text(text) = msg {
                return serde_json::from_str::<ClientMessage>(&text).ok();
            }
        }
        None
    })
    .await;

    let (session_id, user_id) = match hello {
        Ok(Some(ClientMessage::Hello {
            session_id,
            user_id,
        })) => (session_id, user_id),
        _ => {
            let err = serde_json::to_string(&ServerMessage::Error {
                req_id: None,
                message: "Expected Hello within 10s".to_string(),
            })
            .unwrap_or_default();
            let _ = ws_tx.send(Message::Text(err.into())).await;
            return;
        }
    };

    // 2. Open a store connection for this socket
    let connection = state.store.connect();
    let connection_id = connection.id();
    log::info!(
        "[sync_ws] Connection {} opened (session={}, user={})",
        connection_id,
        session_id,
        user_id.as_deref().unwrap_or("-")
    );

    let welcome = serde_json::to_string(&ServerMessage::Welcome { connection_id }).unwrap_or_default();
    if ws_tx.send(Message::Text(welcome.into())).await.is_err() {
        connection.disconnect();
        return;
    }

    // 3. Write task: serialize outgoing messages onto the socket
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    log::warn!("[sync_ws] Failed to encode message: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // 4. Read loop: dispatch requests in arrival order
    let mut session = SyncSession {
        connection,
        outgoing: tx,
        forwarders: HashMap::new(),
    };
    let read_loop = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };
            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(parsed) => session.handle(parsed).await,
                Err(e) => session.reply(ServerMessage::Error {
                    req_id: None,
                    message: format!("Unparseable message: {}", e),
                }),
            }
        }
    };

    // Wait for either side to finish
    tokio::select! {
        _ = read_loop => {}
        _ = &mut write_task => {}
    }
    write_task.abort();

    // 5. Cleanup
    let deferred = session.close();
    log::info!(
        "[sync_ws] Connection {} closed (session={}, deferred writes run: {})",
        connection_id,
        session_id,
        deferred
    );
}
