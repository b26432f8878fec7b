/// WebSocket client for kanban-server.
///
/// One socket carries every request and subscription of this client.
/// Requests are correlated by `req_id`; pushed values are routed by
/// `sub_id`. When the socket closes all pending requests fail with
/// `Disconnected`, all subscriptions end, and the server runs this
/// connection's deferred writes.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{RemoteError, RemoteStore, StorePath, Subscription, WriteOp};
use crate::config::{ClientConfig, SessionIdentity};
use crate::sync::{ClientMessage, ServerMessage};

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reply = Result<Option<Value>, RemoteError>;

struct Inner {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    subscriptions: Mutex<HashMap<u64, mpsc::UnboundedSender<Option<Value>>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, msg: &ClientMessage) -> Result<(), RemoteError> {
        let text = serde_json::to_string(msg)?;
        self.outgoing
            .send(Message::Text(text.into()))
            .map_err(|_| RemoteError::Disconnected)
    }

    async fn request(&self, build: impl FnOnce(u64) -> ClientMessage) -> Reply {
        let req_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| RemoteError::Unavailable("pending map poisoned".to_string()))?;
            if self.closed.load(Ordering::SeqCst) {
                return Err(RemoteError::Disconnected);
            }
            pending.insert(req_id, tx);
        }
        if let Err(e) = self.send(&build(req_id)) {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&req_id);
            }
            return Err(e);
        }
        rx.await.map_err(|_| RemoteError::Disconnected)?
    }

    fn resolve(&self, req_id: u64, reply: Reply) {
        let waiter = self.pending.lock().ok().and_then(|mut p| p.remove(&req_id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => log::debug!("[ws_store] Reply for unknown request {}", req_id),
        }
    }

    fn deliver(&self, sub_id: u64, value: Option<Value>) {
        if let Ok(mut subs) = self.subscriptions.lock() {
            let gone = match subs.get(&sub_id) {
                Some(tx) => tx.send(value).is_err(),
                None => false,
            };
            if gone {
                subs.remove(&sub_id);
            }
        }
    }

    /// Fail everything in flight. Idempotent.
    fn shut_down(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut pending) = self.pending.lock() {
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(RemoteError::Disconnected));
            }
        }
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.clear();
        }
    }
}

pub struct WsRemoteStore {
    inner: Arc<Inner>,
    connection_id: u64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsRemoteStore {
    /// Connect to `url` (e.g. `ws://127.0.0.1:8080/sync`) and complete the
    /// Hello / Welcome handshake.
    pub async fn connect(url: &str, session_id: &str, user_id: Option<&str>) -> Result<Self, RemoteError> {
        let (mut socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| RemoteError::Unavailable(format!("connect to {} failed: {}", url, e)))?;

        let hello = ClientMessage::Hello {
            session_id: session_id.to_string(),
            user_id: user_id.map(str::to_string),
        };
        socket
            .send(Message::Text(serde_json::to_string(&hello)?.into()))
            .await
            .map_err(|e| RemoteError::Unavailable(format!("send Hello failed: {}", e)))?;

        let connection_id = await_welcome(&mut socket).await?;
        log::info!("[ws_store] Connected to {} as connection {}", url, connection_id);

        let (mut sink, stream) = socket.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let inner = Arc::new(Inner {
            outgoing,
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        let writer_inner = inner.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    log::warn!("[ws_store] Send failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            writer_inner.shut_down();
        });

        let reader = tokio::spawn(read_loop(stream, inner.clone()));

        Ok(Self {
            inner,
            connection_id,
            reader,
            writer,
        })
    }

    /// Connect to `config.server_url` as this client's persisted session,
    /// creating the identity file on first use.
    pub async fn connect_with_config(config: &ClientConfig, user_id: Option<&str>) -> Result<Self, RemoteError> {
        let identity = SessionIdentity::load_or_create(&config.identity_path())
            .map_err(|e| RemoteError::Unavailable(format!("session identity: {}", e)))?;
        Self::connect(&config.server_url, &identity.id, user_id).await
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the socket. The server then runs this connection's deferred writes.
    pub async fn close(mut self) {
        let _ = self.inner.outgoing.send(Message::Close(None));
        // The writer exits once the close frame is on the wire; Drop aborts
        // it if the bound elapses first.
        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut self.writer).await.is_err() {
            log::warn!("[ws_store] Close frame not flushed within {:?}", CLOSE_FLUSH_TIMEOUT);
        }
    }
}

impl Drop for WsRemoteStore {
    fn drop(&mut self) {
        self.inner.shut_down();
        self.reader.abort();
        self.writer.abort();
    }
}

async fn await_welcome(socket: &mut Socket) -> Result<u64, RemoteError> {
    while let Some(msg) = socket.next().await {
        let msg = msg.map_err(|e| RemoteError::Unavailable(format!("handshake failed: {}", e)))?;
        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        return match serde_json::from_str::<ServerMessage>(&text)? {
            ServerMessage::Welcome { connection_id } => Ok(connection_id),
            ServerMessage::Error { message, .. } => Err(RemoteError::Rejected(message)),
            other => Err(RemoteError::Rejected(format!(
                "expected Welcome, got {:?}",
                other
            ))),
        };
    }
    Err(RemoteError::Disconnected)
}

async fn read_loop(mut stream: SplitStream<Socket>, inner: Arc<Inner>) {
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("[ws_store] Read error: {}", e);
                break;
            }
        };
        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Ping(data) => {
                let _ = inner.outgoing.send(Message::Pong(data));
                continue;
            }
            Message::Close(_) => {
                log::info!("[ws_store] Server closed the connection");
                break;
            }
            _ => continue,
        };

        match serde_json::from_str::<ServerMessage>(&text) {
            Ok(ServerMessage::Ack { req_id, value }) => inner.resolve(req_id, Ok(value)),
            Ok(ServerMessage::Error {
                req_id: Some(req_id),
                message,
            }) => inner.resolve(req_id, Err(RemoteError::Rejected(message))),
            Ok(ServerMessage::Error { req_id: None, message }) => {
                log::warn!("[ws_store] Server error: {}", message);
            }
            Ok(ServerMessage::Value { sub_id, value }) => inner.deliver(sub_id, value),
            Ok(ServerMessage::Welcome { .. }) => {
                log::debug!("[ws_store] Ignoring repeated Welcome");
            }
            Err(e) => log::warn!("[ws_store] Unparseable server message: {}", e),
        }
    }
    inner.shut_down();
}

#[async_trait]
impl RemoteStore for WsRemoteStore {
    async fn get(&self, path: &StorePath) -> Result<Option<Value>, RemoteError> {
        path.validate()?;
        let path = path.to_string();
        self.inner
            .request(|req_id| ClientMessage::Get { req_id, path })
            .await
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, RemoteError> {
        path.validate()?;
        let sub_id = self.inner.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        // Registered before the request so the initial value cannot race the Ack.
        self.inner
            .subscriptions
            .lock()
            .map_err(|_| RemoteError::Unavailable("subscription map poisoned".to_string()))?
            .insert(sub_id, tx);

        let wire_path = path.to_string();
        let result = self
            .inner
            .request(|req_id| ClientMessage::Subscribe {
                req_id,
                sub_id,
                path: wire_path,
            })
            .await;
        if let Err(e) = result {
            if let Ok(mut subs) = self.inner.subscriptions.lock() {
                subs.remove(&sub_id);
            }
            return Err(e);
        }

        let inner = self.inner.clone();
        Ok(Subscription::new(path.clone(), rx, move || {
            if let Ok(mut subs) = inner.subscriptions.lock() {
                subs.remove(&sub_id);
            }
            if !inner.closed.load(Ordering::SeqCst) {
                let _ = inner.send(&ClientMessage::Unsubscribe { sub_id });
            }
        }))
    }

    async fn set(&self, path: &StorePath, value: Value) -> Result<(), RemoteError> {
        path.validate()?;
        let path = path.to_string();
        self.inner
            .request(|req_id| ClientMessage::Set { req_id, path, value })
            .await?;
        Ok(())
    }

    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<(), RemoteError> {
        path.validate()?;
        if fields.is_empty() {
            return Ok(());
        }
        let path = path.to_string();
        self.inner
            .request(|req_id| ClientMessage::Update { req_id, path, fields })
            .await?;
        Ok(())
    }

    async fn remove(&self, path: &StorePath) -> Result<(), RemoteError> {
        path.validate()?;
        let path = path.to_string();
        self.inner
            .request(|req_id| ClientMessage::Remove { req_id, path })
            .await?;
        Ok(())
    }

    async fn on_disconnect(&self, path: &StorePath, write: WriteOp) -> Result<(), RemoteError> {
        path.validate()?;
        let path = path.to_string();
        self.inner
            .request(|req_id| ClientMessage::OnDisconnect { req_id, path, write })
            .await?;
        Ok(())
    }

    async fn cancel_on_disconnect(&self, path: &StorePath) -> Result<(), RemoteError> {
        path.validate()?;
        let path = path.to_string();
        self.inner
            .request(|req_id| ClientMessage::CancelOnDisconnect { req_id, path })
            .await?;
        Ok(())
    }
}
