//! HTTP/WebSocket front end for the room actors.
//!
//! ```text
//! GET /rooms/{id}        ── upgrade ──▶ RoomRegistry::connect ──▶ RoomActor
//! GET /rooms/{id}/info   ── JSON RoomInfo
//! GET /health            ── JSON { status, rooms }
//! ```
//!
//! Each socket gets a writer task draining the session's outbound queue;
//! the reader forwards binary frames to the room unparsed. The room decides
//! what is malformed. When either side ends, the session guard is released
//! and the room forgets the session.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::document::DocumentId;
use crate::registry::RoomRegistry;
use crate::room::{RoomConfig, SessionRegistration};
use crate::storage::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore, StoreError};

/// Where rooms keep their snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    /// One snapshot file per document under this directory.
    Files(PathBuf),
    #[cfg(feature = "rocksdb")]
    RocksDb(PathBuf),
}

impl StorageBackend {
    pub fn open(&self) -> Result<Arc<dyn SnapshotStore>, StoreError> {
        Ok(match self {
            StorageBackend::Memory => Arc::new(MemorySnapshotStore::new()),
            StorageBackend::Files(dir) => Arc::new(FileSnapshotStore::open(dir)?),
            #[cfg(feature = "rocksdb")]
            StorageBackend::RocksDb(path) => Arc::new(crate::storage::RocksSnapshotStore::open(
                crate::storage::StoreConfig { path: path.clone(), ..Default::default() },
            )?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub storage: StorageBackend,
    pub room: RoomConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage: StorageBackend::Memory,
            room: RoomConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory storage, short timers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            storage: StorageBackend::Memory,
            room: RoomConfig::for_testing(),
        }
    }
}

pub struct SyncServer {
    config: ServerConfig,
    registry: RoomRegistry,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = config.storage.open()?;
        Ok(Self::with_store(config, store))
    }

    /// Use an already opened snapshot store, ignoring `config.storage`.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let registry = RoomRegistry::new(store, config.room.clone());
        Self { config, registry }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/rooms/{document_id}", get(upgrade))
            .route("/rooms/{document_id}/info", get(room_info))
            .route("/health", get(health))
            .with_state(self.registry.clone())
    }

    /// Serve on `listener` until `shutdown` resolves, then flush every room.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        log::info!("sync server listening on {}", listener.local_addr()?);
        let result = axum::serve(listener, self.router()).with_graceful_shutdown(shutdown).await;
        log::info!("sync server stopping, flushing rooms");
        self.registry.shutdown_all().await;
        result
    }

    /// Bind `config.bind_addr` and serve until Ctrl-C.
    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("failed to listen for ctrl-c: {e}");
            }
        })
        .await
    }

    /// Bind and serve in the background.
    pub async fn spawn(self) -> std::io::Result<RunningServer> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        let registry = self.registry.clone();
        let (tx, rx) = oneshot::channel::<()>();
        let join = tokio::spawn(self.serve(listener, async {
            let _ = rx.await;
        }));
        Ok(RunningServer { addr, registry, shutdown: Some(tx), join })
    }
}

/// Handle to a server started with [`SyncServer::spawn`].
pub struct RunningServer {
    addr: SocketAddr,
    registry: RoomRegistry,
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<std::io::Result<()>>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` base URL for providers.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Stop accepting, flush all rooms and wait for the server task.
    pub async fn shutdown(mut self) -> std::io::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        // Upgraded sockets are not tracked by graceful shutdown; stopping
        // the rooms closes their outbound queues and ends those sockets.
        self.registry.shutdown_all().await;
        match (&mut self.join).await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, message).into_response()
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Path(document_id): Path<String>,
    State(registry): State<RoomRegistry>,
) -> Response {
    match DocumentId::new(document_id) {
        Ok(id) => ws.on_upgrade(move |socket| handle_socket(socket, id, registry)),
        Err(e) => bad_request(e.to_string()),
    }
}

async fn room_info(
    Path(document_id): Path<String>,
    State(registry): State<RoomRegistry>,
) -> Response {
    match DocumentId::new(document_id) {
        Ok(id) => Json(registry.info(&id).await).into_response(),
        Err(e) => bad_request(e.to_string()),
    }
}

async fn health(State(registry): State<RoomRegistry>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": registry.room_count().await,
    }))
}

async fn handle_socket(mut socket: WebSocket, id: DocumentId, registry: RoomRegistry) {
    let SessionRegistration { session, mut outbound } = match registry.connect(&id).await {
        Ok(registration) => registration,
        Err(e) => {
            log::warn!("rejecting connection to {}: {e}", id.room_name());
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    let session_id = session.id();
    log::debug!("{} socket open for session {session_id}", id.room_name());

    let (mut sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Binary(frame)).await.is_err() {
                return;
            }
        }
        // Queue closed: the session was evicted or the room stopped.
        let _ = sink.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if session.send(data).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    // Not part of the protocol; the room counts it as dropped.
                    let data = Bytes::copy_from_slice(text.as_str().as_bytes());
                    if session.send(data).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("{} session {session_id} socket error: {e}", id.room_name());
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    writer.abort();
    session.release().await;
    log::debug!("{} socket closed for session {session_id}", id.room_name());
}
