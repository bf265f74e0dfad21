//! Client sync provider: keeps a local replica in sync with its room.
//!
//! ```text
//!   apply_local_edit ──▶ SharedDocument ──(DocumentUpdate)──┐
//!                                                           ▼
//!                                  connection task ── update frames ──▶ room
//!   PresenceChannel ──(awareness/cursor)──────────────────▶ │
//!                                                           │
//!            SharedDocument ◀── sync/update frames ─────────┘◀── room
//! ```
//!
//! The connection task owns the socket and runs until the provider is
//! disconnected or dropped. After a transport failure it waits a capped,
//! jittered backoff and reconnects; each new connection starts by sending
//! the full local state, so edits made while offline are never lost.
//!
//! Status: `Disconnected → Connecting → Connected → Synced`, and back to
//! `Disconnected` on any transport failure.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::backoff::{Backoff, BackoffConfig};
use crate::document::{Delta, DocumentError, DocumentId, EditOp};
use crate::listeners::{Listeners, Subscription};
use crate::presence::{AwarenessRecord, PresenceChannel, PresenceConfig};
use crate::protocol::{ProtocolError, SyncMessage};
use crate::shared::{SharedDocument, UpdateOrigin};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Pings missed before a silent connection is dropped.
const DEAD_AFTER_PINGS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    /// Socket open, initial sync not yet received.
    Connected,
    Synced,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Who is editing. Supplied by the host application at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub user_name: String,
    pub color: String,
    pub avatar: Option<String>,
}

impl Identity {
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            color: color.into(),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }

    fn record(&self) -> AwarenessRecord {
        let mut record =
            AwarenessRecord::new(self.user_id.clone(), self.user_name.clone(), self.color.clone());
        record.avatar = self.avatar.clone();
        record
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL of the room server, e.g. `ws://127.0.0.1:9090`.
    pub server_url: String,
    pub backoff: BackoffConfig,
    pub ping_interval: Duration,
    pub presence: PresenceConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            backoff: BackoffConfig::default(),
            ping_interval: Duration::from_secs(15),
            presence: PresenceConfig::default(),
        }
    }
}

impl ProviderConfig {
    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            backoff: BackoffConfig::for_testing(),
            ping_interval: Duration::from_millis(200),
            presence: PresenceConfig::for_testing(),
        }
    }

    fn room_url(&self, id: &DocumentId) -> String {
        format!("{}/rooms/{}", self.server_url.trim_end_matches('/'), id)
    }
}

struct Shared {
    document: SharedDocument,
    presence: PresenceChannel,
    /// Held by the live connection task.
    presence_rx: Mutex<mpsc::UnboundedReceiver<SyncMessage>>,
    status: watch::Sender<ConnectionStatus>,
    listeners: Listeners<ConnectionStatus>,
    config: ProviderConfig,
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
        if changed {
            log::debug!("{} status {status:?}", self.document.document_id().room_name());
            self.listeners.emit(&status);
        }
    }
}

struct ConnectionTask {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Per-client sync provider for one document.
pub struct SyncProvider {
    shared: Arc<Shared>,
    status_rx: watch::Receiver<ConnectionStatus>,
    task: Option<ConnectionTask>,
}

impl SyncProvider {
    pub fn new(document: SharedDocument, config: ProviderConfig) -> Self {
        let (presence, presence_rx) = PresenceChannel::new(config.presence.clone());
        let (status, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            shared: Arc::new(Shared {
                document,
                presence,
                presence_rx: Mutex::new(presence_rx),
                status,
                listeners: Listeners::new(),
                config,
            }),
            status_rx,
            task: None,
        }
    }

    /// Provider over a fresh replica of `document_id`.
    pub fn open(document_id: DocumentId, config: ProviderConfig) -> Self {
        Self::new(SharedDocument::open(document_id), config)
    }

    pub fn document(&self) -> &SharedDocument {
        &self.shared.document
    }

    pub fn presence(&self) -> &PresenceChannel {
        &self.shared.presence
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    pub fn on_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.shared.listeners.add(callback)
    }

    /// Wait until the provider reaches `status`.
    pub async fn wait_for_status(&self, status: ConnectionStatus) {
        let mut rx = self.status_rx.clone();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|s| *s == status).await;
    }

    /// Start syncing as `identity`. Replaces any running connection task,
    /// including one waiting out a backoff.
    pub fn connect(&mut self, identity: Identity) {
        self.stop_task();
        self.shared.presence.publish(identity.record());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run(self.shared.clone(), shutdown_rx));
        self.task = Some(ConnectionTask { shutdown, join });
    }

    /// Apply an edit locally. The delta is shipped in the background.
    pub fn apply_local_edit(&self, op: &EditOp) -> Result<Delta, DocumentError> {
        self.shared.document.apply_local_edit(op)
    }

    /// Announce a leave, close the socket and wait for the task to end.
    pub async fn disconnect(&mut self) {
        self.shared.presence.leave();
        if let Some(task) = self.task.take() {
            let _ = task.shutdown.send(true);
            if let Err(e) = task.join.await {
                log::error!("connection task panicked: {e}");
            }
        }
        self.shared.set_status(ConnectionStatus::Disconnected);
    }

    /// Disconnect and release every status and presence listener.
    pub async fn destroy(mut self) {
        self.disconnect().await;
        self.shared.listeners.clear();
        self.shared.presence.clear_listeners();
    }

    fn stop_task(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.shutdown.send(true);
        }
    }
}

impl Drop for SyncProvider {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.shared.presence.leave();
            self.stop_task();
        }
    }
}

impl std::fmt::Debug for SyncProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProvider")
            .field("document", self.shared.document.document_id())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

enum SessionEnd {
    Shutdown,
    Lost { synced: bool, reason: String },
}

async fn run(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let room = shared.document.document_id().room_name();
    let url = shared.config.room_url(shared.document.document_id());
    let mut backoff = Backoff::new(shared.config.backoff.clone());

    let mut presence_rx = tokio::select! {
        rx = shared.presence_rx.lock() => rx,
        _ = shutdown.changed() => return,
    };

    loop {
        if *shutdown.borrow() {
            break;
        }
        shared.set_status(ConnectionStatus::Connecting);

        let end = tokio::select! {
            result = tokio_tungstenite::connect_async(url.as_str()) => match result {
                Ok((stream, _)) => {
                    log::info!("{room}: connected to {url}");
                    session(&shared, stream, &mut presence_rx, &mut shutdown).await
                }
                Err(e) => SessionEnd::Lost { synced: false, reason: e.to_string() },
            },
            _ = shutdown.changed() => SessionEnd::Shutdown,
        };
        shared.presence.clear_remote();

        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Lost { synced, reason } => {
                shared.set_status(ConnectionStatus::Disconnected);
                if synced {
                    backoff.reset();
                }
                let delay = backoff.next_delay();
                log::info!(
                    "{room}: connection lost ({reason}), retry {} in {delay:?}",
                    backoff.attempt()
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }
    shared.set_status(ConnectionStatus::Disconnected);
    log::debug!("{room}: connection task stopped");
}

async fn session(
    shared: &Shared,
    stream: WsStream,
    presence_rx: &mut mpsc::UnboundedReceiver<SyncMessage>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut sink, mut inbound) = stream.split();
    shared.set_status(ConnectionStatus::Connected);

    // Subscribe before encoding so no edit falls between the two.
    let mut updates = shared.document.subscribe();
    let bootstrap = SyncMessage::update(&shared.document.encode_full_state());
    if let Err(e) = send_message(&mut sink, &bootstrap).await {
        return SessionEnd::Lost { synced: false, reason: e.to_string() };
    }

    // Anything queued while offline is superseded by a fresh announcement.
    while presence_rx.try_recv().is_ok() {}
    shared.presence.heartbeat();

    let ping_every = shared.config.ping_interval;
    let mut ping = interval_at(Instant::now() + ping_every, ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let heartbeat_every = shared.config.presence.heartbeat;
    let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_inbound = Instant::now();
    let mut synced = false;

    loop {
        tokio::select! {
            frame = inbound.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    last_inbound = Instant::now();
                    handle_frame(shared, &data, &mut synced);
                }
                Some(Ok(Message::Close(_))) | None => {
                    return SessionEnd::Lost { synced, reason: "closed by server".into() };
                }
                Some(Ok(_)) => last_inbound = Instant::now(),
                Some(Err(e)) => return SessionEnd::Lost { synced, reason: e.to_string() },
            },
            Some(update) = updates.recv() => {
                if update.origin == UpdateOrigin::Remote {
                    continue;
                }
                if let Err(e) = send_message(&mut sink, &SyncMessage::update(&update.delta)).await {
                    return SessionEnd::Lost { synced, reason: e.to_string() };
                }
            }
            Some(msg) = presence_rx.recv() => {
                if let Err(e) = send_message(&mut sink, &msg).await {
                    return SessionEnd::Lost { synced, reason: e.to_string() };
                }
            }
            _ = ping.tick() => {
                if last_inbound.elapsed() > ping_every * DEAD_AFTER_PINGS {
                    return SessionEnd::Lost { synced, reason: "no traffic from server".into() };
                }
                if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                    return SessionEnd::Lost { synced, reason: e.to_string() };
                }
            }
            _ = heartbeat.tick() => {
                shared.presence.heartbeat();
                shared.presence.expire_stale();
            }
            _ = shutdown.changed() => {
                while let Ok(msg) = presence_rx.try_recv() {
                    if send_message(&mut sink, &msg).await.is_err() {
                        break;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }
        }
    }
}

fn handle_frame(shared: &Shared, data: &[u8], synced: &mut bool) {
    let msg = match SyncMessage::decode(data) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("dropping undecodable frame: {e}");
            return;
        }
    };
    match msg {
        SyncMessage::Sync { data } => {
            let state = Delta::from_bytes(data);
            match shared.document.apply_remote(&state, UpdateOrigin::Remote) {
                Ok(()) => {
                    *synced = true;
                    shared.set_status(ConnectionStatus::Synced);
                }
                Err(e) => log::warn!("initial sync rejected: {e}"),
            }
        }
        SyncMessage::Update { data } => {
            let delta = Delta::from_bytes(data);
            if let Err(e) = shared.document.apply_remote(&delta, UpdateOrigin::Remote) {
                log::warn!("dropping remote update: {e}");
            }
        }
        SyncMessage::Cursor(payload) => shared.presence.handle_cursor(&payload),
        SyncMessage::Awareness { data } => {
            if let Err(e) = shared.presence.handle_remote(&data) {
                log::debug!("dropping awareness message: {e}");
            }
        }
    }
}

async fn send_message(sink: &mut WsSink, msg: &SyncMessage) -> Result<(), ClientError> {
    let frame = msg.encode_frame()?;
    sink.send(Message::Binary(frame))
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::TextField;
    use parking_lot::Mutex as SyncMutex;

    async fn unused_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{addr}")
    }

    #[test]
    fn test_room_url() {
        let config = ProviderConfig::for_testing("ws://host:1/");
        let id = DocumentId::new("doc-1").unwrap();
        assert_eq!(config.room_url(&id), "ws://host:1/rooms/doc-1");
    }

    #[tokio::test]
    async fn test_unreachable_server_keeps_editing() {
        let config = ProviderConfig::for_testing(unused_url().await);
        let mut provider = SyncProvider::open(DocumentId::new("doc").unwrap(), config);
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = provider.on_status_change(move |s| sink.lock().push(*s));

        provider.connect(Identity::new("u1", "Ada", "#c678dd"));
        provider.apply_local_edit(&EditOp::insert(TextField::Body, 0, "draft")).unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !seen.lock().contains(&ConnectionStatus::Disconnected) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(seen.lock().first(), Some(&ConnectionStatus::Connecting));
        assert_eq!(provider.document().text(TextField::Body), "draft");

        tokio::time::timeout(Duration::from_secs(2), provider.disconnect()).await.unwrap();
        assert_eq!(provider.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_destroy_releases_listeners() {
        let config = ProviderConfig::for_testing(unused_url().await);
        let mut provider = SyncProvider::open(DocumentId::new("doc").unwrap(), config);
        let sub = provider.on_status_change(|_| {});
        sub.detach();
        let shared = provider.shared.clone();
        provider.connect(Identity::new("u1", "Ada", "#c678dd"));

        tokio::time::timeout(Duration::from_secs(2), provider.destroy()).await.unwrap();
        assert!(shared.listeners.is_empty());
    }

    #[test]
    fn test_identity_record() {
        let identity = Identity::new("u7", "Grace", "#98c379").with_avatar("https://a/u7.png");
        let record = identity.record();
        assert_eq!(record.user_id, "u7");
        assert_eq!(record.avatar.as_deref(), Some("https://a/u7.png"));
        assert_eq!(record.cursor, None);
    }
}
