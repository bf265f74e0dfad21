//! Coordination actor: one task per document.
//!
//! ```text
//!  WebSocket tasks                      RoomActor (single task per document)
//! ┌───────────────┐  RoomCommand   ┌───────────────────────────────────────────┐
//! │ RoomHandle    │ ─────────────► │ Initializing: load snapshot (cmds queue)  │
//! │ SessionGuard  │   (mpsc)       │ Ready:                                    │
//! └───────────────┘                │   update ──► apply ──► persist ──► relay  │
//!        ▲                         │   cursor/awareness ──────────────► relay  │
//!        │ per-session queue       │   timers: debounced flush, retry, idle    │
//!        └──────────────────────── │ BroadcastGroup (owned, no locks)          │
//!                                  └───────────────────────────────────────────┘
//! ```
//!
//! All applies, persists and broadcasts for one document happen on the actor
//! task, so they are totally ordered. Storage failures never stop the actor:
//! the in-memory replica stays authoritative, health turns `degraded` and
//! writes are retried with backoff.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backoff::{Backoff, BackoffConfig};
use crate::broadcast::BroadcastGroup;
pub use crate::broadcast::SessionId;
use crate::document::{Delta, DocumentContent, DocumentId, DocumentReplica, Version};
use crate::protocol::SyncMessage;
use crate::storage::{self, SnapshotStore, StoreError};

/// Room tuning.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Outbound frames buffered per session before it is evicted as slow.
    pub session_buffer: usize,
    /// Commands buffered before senders wait.
    pub command_buffer: usize,
    /// Delay between the first unsaved update and the snapshot write.
    /// Zero writes after every update.
    pub snapshot_debounce: Duration,
    /// How long a room with no sessions stays alive.
    pub idle_shutdown: Duration,
    /// Attempts to load the snapshot before serving in memory only.
    pub load_attempts: u32,
    pub retry: BackoffConfig,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            session_buffer: 256,
            command_buffer: 1024,
            snapshot_debounce: Duration::from_millis(500),
            idle_shutdown: Duration::from_secs(60),
            load_attempts: 3,
            retry: BackoffConfig::default(),
        }
    }
}

impl RoomConfig {
    pub fn for_testing() -> Self {
        Self {
            session_buffer: 64,
            command_buffer: 256,
            snapshot_debounce: Duration::ZERO,
            idle_shutdown: Duration::from_secs(5),
            load_attempts: 2,
            retry: BackoffConfig::for_testing(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomHealth {
    Initializing,
    Ready,
    /// Snapshot storage is failing; serving from memory.
    Degraded,
    /// No actor is running for this document.
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomInfo {
    pub document_id: String,
    pub room: String,
    pub active: bool,
    pub sessions: usize,
    pub health: RoomHealth,
    pub updates_applied: u64,
    pub messages_dropped: u64,
    pub sessions_evicted: u64,
    pub persist_failures: u64,
    pub persisted_version: Option<String>,
    pub dirty: bool,
}

impl RoomInfo {
    pub fn inactive(id: &DocumentId) -> Self {
        Self {
            document_id: id.to_string(),
            room: id.room_name(),
            active: false,
            sessions: 0,
            health: RoomHealth::Idle,
            updates_applied: 0,
            messages_dropped: 0,
            sessions_evicted: 0,
            persist_failures: 0,
            persisted_version: None,
            dirty: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("room {0} is closed")]
    Closed(String),
    #[error("room {0} did not accept the connection")]
    Unavailable(String),
}

enum RoomCommand {
    Connect { reply: oneshot::Sender<(SessionId, mpsc::Receiver<Bytes>)> },
    Message { session: SessionId, frame: Bytes },
    Disconnect { session: SessionId },
    Info { reply: oneshot::Sender<RoomInfo> },
    Content { reply: oneshot::Sender<DocumentContent> },
    Flush { reply: oneshot::Sender<Result<(), StoreError>> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Cloneable address of a running room.
#[derive(Clone)]
pub struct RoomHandle {
    document_id: DocumentId,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    /// Start a room actor. It loads the snapshot before handling any command.
    pub fn spawn(
        document_id: DocumentId,
        store: Arc<dyn SnapshotStore>,
        config: RoomConfig,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));
        let actor = RoomActor::new(document_id.clone(), store, config);
        let join = tokio::spawn(actor.run(rx));
        (Self { document_id, tx }, join)
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Open a session. The first frame on `outbound` is the `sync` bootstrap.
    pub async fn connect(&self) -> Result<SessionRegistration, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.command(RoomCommand::Connect { reply }).await?;
        let (id, outbound) = rx
            .await
            .map_err(|_| RoomError::Unavailable(self.document_id.to_string()))?;
        Ok(SessionRegistration {
            session: SessionGuard { room: self.clone(), id, released: false },
            outbound,
        })
    }

    /// Deliver a raw frame received from `session`.
    pub async fn send(&self, session: SessionId, frame: Bytes) -> Result<(), RoomError> {
        self.command(RoomCommand::Message { session, frame }).await
    }

    pub async fn disconnect(&self, session: SessionId) -> Result<(), RoomError> {
        self.command(RoomCommand::Disconnect { session }).await
    }

    pub async fn info(&self) -> Result<RoomInfo, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.command(RoomCommand::Info { reply }).await?;
        rx.await.map_err(|_| self.closed())
    }

    /// Current title and body, for history snapshots.
    pub async fn content(&self) -> Result<DocumentContent, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.command(RoomCommand::Content { reply }).await?;
        rx.await.map_err(|_| self.closed())
    }

    /// Write the snapshot now if anything is unsaved.
    pub async fn flush(&self) -> Result<Result<(), StoreError>, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.command(RoomCommand::Flush { reply }).await?;
        rx.await.map_err(|_| self.closed())
    }

    /// Flush, drop every session and stop the actor.
    pub async fn shutdown(&self) -> Result<(), RoomError> {
        let (reply, rx) = oneshot::channel();
        self.command(RoomCommand::Shutdown { reply }).await?;
        rx.await.map_err(|_| self.closed())
    }

    async fn command(&self, cmd: RoomCommand) -> Result<(), RoomError> {
        self.tx.send(cmd).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> RoomError {
        RoomError::Closed(self.document_id.to_string())
    }
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle")
            .field("document_id", &self.document_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A registered session and its outbound frame queue.
pub struct SessionRegistration {
    pub session: SessionGuard,
    pub outbound: mpsc::Receiver<Bytes>,
}

/// Membership of one session. Dropping it removes the session from the room.
pub struct SessionGuard {
    room: RoomHandle,
    id: SessionId,
    released: bool,
}

impl SessionGuard {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn room(&self) -> &RoomHandle {
        &self.room
    }

    pub async fn send(&self, frame: Bytes) -> Result<(), RoomError> {
        self.room.send(self.id, frame).await
    }

    /// Leave the room, waiting until the command is queued.
    pub async fn release(mut self) {
        self.released = true;
        let _ = self.room.disconnect(self.id).await;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let cmd = RoomCommand::Disconnect { session: self.id };
        if let Err(mpsc::error::TrySendError::Full(cmd)) = self.room.tx.try_send(cmd) {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let tx = self.room.tx.clone();
                runtime.spawn(async move {
                    let _ = tx.send(cmd).await;
                });
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Initializing,
    Ready,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Persistence {
    /// Stored state has been merged into the replica; writes are allowed.
    loaded: bool,
    persisted: Option<Version>,
    dirty_since: Option<Instant>,
    next_attempt: Option<Instant>,
    retry: Backoff,
    degraded: bool,
    failures: u64,
}

struct RoomActor {
    document_id: DocumentId,
    store: Arc<dyn SnapshotStore>,
    config: RoomConfig,
    replica: DocumentReplica,
    sessions: BroadcastGroup,
    lifecycle: Lifecycle,
    persistence: Persistence,
    idle_since: Option<Instant>,
    updates_applied: u64,
    messages_dropped: u64,
    shutdown_reply: Option<oneshot::Sender<()>>,
}

impl RoomActor {
    fn new(document_id: DocumentId, store: Arc<dyn SnapshotStore>, config: RoomConfig) -> Self {
        Self {
            sessions: BroadcastGroup::new(config.session_buffer),
            persistence: Persistence {
                loaded: false,
                persisted: None,
                dirty_since: None,
                next_attempt: None,
                retry: Backoff::new(config.retry.clone()),
                degraded: false,
                failures: 0,
            },
            document_id,
            store,
            config,
            replica: DocumentReplica::with_random_id(),
            lifecycle: Lifecycle::Initializing,
            idle_since: Some(Instant::now()),
            updates_applied: 0,
            messages_dropped: 0,
            shutdown_reply: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        // Commands sent meanwhile wait in the channel.
        self.initialize().await;
        self.lifecycle = Lifecycle::Ready;
        log::info!(
            "{} ready (health {:?})",
            self.document_id.room_name(),
            self.health()
        );

        loop {
            let deadline = self.next_deadline();
            let flow = tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => Flow::Stop,
                },
                _ = sleep_until(deadline) => self.on_timer().await,
            };
            if flow == Flow::Stop {
                break;
            }
        }

        rx.close();
        if self.persistence.loaded && self.persistence.dirty_since.is_some() {
            if let Err(e) = self.flush().await {
                log::error!(
                    "{} stopping with unsaved changes: {e}",
                    self.document_id.room_name()
                );
            }
        }
        self.sessions.clear();
        log::info!("{} stopped", self.document_id.room_name());
        if let Some(reply) = self.shutdown_reply.take() {
            let _ = reply.send(());
        }
    }

    async fn initialize(&mut self) {
        let attempts = self.config.load_attempts.max(1);
        for attempt in 1..=attempts {
            match storage::load_snapshot(&self.store, &self.document_id).await {
                Ok(stored) => {
                    self.apply_stored(stored);
                    return;
                }
                Err(e) => {
                    self.persistence.failures += 1;
                    log::warn!(
                        "{}: snapshot load attempt {attempt}/{attempts} failed: {e}",
                        self.document_id.room_name()
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.persistence.retry.next_delay()).await;
                    }
                }
            }
        }
        // Serve from memory; never write until a load succeeds.
        self.persistence.degraded = true;
        self.schedule_retry();
    }

    fn apply_stored(&mut self, stored: Option<Vec<u8>>) {
        let p = &mut self.persistence;
        p.loaded = true;
        p.degraded = false;
        p.next_attempt = None;
        p.retry.reset();

        if let Some(bytes) = stored {
            let delta = Delta::from_bytes(bytes);
            match self.replica.apply_remote_delta(&delta) {
                Ok(()) => {
                    log::info!(
                        "{} restored snapshot ({} bytes)",
                        self.document_id.room_name(),
                        delta.len()
                    );
                    // Sessions that joined while storage was down lack this state.
                    if !self.sessions.is_empty() {
                        if let Ok(frame) = SyncMessage::update(&delta).encode_frame() {
                            self.sessions.broadcast_except(None, &frame);
                        }
                    }
                }
                Err(e) => log::error!(
                    "{}: stored snapshot is unreadable, starting empty: {e}",
                    self.document_id.room_name()
                ),
            }
        }
        if self.persistence.dirty_since.is_none() {
            self.persistence.persisted = Some(self.replica.version());
        }
    }

    async fn handle(&mut self, cmd: RoomCommand) -> Flow {
        match cmd {
            RoomCommand::Connect { reply } => self.connect(reply),
            RoomCommand::Message { session, frame } => self.handle_message(session, frame).await,
            RoomCommand::Disconnect { session } => {
                if self.sessions.remove_session(&session) {
                    log::info!(
                        "session {session} left {} ({} open)",
                        self.document_id.room_name(),
                        self.sessions.len()
                    );
                }
                self.touch_idle();
            }
            RoomCommand::Info { reply } => {
                let _ = reply.send(self.info());
            }
            RoomCommand::Content { reply } => {
                let _ = reply.send(self.replica.content());
            }
            RoomCommand::Flush { reply } => {
                let result = if self.persistence.loaded {
                    self.flush().await
                } else {
                    Err(StoreError::Task("snapshot has not been loaded".into()))
                };
                let _ = reply.send(result);
            }
            RoomCommand::Shutdown { reply } => {
                self.shutdown_reply = Some(reply);
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn connect(&mut self, reply: oneshot::Sender<(SessionId, mpsc::Receiver<Bytes>)>) {
        let id = SessionId::new();
        let outbound = self.sessions.add_session(id);
        // Queued first, so it precedes any relayed delta.
        match SyncMessage::sync(&self.replica.encode_full_state()).encode_frame() {
            Ok(frame) => {
                self.sessions.send_to(&id, frame);
            }
            Err(e) => log::error!("failed to encode sync for session {id}: {e}"),
        }
        if reply.send((id, outbound)).is_err() {
            self.sessions.remove_session(&id);
            self.touch_idle();
            return;
        }
        self.idle_since = None;
        log::info!(
            "session {id} joined {} ({} open)",
            self.document_id.room_name(),
            self.sessions.len()
        );
    }

    async fn handle_message(&mut self, session: SessionId, frame: Bytes) {
        let msg = match SyncMessage::decode(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                self.messages_dropped += 1;
                log::warn!("dropping malformed message from session {session}: {e}");
                return;
            }
        };
        match msg {
            SyncMessage::Update { data } => {
                let delta = Delta::from_bytes(data);
                if let Err(e) = self.replica.apply_remote_delta(&delta) {
                    self.messages_dropped += 1;
                    log::warn!("dropping update from session {session}: {e}");
                    return;
                }
                self.updates_applied += 1;
                if self.persistence.dirty_since.is_none() {
                    self.persistence.dirty_since = Some(Instant::now());
                }
                if self.config.snapshot_debounce.is_zero()
                    && self.persistence.loaded
                    && self.persistence.next_attempt.is_none()
                {
                    let _ = self.flush().await;
                }
                self.relay(session, &frame);
            }
            SyncMessage::Cursor(_) | SyncMessage::Awareness { .. } => {
                log::trace!("relaying {} from session {session}", msg.kind());
                self.relay(session, &frame);
            }
            SyncMessage::Sync { .. } => {
                self.messages_dropped += 1;
                log::warn!("session {session} sent a sync message, ignoring");
            }
        }
    }

    fn relay(&mut self, from: SessionId, frame: &Bytes) {
        let outcome = self.sessions.broadcast_except(Some(&from), frame);
        if !outcome.evicted.is_empty() {
            for id in &outcome.evicted {
                log::info!("session {id} evicted from {}", self.document_id.room_name());
            }
            self.touch_idle();
        }
    }

    /// Write the snapshot if the replica moved past the persisted version.
    async fn flush(&mut self) -> Result<(), StoreError> {
        let version = self.replica.version();
        if self.persistence.persisted.as_ref() == Some(&version) {
            self.persistence.dirty_since = None;
            return Ok(());
        }
        let snapshot = self.replica.encode_full_state().into_bytes();
        match storage::save_snapshot(&self.store, &self.document_id, snapshot).await {
            Ok(()) => {
                let p = &mut self.persistence;
                if p.degraded {
                    log::info!("{} persistence recovered", self.document_id.room_name());
                }
                log::debug!("{} persisted version {version}", self.document_id.room_name());
                p.persisted = Some(version);
                p.dirty_since = None;
                p.degraded = false;
                p.next_attempt = None;
                p.retry.reset();
                Ok(())
            }
            Err(e) => {
                self.persistence.failures += 1;
                self.persistence.degraded = true;
                let delay = self.schedule_retry();
                log::warn!(
                    "{}: snapshot write failed, retrying in {delay:?}: {e}",
                    self.document_id.room_name()
                );
                Err(e)
            }
        }
    }

    async fn retry_load(&mut self) {
        match storage::load_snapshot(&self.store, &self.document_id).await {
            Ok(stored) => {
                log::info!("{} snapshot storage available again", self.document_id.room_name());
                self.apply_stored(stored);
            }
            Err(e) => {
                self.persistence.failures += 1;
                let delay = self.schedule_retry();
                log::warn!(
                    "{}: snapshot load failed, retrying in {delay:?}: {e}",
                    self.document_id.room_name()
                );
            }
        }
    }

    async fn on_timer(&mut self) -> Flow {
        let now = Instant::now();
        let retry_due = self.persistence.next_attempt.map_or(true, |t| t <= now);
        if !self.persistence.loaded {
            if retry_due {
                self.retry_load().await;
            }
        } else if let Some(since) = self.persistence.dirty_since {
            if retry_due && since + self.config.snapshot_debounce <= now {
                let _ = self.flush().await;
            }
        }

        if self.idle_expired(Instant::now()) {
            log::info!("{} idle, shutting down", self.document_id.room_name());
            return Flow::Stop;
        }
        Flow::Continue
    }

    fn next_deadline(&self) -> Option<Instant> {
        let p = &self.persistence;
        let flush = match (p.loaded, p.dirty_since) {
            (true, Some(since)) => {
                let due = since + self.config.snapshot_debounce;
                Some(p.next_attempt.map_or(due, |retry| retry.max(due)))
            }
            _ => None,
        };
        let load = if p.loaded { None } else { p.next_attempt };
        let idle = if self.sessions.is_empty() && p.dirty_since.is_none() {
            self.idle_since.map(|t| t + self.config.idle_shutdown)
        } else {
            None
        };
        [flush, load, idle].into_iter().flatten().min()
    }

    fn idle_expired(&self, now: Instant) -> bool {
        self.sessions.is_empty()
            && self.persistence.dirty_since.is_none()
            && self
                .idle_since
                .is_some_and(|t| t + self.config.idle_shutdown <= now)
    }

    fn touch_idle(&mut self) {
        if self.sessions.is_empty() && self.idle_since.is_none() {
            self.idle_since = Some(Instant::now());
        }
    }

    fn schedule_retry(&mut self) -> Duration {
        let delay = self.persistence.retry.next_delay();
        self.persistence.next_attempt = Some(Instant::now() + delay);
        delay
    }

    fn health(&self) -> RoomHealth {
        match self.lifecycle {
            Lifecycle::Initializing => RoomHealth::Initializing,
            Lifecycle::Ready if self.persistence.degraded => RoomHealth::Degraded,
            Lifecycle::Ready => RoomHealth::Ready,
        }
    }

    fn info(&self) -> RoomInfo {
        RoomInfo {
            document_id: self.document_id.to_string(),
            room: self.document_id.room_name(),
            active: true,
            sessions: self.sessions.len(),
            health: self.health(),
            updates_applied: self.updates_applied,
            messages_dropped: self.messages_dropped,
            sessions_evicted: self.sessions.stats().sessions_evicted,
            persist_failures: self.persistence.failures,
            persisted_version: self.persistence.persisted.as_ref().map(|v| v.to_string()),
            dirty: self.persistence.dirty_since.is_some(),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
