//! Local durable mirror of a client replica.
//!
//! Opening a handle replays the stored log into the replica before any
//! network traffic, then keeps the log current from a single writer task:
//!
//! ```text
//! SharedDocument ── DocumentUpdate ──▶ writer task ──▶ LocalStore::append
//!                                          │
//!                                          └─ every `compact_after` appends:
//!                                             LocalStore::replace(full state)
//! ```
//!
//! Writes never block editing. A failed write flips the status to `Error`
//! and leaves the log missing a change that later deltas build on, so the
//! writer falls back to full-state replaces until one succeeds. Only then
//! does the status return to `Synced`. Clearing the log does the same: the
//! next write re-seeds it from the live replica.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::document::Delta;
use crate::listeners::{Listeners, Subscription};
use crate::shared::{DocumentUpdate, SharedDocument, UpdateOrigin};
use crate::storage::local::{
    append_entry, clear_entries, load_entries, replace_entries, validate_key, LocalStore,
};
use crate::storage::StoreError;

#[derive(Debug, Clone)]
pub struct OfflineConfig {
    /// Store keys are `<key_prefix>-<document id>`.
    pub key_prefix: String,
    /// Appends between two compactions of the log into a single full state.
    pub compact_after: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            key_prefix: "trellis-doc".to_string(),
            compact_after: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfflineStatus {
    Syncing,
    Synced,
    Error(String),
}

enum Control {
    Clear(oneshot::Sender<Result<(), StoreError>>),
}

#[derive(Clone)]
struct StatusCell {
    tx: Arc<watch::Sender<OfflineStatus>>,
    listeners: Listeners<OfflineStatus>,
}

impl StatusCell {
    fn set(&self, status: OfflineStatus) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status.clone();
                true
            }
        });
        if changed {
            self.listeners.emit(&status);
        }
    }
}

/// Scoped link between one [`SharedDocument`] and its local log.
///
/// Dropping the handle stops the writer after it drains queued updates;
/// [`OfflineHandle::close`] does the same and waits for it.
pub struct OfflineHandle {
    key: String,
    status: StatusCell,
    status_rx: watch::Receiver<OfflineStatus>,
    control: mpsc::Sender<Control>,
    shutdown: watch::Sender<bool>,
    writer: Option<JoinHandle<()>>,
}

impl OfflineHandle {
    /// Replay stored entries into `document` and start mirroring it.
    pub async fn open(
        document: SharedDocument,
        store: Arc<dyn LocalStore>,
        config: OfflineConfig,
    ) -> Result<Self, StoreError> {
        let key = format!("{}-{}", config.key_prefix, document.document_id());
        validate_key(&key)?;

        // Subscribe first so nothing applied during replay is missed.
        let updates = document.subscribe();

        let (status_tx, status_rx) = watch::channel(OfflineStatus::Syncing);
        let status = StatusCell { tx: Arc::new(status_tx), listeners: Listeners::new() };

        let mut stored = 0;
        let mut needs_full_write = false;
        match load_entries(&store, &key).await {
            Ok(entries) => {
                stored = entries.len();
                let mut skipped = 0;
                for entry in entries {
                    let delta = Delta::from_bytes(entry);
                    if let Err(e) = document.apply_remote(&delta, UpdateOrigin::Offline) {
                        log::warn!("skipping unreadable entry in {key}: {e}");
                        skipped += 1;
                    }
                }
                log::info!(
                    "{key}: replayed {} local entries ({skipped} skipped)",
                    stored - skipped
                );
                status.set(OfflineStatus::Synced);
            }
            Err(e) => {
                log::warn!("{key}: failed to load local data: {e}");
                needs_full_write = true;
                status.set(OfflineStatus::Error(e.to_string()));
            }
        }

        let (control_tx, control_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let writer = Writer {
            key: key.clone(),
            document,
            store,
            status: status.clone(),
            compact_after: config.compact_after.max(1),
            appended: stored,
            needs_full_write,
            failed_write: false,
        };
        let task = tokio::spawn(writer.run(updates, control_rx, shutdown_rx));

        Ok(Self {
            key,
            status,
            status_rx,
            control: control_tx,
            shutdown: shutdown_tx,
            writer: Some(task),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn status(&self) -> OfflineStatus {
        self.status_rx.borrow().clone()
    }

    pub fn status_watch(&self) -> watch::Receiver<OfflineStatus> {
        self.status_rx.clone()
    }

    pub fn on_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&OfflineStatus) + Send + Sync + 'static,
    {
        self.status.listeners.add(callback)
    }

    /// Delete the stored log.
    ///
    /// Updates queued before the call are written first. The first update
    /// after it rewrites the log as the replica's full state, so edits made
    /// after a clear still survive a reload.
    pub async fn clear_local_data(&self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Clear(tx))
            .await
            .map_err(|_| StoreError::Task("offline writer stopped".into()))?;
        rx.await.map_err(|_| StoreError::Task("offline writer stopped".into()))?
    }

    /// Flush queued updates and stop the writer.
    pub async fn close(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.writer.take() {
            if let Err(e) = task.await {
                log::error!("{} writer panicked: {e}", self.key);
            }
        }
        self.status.listeners.clear();
    }
}

impl Drop for OfflineHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl std::fmt::Debug for OfflineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineHandle")
            .field("key", &self.key)
            .field("status", &*self.status_rx.borrow())
            .finish()
    }
}

struct Writer {
    key: String,
    document: SharedDocument,
    store: Arc<dyn LocalStore>,
    status: StatusCell,
    compact_after: usize,
    appended: usize,
    /// Set when the log no longer holds every change the replica has.
    needs_full_write: bool,
    /// A change was dropped by a failed write and is not stored anywhere.
    failed_write: bool,
}

impl Writer {
    async fn run(
        mut self,
        mut updates: mpsc::UnboundedReceiver<DocumentUpdate>,
        mut control: mpsc::Receiver<Control>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                update = updates.recv() => match update {
                    Some(update) => self.write(update).await,
                    None => break,
                },
                Some(cmd) = control.recv() => match cmd {
                    Control::Clear(reply) => {
                        while let Ok(update) = updates.try_recv() {
                            self.write(update).await;
                        }
                        let result = clear_entries(&self.store, &self.key).await;
                        if result.is_ok() {
                            self.appended = 0;
                            self.needs_full_write = true;
                            log::info!("{}: local data cleared", self.key);
                        }
                        let _ = reply.send(result);
                    }
                },
                _ = shutdown.changed() => {
                    while let Ok(update) = updates.try_recv() {
                        self.write(update).await;
                    }
                    if self.failed_write {
                        self.write_full_state().await;
                    }
                    break;
                }
            }
        }
        log::debug!("{}: offline writer stopped", self.key);
    }

    async fn write(&mut self, update: DocumentUpdate) {
        if update.origin == UpdateOrigin::Offline {
            return;
        }
        if self.needs_full_write || self.appended + 1 >= self.compact_after {
            self.write_full_state().await;
            return;
        }

        match append_entry(&self.store, &self.key, update.delta.into_bytes()).await {
            Ok(()) => {
                self.appended += 1;
                self.status.set(OfflineStatus::Synced);
            }
            Err(e) => self.fail(e),
        }
    }

    async fn write_full_state(&mut self) {
        let full = self.document.encode_full_state();
        match replace_entries(&self.store, &self.key, full.into_bytes()).await {
            Ok(()) => {
                log::debug!("{}: rewrote local log from full state", self.key);
                self.appended = 1;
                self.needs_full_write = false;
                self.failed_write = false;
                self.status.set(OfflineStatus::Synced);
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, e: StoreError) {
        log::warn!("{}: local write failed: {e}", self.key);
        self.needs_full_write = true;
        self.failed_write = true;
        self.status.set(OfflineStatus::Error(e.to_string()));
    }
}
