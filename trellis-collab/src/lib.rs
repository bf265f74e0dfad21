//! # trellis-collab: real-time collaborative document sync
//!
//! Replicated rich-text documents edited concurrently by many clients,
//! relayed through one coordination actor per document, with presence and
//! offline editing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket, bincode   ┌──────────────────┐
//! │ SyncProvider │ ◄────────────────────► │ SyncServer (axum)│
//! │ (per client) │   sync/update/         └────────┬─────────┘
//! └──┬────────┬──┘   cursor/awareness              │
//!    │        │                           ┌────────▼─────────┐
//!    ▼        ▼                           │ RoomRegistry     │
//! Shared   Presence                       │  room:<id> ──────┼──► RoomActor
//! Document Channel                        └──────────────────┘      │
//!    │                                                    ┌─────────┼──────────┐
//!    ▼                                                    ▼         ▼          ▼
//! OfflineHandle ──► LocalStore                      Replica  BroadcastGroup  SnapshotStore
//! ```
//!
//! ## Modules
//!
//! - [`document`]: CRDT replica, deltas, versions
//! - [`shared`]: thread-safe replica handle with update notification
//! - [`protocol`]: wire envelope
//! - [`broadcast`]: per-session bounded fan-out
//! - [`room`] / [`registry`]: per-document actors
//! - [`server`]: HTTP and WebSocket endpoints
//! - [`client`]: reconnecting sync provider
//! - [`presence`]: ephemeral awareness
//! - [`offline`]: client-side durable mirror
//! - [`storage`]: snapshot and local log backends

pub mod backoff;
pub mod broadcast;
pub mod client;
pub mod document;
pub mod listeners;
pub mod offline;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod shared;
pub mod storage;

pub use backoff::{Backoff, BackoffConfig};
pub use broadcast::{BroadcastGroup, BroadcastStats, SessionId};
pub use client::{ClientError, ConnectionStatus, Identity, ProviderConfig, SyncProvider};
pub use document::{
    Delta, DocumentContent, DocumentError, DocumentId, DocumentReplica, EditOp, ReplicaId,
    TextField, Version,
};
pub use listeners::{Listeners, Subscription};
pub use offline::{OfflineConfig, OfflineHandle, OfflineStatus};
pub use presence::{
    AwarenessRecord, AwarenessUpdate, PresenceChannel, PresenceConfig, PresenceEvent,
    RemovalReason,
};
pub use protocol::{CursorPayload, MessageKind, ProtocolError, SyncMessage};
pub use registry::RoomRegistry;
pub use room::{
    RoomConfig, RoomError, RoomHandle, RoomHealth, RoomInfo, SessionGuard, SessionRegistration,
};
pub use server::{RunningServer, ServerConfig, StorageBackend, SyncServer};
pub use shared::{DocumentUpdate, SharedDocument, UpdateOrigin};
pub use storage::{
    FileLocalStore, FileSnapshotStore, LocalStore, MemoryLocalStore, MemorySnapshotStore,
    SnapshotStore, StoreError,
};
