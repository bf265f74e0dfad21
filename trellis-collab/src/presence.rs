//! Ephemeral per-user awareness: who is here, where their cursor is, what
//! they are doing.
//!
//! ```text
//! publish() / update_cursor() / heartbeat()
//!       │
//!       ▼
//! outbound queue ── SyncMessage::{Awareness, Cursor} ──▶ room ──▶ peers
//!
//! peers ──▶ room ──▶ handle_remote() / handle_cursor()
//!                          │
//!                          ▼
//!                   peer table ──▶ PresenceEvent listeners
//! ```
//!
//! Records are last-write-wins per user and never touch document content.
//! A record disappears when its owner sends a leave, when nothing was heard
//! from it for `ttl`, or when the local transport drops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::listeners::{Listeners, Subscription};
use crate::protocol::{CursorPayload, ProtocolError, SyncMessage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessRecord {
    pub user_id: String,
    pub user_name: String,
    pub color: String,
    pub avatar: Option<String>,
    /// Block that currently has focus.
    pub block_id: Option<String>,
    pub cursor: Option<u64>,
    pub is_editing: bool,
    pub is_typing: bool,
    /// Route the user is looking at.
    pub path: Option<String>,
}

impl AwarenessRecord {
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
            block_id: None,
            cursor: None,
            is_editing: false,
            is_typing: false,
            path: None,
        }
    }

    fn apply_cursor(&mut self, payload: &CursorPayload) {
        self.user_name = payload.user_name.clone();
        self.color = payload.color.clone();
        self.avatar = payload.avatar.clone();
        self.block_id = payload.block_id.clone();
        self.cursor = Some(payload.position);
    }
}

/// Body of `SyncMessage::Awareness`. A `None` state is an explicit leave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub user_id: String,
    pub session: Uuid,
    pub clock: u64,
    pub state: Option<AwarenessRecord>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (update, read) = bincode::serde::decode_from_slice::<AwarenessUpdate, _>(
            bytes,
            bincode::config::standard(),
        )
        .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::TrailingBytes(bytes.len() - read));
        }
        Ok(update)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// The peer announced it was leaving.
    Left,
    /// Nothing was heard from the peer within the TTL.
    Expired,
    /// Our own connection dropped.
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Updated(AwarenessRecord),
    Removed { user_id: String, reason: RemovalReason },
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// How often the local record is re-announced.
    pub heartbeat: Duration,
    /// Peers silent for longer than this are dropped.
    pub ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(10),
            ttl: Duration::from_secs(30),
        }
    }
}

impl PresenceConfig {
    pub fn for_testing() -> Self {
        Self {
            heartbeat: Duration::from_millis(50),
            ttl: Duration::from_millis(200),
        }
    }
}

struct PeerEntry {
    record: AwarenessRecord,
    session: Uuid,
    clock: u64,
    last_seen: Instant,
}

#[derive(Default)]
struct State {
    local: Option<AwarenessRecord>,
    clock: u64,
    peers: HashMap<String, PeerEntry>,
}

struct Inner {
    session: Uuid,
    config: PresenceConfig,
    state: Mutex<State>,
    outbound: mpsc::UnboundedSender<SyncMessage>,
    listeners: Listeners<PresenceEvent>,
}

/// Local awareness state plus the table of remote peers.
///
/// Outgoing messages are queued on the receiver returned by
/// [`PresenceChannel::new`]; the sync provider drains it onto the socket.
#[derive(Clone)]
pub struct PresenceChannel {
    inner: Arc<Inner>,
}

impl PresenceChannel {
    pub fn new(config: PresenceConfig) -> (Self, mpsc::UnboundedReceiver<SyncMessage>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let channel = Self {
            inner: Arc::new(Inner {
                session: Uuid::new_v4(),
                config,
                state: Mutex::new(State::default()),
                outbound,
                listeners: Listeners::new(),
            }),
        };
        (channel, rx)
    }

    pub fn session(&self) -> Uuid {
        self.inner.session
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.inner.config
    }

    /// Replace the local record and announce it.
    pub fn publish(&self, record: AwarenessRecord) {
        let mut state = self.inner.state.lock();
        state.local = Some(record);
        self.announce(&mut state);
    }

    /// Move the local cursor. Returns false if nothing was published yet.
    pub fn update_cursor(&self, position: u64, block_id: Option<String>) -> bool {
        let payload = {
            let mut state = self.inner.state.lock();
            let Some(local) = state.local.as_mut() else {
                return false;
            };
            local.cursor = Some(position);
            local.block_id = block_id.clone();
            CursorPayload {
                user_id: local.user_id.clone(),
                user_name: local.user_name.clone(),
                color: local.color.clone(),
                avatar: local.avatar.clone(),
                block_id,
                position,
            }
        };
        self.send(SyncMessage::cursor(payload));
        true
    }

    /// Withdraw the local record.
    pub fn leave(&self) {
        let mut state = self.inner.state.lock();
        let Some(local) = state.local.take() else {
            return;
        };
        state.clock += 1;
        let update = AwarenessUpdate {
            user_id: local.user_id,
            session: self.inner.session,
            clock: state.clock,
            state: None,
        };
        drop(state);
        self.send_update(&update);
    }

    /// Re-announce the local record so peers keep it alive.
    pub fn heartbeat(&self) {
        let mut state = self.inner.state.lock();
        if state.local.is_some() {
            self.announce(&mut state);
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PresenceEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.add(callback)
    }

    pub fn clear_listeners(&self) {
        self.inner.listeners.clear();
    }

    pub fn local(&self) -> Option<AwarenessRecord> {
        self.inner.state.lock().local.clone()
    }

    /// Remote records, ordered by user id.
    pub fn peers(&self) -> Vec<AwarenessRecord> {
        let state = self.inner.state.lock();
        let mut peers: Vec<AwarenessRecord> =
            state.peers.values().map(|p| p.record.clone()).collect();
        peers.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        peers
    }

    pub fn peer(&self, user_id: &str) -> Option<AwarenessRecord> {
        self.inner.state.lock().peers.get(user_id).map(|p| p.record.clone())
    }

    /// Apply an inbound `awareness` payload.
    pub fn handle_remote(&self, data: &[u8]) -> Result<(), ProtocolError> {
        let update = AwarenessUpdate::decode(data)?;
        if update.session == self.inner.session {
            return Ok(());
        }

        let event = {
            let mut state = self.inner.state.lock();
            let existing = state.peers.get(&update.user_id);
            match update.state {
                Some(record) => {
                    let fresh = existing
                        .map_or(true, |p| p.session != update.session || update.clock > p.clock);
                    let unknown = existing.map_or(true, |p| p.session != update.session);
                    if !fresh {
                        log::trace!(
                            "stale awareness from {} (clock {})",
                            update.user_id,
                            update.clock
                        );
                        return Ok(());
                    }
                    state.peers.insert(
                        update.user_id.clone(),
                        PeerEntry {
                            record: record.clone(),
                            session: update.session,
                            clock: update.clock,
                            last_seen: Instant::now(),
                        },
                    );
                    // Answer a session we have not heard from so it sees us
                    // without waiting for the next heartbeat.
                    if unknown {
                        self.announce(&mut state);
                    }
                    PresenceEvent::Updated(record)
                }
                None => {
                    // A leave only withdraws the session that sent it. Records
                    // known only from cursor messages have no session yet.
                    let owned = existing.is_some_and(|p| {
                        p.session.is_nil()
                            || (p.session == update.session && update.clock > p.clock)
                    });
                    if !owned {
                        return Ok(());
                    }
                    state.peers.remove(&update.user_id);
                    PresenceEvent::Removed { user_id: update.user_id, reason: RemovalReason::Left }
                }
            }
        };
        self.inner.listeners.emit(&event);
        Ok(())
    }

    /// Apply an inbound `cursor` message.
    pub fn handle_cursor(&self, payload: &CursorPayload) {
        let record = {
            let mut state = self.inner.state.lock();
            if state.local.as_ref().is_some_and(|l| l.user_id == payload.user_id) {
                return;
            }
            let entry = state.peers.entry(payload.user_id.clone()).or_insert_with(|| PeerEntry {
                record: AwarenessRecord::new(
                    payload.user_id.clone(),
                    payload.user_name.clone(),
                    payload.color.clone(),
                ),
                session: Uuid::nil(),
                clock: 0,
                last_seen: Instant::now(),
            });
            entry.record.apply_cursor(payload);
            entry.last_seen = Instant::now();
            entry.record.clone()
        };
        self.inner.listeners.emit(&PresenceEvent::Updated(record));
    }

    /// Drop peers not heard from within the TTL. Returns their user ids.
    pub fn expire_stale(&self) -> Vec<String> {
        self.expire_stale_at(Instant::now())
    }

    pub fn expire_stale_at(&self, now: Instant) -> Vec<String> {
        let ttl = self.inner.config.ttl;
        let expired: Vec<String> = {
            let mut state = self.inner.state.lock();
            let stale: Vec<String> = state
                .peers
                .iter()
                .filter(|(_, p)| now.saturating_duration_since(p.last_seen) > ttl)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &stale {
                state.peers.remove(id);
            }
            stale
        };
        for user_id in &expired {
            log::debug!("awareness for {user_id} expired");
            self.inner.listeners.emit(&PresenceEvent::Removed {
                user_id: user_id.clone(),
                reason: RemovalReason::Expired,
            });
        }
        expired
    }

    /// Forget every peer, e.g. after our transport dropped.
    pub fn clear_remote(&self) {
        let removed: Vec<String> =
            self.inner.state.lock().peers.drain().map(|(id, _)| id).collect();
        for user_id in removed {
            self.inner.listeners.emit(&PresenceEvent::Removed {
                user_id,
                reason: RemovalReason::Disconnected,
            });
        }
    }

    fn announce(&self, state: &mut State) {
        let Some(local) = state.local.clone() else {
            return;
        };
        state.clock += 1;
        let update = AwarenessUpdate {
            user_id: local.user_id.clone(),
            session: self.inner.session,
            clock: state.clock,
            state: Some(local),
        };
        self.send_update(&update);
    }

    fn send_update(&self, update: &AwarenessUpdate) {
        match update.encode() {
            Ok(data) => self.send(SyncMessage::awareness(data)),
            Err(e) => log::warn!("failed to encode awareness: {e}"),
        }
    }

    fn send(&self, msg: SyncMessage) {
        // No receiver means no transport; presence is best-effort.
        let _ = self.inner.outbound.send(msg);
    }
}

impl std::fmt::Debug for PresenceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceChannel")
            .field("session", &self.inner.session)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(user: &str, session: Uuid, clock: u64, state: Option<AwarenessRecord>) -> Vec<u8> {
        AwarenessUpdate { user_id: user.into(), session, clock, state }.encode().unwrap()
    }

    fn record(user: &str) -> AwarenessRecord {
        AwarenessRecord::new(user, user.to_uppercase(), "#61afef")
    }

    fn collect(channel: &PresenceChannel) -> (Subscription, Arc<Mutex<Vec<PresenceEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let sub = channel.subscribe(move |e| sink.lock().push(e.clone()));
        (sub, events)
    }

    #[test]
    fn test_publish_emits_awareness() {
        let (channel, mut rx) = PresenceChannel::new(PresenceConfig::default());
        channel.publish(record("alice"));
        channel.heartbeat();

        let mut clocks = Vec::new();
        while let Ok(SyncMessage::Awareness { data }) = rx.try_recv() {
            let update = AwarenessUpdate::decode(&data).unwrap();
            assert_eq!(update.session, channel.session());
            assert_eq!(update.state.unwrap().user_id, "alice");
            clocks.push(update.clock);
        }
        assert_eq!(clocks, vec![1, 2]);
    }

    #[test]
    fn test_heartbeat_without_record_is_silent() {
        let (channel, mut rx) = PresenceChannel::new(PresenceConfig::default());
        channel.heartbeat();
        channel.leave();
        assert!(!channel.update_cursor(3, None));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_remote_update_and_stale_clock() {
        let (channel, _rx) = PresenceChannel::new(PresenceConfig::default());
        let (_sub, events) = collect(&channel);
        let session = Uuid::new_v4();

        let mut newer = record("bob");
        newer.is_typing = true;
        channel.handle_remote(&remote("bob", session, 2, Some(newer))).unwrap();
        channel.handle_remote(&remote("bob", session, 1, Some(record("bob")))).unwrap();

        assert!(channel.peer("bob").unwrap().is_typing);
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn test_new_session_replaces_record() {
        let (channel, _rx) = PresenceChannel::new(PresenceConfig::default());
        channel.handle_remote(&remote("bob", Uuid::new_v4(), 9, Some(record("bob")))).unwrap();

        let mut reloaded = record("bob");
        reloaded.path = Some("/docs/1".into());
        channel.handle_remote(&remote("bob", Uuid::new_v4(), 1, Some(reloaded))).unwrap();
        assert_eq!(channel.peer("bob").unwrap().path.as_deref(), Some("/docs/1"));
    }

    #[test]
    fn test_own_session_ignored() {
        let (channel, _rx) = PresenceChannel::new(PresenceConfig::default());
        let data = remote("me", channel.session(), 1, Some(record("me")));
        channel.handle_remote(&data).unwrap();
        assert!(channel.peers().is_empty());
    }

    #[test]
    fn test_leave_removes_peer() {
        let (channel, _rx) = PresenceChannel::new(PresenceConfig::default());
        let (_sub, events) = collect(&channel);
        let session = Uuid::new_v4();
        channel.handle_remote(&remote("bob", session, 1, Some(record("bob")))).unwrap();
        // A leave from another session does not remove the live one.
        channel.handle_remote(&remote("bob", Uuid::new_v4(), 5, None)).unwrap();
        assert!(channel.peer("bob").is_some());

        channel.handle_remote(&remote("bob", session, 2, None)).unwrap();
        assert!(channel.peer("bob").is_none());
        assert_eq!(
            events.lock().last(),
            Some(&PresenceEvent::Removed { user_id: "bob".into(), reason: RemovalReason::Left })
        );
    }

    #[test]
    fn test_leave_removes_cursor_only_peer() {
        let (channel, _rx) = PresenceChannel::new(PresenceConfig::default());
        let payload = CursorPayload {
            user_id: "carol".into(),
            user_name: "Carol".into(),
            color: "#e5c07b".into(),
            avatar: None,
            block_id: None,
            position: 3,
        };
        channel.handle_cursor(&payload);
        assert!(channel.peer("carol").is_some());

        channel.handle_remote(&remote("carol", Uuid::new_v4(), 1, None)).unwrap();
        assert!(channel.peer("carol").is_none());
    }

    #[test]
    fn test_new_peer_gets_reannouncement() {
        let (channel, mut rx) = PresenceChannel::new(PresenceConfig::default());
        channel.publish(record("alice"));
        assert!(rx.try_recv().is_ok());

        let session = Uuid::new_v4();
        channel.handle_remote(&remote("bob", session, 1, Some(record("bob")))).unwrap();
        let Ok(SyncMessage::Awareness { data }) = rx.try_recv() else {
            panic!("expected a re-announcement");
        };
        let update = AwarenessUpdate::decode(&data).unwrap();
        assert_eq!(update.state.unwrap().user_id, "alice");
        assert_eq!(update.clock, 2);

        // Known sessions do not trigger another one.
        channel.handle_remote(&remote("bob", session, 2, Some(record("bob")))).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_ttl_expiry() {
        let (channel, _rx) = PresenceChannel::new(PresenceConfig::for_testing());
        channel.handle_remote(&remote("bob", Uuid::new_v4(), 1, Some(record("bob")))).unwrap();

        assert!(channel.expire_stale().is_empty());
        let later = Instant::now() + Duration::from_millis(250);
        assert_eq!(channel.expire_stale_at(later), vec!["bob".to_string()]);
        assert!(channel.peers().is_empty());
    }

    #[test]
    fn test_cursor_creates_and_refreshes_record() {
        let (channel, _rx) = PresenceChannel::new(PresenceConfig::default());
        let payload = CursorPayload {
            user_id: "carol".into(),
            user_name: "Carol".into(),
            color: "#e5c07b".into(),
            avatar: None,
            block_id: Some("b1".into()),
            position: 7,
        };
        channel.handle_cursor(&payload);
        channel.handle_cursor(&CursorPayload { position: 9, ..payload });

        let peer = channel.peer("carol").unwrap();
        assert_eq!(peer.cursor, Some(9));
        assert_eq!(peer.block_id.as_deref(), Some("b1"));
    }

    #[test]
    fn test_update_cursor_emits_cursor_message() {
        let (channel, mut rx) = PresenceChannel::new(PresenceConfig::default());
        channel.publish(record("alice"));
        let _ = rx.try_recv();

        assert!(channel.update_cursor(12, Some("intro".into())));
        match rx.try_recv().unwrap() {
            SyncMessage::Cursor(c) => {
                assert_eq!(c.user_id, "alice");
                assert_eq!(c.position, 12);
            }
            other => panic!("expected cursor, got {other:?}"),
        }
        assert_eq!(channel.local().unwrap().cursor, Some(12));
    }

    #[test]
    fn test_clear_remote_reports_disconnected() {
        let (channel, _rx) = PresenceChannel::new(PresenceConfig::default());
        let (sub, events) = collect(&channel);
        channel.handle_remote(&remote("bob", Uuid::new_v4(), 1, Some(record("bob")))).unwrap();
        channel.clear_remote();

        assert!(channel.peers().is_empty());
        assert!(matches!(
            events.lock().last(),
            Some(PresenceEvent::Removed { reason: RemovalReason::Disconnected, .. })
        ));

        sub.unsubscribe();
        channel.handle_remote(&remote("dan", Uuid::new_v4(), 1, Some(record("dan")))).unwrap();
        assert_eq!(events.lock().len(), 2);
    }

    #[test]
    fn test_malformed_awareness_rejected() {
        let (channel, _rx) = PresenceChannel::new(PresenceConfig::default());
        assert!(channel.handle_remote(&[0xFF, 0xFF, 0xFF]).is_err());
    }
}
