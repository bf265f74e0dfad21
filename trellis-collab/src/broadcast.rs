//! Per-room fan-out to N-1 sessions.
//!
//! Each session owns a bounded outbound queue. Broadcasting pushes one
//! shared frame into every other queue with `try_send`, so a single slow or
//! dead connection never stalls delivery to the rest:
//!
//! ```text
//!                   ┌──► [q: s1] ──► writer s1
//! frame (Bytes) ────┼──► [q: s2] ──► writer s2      full/closed queue
//!   (sender s3      └──► [q: s4] ──X evicted  ◄──── => session dropped
//!    skipped)
//! ```
//!
//! A session whose queue is full or whose receiver is gone is evicted:
//! its sender is dropped, which ends the writer task and closes the socket.
//! The group is owned by the room actor, so no locking is involved.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifier of one live connection to a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell sessions apart in logs.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// Counters for one broadcast group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Frames queued to some session.
    pub frames_delivered: u64,
    pub sessions_evicted: u64,
    pub active_sessions: usize,
}

/// Result of one fan-out.
#[derive(Debug, Default)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub evicted: Vec<SessionId>,
}

pub struct BroadcastGroup {
    sessions: HashMap<SessionId, mpsc::Sender<Bytes>>,
    capacity: usize,
    frames_delivered: u64,
    sessions_evicted: u64,
}

impl BroadcastGroup {
    /// `capacity` frames may be queued per session before it counts as slow.
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            capacity: capacity.max(1),
            frames_delivered: 0,
            sessions_evicted: 0,
        }
    }

    /// Register a session and return the receiving end of its queue.
    pub fn add_session(&mut self, id: SessionId) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.sessions.insert(id, tx);
        rx
    }

    pub fn remove_session(&mut self, id: &SessionId) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Queue a frame for one session. Evicts it on failure.
    pub fn send_to(&mut self, id: &SessionId, frame: Bytes) -> bool {
        let Some(tx) = self.sessions.get(id) else {
            return false;
        };
        if tx.try_send(frame).is_ok() {
            self.frames_delivered += 1;
            true
        } else {
            self.evict(id);
            false
        }
    }

    /// Queue a frame for every session except `sender`.
    pub fn broadcast_except(
        &mut self,
        sender: Option<&SessionId>,
        frame: &Bytes,
    ) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();
        for (id, tx) in &self.sessions {
            if Some(id) == sender {
                continue;
            }
            match tx.try_send(frame.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("session {id} outbound queue full, evicting");
                    outcome.evicted.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("session {id} writer gone, evicting");
                    outcome.evicted.push(*id);
                }
            }
        }
        for id in &outcome.evicted {
            self.evict(id);
        }
        self.frames_delivered += outcome.delivered as u64;
        outcome
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop every session, closing their queues.
    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_delivered: self.frames_delivered,
            sessions_evicted: self.sessions_evicted,
            active_sessions: self.sessions.len(),
        }
    }

    fn evict(&mut self, id: &SessionId) {
        if self.sessions.remove(id).is_some() {
            self.sessions_evicted += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(b: &[u8]) -> Bytes {
        Bytes::copy_from_slice(b)
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let mut group = BroadcastGroup::new(8);
        let (a, b, c) = (SessionId::new(), SessionId::new(), SessionId::new());
        let mut ra = group.add_session(a);
        let mut rb = group.add_session(b);
        let mut rc = group.add_session(c);

        let outcome = group.broadcast_except(Some(&a), &frame(b"delta"));
        assert_eq!(outcome.delivered, 2);
        assert!(outcome.evicted.is_empty());
        assert!(ra.try_recv().is_err());
        assert_eq!(rb.try_recv().unwrap(), frame(b"delta"));
        assert_eq!(rc.try_recv().unwrap(), frame(b"delta"));
    }

    #[test]
    fn test_full_queue_evicts_only_slow_session() {
        let mut group = BroadcastGroup::new(2);
        let (fast, slow) = (SessionId::new(), SessionId::new());
        let mut rf = group.add_session(fast);
        let _rs = group.add_session(slow);

        for i in 0..3u8 {
            group.broadcast_except(None, &frame(&[i]));
            // The fast reader keeps up.
            assert_eq!(rf.try_recv().unwrap(), frame(&[i]));
        }

        assert!(group.contains(&fast));
        assert!(!group.contains(&slow));
        assert_eq!(group.stats().sessions_evicted, 1);
    }

    #[test]
    fn test_closed_receiver_evicted() {
        let mut group = BroadcastGroup::new(4);
        let gone = SessionId::new();
        drop(group.add_session(gone));
        let live = SessionId::new();
        let _rl = group.add_session(live);

        let outcome = group.broadcast_except(None, &frame(b"x"));
        assert_eq!(outcome.evicted, vec![gone]);
        assert_eq!(group.len(), 1);
        assert!(!group.send_to(&gone, frame(b"y")));
    }

    #[test]
    fn test_send_to_and_clear() {
        let mut group = BroadcastGroup::new(4);
        let id = SessionId::new();
        let mut rx = group.add_session(id);
        assert!(group.send_to(&id, frame(b"sync")));
        assert_eq!(rx.try_recv().unwrap(), frame(b"sync"));

        group.clear();
        assert!(group.is_empty());
        // Sender dropped: the writer side observes the end of the stream.
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }
}
