//! Wire envelope exchanged between providers and rooms.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded
//! [`SyncMessage`]:
//! ```text
//! ┌─────────────┬──────────────────────────────────────────────┐
//! │ variant tag │ body                                         │
//! │ varint      │ sync/update/awareness: len-prefixed bytes    │
//! │             │ cursor: CursorPayload fields                 │
//! └─────────────┴──────────────────────────────────────────────┘
//! ```
//! Decoding is strict: unknown tags and trailing bytes are rejected, so a
//! frame is either fully understood or dropped.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::document::Delta;

/// Relay-only cursor position of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPayload {
    pub user_id: String,
    pub user_name: String,
    /// CSS color string, e.g. `#e06c75`.
    pub color: String,
    pub avatar: Option<String>,
    pub block_id: Option<String>,
    /// Offset in the document body.
    pub position: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Full state, sent by a room to a session right after it connects.
    Sync { data: Vec<u8> },
    /// A delta, in either direction.
    Update { data: Vec<u8> },
    Cursor(CursorPayload),
    /// Opaque awareness blob, relayed verbatim.
    Awareness { data: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Sync,
    Update,
    Cursor,
    Awareness,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageKind::Sync => "sync",
            MessageKind::Update => "update",
            MessageKind::Cursor => "cursor",
            MessageKind::Awareness => "awareness",
        })
    }
}

impl SyncMessage {
    pub fn sync(full_state: &Delta) -> Self {
        SyncMessage::Sync { data: full_state.as_bytes().to_vec() }
    }

    pub fn update(delta: &Delta) -> Self {
        SyncMessage::Update { data: delta.as_bytes().to_vec() }
    }

    pub fn cursor(payload: CursorPayload) -> Self {
        SyncMessage::Cursor(payload)
    }

    pub fn awareness(data: Vec<u8>) -> Self {
        SyncMessage::Awareness { data }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            SyncMessage::Sync { .. } => MessageKind::Sync,
            SyncMessage::Update { .. } => MessageKind::Update,
            SyncMessage::Cursor(_) => MessageKind::Cursor,
            SyncMessage::Awareness { .. } => MessageKind::Awareness,
        }
    }

    /// Ephemeral messages that a room forwards without inspecting.
    pub fn is_relay_only(&self) -> bool {
        matches!(self, SyncMessage::Cursor(_) | SyncMessage::Awareness { .. })
    }

    /// The carried delta for `sync` and `update` messages.
    pub fn delta(&self) -> Option<Delta> {
        match self {
            SyncMessage::Sync { data } | SyncMessage::Update { data } => {
                Some(Delta::from_bytes(data.clone()))
            }
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn encode_frame(&self) -> Result<Bytes, ProtocolError> {
        self.encode().map(Bytes::from)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, read) =
            bincode::serde::decode_from_slice::<SyncMessage, _>(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::TrailingBytes(bytes.len() - read));
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor() -> CursorPayload {
        CursorPayload {
            user_id: "u-1".into(),
            user_name: "Ada".into(),
            color: "#e06c75".into(),
            avatar: None,
            block_id: Some("block-7".into()),
            position: 42,
        }
    }

    #[test]
    fn test_every_variant_decodes() {
        let messages = [
            SyncMessage::Sync { data: vec![1, 2, 3] },
            SyncMessage::Update { data: vec![9; 300] },
            SyncMessage::cursor(cursor()),
            SyncMessage::awareness(Vec::new()),
        ];
        for msg in messages {
            let bytes = msg.encode().unwrap();
            assert_eq!(SyncMessage::decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = SyncMessage::decode(&[7, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn test_truncated_and_trailing_rejected() {
        let bytes = SyncMessage::Update { data: vec![5; 16] }.encode().unwrap();
        assert!(SyncMessage::decode(&bytes[..bytes.len() - 1]).is_err());

        let mut extra = bytes.clone();
        extra.push(0);
        assert_eq!(SyncMessage::decode(&extra), Err(ProtocolError::TrailingBytes(1)));
        assert!(SyncMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_kind_and_relay() {
        assert_eq!(SyncMessage::cursor(cursor()).kind().to_string(), "cursor");
        assert!(SyncMessage::awareness(vec![1]).is_relay_only());
        assert!(!SyncMessage::Update { data: vec![] }.is_relay_only());
        assert!(SyncMessage::cursor(cursor()).delta().is_none());
        assert_eq!(
            SyncMessage::Update { data: vec![4, 2] }.delta().unwrap().as_bytes(),
            &[4, 2]
        );
    }
}
