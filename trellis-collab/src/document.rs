//! Replicated document engine.
//!
//! A [`DocumentReplica`] wraps an automerge document holding two text
//! sequences, `title` and `body`. Local edits produce a [`Delta`]; deltas
//! from any replica can be applied in any order, any number of times.
//!
//! ```text
//!   EditOp ──► apply_local_edit ──► Delta ──► (transport) ──► apply_remote_delta
//!                    │                                               │
//!                    ▼                                               ▼
//!              AutoCommit (actor = ReplicaId)              AutoCommit (other actor)
//! ```
//!
//! Ordering of concurrent inserts: every inserted character carries an op id
//! `(lamport counter, replica id)`. Siblings inserted after the same element
//! are ordered by descending op id, counter first and then replica id bytes.
//! Characters of one insertion chain off each other, so two concurrent runs
//! at the same position never interleave.
//!
//! Every replica starts from the same genesis change (fixed actor, time 0), so
//! the text objects have identical ids everywhere and replicas created
//! independently can still merge.

use std::fmt;
use std::str::FromStr;

use automerge::transaction::{CommitOptions, Transactable};
use automerge::{ActorId, AutoCommit, Change, ChangeHash, ObjId, ObjType, ReadDoc, Value, ROOT};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Actor used for the shared genesis change.
const GENESIS_ACTOR: [u8; 16] = [0u8; 16];

const MAX_DOCUMENT_ID_LEN: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// Delta bytes could not be parsed.
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
    /// Well-formed changes that the CRDT refused (e.g. a reused sequence number).
    #[error("merge rejected: {0}")]
    Merge(String),
    #[error("invalid edit: {0}")]
    InvalidEdit(String),
    #[error("invalid document id {0:?}")]
    InvalidDocumentId(String),
}

/// Identifier of a shared document. Safe to use as a file name or store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Result<Self, DocumentError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= MAX_DOCUMENT_ID_LEN
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(id))
        } else {
            Err(DocumentError::InvalidDocumentId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable address of the room that owns this document.
    pub fn room_name(&self) -> String {
        format!("room:{}", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DocumentId {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for DocumentId {
    type Error = DocumentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DocumentId> for String {
    fn from(id: DocumentId) -> Self {
        id.0
    }
}

/// Identity of one replica instance. Also the CRDT actor id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    fn actor(&self) -> ActorId {
        ActorId::from(self.0)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The text fields of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextField {
    Title,
    Body,
}

impl TextField {
    pub const ALL: [TextField; 2] = [TextField::Title, TextField::Body];

    pub fn key(&self) -> &'static str {
        match self {
            TextField::Title => "title",
            TextField::Body => "body",
        }
    }
}

/// A local mutation. Indices count Unicode scalar values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOp {
    Insert { field: TextField, index: usize, text: String },
    Delete { field: TextField, index: usize, len: usize },
    /// Replace the whole field, diffing against the current value.
    Replace { field: TextField, text: String },
}

impl EditOp {
    pub fn insert(field: TextField, index: usize, text: impl Into<String>) -> Self {
        EditOp::Insert { field, index, text: text.into() }
    }

    pub fn delete(field: TextField, index: usize, len: usize) -> Self {
        EditOp::Delete { field, index, len }
    }

    pub fn replace(field: TextField, text: impl Into<String>) -> Self {
        EditOp::Replace { field, text: text.into() }
    }

    pub fn field(&self) -> TextField {
        match self {
            EditOp::Insert { field, .. }
            | EditOp::Delete { field, .. }
            | EditOp::Replace { field, .. } => *field,
        }
    }
}

#[derive(Serialize, Deserialize)]
enum DeltaBody {
    /// Raw automerge changes, in causal order.
    Changes(Vec<Vec<u8>>),
    /// A full saved document.
    Snapshot(Vec<u8>),
}

/// Opaque binary update produced by a replica.
///
/// Zero-length deltas are no-ops and are never sent over the wire.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Delta {
    bytes: Vec<u8>,
}

impl Delta {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wrap received bytes. Validation happens on apply.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn encode(body: &DeltaBody) -> Result<Self, DocumentError> {
        let bytes = bincode::serde::encode_to_vec(body, bincode::config::standard())
            .map_err(|e| DocumentError::Encode(e.to_string()))?;
        Ok(Self { bytes })
    }

    fn decode(&self) -> Result<DeltaBody, DocumentError> {
        let (body, read) = bincode::serde::decode_from_slice::<DeltaBody, _>(
            &self.bytes,
            bincode::config::standard(),
        )
        .map_err(|e| DocumentError::Decode(e.to_string()))?;
        if read != self.bytes.len() {
            return Err(DocumentError::Decode(format!(
                "{} trailing bytes after delta",
                self.bytes.len() - read
            )));
        }
        Ok(body)
    }
}

impl fmt::Debug for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Delta({} bytes)", self.bytes.len())
    }
}

/// Heads of a replica. Two replicas with equal versions hold equal content.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Version(Vec<ChangeHash>);

impl Version {
    pub fn is_genesis(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("genesis");
        }
        let short: Vec<String> = self
            .0
            .iter()
            .map(|h| h.to_string().chars().take(12).collect())
            .collect();
        write!(f, "{}", short.join(","))
    }
}

/// Plain content of a document, as read by the history collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DocumentContent {
    pub title: String,
    pub body: String,
}

/// One CRDT replica of a document.
pub struct DocumentReplica {
    doc: AutoCommit,
    replica_id: ReplicaId,
    genesis: Vec<ChangeHash>,
}

impl DocumentReplica {
    pub fn new(replica_id: ReplicaId) -> Self {
        let (mut doc, genesis) = genesis_document();
        doc.set_actor(replica_id.actor());
        Self { doc, replica_id, genesis }
    }

    pub fn with_random_id() -> Self {
        Self::new(ReplicaId::random())
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Apply an edit and return the delta describing it.
    pub fn apply_local_edit(&mut self, op: &EditOp) -> Result<Delta, DocumentError> {
        let obj = self.text_object(op.field())?;
        let result = match op {
            EditOp::Insert { index, text, .. } => {
                self.check_index(&obj, *index, 0)?;
                if text.is_empty() {
                    return Ok(Delta::empty());
                }
                self.doc.splice_text(&obj, *index, 0, text)
            }
            EditOp::Delete { index, len, .. } => {
                self.check_index(&obj, *index, *len)?;
                if *len == 0 {
                    return Ok(Delta::empty());
                }
                let del = isize::try_from(*len)
                    .map_err(|_| DocumentError::InvalidEdit(format!("delete length {len}")))?;
                self.doc.splice_text(&obj, *index, del, "")
            }
            EditOp::Replace { text, .. } => self.doc.update_text(&obj, text),
        };
        if let Err(e) = result {
            self.doc.rollback();
            return Err(DocumentError::InvalidEdit(e.to_string()));
        }

        let Some(hash) = self.doc.commit_with(CommitOptions::default().with_time(now_secs()))
        else {
            return Ok(Delta::empty());
        };
        let change = self
            .doc
            .get_change_by_hash(&hash)
            .map(|c| c.raw_bytes().to_vec())
            .ok_or_else(|| DocumentError::Merge(format!("committed change {hash} not found")))?;
        Delta::encode(&DeltaBody::Changes(vec![change]))
    }

    /// Merge a delta from any replica. Duplicates are no-ops.
    pub fn apply_remote_delta(&mut self, delta: &Delta) -> Result<(), DocumentError> {
        if delta.is_empty() {
            return Ok(());
        }
        match delta.decode()? {
            DeltaBody::Changes(raw) => {
                let changes = raw
                    .into_iter()
                    .map(Change::from_bytes)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| DocumentError::Decode(e.to_string()))?;
                self.doc
                    .apply_changes(changes)
                    .map_err(|e| DocumentError::Merge(e.to_string()))
            }
            DeltaBody::Snapshot(saved) => {
                let mut other =
                    AutoCommit::load(&saved).map_err(|e| DocumentError::Decode(e.to_string()))?;
                self.doc
                    .merge(&mut other)
                    .map(|_| ())
                    .map_err(|e| DocumentError::Merge(e.to_string()))
            }
        }
    }

    /// A delta carrying the entire current state.
    ///
    /// Falls back to an empty delta, which peers treat as a no-op, if the
    /// envelope cannot be encoded.
    pub fn encode_full_state(&mut self) -> Delta {
        Delta::encode(&DeltaBody::Snapshot(self.doc.save())).unwrap_or_else(|e| {
            log::error!("replica {}: full state not encoded: {e}", self.replica_id);
            Delta::empty()
        })
    }

    pub fn content(&self) -> DocumentContent {
        DocumentContent {
            title: self.text(TextField::Title),
            body: self.text(TextField::Body),
        }
    }

    pub fn text(&self, field: TextField) -> String {
        self.text_object(field)
            .and_then(|obj| {
                self.doc
                    .text(&obj)
                    .map_err(|e| DocumentError::Merge(e.to_string()))
            })
            .unwrap_or_default()
    }

    /// Length of a field in Unicode scalar values.
    pub fn len(&self, field: TextField) -> usize {
        self.text_object(field)
            .map(|obj| self.doc.length(&obj))
            .unwrap_or(0)
    }

    /// Current heads, excluding the genesis change.
    pub fn version(&mut self) -> Version {
        let heads = self.doc.get_heads();
        if heads == self.genesis {
            Version::default()
        } else {
            Version(heads)
        }
    }

    fn text_object(&self, field: TextField) -> Result<ObjId, DocumentError> {
        match self.doc.get(ROOT, field.key()) {
            Ok(Some((Value::Object(ObjType::Text), id))) => Ok(id),
            Ok(_) => Err(DocumentError::Merge(format!(
                "field {} is missing or not text",
                field.key()
            ))),
            Err(e) => Err(DocumentError::Merge(e.to_string())),
        }
    }

    fn check_index(&self, obj: &ObjId, index: usize, len: usize) -> Result<(), DocumentError> {
        let length = self.doc.length(obj);
        match index.checked_add(len) {
            Some(end) if end <= length => Ok(()),
            _ => Err(DocumentError::InvalidEdit(format!(
                "range {index}..{} out of bounds for length {length}",
                index.saturating_add(len)
            ))),
        }
    }
}

impl fmt::Debug for DocumentReplica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentReplica")
            .field("replica_id", &self.replica_id)
            .finish_non_exhaustive()
    }
}

fn genesis_document() -> (AutoCommit, Vec<ChangeHash>) {
    let mut doc = AutoCommit::new().with_actor(ActorId::from(GENESIS_ACTOR));
    for field in TextField::ALL {
        doc.put_object(ROOT, field.key(), ObjType::Text)
            .expect("creating a text field on an empty root cannot fail");
    }
    doc.commit_with(CommitOptions::default().with_time(0));
    let heads = doc.get_heads();
    (doc, heads)
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
