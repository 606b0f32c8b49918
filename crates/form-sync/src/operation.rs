//! The operation model.
//!
//! An [`Operation`] is one atomic, serializable change to a document: who made
//! it (`user`), their per-user sequence number (`seq`), a hybrid timestamp, and
//! a [`Change`] payload. `(user, seq)` is the operation's identity ([`OpId`])
//! and the reconciliation key; `(timestamp, user, seq)` is its [`Stamp`], the
//! total order last-writer-wins decisions are made with.

use crate::ids::{FieldId, RowId, UserId};
use crate::tree::{Field, FieldPatch, Placement};
use crate::wire::WireOperation;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};

/// Identity of an operation: author plus author-local sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub user: UserId,
    pub seq: u64,
}

impl Display for OpId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.user, self.seq)
    }
}

/// Position of an operation in the global last-writer-wins order.
///
/// A stamp compares greater (wins) when it has the larger timestamp; on equal
/// timestamps the *smaller* user id wins; the larger sequence number breaks
/// whatever tie remains (only possible within one user).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub timestamp: u64,
    pub user: UserId,
    pub seq: u64,
}

impl Stamp {
    pub fn wins_over(&self, other: &Stamp) -> bool {
        self > other
    }

    /// Id of the row created by the operation carrying this stamp.
    pub fn derived_row(&self) -> RowId {
        RowId::derived(self.timestamp, &self.user, self.seq)
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| other.user.cmp(&self.user))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Operation tag, as it appears in the wire `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    FieldAdd,
    FieldUpdate,
    FieldDelete,
    FieldMove,
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::FieldAdd => "field_add",
            OperationKind::FieldUpdate => "field_update",
            OperationKind::FieldDelete => "field_delete",
            OperationKind::FieldMove => "field_move",
        };
        f.write_str(name)
    }
}

/// Payload of an operation, one shape per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    FieldAdd { field: Field, placement: Placement },
    FieldUpdate { field_id: FieldId, patch: FieldPatch },
    FieldDelete { field_id: FieldId },
    FieldMove { field_id: FieldId, target: Placement },
}

impl Change {
    pub fn kind(&self) -> OperationKind {
        match self {
            Change::FieldAdd { .. } => OperationKind::FieldAdd,
            Change::FieldUpdate { .. } => OperationKind::FieldUpdate,
            Change::FieldDelete { .. } => OperationKind::FieldDelete,
            Change::FieldMove { .. } => OperationKind::FieldMove,
        }
    }

    /// The field this change targets.
    pub fn field_id(&self) -> &FieldId {
        match self {
            Change::FieldAdd { field, .. } => &field.id,
            Change::FieldUpdate { field_id, .. }
            | Change::FieldDelete { field_id }
            | Change::FieldMove { field_id, .. } => field_id,
        }
    }
}

/// One change, attributed and ordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireOperation", try_from = "WireOperation")]
pub struct Operation {
    pub user: UserId,
    pub seq: u64,
    pub timestamp: u64,
    pub change: Change,
}

impl Operation {
    pub fn new(user: UserId, seq: u64, timestamp: u64, change: Change) -> Self {
        Self {
            user,
            seq,
            timestamp,
            change,
        }
    }

    pub fn id(&self) -> OpId {
        OpId {
            user: self.user.clone(),
            seq: self.seq,
        }
    }

    pub fn stamp(&self) -> Stamp {
        Stamp {
            timestamp: self.timestamp,
            user: self.user.clone(),
            seq: self.seq,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.change.kind()
    }

    pub fn field_id(&self) -> &FieldId {
        self.change.field_id()
    }

    /// Id of the row this operation creates when it asks for a new row.
    pub fn derived_row(&self) -> RowId {
        self.stamp().derived_row()
    }

    /// Same operation with a different payload.
    pub fn with_change(&self, change: Change) -> Self {
        Self {
            change,
            ..self.clone()
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Operation serialization should not fail")
    }

    /// Parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
