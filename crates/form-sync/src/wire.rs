//! Wire format for operations.
//!
//! Every operation travels as one flat JSON object:
//!
//! ```json
//! {"type":"field_update","fieldId":"F1","userId":"alice","seq":4,"timestamp":1700000000000,"value":{"label":"Full Name"}}
//! ```
//!
//! `value` depends on `type`:
//! - `field_add`: the full field object plus `sectionId`, `rowId`, `index`;
//! - `field_update`: a partial attribute map;
//! - `field_delete`: `null`;
//! - `field_move`: `{sectionId, rowId, index}`.
//!
//! [`Operation`] serializes through [`WireOperation`], so `serde_json` on an
//! `Operation` always produces this shape.

use crate::ids::{FieldId, UserId};
use crate::operation::{Change, Operation, OperationKind};
use crate::tree::{Field, Placement};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("Malformed operation: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{kind} operation is missing fieldId")]
    MissingFieldId { kind: OperationKind },
    #[error("fieldId {envelope} does not match field {payload}")]
    FieldIdMismatch { envelope: FieldId, payload: FieldId },
    #[error("Invalid value for {kind}: {source}")]
    InvalidValue {
        kind: OperationKind,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, WireError>;

/// Flat wire representation of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOperation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    #[serde(default)]
    pub field_id: Option<FieldId>,
    pub user_id: UserId,
    pub seq: u64,
    pub timestamp: u64,
    #[serde(default)]
    pub value: Value,
}

/// `field_add` value: the field with its placement keys alongside.
#[derive(Serialize, Deserialize)]
struct AddValue {
    #[serde(flatten)]
    field: Field,
    #[serde(flatten)]
    placement: Placement,
}

impl From<Operation> for WireOperation {
    fn from(op: Operation) -> Self {
        let kind = op.kind();
        let (field_id, value) = match op.change {
            Change::FieldAdd { field, placement } => {
                let id = field.id.clone();
                (id, to_value(&AddValue { field, placement }))
            }
            Change::FieldUpdate { field_id, patch } => (field_id, to_value(&patch)),
            Change::FieldDelete { field_id } => (field_id, Value::Null),
            Change::FieldMove { field_id, target } => (field_id, to_value(&target)),
        };
        Self {
            kind,
            field_id: Some(field_id),
            user_id: op.user,
            seq: op.seq,
            timestamp: op.timestamp,
            value,
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).expect("wire value serialization should not fail")
}

fn from_value<T: for<'de> Deserialize<'de>>(kind: OperationKind, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|source| WireError::InvalidValue { kind, source })
}

impl TryFrom<WireOperation> for Operation {
    type Error = WireError;

    fn try_from(wire: WireOperation) -> Result<Self> {
        let kind = wire.kind;
        let require_id = |field_id: Option<FieldId>| field_id.ok_or(WireError::MissingFieldId { kind });

        let change = match kind {
            OperationKind::FieldAdd => {
                let AddValue { field, placement } = from_value(kind, wire.value)?;
                if let Some(envelope) = wire.field_id {
                    if envelope != field.id {
                        return Err(WireError::FieldIdMismatch {
                            envelope,
                            payload: field.id,
                        });
                    }
                }
                Change::FieldAdd { field, placement }
            }
            OperationKind::FieldUpdate => Change::FieldUpdate {
                field_id: require_id(wire.field_id)?,
                patch: from_value(kind, wire.value)?,
            },
            OperationKind::FieldDelete => Change::FieldDelete {
                field_id: require_id(wire.field_id)?,
            },
            OperationKind::FieldMove => Change::FieldMove {
                field_id: require_id(wire.field_id)?,
                target: from_value(kind, wire.value)?,
            },
        };

        Ok(Operation::new(wire.user_id, wire.seq, wire.timestamp, change))
    }
}

/// Decode one operation from JSON bytes.
pub fn decode(data: &[u8]) -> Result<Operation> {
    let wire: WireOperation = serde_json::from_slice(data)?;
    Operation::try_from(wire)
}
