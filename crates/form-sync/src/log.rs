//! Operation log.
//!
//! Append-only record of every operation this replica has processed, local and
//! remote, together with what became of it. The log also owns the state the
//! conflict resolver needs to decide later arrivals:
//!
//! - the reconciled set (`OpId`s seen so far), which makes re-delivery a no-op;
//! - one [`FieldRecord`] per field id, holding its last-writer-wins registers;
//! - a per-user high-water sequence number, for diagnostics.

use crate::ids::{FieldId, UserId};
use crate::mutator::MutationError;
use crate::operation::{OpId, Operation, Stamp};
use crate::resolver::{ResolveError, Supersession};
use crate::tree::{Attribute, FieldPatch, Placement};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Where an operation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Origin {
    Local,
    Remote,
}

/// What became of a logged operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Changed the tree.
    Applied,
    /// Won its registers but referenced something this replica does not have.
    NoOp(MutationError),
    /// Lost to a newer write or a delete.
    Superseded(Supersession),
    /// Could not be resolved at all; never reconciled.
    Dropped(String),
}

impl Disposition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Disposition::Applied)
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub op: Operation,
    pub origin: Origin,
    pub disposition: Disposition,
}

/// Add/delete register of a field. A `None` stamp is the baseline of a field
/// that came with the starting document; any real stamp beats it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Liveness {
    pub alive: bool,
    pub stamp: Option<Stamp>,
}

/// Placement register of a field. The row is always concrete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementRegister {
    pub placement: Placement,
    pub stamp: Stamp,
}

/// Last-writer-wins registers for one field id.
#[derive(Debug, Clone, Default)]
pub struct FieldRecord {
    pub liveness: Option<Liveness>,
    /// Winning stamp per attribute.
    pub attributes: BTreeMap<Attribute, Stamp>,
    /// Winning value per attribute, set for every key of `attributes`.
    pub values: FieldPatch,
    pub placement: Option<PlacementRegister>,
}

impl FieldRecord {
    pub fn is_alive(&self) -> bool {
        self.liveness.as_ref().is_some_and(|l| l.alive)
    }

    pub fn is_deleted(&self) -> bool {
        self.liveness.as_ref().is_some_and(|l| !l.alive)
    }

    pub fn liveness_stamp(&self) -> Option<&Stamp> {
        self.liveness.as_ref().and_then(|l| l.stamp.as_ref())
    }

    pub fn attribute_stamp(&self, attribute: Attribute) -> Option<&Stamp> {
        self.attributes.get(&attribute)
    }
}

#[derive(Debug, Default)]
pub struct OperationLog {
    entries: Vec<LogEntry>,
    reconciled: HashSet<OpId>,
    records: HashMap<FieldId, FieldRecord>,
    high_water: HashMap<UserId, u64>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_reconciled(&self, id: &OpId) -> bool {
        self.reconciled.contains(id)
    }

    /// Mark `id` reconciled. Fails with [`ResolveError::Duplicate`] if it
    /// already was.
    pub fn reconcile(&mut self, id: OpId) -> Result<(), ResolveError> {
        let seq = id.seq;
        let user = id.user.clone();
        if !self.reconciled.insert(id.clone()) {
            return Err(ResolveError::Duplicate(id));
        }
        let mark = self.high_water.entry(user).or_insert(0);
        *mark = (*mark).max(seq);
        Ok(())
    }

    pub fn append(&mut self, op: Operation, origin: Origin, disposition: Disposition) {
        self.entries.push(LogEntry {
            op,
            origin,
            disposition,
        });
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Operations authored on this replica, in commit order.
    pub fn local_operations(&self) -> impl Iterator<Item = &Operation> {
        self.entries
            .iter()
            .filter(|entry| entry.origin == Origin::Local)
            .map(|entry| &entry.op)
    }

    pub fn reconciled_count(&self) -> usize {
        self.reconciled.len()
    }

    /// Highest sequence number reconciled from `user`.
    pub fn high_water(&self, user: &UserId) -> Option<u64> {
        self.high_water.get(user).copied()
    }

    pub fn record(&self, field_id: &FieldId) -> Option<&FieldRecord> {
        self.records.get(field_id)
    }

    pub(crate) fn record_mut(&mut self, field_id: &FieldId) -> &mut FieldRecord {
        self.records.entry(field_id.clone()).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Change;

    fn op(user: &str, seq: u64) -> Operation {
        Operation::new(
            user.parse().unwrap(),
            seq,
            seq,
            Change::FieldDelete {
                field_id: "F1".parse().unwrap(),
            },
        )
    }

    #[test]
    fn test_reconcile_once() {
        let mut log = OperationLog::new();
        let id = op("alice", 1).id();
        assert!(log.reconcile(id.clone()).is_ok());
        assert!(log.is_reconciled(&id));
        assert!(matches!(log.reconcile(id), Err(ResolveError::Duplicate(_))));
        assert_eq!(log.reconciled_count(), 1);
    }

    #[test]
    fn test_high_water_tracks_max_seq() {
        let mut log = OperationLog::new();
        let alice: UserId = "alice".parse().unwrap();
        log.reconcile(op("alice", 3).id()).unwrap();
        log.reconcile(op("alice", 1).id()).unwrap();
        assert_eq!(log.high_water(&alice), Some(3));
        assert_eq!(log.high_water(&"bob".parse().unwrap()), None);
    }

    #[test]
    fn test_local_operations_filters_origin() {
        let mut log = OperationLog::new();
        log.append(op("alice", 1), Origin::Local, Disposition::Applied);
        log.append(op("bob", 1), Origin::Remote, Disposition::Applied);
        log.append(op("alice", 2), Origin::Local, Disposition::Applied);

        let seqs: Vec<_> = log.local_operations().map(|op| op.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_record_defaults_to_unknown() {
        let mut log = OperationLog::new();
        let id: FieldId = "F1".parse().unwrap();
        assert!(log.record(&id).is_none());
        let record = log.record_mut(&id);
        assert!(!record.is_alive());
        assert!(!record.is_deleted());
    }
}
