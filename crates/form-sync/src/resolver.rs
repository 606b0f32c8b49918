//! Conflict resolver.
//!
//! `resolve(op, tree, log)` decides what an operation is allowed to do before
//! the mutator sees it. Every replica runs the same decision over the same
//! registers, so the same multiset of operations converges to the same fields
//! whatever order it arrives in.
//!
//! Policy, per field id:
//! - attribute updates are last-writer-wins per `(field, attribute)`; a patch
//!   is cut down to the attributes it still wins;
//! - a delete beats every update, whatever their stamps. Updates never revive
//!   a deleted field, but their register writes are kept;
//! - adds and deletes race on a liveness register. Only a newer add (the undo
//!   of a delete) brings a field back;
//! - placement (add position and moves) is a last-writer-wins register;
//! - an add arriving after newer updates or moves is rewritten to carry their
//!   values ("folded"), so late adds do not roll anything back;
//! - an add or move into a section the document does not have is rejected
//!   before it touches any register. Sections are fixed, so every replica
//!   rejects the same operations.
//!
//! Stamps give the total order: timestamp, then smaller user id, then seq.
//! Option lists are one attribute and are never merged element-wise.

use crate::ids::FieldId;
use crate::log::{FieldRecord, Liveness, OperationLog, PlacementRegister};
use crate::mutator::MutationError;
use crate::operation::{Change, OpId, Operation, Stamp};
use crate::tree::{Attribute, DocumentTree, Placement};
use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Operation {0} was already reconciled")]
    Duplicate(OpId),
    #[error("Cannot resolve operation {op}: {reason}")]
    Unresolvable { op: OpId, reason: String },
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// Why an operation lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Supersession {
    /// The field is deleted and the operation cannot bring it back.
    Deleted,
    /// Every register it writes already holds a newer value.
    NewerWrite,
}

impl Display for Supersession {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Supersession::Deleted => f.write_str("field is deleted"),
            Supersession::NewerWrite => f.write_str("newer write wins"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Hand the (possibly rewritten) operation to the mutator.
    Apply,
    /// Record it, change nothing.
    Superseded(Supersession),
    /// Targets something no replica can hold. Record it, change nothing.
    Rejected(MutationError),
    /// Already reconciled; skip.
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    /// The operation to apply: the input with its patch filtered or, for a
    /// folded add, its content and placement replaced.
    pub op: Operation,
    pub outcome: Outcome,
    /// Stamp naming any row the mutator creates.
    pub origin: Stamp,
}

impl Resolution {
    fn new(op: Operation, outcome: Outcome, origin: Stamp) -> Self {
        Self { op, outcome, origin }
    }
}

fn validate(op: &Operation) -> Result<()> {
    if op.seq == 0 {
        return Err(ResolveError::Unresolvable {
            op: op.id(),
            reason: "sequence numbers start at 1".to_string(),
        });
    }
    Ok(())
}

/// A placement with its row made concrete: a request for a new row becomes a
/// request for the row derived from `stamp`.
fn concrete(placement: &Placement, stamp: &Stamp) -> Placement {
    match &placement.row_id {
        Some(_) => placement.clone(),
        None => Placement {
            section_id: placement.section_id.clone(),
            row_id: Some(stamp.derived_row()),
            index: None,
        },
    }
}

fn record_for<'a>(log: &'a mut OperationLog, tree: &DocumentTree, field_id: &FieldId) -> &'a mut FieldRecord {
    let seeded = tree.contains_field(field_id);
    let record = log.record_mut(field_id);
    if record.liveness.is_none() && seeded {
        // Field from the starting document: alive at the baseline stamp.
        record.liveness = Some(Liveness {
            alive: true,
            stamp: None,
        });
    }
    record
}

/// Resolve `op` against the registers in `log`, marking it reconciled.
pub fn resolve(op: &Operation, tree: &DocumentTree, log: &mut OperationLog) -> Result<Resolution> {
    validate(op)?;
    let stamp = op.stamp();

    if let Err(ResolveError::Duplicate(id)) = log.reconcile(op.id()) {
        debug!(op = %id, "Skipping already reconciled operation");
        return Ok(Resolution::new(op.clone(), Outcome::Duplicate, stamp));
    }

    let target = match &op.change {
        Change::FieldAdd { placement, .. } => Some(placement),
        Change::FieldMove { target, .. } => Some(target),
        Change::FieldUpdate { .. } | Change::FieldDelete { .. } => None,
    };
    if let Some(Err(err)) = target.map(|placement| tree.check_placement(placement)) {
        debug!(op = %op.id(), "Rejecting operation: {}", err);
        return Ok(Resolution::new(op.clone(), Outcome::Rejected(err), stamp));
    }

    let record = record_for(log, tree, op.field_id());

    let resolution = match &op.change {
        Change::FieldAdd { field, placement } => {
            if let Some(liveness) = &record.liveness {
                if liveness.stamp.as_ref().is_some_and(|current| current > &stamp) {
                    let reason = if liveness.alive {
                        Supersession::NewerWrite
                    } else {
                        Supersession::Deleted
                    };
                    return Ok(Resolution::new(op.clone(), Outcome::Superseded(reason), stamp));
                }
            }
            record.liveness = Some(Liveness {
                alive: true,
                stamp: Some(stamp.clone()),
            });

            let mut field = field.clone();
            let mut carried = record.values.clone();
            carried.retain(|attribute| {
                record
                    .attributes
                    .get(&attribute)
                    .is_some_and(|current| current > &stamp)
            });
            for attribute in Attribute::ALL {
                if !carried.contains(attribute) {
                    record.attributes.insert(attribute, stamp.clone());
                    record.values.copy_from_field(attribute, &field);
                }
            }
            carried.apply_to(&mut field);

            let wanted = concrete(placement, &stamp);
            let newer = record
                .placement
                .as_ref()
                .filter(|current| current.stamp > stamp)
                .map(|current| (current.placement.clone(), current.stamp.clone()));
            let (placement, origin) = match newer {
                Some(kept) => kept,
                None => {
                    record.placement = Some(PlacementRegister {
                        placement: wanted.clone(),
                        stamp: stamp.clone(),
                    });
                    (wanted, stamp.clone())
                }
            };

            Resolution::new(
                op.with_change(Change::FieldAdd { field, placement }),
                Outcome::Apply,
                origin,
            )
        }

        Change::FieldUpdate { field_id, patch } => {
            let mut patch = patch.clone();
            patch.retain(|attribute| {
                record
                    .attributes
                    .get(&attribute)
                    .is_none_or(|current| &stamp > current)
            });
            for attribute in patch.attributes() {
                record.attributes.insert(attribute, stamp.clone());
            }
            record.values.merge(&patch);

            let outcome = if record.is_deleted() {
                Outcome::Superseded(Supersession::Deleted)
            } else if patch.is_empty() {
                Outcome::Superseded(Supersession::NewerWrite)
            } else {
                Outcome::Apply
            };
            Resolution::new(
                op.with_change(Change::FieldUpdate {
                    field_id: field_id.clone(),
                    patch,
                }),
                outcome,
                stamp,
            )
        }

        Change::FieldDelete { .. } => {
            let newer_alive = record
                .liveness
                .as_ref()
                .filter(|liveness| liveness.stamp.as_ref().is_some_and(|current| current > &stamp))
                .map(|liveness| liveness.alive);
            match newer_alive {
                Some(alive) => {
                    let reason = if alive {
                        Supersession::NewerWrite
                    } else {
                        Supersession::Deleted
                    };
                    Resolution::new(op.clone(), Outcome::Superseded(reason), stamp)
                }
                None => {
                    record.liveness = Some(Liveness {
                        alive: false,
                        stamp: Some(stamp.clone()),
                    });
                    Resolution::new(op.clone(), Outcome::Apply, stamp)
                }
            }
        }

        Change::FieldMove { field_id, target } => {
            let target = concrete(target, &stamp);
            let newer = record
                .placement
                .as_ref()
                .is_some_and(|current| current.stamp > stamp);
            if !newer {
                record.placement = Some(PlacementRegister {
                    placement: target.clone(),
                    stamp: stamp.clone(),
                });
            }

            let outcome = if record.is_deleted() {
                Outcome::Superseded(Supersession::Deleted)
            } else if newer {
                Outcome::Superseded(Supersession::NewerWrite)
            } else {
                Outcome::Apply
            };
            Resolution::new(
                op.with_change(Change::FieldMove {
                    field_id: field_id.clone(),
                    target,
                }),
                outcome,
                stamp,
            )
        }
    };

    Ok(resolution)
}

/// Cut an undo/redo step down to what its author may still replay.
///
/// `original` is the operation being reverted and `inverse` the change that
/// reverts it. Replaying is only allowed where `original` is still the winning
/// write, so that reverting never overwrites somebody else's later edit:
/// - update attributes survive only if their stamp is `original`'s;
/// - a move survives only if `original` still owns the placement;
/// - a re-add survives only if `original` wrote the current liveness;
/// - a delete always survives (deletes win anyway).
///
/// `None` means nothing is left to replay.
pub fn guard_replay(original: &Operation, inverse: &Change, log: &OperationLog) -> Option<Change> {
    let stamp = original.stamp();
    let record = log.record(inverse.field_id());

    match inverse {
        Change::FieldDelete { .. } => Some(inverse.clone()),
        Change::FieldUpdate { field_id, patch } => {
            let record = record.filter(|record| !record.is_deleted())?;
            let mut patch = patch.clone();
            patch.retain(|attribute| record.attribute_stamp(attribute) == Some(&stamp));
            (!patch.is_empty()).then(|| Change::FieldUpdate {
                field_id: field_id.clone(),
                patch,
            })
        }
        Change::FieldAdd { .. } => {
            let record = record?;
            (record.liveness_stamp() == Some(&stamp)).then(|| inverse.clone())
        }
        Change::FieldMove { .. } => {
            let record = record.filter(|record| record.is_alive())?;
            let owns = record
                .placement
                .as_ref()
                .is_some_and(|current| current.stamp == stamp);
            owns.then(|| inverse.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{RowId, SectionId};
    use crate::mutator;
    use crate::tree::{Field, FieldKind, FieldPatch};
    use std::collections::BTreeMap;

    fn f(id: &str) -> FieldId {
        id.parse().unwrap()
    }

    fn s1() -> SectionId {
        "S1".parse().unwrap()
    }

    fn s2() -> SectionId {
        "S2".parse().unwrap()
    }

    fn row(id: &str) -> RowId {
        id.parse().unwrap()
    }

    fn op(user: &str, seq: u64, timestamp: u64, change: Change) -> Operation {
        Operation::new(user.parse().unwrap(), seq, timestamp, change)
    }

    fn add(user: &str, seq: u64, timestamp: u64, id: &str) -> Operation {
        op(
            user,
            seq,
            timestamp,
            Change::FieldAdd {
                field: Field::new(f(id), FieldKind::ShortText).with_label("Name"),
                placement: Placement::new_row(s1()),
            },
        )
    }

    fn label(user: &str, seq: u64, timestamp: u64, id: &str, text: &str) -> Operation {
        op(
            user,
            seq,
            timestamp,
            Change::FieldUpdate {
                field_id: f(id),
                patch: FieldPatch::new().with_label(text),
            },
        )
    }

    fn delete(user: &str, seq: u64, timestamp: u64, id: &str) -> Operation {
        op(user, seq, timestamp, Change::FieldDelete { field_id: f(id) })
    }

    fn add_at(user: &str, seq: u64, timestamp: u64, id: &str, placement: Placement) -> Operation {
        op(
            user,
            seq,
            timestamp,
            Change::FieldAdd {
                field: Field::new(f(id), FieldKind::ShortText).with_label(id),
                placement,
            },
        )
    }

    fn move_to(user: &str, seq: u64, timestamp: u64, id: &str, target: Placement) -> Operation {
        op(
            user,
            seq,
            timestamp,
            Change::FieldMove {
                field_id: f(id),
                target,
            },
        )
    }

    fn move_to_new_row(user: &str, seq: u64, timestamp: u64, id: &str) -> Operation {
        op(
            user,
            seq,
            timestamp,
            Change::FieldMove {
                field_id: f(id),
                target: Placement::new_row(s1()),
            },
        )
    }

    struct Replica {
        tree: DocumentTree,
        log: OperationLog,
    }

    impl Replica {
        fn new() -> Self {
            Self::seeded(DocumentTree::new(s1(), "Intro").with_section(s2(), "More"))
        }

        fn seeded(tree: DocumentTree) -> Self {
            Self {
                tree,
                log: OperationLog::new(),
            }
        }

        fn receive(&mut self, op: &Operation) -> Outcome {
            let resolution = resolve(op, &self.tree, &mut self.log).unwrap();
            if resolution.outcome == Outcome::Apply {
                self.tree = mutator::apply_at(&self.tree, &resolution.op, &resolution.origin);
            }
            resolution.outcome
        }
    }

    fn replay(ops: &[Operation]) -> DocumentTree {
        replay_onto(Replica::new(), ops)
    }

    fn replay_onto(mut replica: Replica, ops: &[Operation]) -> DocumentTree {
        for op in ops {
            replica.receive(op);
        }
        replica.tree
    }

    fn permutations(ops: &[Operation]) -> Vec<Vec<Operation>> {
        if ops.len() <= 1 {
            return vec![ops.to_vec()];
        }
        let mut all = Vec::new();
        for i in 0..ops.len() {
            let mut rest = ops.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                all.push(tail);
            }
        }
        all
    }

    /// Field content plus section and row membership.
    fn per_field(tree: &DocumentTree) -> BTreeMap<FieldId, (Field, Placement)> {
        tree.fields_in_order()
            .into_iter()
            .map(|field| {
                let mut placement = tree.locate(&field.id).unwrap();
                placement.index = None;
                (field.id.clone(), (field.clone(), placement))
            })
            .collect()
    }

    #[test]
    fn test_duplicate_is_skipped() {
        let mut replica = Replica::new();
        let op = add("a", 1, 1, "F1");
        assert_eq!(replica.receive(&op), Outcome::Apply);
        let once = replica.tree.clone();
        assert_eq!(replica.receive(&op), Outcome::Duplicate);
        assert_eq!(replica.tree, once);
    }

    #[test]
    fn test_seq_zero_is_unresolvable() {
        let mut log = OperationLog::new();
        let tree = DocumentTree::new(s1(), "Intro");
        let err = resolve(&add("a", 0, 1, "F1"), &tree, &mut log).unwrap_err();
        assert!(matches!(err, ResolveError::Unresolvable { .. }));
        assert_eq!(log.reconciled_count(), 0);
    }

    #[test]
    fn test_concurrent_update_race_higher_timestamp_wins() {
        let base = add("a", 1, 1, "F1");
        let a = label("A", 1, 5, "F1", "Full Name");
        let b = label("B", 1, 7, "F1", "Name (Full)");

        for order in [[&base, &a, &b], [&base, &b, &a]] {
            let ops: Vec<_> = order.into_iter().cloned().collect();
            let tree = replay(&ops);
            assert_eq!(tree.field(&f("F1")).unwrap().label, "Name (Full)");
        }
    }

    #[test]
    fn test_equal_timestamps_smaller_user_wins() {
        let base = add("a", 1, 1, "F1");
        let alice = label("alice", 1, 5, "F1", "from alice");
        let bob = label("bob", 1, 5, "F1", "from bob");
        for ops in [
            vec![base.clone(), alice.clone(), bob.clone()],
            vec![base.clone(), bob.clone(), alice.clone()],
        ] {
            assert_eq!(replay(&ops).field(&f("F1")).unwrap().label, "from alice");
        }
    }

    #[test]
    fn test_delete_update_race_delete_wins() {
        let base = add("a", 1, 1, "F1");
        let del = delete("A", 1, 10, "F1");
        let upd = op(
            "B",
            1,
            9,
            Change::FieldUpdate {
                field_id: f("F1"),
                patch: FieldPatch::new().with_required(true),
            },
        );
        for ops in permutations(&[base, del, upd]) {
            assert!(!replay(&ops).contains_field(&f("F1")));
        }
    }

    #[test]
    fn test_newer_update_does_not_revive_deleted_field() {
        let mut replica = Replica::new();
        replica.receive(&add("a", 1, 1, "F1"));
        replica.receive(&delete("a", 2, 5, "F1"));
        let outcome = replica.receive(&label("b", 1, 9, "F1", "late"));
        assert_eq!(outcome, Outcome::Superseded(Supersession::Deleted));
        assert!(!replica.tree.contains_field(&f("F1")));
    }

    #[test]
    fn test_newer_add_restores_deleted_field() {
        let mut replica = Replica::new();
        replica.receive(&add("a", 1, 1, "F1"));
        replica.receive(&delete("a", 2, 5, "F1"));
        assert_eq!(replica.receive(&add("a", 3, 9, "F1")), Outcome::Apply);
        assert!(replica.tree.contains_field(&f("F1")));
    }

    #[test]
    fn test_late_add_folds_newer_updates() {
        let mut replica = Replica::new();
        assert_eq!(replica.receive(&label("b", 1, 5, "F1", "Full Name")), Outcome::Apply);
        assert!(!replica.tree.contains_field(&f("F1")));

        replica.receive(&add("a", 1, 1, "F1"));
        assert_eq!(replica.tree.field(&f("F1")).unwrap().label, "Full Name");
    }

    #[test]
    fn test_late_add_folds_newer_move() {
        let early = add("a", 1, 1, "F1");
        let moved = move_to_new_row("b", 1, 5, "F1");
        let in_order = replay(&[early.clone(), moved.clone()]);
        let reversed = replay(&[moved, early]);
        assert_eq!(in_order, reversed);
    }

    #[test]
    fn test_move_on_deleted_field_is_superseded() {
        let mut replica = Replica::new();
        replica.receive(&add("a", 1, 1, "F1"));
        replica.receive(&delete("a", 2, 5, "F1"));
        assert_eq!(
            replica.receive(&move_to_new_row("b", 1, 7, "F1")),
            Outcome::Superseded(Supersession::Deleted)
        );
    }

    #[test]
    fn test_convergence_over_all_permutations() {
        let ops = vec![
            add("A", 1, 1, "F1"),
            add("B", 1, 2, "F2"),
            label("A", 2, 5, "F1", "Full Name"),
            label("B", 2, 7, "F1", "Name (Full)"),
            move_to_new_row("A", 3, 6, "F1"),
            op(
                "A",
                4,
                8,
                Change::FieldUpdate {
                    field_id: f("F2"),
                    patch: FieldPatch::new().with_required(true).with_options(["x", "y"]),
                },
            ),
            delete("B", 3, 9, "F2"),
        ];

        let expected = replay(&ops);
        assert_eq!(expected.field(&f("F1")).unwrap().label, "Name (Full)");
        assert!(!expected.contains_field(&f("F2")));

        for order in permutations(&ops) {
            assert_eq!(replay(&order), expected);
        }
    }

    #[test]
    fn test_per_field_convergence_with_moves_into_rows() {
        let a1 = add("A", 1, 1, "F1");
        let tree = replay(&[a1.clone()]);
        let row = tree.locate(&f("F1")).unwrap().row_id.unwrap();

        let ops = vec![
            a1,
            add("B", 1, 2, "F2"),
            op(
                "B",
                2,
                8,
                Change::FieldMove {
                    field_id: f("F2"),
                    target: Placement::in_row(s1(), row, 1),
                },
            ),
            move_to_new_row("A", 2, 6, "F1"),
            label("A", 3, 9, "F2", "Moved"),
        ];

        let expected = per_field(&replay(&ops));
        for order in permutations(&ops) {
            assert_eq!(per_field(&replay(&order)), expected);
        }
    }

    #[test]
    fn test_contention_for_last_slot_converges() {
        let r = add("A", 1, 1, "F1").stamp().derived_row();
        let ops = vec![
            add("A", 1, 1, "F1"),
            add_at("A", 2, 2, "F2", Placement::in_row(s1(), r.clone(), 1)),
            add_at("A", 3, 3, "F3", Placement::in_row(s1(), r.clone(), 2)),
            add("B", 1, 4, "F5"),
            add("C", 1, 5, "F6"),
            move_to("B", 2, 10, "F5", Placement::in_row(s1(), r.clone(), 3)),
            move_to("C", 2, 11, "F6", Placement::in_row(s1(), r.clone(), 3)),
        ];

        let expected = per_field(&replay(&ops));
        assert_eq!(expected[&f("F5")].1.row_id, Some(r.clone()));
        assert_eq!(
            expected[&f("F6")].1.row_id,
            Some(RowId::in_chain(r.as_str(), 1))
        );
        for order in permutations(&ops) {
            assert_eq!(per_field(&replay(&order)), expected);
        }
    }

    #[test]
    fn test_placement_into_unknown_section_is_rejected() {
        let mut replica = Replica::new();
        let stray = move_to("B", 1, 5, "F1", Placement::new_row("S9".parse().unwrap()));
        assert_eq!(
            replica.receive(&stray),
            Outcome::Rejected(MutationError::UnknownSection("S9".parse().unwrap()))
        );
        assert!(replica.log.record(&f("F1")).is_none());
        assert!(replica.log.is_reconciled(&stray.id()));

        replica.receive(&add("A", 1, 1, "F1"));
        assert!(replica.tree.contains_field(&f("F1")));
    }

    #[test]
    fn test_unknown_section_targets_converge() {
        let ops = vec![
            add("A", 1, 1, "F1"),
            move_to("B", 1, 5, "F1", Placement::new_row("S9".parse().unwrap())),
            label("B", 2, 3, "F1", "Kept"),
            add_at("A", 2, 2, "F2", Placement::new_row("S9".parse().unwrap())),
            move_to("B", 3, 6, "F2", Placement::new_row(s1())),
        ];

        let expected = replay(&ops);
        assert_eq!(expected.field(&f("F1")).unwrap().label, "Kept");
        assert!(!expected.contains_field(&f("F2")));
        for order in permutations(&ops) {
            assert_eq!(replay(&order), expected);
        }
    }

    #[test]
    fn test_same_row_id_in_two_sections_converges() {
        let ops = vec![
            add_at("A", 1, 1, "F1", Placement::in_row(s1(), row("R7"), 0)),
            add_at("B", 1, 2, "F2", Placement::in_row(s2(), row("R7"), 0)),
            move_to("A", 2, 3, "F1", Placement::in_row(s2(), row("R7"), 0)),
            move_to("B", 2, 4, "F2", Placement::in_row(s1(), row("R7"), 0)),
        ];

        let expected = per_field(&replay(&ops));
        assert_eq!(expected[&f("F1")].1.section_id, s2());
        assert_eq!(expected[&f("F2")].1.section_id, s1());
        for order in permutations(&ops) {
            assert_eq!(per_field(&replay(&order)), expected);
        }
    }

    #[test]
    fn test_recreated_seed_row_order_converges() {
        let seed: DocumentTree = serde_json::from_str(
            r#"{
                "sections": [{"id": "S1", "title": "Intro", "rows": [
                    {"id": "R2", "fields": ["F1"]},
                    {"id": "R1", "fields": ["F2"]}
                ]}],
                "fields": {
                    "F1": {"id": "F1", "type": "short_text", "label": "First"},
                    "F2": {"id": "F2", "type": "email", "label": "Second"}
                }
            }"#,
        )
        .unwrap();

        let ops = vec![
            delete("A", 1, 2, "F1"),
            add_at("A", 2, 5, "F1", Placement::in_row(s1(), row("R2"), 0)),
            add_at("B", 1, 3, "F3", Placement::in_row(s1(), row("A0"), 0)),
            add("C", 1, 4, "F4"),
        ];

        let expected = replay_onto(Replica::seeded(seed.clone()), &ops);
        let rows: Vec<_> = expected.sections()[0]
            .rows
            .iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(rows[..3], ["R2", "R1", "A0"]);
        for order in permutations(&ops) {
            assert_eq!(replay_onto(Replica::seeded(seed.clone()), &order), expected);
        }
    }

    #[test]
    fn test_guard_replay_keeps_only_own_winning_attributes() {
        let mut replica = Replica::new();
        replica.receive(&add("A", 1, 1, "F1"));
        let mine = op(
            "A",
            2,
            5,
            Change::FieldUpdate {
                field_id: f("F1"),
                patch: FieldPatch::new().with_label("mine").with_required(true),
            },
        );
        replica.receive(&mine);
        replica.receive(&label("B", 1, 7, "F1", "theirs"));

        let inverse = Change::FieldUpdate {
            field_id: f("F1"),
            patch: FieldPatch::new().with_label("Name").with_required(false),
        };
        let guarded = guard_replay(&mine, &inverse, &replica.log).unwrap();
        match guarded {
            Change::FieldUpdate { patch, .. } => {
                assert_eq!(patch.attributes(), vec![Attribute::Required]);
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_guard_replay_never_blocks_delete() {
        let mut replica = Replica::new();
        let mine = add("A", 1, 1, "F1");
        replica.receive(&mine);
        replica.receive(&label("B", 1, 7, "F1", "theirs"));

        let inverse = Change::FieldDelete { field_id: f("F1") };
        assert_eq!(guard_replay(&mine, &inverse, &replica.log), Some(inverse));
    }

    #[test]
    fn test_guard_replay_restore_requires_own_tombstone() {
        let mut replica = Replica::new();
        replica.receive(&add("A", 1, 1, "F1"));
        let mine = delete("A", 2, 5, "F1");
        replica.receive(&mine);

        let restore = Change::FieldAdd {
            field: Field::new(f("F1"), FieldKind::ShortText),
            placement: Placement::new_row(s1()),
        };
        assert!(guard_replay(&mine, &restore, &replica.log).is_some());

        replica.receive(&delete("B", 1, 6, "F1"));
        assert!(guard_replay(&mine, &restore, &replica.log).is_none());
    }
}
