//! Tree mutator: `apply(tree, op) -> tree'`.
//!
//! Pure and deterministic. The input tree is never touched; every call returns
//! a fully formed replacement. Operations that reference ids this replica does
//! not know are benign no-ops (async delivery does not follow causal order),
//! reported through `tracing::debug!` and never raised to the caller of
//! [`apply`].
//!
//! [`try_apply`] exposes the same logic with the reason for a no-op as a
//! [`MutationError`], which is what the session records in its log.

use crate::ids::{FieldId, SectionId};
use crate::operation::{Change, Operation, Stamp};
use crate::tree::DocumentTree;
use thiserror::Error;
use tracing::debug;

/// Why an operation could not be applied. Both variants are unknown-target
/// conditions and are recovered as no-ops.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("Field not found: {0}")]
    UnknownField(FieldId),
    #[error("Section not found: {0}")]
    UnknownSection(SectionId),
}

pub type Result<T> = std::result::Result<T, MutationError>;

/// Apply `op`, degrading any failure to a no-op.
pub fn apply(tree: &DocumentTree, op: &Operation) -> DocumentTree {
    apply_at(tree, op, &op.stamp())
}

/// Apply `op`, returning why it was a no-op on failure.
pub fn try_apply(tree: &DocumentTree, op: &Operation) -> Result<DocumentTree> {
    try_apply_at(tree, op, &op.stamp())
}

/// [`apply`] with an explicit origin: the stamp the field's row claim is made
/// with, and whose derived row id names any row the operation creates.
///
/// The resolver uses this when an add has been folded onto a newer move, so
/// that the field holds the move's claim on every replica.
pub fn apply_at(tree: &DocumentTree, op: &Operation, origin: &Stamp) -> DocumentTree {
    match try_apply_at(tree, op, origin) {
        Ok(next) => next,
        Err(err) => {
            debug!(op = %op.id(), kind = %op.kind(), "Operation is a no-op: {}", err);
            tree.clone()
        }
    }
}

pub fn try_apply_at(tree: &DocumentTree, op: &Operation, origin: &Stamp) -> Result<DocumentTree> {
    let mut next = tree.clone();

    match &op.change {
        Change::FieldAdd { field, placement } => {
            next.check_placement(placement)?;
            // Re-adding a known id replaces it, so ids stay unique.
            next.detach_field(&field.id);
            next.insert_field(field.clone(), placement, origin)?;
        }
        Change::FieldUpdate { field_id, patch } => {
            let field = next
                .field_mut(field_id)
                .ok_or_else(|| MutationError::UnknownField(field_id.clone()))?;
            patch.apply_to(field);
        }
        Change::FieldDelete { field_id } => {
            next.detach_field(field_id)
                .ok_or_else(|| MutationError::UnknownField(field_id.clone()))?;
        }
        Change::FieldMove { field_id, target } => {
            next.check_placement(target)?;
            let (field, _) = next
                .detach_field(field_id)
                .ok_or_else(|| MutationError::UnknownField(field_id.clone()))?;
            next.insert_field(field, target, origin)?;
        }
    }

    next.settle();
    Ok(next)
}
