//! Per-user undo/redo history.
//!
//! - Each local operation records its inverse, computed against the tree
//!   *before* the operation was applied
//! - Undo replays inverses (latest first) as new local operations and moves
//!   the entry to the redo stack
//! - Redo replays the reverted changes the same way and moves it back
//! - A new local operation clears the redo stack
//! - Batches group several operations into one step
//!
//! The manager belongs to one user and refuses steps authored by anyone else,
//! so another participant's edit can never end up on this user's stacks.
//! Replaying itself (guards, stamping, broadcasting) is done by the session.

use crate::ids::UserId;
use crate::operation::{Change, Operation};
use crate::tree::{DocumentTree, FieldPatch};
use tracing::debug;

/// Default number of undo levels kept.
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// One applied operation and the change that reverts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoStep {
    pub original: Operation,
    pub inverse: Change,
}

/// One user-visible undo step: the steps of a batch, in application order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UndoEntry {
    pub steps: Vec<UndoStep>,
    pub description: Option<String>,
}

impl UndoEntry {
    pub fn single(step: UndoStep) -> Self {
        Self {
            steps: vec![step],
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// The change that returns `tree` to its current state after `change` is
/// applied to it, or `None` when `change` would not touch anything.
pub fn inverse_of(tree: &DocumentTree, change: &Change) -> Option<Change> {
    match change {
        Change::FieldAdd { field, .. } => match (tree.field(&field.id), tree.locate(&field.id)) {
            (Some(previous), Some(placement)) => Some(Change::FieldAdd {
                field: previous.clone(),
                placement,
            }),
            _ => Some(Change::FieldDelete {
                field_id: field.id.clone(),
            }),
        },
        Change::FieldUpdate { field_id, patch } => {
            let field = tree.field(field_id)?;
            Some(Change::FieldUpdate {
                field_id: field_id.clone(),
                patch: FieldPatch::capture(field, patch.attributes()),
            })
        }
        Change::FieldDelete { field_id } => {
            let field = tree.field(field_id)?;
            let placement = tree.locate(field_id)?;
            Some(Change::FieldAdd {
                field: field.clone(),
                placement,
            })
        }
        Change::FieldMove { field_id, .. } => Some(Change::FieldMove {
            field_id: field_id.clone(),
            target: tree.locate(field_id)?,
        }),
    }
}

#[derive(Debug)]
pub struct UndoManager {
    owner: UserId,
    undo_stack: Vec<UndoEntry>,
    redo_stack: Vec<UndoEntry>,
    /// 0 = unlimited
    max_depth: usize,
    current_batch: Option<UndoEntry>,
}

impl UndoManager {
    pub fn new(owner: UserId) -> Self {
        Self::with_max_depth(owner, DEFAULT_MAX_DEPTH)
    }

    pub fn with_max_depth(owner: UserId, max_depth: usize) -> Self {
        Self {
            owner,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            max_depth,
            current_batch: None,
        }
    }

    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.max_depth = max_depth;
        Self::trim(&mut self.undo_stack, max_depth);
        Self::trim(&mut self.redo_stack, max_depth);
    }

    /// Record a freshly applied local operation. Clears the redo stack.
    ///
    /// Returns `false` (and records nothing) for operations authored by
    /// another user.
    pub fn record(&mut self, step: UndoStep) -> bool {
        if step.original.user != self.owner {
            debug!(op = %step.original.id(), "Not recording another user's operation");
            return false;
        }
        match &mut self.current_batch {
            Some(batch) => batch.steps.push(step),
            None => self.push_undo(UndoEntry::single(step)),
        }
        self.redo_stack.clear();
        true
    }

    /// Start grouping recorded operations into one entry. A batch already in
    /// progress is closed first.
    pub fn begin_batch(&mut self, description: Option<String>) {
        self.end_batch();
        self.current_batch = Some(UndoEntry {
            steps: Vec::new(),
            description,
        });
    }

    /// Close the current batch. Empty batches are discarded.
    pub fn end_batch(&mut self) {
        if let Some(batch) = self.current_batch.take() {
            if !batch.steps.is_empty() {
                self.push_undo(batch);
            }
        }
    }

    pub fn in_batch(&self) -> bool {
        self.current_batch.is_some()
    }

    /// Take the entry to undo. Closes any open batch first.
    pub fn pop_undo(&mut self) -> Option<UndoEntry> {
        self.end_batch();
        self.undo_stack.pop()
    }

    pub fn pop_redo(&mut self) -> Option<UndoEntry> {
        self.end_batch();
        self.redo_stack.pop()
    }

    /// Store the result of an undo so it can be redone.
    pub fn push_redo(&mut self, entry: UndoEntry) {
        if entry.steps.is_empty() {
            return;
        }
        self.redo_stack.push(entry);
        Self::trim(&mut self.redo_stack, self.max_depth);
    }

    /// Store the result of a redo. Unlike [`UndoManager::record`] this keeps
    /// the remaining redo entries.
    pub fn push_undo(&mut self, entry: UndoEntry) {
        if entry.steps.is_empty() {
            return;
        }
        self.undo_stack.push(entry);
        Self::trim(&mut self.undo_stack, self.max_depth);
    }

    fn trim(stack: &mut Vec<UndoEntry>, max_depth: usize) {
        if max_depth > 0 && stack.len() > max_depth {
            let excess = stack.len() - max_depth;
            stack.drain(..excess);
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
            || self
                .current_batch
                .as_ref()
                .is_some_and(|batch| !batch.steps.is_empty())
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn undo_description(&self) -> Option<&str> {
        self.undo_stack
            .last()
            .and_then(|entry| entry.description.as_deref())
    }

    pub fn redo_description(&self) -> Option<&str> {
        self.redo_stack
            .last()
            .and_then(|entry| entry.description.as_deref())
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.current_batch = None;
    }
}
