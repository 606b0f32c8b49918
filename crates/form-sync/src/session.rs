//! Collaboration session: one user's replica of a form.
//!
//! A `Session` owns the document tree, the operation log, the user's undo
//! history and the presence view, and connects them:
//!
//! - local edits are stamped, resolved, applied, logged, recorded for undo
//!   and broadcast through the [`SyncGateway`];
//! - inbound events are queued by [`Session::receive`] and drained by
//!   [`Session::process_inbound`] through the same resolve/apply path;
//! - undo and redo replay guarded inverses as new local operations.
//!
//! Everything is synchronous. The tree is replaced wholesale on every change
//! and handed out as `Arc<DocumentTree>` snapshots. [`Session::pump`] is the
//! only async entry point.

use crate::clock::{HybridClock, SystemClock, TimeSource};
use crate::config::{CollabConfig, ConfigError};
use crate::events::{CollabEvent, EventBus};
use crate::gateway::{InboundEvent, SyncGateway};
use crate::history::{inverse_of, UndoEntry, UndoManager, UndoStep};
use crate::ids::{FieldId, SectionId, UserId};
use crate::log::{Disposition, OperationLog, Origin};
use crate::mutator;
use crate::operation::{Change, OpId, Operation};
use crate::presence::{
    ActiveUser, CursorPosition, CursorThrottle, LiveCursor, PresenceChange, PresenceEvent,
    PresenceSnapshot, PresenceTracker,
};
use crate::resolver::{self, Outcome, ResolveError};
use crate::tree::{DocumentTree, Field, FieldKind, FieldPatch, Placement};
use crate::wire::{self, WireError};
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Update for field {0} changes nothing")]
    EmptyPatch(FieldId),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Result of a local edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub op_id: OpId,
    pub field_id: FieldId,
    pub disposition: Disposition,
}

/// What integrating one operation did.
struct Integrated {
    disposition: Disposition,
    /// Reverting change, computed before applying; local operations only.
    inverse: Option<Change>,
}

/// One user's replica.
///
/// A user id is meant to run in one session at a time: `(user, seq)` is the
/// identity of an operation, so two sessions minting sequence numbers for the
/// same user can collide. A colliding operation that differs from the local
/// one is dropped and reported through [`CollabEvent::OperationDropped`]
/// rather than mistaken for a re-delivery. Give each tab its own user id.
pub struct Session {
    local: ActiveUser,
    config: CollabConfig,
    tree: Arc<DocumentTree>,
    log: OperationLog,
    history: UndoManager,
    presence: PresenceTracker,
    throttle: CursorThrottle,
    clock: HybridClock,
    time: Arc<dyn TimeSource>,
    gateway: Arc<dyn SyncGateway>,
    events: Arc<EventBus>,
    inbound: VecDeque<InboundEvent>,
    outbox: VecDeque<Operation>,
    next_seq: u64,
}

impl Session {
    pub fn new(local: ActiveUser, tree: DocumentTree, gateway: Arc<dyn SyncGateway>) -> Self {
        let config = CollabConfig::default();
        Self {
            history: UndoManager::with_max_depth(local.id.clone(), config.undo_depth),
            presence: PresenceTracker::new(local.id.clone(), &config),
            throttle: CursorThrottle::new(&config),
            local,
            config,
            tree: Arc::new(tree),
            log: OperationLog::new(),
            clock: HybridClock::new(),
            time: Arc::new(SystemClock),
            gateway,
            events: Arc::new(EventBus::new()),
            inbound: VecDeque::new(),
            outbox: VecDeque::new(),
            next_seq: 0,
        }
    }

    /// Replace the default configuration. Fails if `config` does not validate.
    pub fn with_config(mut self, config: CollabConfig) -> Result<Self> {
        config.validate()?;
        self.history.set_max_depth(config.undo_depth);
        self.presence.configure(&config);
        self.throttle.configure(&config);
        self.config = config;
        Ok(self)
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn local_user(&self) -> &ActiveUser {
        &self.local
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Current tree. Cheap; later edits do not affect the returned snapshot.
    pub fn tree(&self) -> Arc<DocumentTree> {
        Arc::clone(&self.tree)
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn history(&self) -> &UndoManager {
        &self.history
    }

    pub fn roster(&self) -> Vec<ActiveUser> {
        self.presence.roster()
    }

    pub fn cursors(&self) -> Vec<LiveCursor> {
        self.presence.cursors()
    }

    /// Evict stale participants, then report who is here and where.
    pub fn presence_snapshot(&mut self) -> PresenceSnapshot {
        let now = self.time.now_ms();
        self.evict(now);
        self.presence.snapshot(now)
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    // ------------------------------------------------------------------
    // Local edits
    // ------------------------------------------------------------------

    /// Add a fresh field of `kind` in a new row at the end of `section_id`.
    pub fn add_field(&mut self, kind: FieldKind, section_id: SectionId) -> Result<Committed> {
        let field = Field::new(FieldId::generate(), kind);
        self.insert_field(field, Placement::new_row(section_id))
    }

    /// Add `field` at `placement`.
    pub fn insert_field(&mut self, field: Field, placement: Placement) -> Result<Committed> {
        self.commit(Change::FieldAdd { field, placement })
    }

    pub fn update_field(&mut self, field_id: FieldId, patch: FieldPatch) -> Result<Committed> {
        if patch.is_empty() {
            return Err(SessionError::EmptyPatch(field_id));
        }
        self.commit(Change::FieldUpdate { field_id, patch })
    }

    pub fn delete_field(&mut self, field_id: FieldId) -> Result<Committed> {
        self.commit(Change::FieldDelete { field_id })
    }

    pub fn move_field(&mut self, field_id: FieldId, target: Placement) -> Result<Committed> {
        self.commit(Change::FieldMove { field_id, target })
    }

    /// Group the following edits into one undo step.
    pub fn begin_batch(&mut self, description: Option<String>) {
        self.history.begin_batch(description);
    }

    pub fn end_batch(&mut self) {
        self.history.end_batch();
        self.emit_history();
    }

    fn stamp(&mut self, change: Change) -> Operation {
        let timestamp = self.clock.tick(self.time.now_ms());
        self.next_seq += 1;
        Operation::new(self.local.id.clone(), self.next_seq, timestamp, change)
    }

    fn commit(&mut self, change: Change) -> Result<Committed> {
        let op = self.stamp(change);
        let Some(Integrated {
            disposition,
            inverse,
        }) = self.integrate(&op, Origin::Local)?
        else {
            return Err(ResolveError::Duplicate(op.id()).into());
        };

        if let (true, Some(inverse)) = (disposition.is_applied(), inverse) {
            self.history.record(UndoStep {
                original: op.clone(),
                inverse,
            });
            self.emit_history();
        }

        let committed = Committed {
            op_id: op.id(),
            field_id: op.field_id().clone(),
            disposition,
        };
        self.broadcast(op);
        Ok(committed)
    }

    // ------------------------------------------------------------------
    // Undo / redo
    // ------------------------------------------------------------------

    /// Revert this user's latest step. Returns whether anything changed.
    ///
    /// Parts of the step that another user has since overwritten are skipped
    /// and dropped from history.
    pub fn undo(&mut self) -> Result<bool> {
        let Some(entry) = self.history.pop_undo() else {
            return Ok(false);
        };
        let replayed = self.replay(entry)?;
        let changed = !replayed.steps.is_empty();
        self.history.push_redo(replayed);
        self.emit_history();
        Ok(changed)
    }

    /// Re-apply the latest undone step. Returns whether anything changed.
    pub fn redo(&mut self) -> Result<bool> {
        let Some(entry) = self.history.pop_redo() else {
            return Ok(false);
        };
        let replayed = self.replay(entry)?;
        let changed = !replayed.steps.is_empty();
        self.history.push_undo(replayed);
        self.emit_history();
        Ok(changed)
    }

    /// Commit the inverses of `entry`, latest first, and return the entry that
    /// reverts what was actually replayed.
    fn replay(&mut self, entry: UndoEntry) -> Result<UndoEntry> {
        let mut steps = Vec::new();
        for step in entry.steps.into_iter().rev() {
            let Some(change) = resolver::guard_replay(&step.original, &step.inverse, &self.log)
            else {
                debug!(op = %step.original.id(), "Skipping undo step overwritten by a later edit");
                continue;
            };
            let op = self.stamp(change);
            let integrated = self.integrate(&op, Origin::Local)?;
            if let Some(Integrated {
                disposition: Disposition::Applied,
                inverse: Some(inverse),
            }) = integrated
            {
                steps.push(UndoStep {
                    original: op.clone(),
                    inverse,
                });
            }
            self.broadcast(op);
        }
        Ok(UndoEntry {
            steps,
            description: entry.description,
        })
    }

    // ------------------------------------------------------------------
    // Resolve / apply / log
    // ------------------------------------------------------------------

    /// Run `op` through the resolver and mutator. `None` for a duplicate.
    fn integrate(
        &mut self,
        op: &Operation,
        origin: Origin,
    ) -> std::result::Result<Option<Integrated>, ResolveError> {
        let resolution = resolver::resolve(op, &self.tree, &mut self.log)?;

        let (disposition, inverse) = match resolution.outcome {
            Outcome::Duplicate => return Ok(None),
            Outcome::Superseded(reason) => {
                debug!(op = %op.id(), "Operation superseded: {}", reason);
                (Disposition::Superseded(reason), None)
            }
            Outcome::Rejected(err) => (Disposition::NoOp(err), None),
            Outcome::Apply => {
                let inverse = match origin {
                    Origin::Local => inverse_of(&self.tree, &resolution.op.change),
                    Origin::Remote => None,
                };
                match mutator::try_apply_at(&self.tree, &resolution.op, &resolution.origin) {
                    Ok(next) => {
                        self.tree = Arc::new(next);
                        (Disposition::Applied, inverse)
                    }
                    Err(err) => {
                        debug!(op = %op.id(), kind = %op.kind(), "Operation is a no-op: {}", err);
                        (Disposition::NoOp(err), None)
                    }
                }
            }
        };

        self.log.append(op.clone(), origin, disposition.clone());
        self.events.emit(match &disposition {
            Disposition::Applied => CollabEvent::OperationApplied {
                op_id: op.id(),
                kind: op.kind(),
                field_id: op.field_id().clone(),
                origin,
            },
            Disposition::NoOp(err) => CollabEvent::OperationSkipped {
                op_id: op.id(),
                origin,
                reason: err.to_string(),
            },
            Disposition::Superseded(reason) => CollabEvent::OperationSkipped {
                op_id: op.id(),
                origin,
                reason: reason.to_string(),
            },
            Disposition::Dropped(reason) => CollabEvent::OperationDropped {
                op_id: op.id(),
                reason: reason.clone(),
            },
        });

        Ok(Some(Integrated {
            disposition,
            inverse,
        }))
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Queue an inbound event. Nothing happens until [`Session::process_inbound`].
    pub fn receive(&mut self, event: impl Into<InboundEvent>) {
        self.inbound.push_back(event.into());
    }

    /// Decode and queue one JSON message: an operation or a presence event.
    pub fn receive_json(&mut self, data: &[u8]) -> Result<()> {
        let value: serde_json::Value = serde_json::from_slice(data).map_err(WireError::from)?;
        let event = if value.get("seq").is_some() {
            InboundEvent::Change(wire::decode(data)?)
        } else {
            InboundEvent::Presence(serde_json::from_value(value).map_err(WireError::from)?)
        };
        self.receive(event);
        Ok(())
    }

    /// Drain the inbound queue. Returns the number of events processed.
    pub fn process_inbound(&mut self) -> usize {
        let mut processed = 0;
        while let Some(event) = self.inbound.pop_front() {
            match event {
                InboundEvent::Change(op) => self.apply_remote(op),
                InboundEvent::Presence(event) => self.apply_presence(event),
            }
            processed += 1;
        }
        processed
    }

    /// Feed `stream` into the session until it ends. Returns the number of
    /// events processed.
    pub async fn pump<S>(&mut self, mut stream: S) -> usize
    where
        S: Stream<Item = InboundEvent> + Unpin,
    {
        let mut processed = 0;
        while let Some(event) = stream.next().await {
            self.receive(event);
            processed += self.process_inbound();
        }
        processed
    }

    fn apply_remote(&mut self, op: Operation) {
        let now = self.time.now_ms();
        self.clock.observe(op.timestamp);
        if op.user == self.local.id {
            // Another session of the same user: never reuse its sequence numbers.
            self.next_seq = self.next_seq.max(op.seq);
            let clash = self
                .log
                .local_operations()
                .any(|local| local.id() == op.id() && *local != op);
            if clash {
                warn!(op = %op.id(), "Sequence number already used by a different local operation");
                let reason = format!("Sequence number {} of {} is already taken", op.seq, op.user);
                self.drop_remote(op, reason);
                return;
            }
        } else {
            self.presence.touch(&op.user, now);
        }

        if let Err(err) = self.integrate(&op, Origin::Remote) {
            error!(op = %op.id(), "Dropping operation: {}", err);
            self.drop_remote(op, err.to_string());
        }
    }

    fn drop_remote(&mut self, op: Operation, reason: String) {
        self.events.emit(CollabEvent::OperationDropped {
            op_id: op.id(),
            reason: reason.clone(),
        });
        self.log.append(op, Origin::Remote, Disposition::Dropped(reason));
    }

    fn apply_presence(&mut self, event: PresenceEvent) {
        let now = self.time.now_ms();
        match self.presence.apply(event, now) {
            PresenceChange::Joined(user_id) => {
                self.events.emit(CollabEvent::ParticipantJoined { user_id })
            }
            PresenceChange::Left(user_id) => {
                self.events.emit(CollabEvent::ParticipantLeft { user_id })
            }
            PresenceChange::CursorMoved(_) | PresenceChange::Touched(_) => {}
            PresenceChange::Ignored => debug!("Ignoring presence event"),
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Offer a new pointer position. Returns whether it was sent right away;
    /// a held-back position goes out on a later [`Session::tick`].
    pub fn move_cursor(&mut self, position: CursorPosition) -> bool {
        let now = self.time.now_ms();
        match self.throttle.offer(position, now) {
            Some(position) => {
                self.send_cursor(position, now);
                true
            }
            None => false,
        }
    }

    fn send_cursor(&self, position: CursorPosition, now: u64) {
        let cursor = LiveCursor {
            user_id: self.local.id.clone(),
            position,
            timestamp: now,
        };
        if let Err(err) = self.gateway.broadcast_cursor(&cursor) {
            warn!("Cursor update not sent: {}", err);
        }
    }

    fn broadcast(&mut self, op: Operation) {
        // Later operations queue behind failed ones to keep per-sender order.
        if !self.outbox.is_empty() {
            self.outbox.push_back(op);
            self.emit_outbox();
            return;
        }
        if let Err(err) = self.gateway.broadcast_change(&op) {
            warn!(op = %op.id(), "Broadcast failed, keeping operation in outbox: {}", err);
            self.outbox.push_back(op);
            self.emit_outbox();
        }
    }

    /// Resend parked operations in order, stopping at the first failure.
    /// Returns the number sent.
    pub fn retry_outbox(&mut self) -> usize {
        let mut sent = 0;
        while let Some(op) = self.outbox.front() {
            match self.gateway.broadcast_change(op) {
                Ok(()) => {
                    self.outbox.pop_front();
                    sent += 1;
                }
                Err(err) => {
                    warn!(pending = self.outbox.len(), "Outbox retry failed: {}", err);
                    break;
                }
            }
        }
        if sent > 0 {
            info!(sent, "Flushed outbox");
            self.emit_outbox();
        }
        sent
    }

    /// Periodic housekeeping: flush a held-back cursor, retry the outbox and
    /// evict idle participants. Returns the evicted users.
    pub fn tick(&mut self) -> Vec<UserId> {
        let now = self.time.now_ms();
        if let Some(position) = self.throttle.flush(now) {
            self.send_cursor(position, now);
        }
        if !self.outbox.is_empty() {
            self.retry_outbox();
        }
        self.evict(now)
    }

    fn evict(&mut self, now: u64) -> Vec<UserId> {
        let evicted = self.presence.evict_stale(now);
        for user_id in &evicted {
            self.events.emit(CollabEvent::ParticipantEvicted {
                user_id: user_id.clone(),
            });
        }
        evicted
    }

    fn emit_history(&self) {
        self.events.emit(CollabEvent::HistoryChanged {
            can_undo: self.history.can_undo(),
            can_redo: self.history.can_redo(),
        });
    }

    fn emit_outbox(&self) {
        self.events.emit(CollabEvent::OutboxChanged {
            pending: self.outbox.len(),
        });
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.local.id)
            .field("fields", &self.tree.field_count())
            .field("log", &self.log.len())
            .field("outbox", &self.outbox.len())
            .finish()
    }
}
