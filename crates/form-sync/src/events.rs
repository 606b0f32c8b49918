//! Session events.
//!
//! [`CollabEvent`] is what an editor listens to for refreshes and status.
//! [`EventBus`] is `Arc`-shared and thread safe, so a UI thread can listen
//! while the session runs on a Tokio worker.

use crate::ids::{FieldId, UserId};
use crate::log::Origin;
use crate::operation::{OpId, OperationKind};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CollabEvent {
    /// An operation changed the tree.
    #[serde(rename_all = "camelCase")]
    OperationApplied {
        op_id: OpId,
        kind: OperationKind,
        field_id: FieldId,
        origin: Origin,
    },
    /// An operation was reconciled but left the tree alone (lost a race or
    /// referenced something unknown).
    #[serde(rename_all = "camelCase")]
    OperationSkipped {
        op_id: OpId,
        origin: Origin,
        reason: String,
    },
    /// An operation could not be resolved and was discarded.
    #[serde(rename_all = "camelCase")]
    OperationDropped { op_id: OpId, reason: String },
    #[serde(rename_all = "camelCase")]
    ParticipantJoined { user_id: UserId },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft { user_id: UserId },
    /// Removed after `presence_timeout` without activity.
    #[serde(rename_all = "camelCase")]
    ParticipantEvicted { user_id: UserId },
    /// Undo/redo availability may have changed.
    #[serde(rename_all = "camelCase")]
    HistoryChanged { can_undo: bool, can_redo: bool },
    /// Broadcasts failed and are waiting in the outbox.
    OutboxChanged { pending: usize },
}

impl CollabEvent {
    /// The operation this event reports on, if any.
    pub fn op_id(&self) -> Option<&OpId> {
        match self {
            CollabEvent::OperationApplied { op_id, .. }
            | CollabEvent::OperationSkipped { op_id, .. }
            | CollabEvent::OperationDropped { op_id, .. } => Some(op_id),
            _ => None,
        }
    }

    /// The participant this event reports on, if any.
    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            CollabEvent::ParticipantJoined { user_id }
            | CollabEvent::ParticipantLeft { user_id }
            | CollabEvent::ParticipantEvicted { user_id } => Some(user_id),
            _ => None,
        }
    }
}

type Callback = Box<dyn Fn(CollabEvent) + Send + Sync>;
type Filter = Box<dyn Fn(&CollabEvent) -> bool + Send + Sync>;

struct Listener {
    accepts: Filter,
    callback: Callback,
}

/// Keeps a listener registered. Dropping it unregisters the listener.
pub struct Subscription {
    bus: Weak<EventBus>,
    key: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.key);
        }
    }
}

/// Fan-out of session events to registered listeners, in registration order.
///
/// Listeners are only reachable through an `Arc<EventBus>`.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<BTreeMap<u64, Arc<Listener>>>,
    next_key: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event until the returned [`Subscription`] is dropped.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(CollabEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_where(|_| true, callback)
    }

    /// Receive the events `accepts` returns true for.
    pub fn subscribe_where(
        self: &Arc<Self>,
        accepts: impl Fn(&CollabEvent) -> bool + Send + Sync + 'static,
        callback: impl Fn(CollabEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let listener = Listener {
            accepts: Box::new(accepts),
            callback: Box::new(callback),
        };
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::new(listener));
        Subscription {
            bus: Arc::downgrade(self),
            key,
        }
    }

    fn remove(&self, key: u64) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Deliver `event` to every listener that accepts it. Callbacks run after
    /// the listener table is released, so they may subscribe or unsubscribe.
    pub fn emit(&self, event: CollabEvent) {
        let listeners: Vec<Arc<Listener>> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|listener| (listener.accepts)(&event))
            .cloned()
            .collect();
        for listener in listeners {
            (listener.callback)(event.clone());
        }
    }
}
