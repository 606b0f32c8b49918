//! form-sync: real-time collaborative editing core for form definitions.
//!
//! This crate provides:
//! - The document tree (sections, rows, fields) and its pure mutator
//! - The operation model and its JSON wire format
//! - Last-writer-wins conflict resolution with delete-wins semantics
//! - Per-user undo/redo that never reverts another user's edits
//! - Presence: roster, live cursors, cursor throttling, idle eviction
//! - The `Session` tying them together behind a `SyncGateway` trait

pub mod clock;
pub mod config;
pub mod events;
pub mod gateway;
pub mod history;
pub mod ids;
pub mod log;
pub mod mutator;
pub mod operation;
pub mod presence;
pub mod resolver;
pub mod session;
pub mod tree;
pub mod wire;

pub use clock::{HybridClock, ManualClock, SystemClock, TimeSource};
pub use config::{CollabConfig, ConfigError};
pub use events::{CollabEvent, EventBus, Subscription};
pub use gateway::{
    ChannelGateway, DetachedGateway, GatewayError, InboundEvent, OutboundMessage, SyncGateway,
};
pub use history::{UndoEntry, UndoManager, UndoStep};
pub use ids::{FieldId, IdError, RowId, SectionId, UserId};
pub use log::{Disposition, LogEntry, OperationLog, Origin};
pub use mutator::MutationError;
pub use operation::{Change, OpId, Operation, OperationKind, Stamp};
pub use presence::{
    ActiveUser, CursorPosition, CursorThrottle, LiveCursor, PresenceEvent, PresenceSnapshot,
    PresenceTracker,
};
pub use resolver::{Outcome, Resolution, ResolveError, Supersession};
pub use session::{Committed, Session, SessionError};
pub use tree::{
    Attribute, DocumentTree, Field, FieldKind, FieldPatch, Placement, Row, Section, MAX_ROW_FIELDS,
};
pub use wire::{WireError, WireOperation};
