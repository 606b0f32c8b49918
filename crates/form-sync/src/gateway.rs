//! SyncGateway trait: the outbound side of the transport.
//!
//! The transport itself (pub/sub, reliable, ordered per sender) lives outside
//! this crate. Implementations:
//! - `ChannelGateway`: hands messages to a futures mpsc channel drained by
//!   whatever owns the connection
//! - `DetachedGateway`: read-only replicas and headless replay

use crate::operation::Operation;
use crate::presence::{LiveCursor, PresenceEvent};
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    #[error("Message rejected: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Outbound broadcast. Fire-and-forget: `Ok` means handed to the transport,
/// not delivered.
pub trait SyncGateway: Send + Sync {
    fn broadcast_change(&self, op: &Operation) -> Result<()>;

    fn broadcast_cursor(&self, cursor: &LiveCursor) -> Result<()>;
}

/// What a [`ChannelGateway`] puts on its channel.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Change(Operation),
    Cursor(LiveCursor),
}

impl OutboundMessage {
    /// JSON bytes for the wire.
    pub fn to_json(&self) -> Vec<u8> {
        match self {
            OutboundMessage::Change(op) => op.to_json(),
            OutboundMessage::Cursor(cursor) => serde_json::to_vec(&PresenceEvent::Cursor {
                cursor: cursor.clone(),
            })
            .expect("PresenceEvent serialization should not fail"),
        }
    }
}

/// Everything a replica can receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundEvent {
    Change(Operation),
    Presence(PresenceEvent),
}

impl From<Operation> for InboundEvent {
    fn from(op: Operation) -> Self {
        InboundEvent::Change(op)
    }
}

impl From<PresenceEvent> for InboundEvent {
    fn from(event: PresenceEvent) -> Self {
        InboundEvent::Presence(event)
    }
}

/// Gateway backed by an unbounded futures channel.
#[derive(Debug, Clone)]
pub struct ChannelGateway {
    tx: UnboundedSender<OutboundMessage>,
}

impl ChannelGateway {
    pub fn new() -> (Self, UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded();
        (Self { tx }, rx)
    }

    fn send(&self, message: OutboundMessage) -> Result<()> {
        self.tx
            .unbounded_send(message)
            .map_err(|e| GatewayError::Unavailable(e.to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl SyncGateway for ChannelGateway {
    fn broadcast_change(&self, op: &Operation) -> Result<()> {
        self.send(OutboundMessage::Change(op.clone()))
    }

    fn broadcast_cursor(&self, cursor: &LiveCursor) -> Result<()> {
        self.send(OutboundMessage::Cursor(cursor.clone()))
    }
}

/// Gateway that sends nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedGateway;

impl SyncGateway for DetachedGateway {
    fn broadcast_change(&self, _op: &Operation) -> Result<()> {
        Ok(())
    }

    fn broadcast_cursor(&self, _cursor: &LiveCursor) -> Result<()> {
        Ok(())
    }
}
