//! Presence: who is here and where their pointer is.
//!
//! Provides `PresenceTracker` for the roster and cursor map, and
//! `CursorThrottle` for rate-limiting outbound pointer updates.
//!
//! Presence is advisory. Nothing here feeds back into the document, and a
//! lost or stale presence message only makes a cursor disappear for a while.
//!
//! Time is passed in as milliseconds since the epoch (`now_ms`) so that the
//! tracker stays deterministic under test.

use crate::config::{millis, CollabConfig};
use crate::ids::{FieldId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

const PALETTE: [&str; 12] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FFEAA7", "#DDA0DD", "#98D8C8", "#F7DC6F",
    "#BB8FCE", "#85C1E9", "#F8B500", "#00CED1",
];

/// Display color for `user`. Same id, same color, on every replica.
pub fn color_for(user: &UserId) -> &'static str {
    let index = fnv1a_hash(user.as_str()) % PALETTE.len() as u64;
    PALETTE[index as usize]
}

/// FNV-1a. Stable across Rust versions (unlike DefaultHasher).
fn fnv1a_hash(s: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// A participant in the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveUser {
    pub id: UserId,
    pub display_name: String,
    /// Contact channel (email, handle), if the participant shared one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub color: String,
}

impl ActiveUser {
    pub fn new(id: UserId, display_name: impl Into<String>) -> Self {
        let color = color_for(&id).to_string();
        Self {
            id,
            display_name: display_name.into(),
            contact: None,
            color,
        }
    }

    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }

    /// Override the derived color (e.g. with a server-assigned one).
    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }
}

/// Where a pointer is: free coordinates on the canvas, or over a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CursorPosition {
    Point { x: f64, y: f64 },
    #[serde(rename_all = "camelCase")]
    Field { field_id: FieldId },
}

impl CursorPosition {
    pub fn point(x: f64, y: f64) -> Self {
        CursorPosition::Point { x, y }
    }

    /// Distance in pixels between two points; 0 for the same field; `None`
    /// when the positions cannot be compared.
    pub fn distance(&self, other: &CursorPosition) -> Option<f64> {
        match (self, other) {
            (CursorPosition::Point { x: x1, y: y1 }, CursorPosition::Point { x: x2, y: y2 }) => {
                Some(((x1 - x2).powi(2) + (y1 - y2).powi(2)).sqrt())
            }
            (CursorPosition::Field { field_id: a }, CursorPosition::Field { field_id: b }) if a == b => {
                Some(0.0)
            }
            _ => None,
        }
    }
}

/// Latest pointer position of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveCursor {
    pub user_id: UserId,
    pub position: CursorPosition,
    /// Sender's clock, ms since epoch.
    pub timestamp: u64,
}

/// Presence traffic between participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PresenceEvent {
    Joined { user: ActiveUser },
    #[serde(rename_all = "camelCase")]
    Left { user_id: UserId },
    Cursor { cursor: LiveCursor },
    #[serde(rename_all = "camelCase")]
    Heartbeat { user_id: UserId },
}

impl PresenceEvent {
    pub fn user_id(&self) -> &UserId {
        match self {
            PresenceEvent::Joined { user } => &user.id,
            PresenceEvent::Left { user_id } | PresenceEvent::Heartbeat { user_id } => user_id,
            PresenceEvent::Cursor { cursor } => &cursor.user_id,
        }
    }
}

/// What a presence event did to the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    Joined(UserId),
    Left(UserId),
    CursorMoved(UserId),
    Touched(UserId),
    /// Our own echo, an unknown user leaving, or an out-of-date cursor.
    Ignored,
}

/// Roster entry with activity bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub user: ActiveUser,
    /// When first seen this session (ms since epoch)
    pub joined_at: u64,
    /// When last activity observed (ms since epoch)
    pub last_seen: u64,
}

#[derive(Debug, Clone)]
struct CursorEntry {
    cursor: LiveCursor,
    received_at: u64,
}

/// Point-in-time view for the editor. Sorted by user id.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceSnapshot {
    pub users: Vec<ActiveUser>,
    pub cursors: Vec<LiveCursor>,
}

/// Roster and cursor map of remote participants.
#[derive(Debug)]
pub struct PresenceTracker {
    local: UserId,
    participants: HashMap<UserId, Participant>,
    cursors: HashMap<UserId, CursorEntry>,
    presence_timeout_ms: u64,
    cursor_timeout_ms: u64,
}

impl PresenceTracker {
    pub fn new(local: UserId, config: &CollabConfig) -> Self {
        Self {
            local,
            participants: HashMap::new(),
            cursors: HashMap::new(),
            presence_timeout_ms: millis(config.presence_timeout),
            cursor_timeout_ms: millis(config.cursor_timeout),
        }
    }

    pub fn configure(&mut self, config: &CollabConfig) {
        self.presence_timeout_ms = millis(config.presence_timeout);
        self.cursor_timeout_ms = millis(config.cursor_timeout);
    }

    /// Apply an inbound presence event received at `now_ms`.
    pub fn apply(&mut self, event: PresenceEvent, now_ms: u64) -> PresenceChange {
        if event.user_id() == &self.local {
            return PresenceChange::Ignored;
        }
        match event {
            PresenceEvent::Joined { user } => self.join(user, now_ms),
            PresenceEvent::Left { user_id } => {
                if self.leave(&user_id) {
                    PresenceChange::Left(user_id)
                } else {
                    PresenceChange::Ignored
                }
            }
            PresenceEvent::Cursor { cursor } => self.update_cursor(cursor, now_ms),
            PresenceEvent::Heartbeat { user_id } => {
                self.touch(&user_id, now_ms);
                PresenceChange::Touched(user_id)
            }
        }
    }

    /// Add or refresh a participant. A repeated join overwrites the entry but
    /// keeps `joined_at`.
    pub fn join(&mut self, user: ActiveUser, now_ms: u64) -> PresenceChange {
        let id = user.id.clone();
        match self.participants.get_mut(&id) {
            Some(existing) => {
                existing.user = user;
                existing.last_seen = now_ms;
                PresenceChange::Touched(id)
            }
            None => {
                info!(user = %id, "Participant joined");
                self.participants.insert(
                    id.clone(),
                    Participant {
                        user,
                        joined_at: now_ms,
                        last_seen: now_ms,
                    },
                );
                PresenceChange::Joined(id)
            }
        }
    }

    /// Remove a participant and their cursor.
    pub fn leave(&mut self, user_id: &UserId) -> bool {
        self.cursors.remove(user_id);
        let removed = self.participants.remove(user_id).is_some();
        if removed {
            info!(user = %user_id, "Participant left");
        }
        removed
    }

    /// Update `last_seen`.
    pub fn touch(&mut self, user_id: &UserId, now_ms: u64) {
        if let Some(participant) = self.participants.get_mut(user_id) {
            participant.last_seen = participant.last_seen.max(now_ms);
        }
    }

    /// Store a cursor, replacing the user's previous one unless that one is
    /// newer.
    pub fn update_cursor(&mut self, cursor: LiveCursor, now_ms: u64) -> PresenceChange {
        if cursor.user_id == self.local {
            return PresenceChange::Ignored;
        }
        if let Some(existing) = self.cursors.get(&cursor.user_id) {
            if existing.cursor.timestamp > cursor.timestamp {
                debug!(user = %cursor.user_id, "Dropping out-of-date cursor");
                return PresenceChange::Ignored;
            }
        }
        let user_id = cursor.user_id.clone();
        self.touch(&user_id, now_ms);
        self.cursors.insert(
            user_id.clone(),
            CursorEntry {
                cursor,
                received_at: now_ms,
            },
        );
        PresenceChange::CursorMoved(user_id)
    }

    /// Drop participants idle beyond the presence timeout (with their
    /// cursors) and cursors idle beyond the cursor timeout. Returns the
    /// evicted participants.
    pub fn evict_stale(&mut self, now_ms: u64) -> Vec<UserId> {
        let presence_timeout = self.presence_timeout_ms;
        let mut evicted: Vec<UserId> = self
            .participants
            .values()
            .filter(|p| now_ms.saturating_sub(p.last_seen) > presence_timeout)
            .map(|p| p.user.id.clone())
            .collect();
        evicted.sort();

        for user_id in &evicted {
            self.participants.remove(user_id);
            self.cursors.remove(user_id);
            info!(user = %user_id, "Participant evicted after inactivity");
        }

        let cursor_timeout = self.cursor_timeout_ms;
        self.cursors
            .retain(|_, entry| now_ms.saturating_sub(entry.received_at) <= cursor_timeout);

        evicted
    }

    /// Evict, then report who is here and where. Sorted by user id.
    pub fn snapshot(&mut self, now_ms: u64) -> PresenceSnapshot {
        self.evict_stale(now_ms);
        PresenceSnapshot {
            users: self.roster(),
            cursors: self.cursors(),
        }
    }

    pub fn roster(&self) -> Vec<ActiveUser> {
        let mut users: Vec<_> = self.participants.values().map(|p| p.user.clone()).collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }

    pub fn cursors(&self) -> Vec<LiveCursor> {
        let mut cursors: Vec<_> = self.cursors.values().map(|e| e.cursor.clone()).collect();
        cursors.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        cursors
    }

    pub fn participant(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

/// Rate limiter for outbound cursor updates.
///
/// A position is sent when at least `interval_ms` has passed since the last
/// send and it is at least `min_distance` away from the last sent position.
/// Anything held back is kept as a single pending position (the most recent)
/// and released by [`CursorThrottle::flush`] on the trailing edge.
#[derive(Debug)]
pub struct CursorThrottle {
    interval_ms: u64,
    min_distance: f64,
    last_sent: Option<(CursorPosition, u64)>,
    pending: Option<CursorPosition>,
}

impl CursorThrottle {
    pub fn new(config: &CollabConfig) -> Self {
        Self {
            interval_ms: millis(config.cursor_interval),
            min_distance: config.cursor_min_distance,
            last_sent: None,
            pending: None,
        }
    }

    pub fn configure(&mut self, config: &CollabConfig) {
        self.interval_ms = millis(config.cursor_interval);
        self.min_distance = config.cursor_min_distance;
    }

    /// Offer a new position. Returns it if it should be sent now.
    pub fn offer(&mut self, position: CursorPosition, now_ms: u64) -> Option<CursorPosition> {
        if let Some((last, sent_at)) = &self.last_sent {
            let jitter = last
                .distance(&position)
                .is_some_and(|distance| distance < self.min_distance);
            if jitter {
                self.pending = None;
                return None;
            }
            if now_ms.saturating_sub(*sent_at) < self.interval_ms {
                self.pending = Some(position);
                return None;
            }
        }
        self.pending = None;
        self.last_sent = Some((position.clone(), now_ms));
        Some(position)
    }

    /// Release the pending position once the interval has passed.
    pub fn flush(&mut self, now_ms: u64) -> Option<CursorPosition> {
        let due = self
            .last_sent
            .as_ref()
            .is_none_or(|(_, sent_at)| now_ms.saturating_sub(*sent_at) >= self.interval_ms);
        if !due {
            return None;
        }
        let position = self.pending.take()?;
        self.last_sent = Some((position.clone(), now_ms));
        Some(position)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}
