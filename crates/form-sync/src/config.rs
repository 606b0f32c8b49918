//! Session configuration.

use crate::history::DEFAULT_MAX_DEPTH;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("cursor_min_distance must be a finite, non-negative number (got {0})")]
    InvalidDistance(f64),
    #[error("cursor_timeout ({cursor:?}) must not exceed presence_timeout ({presence:?})")]
    CursorOutlivesPresence { cursor: Duration, presence: Duration },
}

/// Tunables for a collaboration session.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Undo levels kept per user, 0 = unlimited (default: 100)
    pub undo_depth: usize,
    /// Minimum time between outbound cursor updates (default: 50ms)
    pub cursor_interval: Duration,
    /// Pointer moves shorter than this, in pixels, are not sent (default: 2.0)
    pub cursor_min_distance: f64,
    /// Time without an update before a cursor is hidden (default: 5s)
    pub cursor_timeout: Duration,
    /// Time without any activity before a participant is evicted (default: 30s)
    pub presence_timeout: Duration,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            undo_depth: DEFAULT_MAX_DEPTH,
            cursor_interval: Duration::from_millis(50),
            cursor_min_distance: 2.0,
            cursor_timeout: Duration::from_secs(5),
            presence_timeout: Duration::from_secs(30),
        }
    }
}

impl CollabConfig {
    pub fn with_undo_depth(mut self, undo_depth: usize) -> Self {
        self.undo_depth = undo_depth;
        self
    }

    pub fn with_cursor_interval(mut self, interval: Duration) -> Self {
        self.cursor_interval = interval;
        self
    }

    pub fn with_cursor_min_distance(mut self, distance: f64) -> Self {
        self.cursor_min_distance = distance;
        self
    }

    pub fn with_cursor_timeout(mut self, timeout: Duration) -> Self {
        self.cursor_timeout = timeout;
        self
    }

    pub fn with_presence_timeout(mut self, timeout: Duration) -> Self {
        self.presence_timeout = timeout;
        self
    }

    /// Check the values make sense together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cursor_timeout.is_zero() {
            return Err(ConfigError::Zero("cursor_timeout"));
        }
        if self.presence_timeout.is_zero() {
            return Err(ConfigError::Zero("presence_timeout"));
        }
        if !self.cursor_min_distance.is_finite() || self.cursor_min_distance < 0.0 {
            return Err(ConfigError::InvalidDistance(self.cursor_min_distance));
        }
        if self.cursor_timeout > self.presence_timeout {
            return Err(ConfigError::CursorOutlivesPresence {
                cursor: self.cursor_timeout,
                presence: self.presence_timeout,
            });
        }
        Ok(())
    }
}

/// Milliseconds in `duration`, saturating.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
