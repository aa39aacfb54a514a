//! Relay-side session state.

use std::time::Instant;

use fastsync_core::SessionId;

/// One physical connection as the relay sees it.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    /// Room joined via handshake; `None` until the client names one.
    pub room: Option<String>,
    /// Cleared on every heartbeat round, set again by a protocol pong.
    pub alive: bool,
    /// Missed a heartbeat round; waiting for the connection to go away.
    pub expired: bool,
    /// Time of the last frame of any kind received from this session.
    pub last_seen: Instant,
}

impl Session {
    /// Create a new session.
    pub fn new(id: SessionId, now: Instant) -> Self {
        Self {
            id,
            room: None,
            alive: true,
            expired: false,
            last_seen: now,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
    }
}
