//! fastsync Relay Server
//!
//! The relay sits between client sessions and owns:
//! - Session id allocation (lowest free id, `0` reserved)
//! - Room membership and roster broadcast
//! - Control message routing with authoritative sender stamping
//! - Per-room coalescing of binary transform frames, flushed on a timer
//! - Protocol-level liveness
//!
//! # Architecture
//!
//! [`Relay`] is a synchronous state machine: every input (connection, text
//! frame, binary frame, timer tick) returns the [`Delivery`] list it causes.
//! The async [`net`] module runs exactly one `Relay` inside a single task, so
//! room buffers have a single writer without any locking.

#![deny(unsafe_code)]

pub mod error;
pub mod net;
pub mod room;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fastsync_core::{SessionId, SlotAllocator};
use fastsync_wire::{
    ClientMessage, ENTRY_WORDS, HEADER_WORDS, MAX_ENTRIES_PER_GROUP, PING, PONG, PeerMessage,
    ServerMessage,
};
pub use error::RelayError;
use room::{Room, Submit};
use session::Session;

// ============================================================================
// Default Parameters
// ============================================================================

/// Room buffer flush rate in Hz.
pub const FLUSH_RATE_HZ: u32 = 15;

/// Protocol ping interval; a session silent for a whole interval is dropped.
pub const HEARTBEAT_INTERVAL_MS: u64 = 5000;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 3000;

/// Largest binary payload one session may submit: one full group.
pub const MAX_PAYLOAD_BYTES: usize =
    (HEADER_WORDS + MAX_ENTRIES_PER_GROUP as usize * ENTRY_WORDS) * 4;

// ============================================================================
// Configuration
// ============================================================================

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub flush_rate_hz: u32,
    pub heartbeat_interval_ms: u64,
    pub max_payload_bytes: usize,
    /// Drop a room's state once its last member leaves.
    pub collect_empty_rooms: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            flush_rate_hz: FLUSH_RATE_HZ,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            max_payload_bytes: MAX_PAYLOAD_BYTES,
            collect_empty_rooms: true,
        }
    }
}

impl RelayConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(1) / self.flush_rate_hz.max(1)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

// ============================================================================
// Outbound Frames
// ============================================================================

/// Frame payload to hand to a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Text(String),
    /// Shared so one flushed room buffer can be queued to every member.
    Binary(Arc<[u8]>),
}

/// One frame addressed to one session.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: SessionId,
    pub frame: Outgoing,
}

impl Delivery {
    fn text(to: SessionId, text: impl Into<String>) -> Self {
        Self {
            to,
            frame: Outgoing::Text(text.into()),
        }
    }
}

/// Outcome of a heartbeat round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LivenessSweep {
    /// Sessions that never answered the previous ping. They have left their
    /// rooms; their ids stay reserved until [`Relay::disconnect_session`].
    pub expired: Vec<SessionId>,
    /// Sessions to ping now.
    pub to_ping: Vec<SessionId>,
    /// Roster updates caused by the expirations.
    pub deliveries: Vec<Delivery>,
}

// ============================================================================
// Relay State
// ============================================================================

/// Relay state for all rooms.
pub struct Relay {
    config: RelayConfig,
    sessions: HashMap<SessionId, Session>,
    ids: SlotAllocator,
    rooms: HashMap<String, Room>,
}

impl Relay {
    /// Create a relay with the given configuration.
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            // Id 0 doubles as the binary padding word.
            ids: SlotAllocator::with_reserved(1),
            rooms: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Get number of connected sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn room(&self, name: &str) -> Option<&Room> {
        self.rooms.get(name)
    }

    /// Accept a new connection: allocate its id and greet it.
    pub fn accept_session(&mut self, now: Instant) -> (SessionId, Vec<Delivery>) {
        let id = self.ids.allocate();
        self.sessions.insert(id, Session::new(id, now));
        tracing::debug!(session = id, "session accepted");

        let mut out = Vec::new();
        self.push_server_message(&mut out, id, &ServerMessage::Handshake { session_id: id });
        (id, out)
    }

    /// Handle a text frame from a session.
    pub fn handle_text(
        &mut self,
        id: SessionId,
        text: &str,
        now: Instant,
    ) -> Result<Vec<Delivery>, RelayError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(RelayError::UnknownSession(id))?;
        if session.expired {
            return Err(RelayError::ExpiredSession(id));
        }
        session.touch(now);

        if text == PING {
            return Ok(vec![Delivery::text(id, PONG)]);
        }

        match ClientMessage::parse(text)? {
            ClientMessage::Handshake { room } => Ok(self.join_room(id, room)),
            ClientMessage::Broadcast(message) => self.broadcast(id, message),
            ClientMessage::Direct { recipient, message } => self.direct(id, recipient, message),
        }
    }

    /// Handle a binary frame: overwrite the sender's slot in its room buffer.
    pub fn handle_binary(
        &mut self,
        id: SessionId,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), RelayError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(RelayError::UnknownSession(id))?;
        if session.expired {
            return Err(RelayError::ExpiredSession(id));
        }
        session.touch(now);

        if payload.len() % 4 != 0 {
            return Err(RelayError::UnalignedPayload { len: payload.len() });
        }
        if payload.len() > self.config.max_payload_bytes {
            return Err(RelayError::PayloadTooLarge {
                len: payload.len(),
                max: self.config.max_payload_bytes,
            });
        }
        if let Some(head) = payload.get(..4) {
            let claimed = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
            if claimed != id {
                return Err(RelayError::SpoofedSender { claimed, actual: id });
            }
        }

        let room_name = session.room.as_deref().ok_or(RelayError::NotInRoom(id))?;
        let room = self
            .rooms
            .get_mut(room_name)
            .ok_or(RelayError::NotInRoom(id))?;
        match room.submit(id, payload) {
            Submit::Resized => {
                tracing::debug!(
                    session = id,
                    room = room_name,
                    size = room.capacity(),
                    "room buffer resized"
                );
                Ok(())
            }
            Submit::Written => Ok(()),
            Submit::NotMember => Err(RelayError::NotInRoom(id)),
        }
    }

    /// Broadcast every dirty room's buffer to all of its members.
    pub fn flush(&mut self) -> Vec<Delivery> {
        let mut out = Vec::new();
        for room in self.rooms.values_mut() {
            let Some(frame) = room.take_flush() else {
                continue;
            };
            for member in room.members() {
                out.push(Delivery {
                    to: member,
                    frame: Outgoing::Binary(Arc::clone(&frame)),
                });
            }
        }
        out
    }

    /// Record a protocol-level pong.
    pub fn record_pong(&mut self, id: SessionId, now: Instant) {
        if let Some(session) = self.sessions.get_mut(&id)
            && !session.expired
        {
            session.alive = true;
            session.touch(now);
        }
    }

    /// Run one heartbeat round.
    ///
    /// Sessions that did not pong since the previous round are expired: they
    /// leave their room and every later frame from them is rejected, but the
    /// id is only freed once the connection itself is gone. Everyone else is
    /// marked pending and listed for a ping.
    pub fn sweep_liveness(&mut self) -> LivenessSweep {
        let mut sweep = LivenessSweep::default();
        for session in self.sessions.values_mut() {
            if session.expired {
                continue;
            }
            if session.alive {
                session.alive = false;
                sweep.to_ping.push(session.id);
            } else {
                sweep.expired.push(session.id);
            }
        }
        sweep.expired.sort_unstable();
        sweep.to_ping.sort_unstable();
        for &id in &sweep.expired {
            tracing::info!(session = id, "session timed out");
            let room = self.sessions.get_mut(&id).and_then(|s| {
                s.expired = true;
                s.room.take()
            });
            if let Some(room) = room {
                self.leave_room(id, &room, &mut sweep.deliveries);
            }
        }
        sweep
    }

    /// Handle session disconnect: leave the room, free the id, update roster.
    ///
    /// Unknown ids are ignored, so calling this twice is harmless.
    pub fn disconnect_session(&mut self, id: SessionId) -> Vec<Delivery> {
        let Some(session) = self.sessions.remove(&id) else {
            return Vec::new();
        };
        self.ids.release(id);
        tracing::debug!(session = id, "session removed");

        let mut out = Vec::new();
        if let Some(room) = session.room {
            self.leave_room(id, &room, &mut out);
        }
        out
    }

    // ------------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------------

    fn join_room(&mut self, id: SessionId, name: String) -> Vec<Delivery> {
        let mut out = Vec::new();
        let previous = self
            .sessions
            .get_mut(&id)
            .and_then(|s| s.room.replace(name.clone()));
        if let Some(previous) = previous {
            if previous == name {
                // Re-handshake into the same room: just resend the roster.
                self.push_roster(&mut out, &name);
                return out;
            }
            self.leave_room(id, &previous, &mut out);
        }

        tracing::info!(session = id, room = %name, "session joined room");
        self.rooms
            .entry(name.clone())
            .or_insert_with(|| Room::new(name.clone()))
            .join(id);
        self.push_roster(&mut out, &name);
        out
    }

    fn leave_room(&mut self, id: SessionId, name: &str, out: &mut Vec<Delivery>) {
        let Some(room) = self.rooms.get_mut(name) else {
            return;
        };
        room.leave(id);
        if room.is_empty() && self.config.collect_empty_rooms {
            self.rooms.remove(name);
            tracing::debug!(room = name, "empty room collected");
            return;
        }
        self.push_roster(out, name);
    }

    fn push_roster(&self, out: &mut Vec<Delivery>, name: &str) {
        let Some(room) = self.rooms.get(name) else {
            return;
        };
        let members = room.members();
        let message = ServerMessage::UpdateUsers {
            members: members.clone(),
        };
        for member in members {
            self.push_server_message(out, member, &message);
        }
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    fn room_of(&self, id: SessionId) -> Result<&Room, RelayError> {
        self.sessions
            .get(&id)
            .and_then(|s| s.room.as_deref())
            .and_then(|name| self.rooms.get(name))
            .ok_or(RelayError::NotInRoom(id))
    }

    fn broadcast(&self, sender: SessionId, message: PeerMessage) -> Result<Vec<Delivery>, RelayError> {
        let room = self.room_of(sender)?;
        let text = ServerMessage::Relayed { sender, message }.to_text()?;
        Ok(room
            .members()
            .into_iter()
            .filter(|&member| member != sender)
            .map(|member| Delivery::text(member, text.clone()))
            .collect())
    }

    fn direct(
        &self,
        sender: SessionId,
        recipient: SessionId,
        message: PeerMessage,
    ) -> Result<Vec<Delivery>, RelayError> {
        let room = self.room_of(sender)?;
        if !room.contains(recipient) {
            return Err(RelayError::UnknownRecipient {
                recipient,
                room: room.name().to_string(),
            });
        }
        let text = ServerMessage::Relayed { sender, message }.to_text()?;
        Ok(vec![Delivery::text(recipient, text)])
    }

    fn push_server_message(&self, out: &mut Vec<Delivery>, to: SessionId, message: &ServerMessage) {
        match message.to_text() {
            Ok(text) => out.push(Delivery::text(to, text)),
            Err(e) => tracing::error!(session = to, error = %e, "failed to encode server message"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
