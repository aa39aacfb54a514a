//! fastsync Client
//!
//! A client session keeps a set of locally owned objects streaming to a room
//! and mirrors the objects other sessions own.
//!
//! # Architecture
//!
//! - [`ClientSession`]: synchronous state machine, no I/O. Feed it relay
//!   frames, call [`ClientSession::tick`] at the tick rate, and drain its
//!   outbound queue onto the socket.
//! - [`Scene`]: the renderer-side collaborator the session drives.
//! - [`runtime`]: tokio/WebSocket driver. [`connect`] resolves only after the
//!   relay handshake, and every [`SessionHandle`] operation is executed in
//!   submission order by a single actor task.

#![deny(unsafe_code)]

pub mod error;
pub mod runtime;
pub mod scene;
pub mod session;

use std::time::Duration;

use fastsync_wire::FieldEncoding;

pub use error::{ClientError, SessionError};
pub use runtime::{SessionHandle, connect};
pub use scene::{Entity, EntityId, MemoryScene, Representation, Scene};
pub use session::{ClientSession, Outbound, SessionEvent, StealStatus};

/// Outgoing transform ticks per second.
pub const TICK_RATE_HZ: u32 = 30;

/// Application-level ping interval.
pub const HEARTBEAT_INTERVAL_MS: u64 = 3000;

/// Wait before retrying a removal or content update for an unknown mirror.
pub const RETRY_GRACE_MS: u64 = 1000;

/// Client configuration.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    pub tick_rate_hz: u32,
    pub heartbeat_interval_ms: u64,
    pub retry_grace_ms: u64,
    /// Float encoding of outgoing frames; inbound frames use the same one.
    pub encoding: FieldEncoding,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: TICK_RATE_HZ,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            retry_grace_ms: RETRY_GRACE_MS,
            encoding: FieldEncoding::Exact,
        }
    }
}

impl ClientConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate_hz.max(1)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn retry_grace(&self) -> Duration {
        Duration::from_millis(self.retry_grace_ms)
    }
}
