//! Client-side error types.

use fastsync_core::{SessionId, SyncId};
use fastsync_wire::{ControlError, DecodeError};
use thiserror::Error;

/// Errors raised by [`ClientSession`](crate::ClientSession) operations and
/// inbound message handling.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session id assigned yet")]
    NotConnected,

    #[error("all {0} local object slots are in use")]
    ObjectLimit(u32),

    #[error("no locally owned object with sync id {0}")]
    UnknownObject(SyncId),

    #[error("no foreign object ({owner}, {sync_id})")]
    UnknownForeignObject { owner: SessionId, sync_id: SyncId },

    #[error("no pong received since the last ping")]
    PongTimeout,

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Errors surfaced by the async runtime.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection closed before the handshake completed")]
    HandshakeFailed,

    #[error("session closed")]
    Closed,

    #[error(transparent)]
    Session(#[from] SessionError),
}
