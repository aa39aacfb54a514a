//! Reasons the relay drops an inbound frame.
//!
//! None of these close the connection; the runtime logs and moves on.

use fastsync_core::SessionId;
use fastsync_wire::ControlError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("session {0} missed its heartbeat and is closing")]
    ExpiredSession(SessionId),

    #[error("session {0} has not joined a room")]
    NotInRoom(SessionId),

    #[error("recipient {recipient} is not in room {room:?}")]
    UnknownRecipient { recipient: SessionId, room: String },

    #[error("binary payload of {len} bytes is not word-aligned")]
    UnalignedPayload { len: usize },

    #[error("binary payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("binary payload claims sender {claimed} on connection {actual}")]
    SpoofedSender { claimed: u32, actual: SessionId },

    #[error(transparent)]
    Control(#[from] ControlError),
}
