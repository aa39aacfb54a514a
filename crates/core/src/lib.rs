//! fastsync Core
//!
//! Identifier and transform types shared by the relay server and the client
//! session, plus the two pieces of bookkeeping both sides lean on:
//!
//! - [`SlotAllocator`]: lowest-free-index allocation of reusable numeric slots
//!   (session ids on the relay, local object slots on a client).
//! - [`DirtyTracker`]: per-object cache of the last sampled transform that
//!   gates retransmission.
//!
//! # Architecture Constraints
//!
//! This crate MUST NOT perform I/O, read wall-clock time or spawn tasks.
//! Everything here is plain data driven by the caller.

#![deny(unsafe_code)]

pub mod dirty;
pub mod slots;

pub use dirty::DirtyTracker;
pub use slots::SlotAllocator;

// ============================================================================
// Type Aliases
// ============================================================================

/// Identifier of one connected participant, unique while it stays connected.
///
/// `0` is never handed out: the binary codec uses a zero word as padding.
pub type SessionId = u32;

/// Identifier of a synchronizable object.
///
/// Composed as `SYNC_ID_STRIDE * session_id + local_slot` at creation time.
pub type SyncId = u32;

/// Number of local slots reserved per session inside the `SyncId` space.
pub const SYNC_ID_STRIDE: u32 = 1024;

/// Compose a `SyncId` from the creating session and its local slot.
///
/// Returns `None` if the slot does not fit in the stride or the product
/// overflows the 32-bit id space.
pub fn compose_sync_id(session_id: SessionId, local_slot: u32) -> Option<SyncId> {
    if local_slot >= SYNC_ID_STRIDE {
        return None;
    }
    session_id
        .checked_mul(SYNC_ID_STRIDE)?
        .checked_add(local_slot)
}

/// Split a `SyncId` back into `(creating_session, local_slot)`.
///
/// This reflects the creator at creation time, not the current owner.
pub fn split_sync_id(sync_id: SyncId) -> (SessionId, u32) {
    (sync_id / SYNC_ID_STRIDE, sync_id % SYNC_ID_STRIDE)
}

// ============================================================================
// Transform
// ============================================================================

/// Number of float fields carried per object on the wire.
pub const TRANSFORM_FIELDS: usize = 6;

/// Rotation (Euler degrees) and position of one object.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Transform {
    pub rotation: [f32; 3],
    pub position: [f32; 3],
}

impl Transform {
    pub const ZERO: Self = Self {
        rotation: [0.0; 3],
        position: [0.0; 3],
    };

    pub fn new(rotation: [f32; 3], position: [f32; 3]) -> Self {
        Self { rotation, position }
    }

    /// Flatten into wire order: rotation x,y,z then position x,y,z.
    pub fn to_array(&self) -> [f32; TRANSFORM_FIELDS] {
        let [rx, ry, rz] = self.rotation;
        let [px, py, pz] = self.position;
        [rx, ry, rz, px, py, pz]
    }

    pub fn from_array(fields: [f32; TRANSFORM_FIELDS]) -> Self {
        let [rx, ry, rz, px, py, pz] = fields;
        Self {
            rotation: [rx, ry, rz],
            position: [px, py, pz],
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
