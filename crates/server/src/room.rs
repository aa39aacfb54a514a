//! Per-room coalescing buffer.
//!
//! - One slot per member, laid out in join order
//! - Slot size = largest payload that member ever submitted (never shrinks)
//! - A submission overwrites the member's slot in place; the tail beyond the
//!   payload is zeroed so decoders skip it as padding
//! - Growth or removal of a slot re-lays the buffer; bytes already submitted
//!   this interval move with their slot
//! - `take_flush` hands out the buffer once per dirty period, then zeroes it

use std::ops::Range;
use std::sync::Arc;

use fastsync_core::SessionId;

/// One member's region of the room buffer.
#[derive(Debug, Clone)]
struct Slot {
    session: SessionId,
    offset: usize,
    high_water: usize,
}

/// Result of [`Room::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    /// Payload fit the member's existing slot.
    Written,
    /// Payload grew the member's slot and the buffer was re-laid out.
    Resized,
    /// The session is not a member of this room.
    NotMember,
}

/// A named broadcast domain and its coalescing buffer.
#[derive(Debug)]
pub struct Room {
    name: String,
    slots: Vec<Slot>,
    buffer: Vec<u8>,
    dirty: bool,
}

impl Room {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Vec::new(),
            buffer: Vec::new(),
            dirty: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Member ids in join order.
    pub fn members(&self) -> Vec<SessionId> {
        self.slots.iter().map(|s| s.session).collect()
    }

    pub fn contains(&self, session: SessionId) -> bool {
        self.slots.iter().any(|s| s.session == session)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Current buffer size in bytes (sum of high-water marks).
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Byte range of a member's slot.
    pub fn slot_range(&self, session: SessionId) -> Option<Range<usize>> {
        self.slots
            .iter()
            .find(|s| s.session == session)
            .map(|s| s.offset..s.offset + s.high_water)
    }

    /// Add a member at the end of the layout. Returns `false` if already present.
    pub fn join(&mut self, session: SessionId) -> bool {
        if self.contains(session) {
            return false;
        }
        let offset = self.buffer.len();
        self.slots.push(Slot {
            session,
            offset,
            high_water: 0,
        });
        true
    }

    /// Remove a member and close the gap. Returns `false` if not present.
    pub fn leave(&mut self, session: SessionId) -> bool {
        let before = self.slots.len();
        self.slots.retain(|s| s.session != session);
        if self.slots.len() == before {
            return false;
        }
        self.relayout(None);
        true
    }

    /// Copy a member's payload into its slot and mark the room dirty.
    pub fn submit(&mut self, session: SessionId, payload: &[u8]) -> Submit {
        let Some(idx) = self.slots.iter().position(|s| s.session == session) else {
            return Submit::NotMember;
        };

        let outcome = if payload.len() > self.slots[idx].high_water {
            self.relayout(Some((idx, payload.len())));
            Submit::Resized
        } else {
            Submit::Written
        };

        let slot = &self.slots[idx];
        let region = &mut self.buffer[slot.offset..slot.offset + slot.high_water];
        let (head, tail) = region.split_at_mut(payload.len());
        head.copy_from_slice(payload);
        tail.fill(0);
        self.dirty = true;
        outcome
    }

    /// Take the buffer for broadcast if anything was submitted since the last
    /// flush. The live buffer is zeroed so stale payloads are not resent.
    pub fn take_flush(&mut self) -> Option<Arc<[u8]>> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        let frame: Arc<[u8]> = Arc::from(self.buffer.as_slice());
        self.buffer.fill(0);
        Some(frame)
    }

    /// Recompute offsets from high-water marks, optionally growing slot
    /// `grow.0` to `grow.1` bytes. Each slot keeps its current bytes; new
    /// space is zero.
    ///
    /// Slot offsets must still describe the current buffer when called.
    fn relayout(&mut self, grow: Option<(usize, usize)>) {
        let old = std::mem::take(&mut self.buffer);
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            let offset = self.buffer.len();
            self.buffer
                .extend_from_slice(&old[slot.offset..slot.offset + slot.high_water]);
            if let Some((grown, len)) = grow
                && grown == idx
            {
                self.buffer.resize(offset + len, 0);
                slot.high_water = len;
            }
            slot.offset = offset;
        }
    }
}
