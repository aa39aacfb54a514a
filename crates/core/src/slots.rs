//! Reusable numeric slot allocation.
//!
//! Slots are plain indices into an occupancy table. Released slots go onto a
//! free set and are handed out again before the table grows, lowest index
//! first, so id reuse is deterministic.

use std::collections::BTreeSet;

/// Slot table with an ordered free list.
#[derive(Debug, Clone, Default)]
pub struct SlotAllocator {
    /// Occupancy per slot index.
    occupied: Vec<bool>,
    /// Released slots, ordered so the lowest index is reused first.
    free: BTreeSet<u32>,
    /// Leading slots that are never handed out.
    reserved: u32,
    /// Number of slots currently occupied.
    live: usize,
}

impl SlotAllocator {
    /// Create an empty allocator; the first slot handed out is `0`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an allocator whose first `reserved` slots are permanently taken.
    ///
    /// The relay reserves slot `0` so no session is ever assigned id `0`.
    pub fn with_reserved(reserved: u32) -> Self {
        Self {
            occupied: vec![true; reserved as usize],
            free: BTreeSet::new(),
            reserved,
            live: 0,
        }
    }

    /// Occupy and return the lowest free slot.
    pub fn allocate(&mut self) -> u32 {
        if let Some(idx) = self.free.pop_first() {
            self.occupied[idx as usize] = true;
            self.live += 1;
            return idx;
        }
        let idx = self.occupied.len() as u32;
        self.occupied.push(true);
        self.live += 1;
        idx
    }

    /// Mark a slot free for immediate reuse.
    ///
    /// Returns `false` if the slot was not occupied (unknown, already
    /// released, or reserved via [`with_reserved`](Self::with_reserved)).
    pub fn release(&mut self, idx: u32) -> bool {
        match self.occupied.get_mut(idx as usize) {
            Some(slot) if *slot && idx >= self.reserved => {
                *slot = false;
                self.free.insert(idx);
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    /// Whether the slot is currently handed out.
    pub fn is_occupied(&self, idx: u32) -> bool {
        idx >= self.reserved && self.occupied.get(idx as usize).copied().unwrap_or(false)
    }

    /// Number of live (allocated, not reserved) slots.
    pub fn live_count(&self) -> usize {
        self.live
    }
}
