//! Dirty-state tracking for outgoing transforms.
//!
//! The tracker keeps the most recent sample per object, not the most recent
//! *sent* value: every observation overwrites the cache. Comparison is exact
//! float inequality with no epsilon.

use std::collections::HashMap;

use crate::{SyncId, TRANSFORM_FIELDS, Transform};

/// Per-object sample cache plus a one-shot force-resync flag.
#[derive(Debug, Clone, Default)]
pub struct DirtyTracker {
    samples: HashMap<SyncId, [f32; TRANSFORM_FIELDS]>,
    force_resync: bool,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `sample` for `sync_id` and report whether it must be sent.
    ///
    /// True if any field differs from the previous sample, if there is no
    /// previous sample, or if a force-resync is pending. The cache is updated
    /// regardless of the result; the force flag is left untouched (see
    /// [`take_resync`](Self::take_resync)).
    pub fn should_send(&mut self, sync_id: SyncId, sample: &Transform) -> bool {
        let fields = sample.to_array();
        let changed = match self.samples.insert(sync_id, fields) {
            Some(previous) => previous.iter().zip(fields.iter()).any(|(a, b)| a != b),
            None => true,
        };
        changed || self.force_resync
    }

    /// Arm the one-shot force-resync flag (a remote session joined).
    pub fn request_resync(&mut self) {
        self.force_resync = true;
    }

    pub fn resync_pending(&self) -> bool {
        self.force_resync
    }

    /// Consume the force-resync flag, returning whether it was set.
    pub fn take_resync(&mut self) -> bool {
        std::mem::take(&mut self.force_resync)
    }

    /// Last sample retained for an object.
    pub fn retained(&self, sync_id: SyncId) -> Option<Transform> {
        self.samples.get(&sync_id).copied().map(Transform::from_array)
    }

    /// Drop the cache entry of an object that is no longer locally owned.
    pub fn forget(&mut self, sync_id: SyncId) {
        self.samples.remove(&sync_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(px: f32) -> Transform {
        Transform::new([0.0, 0.0, 0.0], [px, 2.0, 3.0])
    }

    #[test]
    fn test_first_sample_is_dirty() {
        let mut tracker = DirtyTracker::new();
        assert!(tracker.should_send(1, &sample(1.0)));
    }

    #[test]
    fn test_identical_sample_not_dirty() {
        let mut tracker = DirtyTracker::new();
        tracker.should_send(1, &sample(1.0));
        assert!(!tracker.should_send(1, &sample(1.0)));
    }

    #[test]
    fn test_changed_sample_updates_retained_value() {
        let mut tracker = DirtyTracker::new();
        tracker.should_send(1, &sample(1.0));
        assert!(tracker.should_send(1, &sample(1.5)));
        assert_eq!(tracker.retained(1), Some(sample(1.5)));
    }

    #[test]
    fn test_compares_against_previous_sample_not_previous_send() {
        let mut tracker = DirtyTracker::new();
        tracker.should_send(1, &sample(1.0));
        tracker.should_send(1, &sample(2.0));
        // Back to the first value: differs from the immediately preceding sample.
        assert!(tracker.should_send(1, &sample(1.0)));
        assert!(!tracker.should_send(1, &sample(1.0)));
    }

    #[test]
    fn test_force_resync_marks_everything_until_taken() {
        let mut tracker = DirtyTracker::new();
        tracker.should_send(1, &sample(1.0));
        tracker.request_resync();
        assert!(tracker.should_send(1, &sample(1.0)));
        assert!(tracker.take_resync());
        assert!(!tracker.take_resync());
        assert!(!tracker.should_send(1, &sample(1.0)));
    }

    #[test]
    fn test_forget_resets_object() {
        let mut tracker = DirtyTracker::new();
        tracker.should_send(1, &sample(1.0));
        tracker.forget(1);
        assert_eq!(tracker.retained(1), None);
        assert!(tracker.should_send(1, &sample(1.0)));
    }
}
