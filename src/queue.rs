//! Bounded per-layer buffer of materialized features.
//!
//! The queue is a cursor over a vector of owned slots. Dequeued slots
//! are emptied in place; when the cursor reaches the end the whole
//! vector is dropped and the cursor rewinds, so storage never grows
//! unbounded under repeated partial drains. The buffered length used for
//! read coordination counts consumed slots until that compaction point.

use std::collections::TryReserveError;

use log::warn;
use thiserror::Error;

use crate::record::Feature;

/// Soft and hard buffering thresholds for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Above this many buffered features the queue reports overfull and
    /// the read coordinator forces a switch to drain it.
    pub soft: usize,
    /// At this many buffered features further enqueues are rejected.
    pub hard: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            soft: 10_000,
            hard: 100_000,
        }
    }
}

/// Why an enqueue was refused. Non-fatal; the record is dropped.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EnqueueError {
    /// The hard buffering ceiling was reached.
    #[error("feature buffer for layer '{layer}' is full ({buffered} features)")]
    CapacityExceeded {
        /// Name of the owning layer.
        layer: String,
        /// Buffered feature count at rejection time.
        buffered: usize,
    },
    /// The buffer could not grow.
    #[error("cannot grow feature buffer for layer '{layer}'")]
    OutOfMemory {
        /// Name of the owning layer.
        layer: String,
        /// Underlying allocation failure.
        #[source]
        source: TryReserveError,
    },
}

/// FIFO buffer of features awaiting a consumer.
#[derive(Debug)]
pub struct FeatureQueue {
    label: String,
    entries: Vec<Option<Feature>>,
    cursor: usize,
    limits: QueueLimits,
    warned_capacity: bool,
}

impl FeatureQueue {
    /// Create an empty queue labelled with the owning layer's name.
    pub fn new(label: impl Into<String>, limits: QueueLimits) -> Self {
        Self {
            label: label.into(),
            entries: Vec::new(),
            cursor: 0,
            limits,
            warned_capacity: false,
        }
    }

    /// Append a feature.
    ///
    /// With `check_threshold`, rejects once the buffer holds
    /// `limits.hard` features; the over-capacity warning is emitted once
    /// per queue, not per rejection.
    pub fn enqueue(&mut self, feature: Feature, check_threshold: bool) -> Result<(), EnqueueError> {
        if check_threshold && self.entries.len() >= self.limits.hard {
            if !self.warned_capacity {
                warn!(
                    "too many features have accumulated in layer '{}'; \
                     enable interleaved reading or drain the layer",
                    self.label
                );
                self.warned_capacity = true;
            }
            return Err(EnqueueError::CapacityExceeded {
                layer: self.label.clone(),
                buffered: self.entries.len(),
            });
        }
        self.entries
            .try_reserve(1)
            .map_err(|source| EnqueueError::OutOfMemory {
                layer: self.label.clone(),
                source,
            })?;
        self.entries.push(Some(feature));
        Ok(())
    }

    /// Remove and return the oldest buffered feature.
    ///
    /// Returning the last buffered feature clears the backing storage
    /// and rewinds the cursor.
    pub fn dequeue_next(&mut self) -> Option<Feature> {
        let feature = self.entries.get_mut(self.cursor).and_then(Option::take)?;
        self.cursor += 1;
        if self.cursor == self.entries.len() {
            self.cursor = 0;
            self.entries.clear();
        }
        Some(feature)
    }

    /// Discard all buffered content and rewind the cursor.
    pub fn force_clear(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }

    /// Buffered length as seen by read coordination: includes slots
    /// already consumed since the last compaction.
    pub fn buffered_len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True above the soft threshold; used to force a drain switch.
    pub fn is_overfull(&self) -> bool {
        self.entries.len() > self.limits.soft
    }

    /// True when some, but not all, buffered features were consumed.
    pub fn has_partial_reads(&self) -> bool {
        self.cursor != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn queue_with_limits(soft: usize, hard: usize) -> FeatureQueue {
        FeatureQueue::new("points", QueueLimits { soft, hard })
    }

    fn feature(id: i64) -> Feature {
        Feature::new(id, 0)
    }

    #[rstest]
    fn dequeues_in_fifo_order() {
        let mut queue = queue_with_limits(10, 20);
        for id in 0..5 {
            queue.enqueue(feature(id), true).expect("within capacity");
        }
        let drained: Vec<i64> = std::iter::from_fn(|| queue.dequeue_next())
            .map(|f| f.id)
            .collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
    }

    #[rstest]
    fn full_drain_clears_storage() {
        let mut queue = queue_with_limits(10, 20);
        queue.enqueue(feature(1), true).expect("within capacity");
        queue.enqueue(feature(2), true).expect("within capacity");
        assert!(queue.dequeue_next().is_some());
        assert!(queue.has_partial_reads());
        assert_eq!(queue.buffered_len(), 2);
        assert!(queue.dequeue_next().is_some());
        assert_eq!(queue.buffered_len(), 0);
        assert!(!queue.has_partial_reads());
        assert!(queue.dequeue_next().is_none());
    }

    #[rstest]
    fn rejects_at_hard_ceiling() {
        let mut queue = queue_with_limits(2, 4);
        for id in 0..4 {
            queue.enqueue(feature(id), true).expect("below ceiling");
        }
        let refused = queue.enqueue(feature(4), true);
        assert!(matches!(
            refused,
            Err(EnqueueError::CapacityExceeded { buffered: 4, .. })
        ));
        // The ceiling only applies when the caller asks for it.
        queue.enqueue(feature(4), false).expect("unchecked enqueue");
        assert_eq!(queue.buffered_len(), 5);
    }

    #[rstest]
    fn overfull_above_soft_threshold() {
        let mut queue = queue_with_limits(2, 10);
        for id in 0..2 {
            queue.enqueue(feature(id), true).expect("below ceiling");
        }
        assert!(!queue.is_overfull());
        queue.enqueue(feature(2), true).expect("below ceiling");
        assert!(queue.is_overfull());
    }

    #[rstest]
    fn consumed_slots_count_until_compaction() {
        let mut queue = queue_with_limits(2, 3);
        for id in 0..3 {
            queue.enqueue(feature(id), true).expect("below ceiling");
        }
        assert!(queue.dequeue_next().is_some());
        // Two live features, but three slots until the drain completes.
        assert_eq!(queue.buffered_len(), 3);
        assert!(queue.is_overfull());
        assert!(matches!(
            queue.enqueue(feature(9), true),
            Err(EnqueueError::CapacityExceeded { .. })
        ));
    }

    #[rstest]
    fn force_clear_discards_everything() {
        let mut queue = queue_with_limits(2, 10);
        queue.enqueue(feature(1), true).expect("below ceiling");
        queue.dequeue_next();
        queue.enqueue(feature(2), true).expect("below ceiling");
        queue.force_clear();
        assert!(queue.is_empty());
        assert!(queue.dequeue_next().is_none());
        assert!(!queue.has_partial_reads());
    }

    #[rstest]
    fn default_limits_match_the_documented_constants() {
        let limits = QueueLimits::default();
        assert_eq!(limits.soft, 10_000);
        assert_eq!(limits.hard, 100_000);
    }
}
