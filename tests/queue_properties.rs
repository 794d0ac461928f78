//! Property-based tests for the feature queue.
//!
//! These complement the unit tests with invariants that must hold for
//! arbitrary enqueue/dequeue interleavings:
//!
//! - **FIFO:** dequeue order equals enqueue order for accepted features.
//! - **Compaction:** after a full drain the backing storage is empty.
//! - **Capacity:** the hard ceiling admits exactly `hard` features.

use std::collections::VecDeque;

use osmflow::{Feature, FeatureQueue, QueueLimits};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: accepted features come back in insertion order, and a
    /// full drain leaves zero buffered slots.
    #[test]
    fn dequeue_order_matches_enqueue_order(
        ops in proptest::collection::vec(any::<bool>(), 0..200),
    ) {
        let mut queue = FeatureQueue::new("model", QueueLimits { soft: 16, hard: 64 });
        let mut model: VecDeque<i64> = VecDeque::new();
        let mut next_id = 0_i64;

        for enqueue in ops {
            if enqueue {
                if queue.enqueue(Feature::new(next_id, 0), true).is_ok() {
                    model.push_back(next_id);
                }
                next_id += 1;
            } else {
                prop_assert_eq!(queue.dequeue_next().map(|f| f.id), model.pop_front());
            }
        }

        while let Some(expected) = model.pop_front() {
            prop_assert_eq!(queue.dequeue_next().map(|f| f.id), Some(expected));
        }
        prop_assert_eq!(queue.dequeue_next().map(|f| f.id), None);
        prop_assert_eq!(queue.buffered_len(), 0);
    }

    /// Property: without dequeues, exactly `hard` enqueues succeed and
    /// the next one is rejected.
    #[test]
    fn hard_ceiling_admits_exactly_its_capacity(hard in 1_usize..64) {
        let mut queue = FeatureQueue::new("model", QueueLimits { soft: 1, hard });
        for slot in 0..hard {
            let id = i64::try_from(slot).expect("small test id");
            prop_assert!(queue.enqueue(Feature::new(id, 0), true).is_ok());
        }
        prop_assert!(queue.enqueue(Feature::new(0, 0), true).is_err());
    }
}

/// The documented default thresholds: the first 100 000 enqueues
/// succeed and the 100 001st is rejected.
#[test]
fn default_hard_ceiling_rejects_the_hundred_thousand_and_first() {
    let mut queue = FeatureQueue::new("points", QueueLimits::default());
    for id in 0..100_000_i64 {
        assert!(
            queue.enqueue(Feature::new(id, 0), true).is_ok(),
            "enqueue {id} should be within capacity"
        );
    }
    assert!(queue.enqueue(Feature::new(100_000, 0), true).is_err());
    assert_eq!(queue.buffered_len(), 100_000);
}
