//! Lookahead cache: confidence gate, collisions, learning

use diram_exec::lookahead::{CONFIDENCE_THRESHOLD, INITIAL_CONFIDENCE, LEARNING_RATE};
use diram_exec::{LookaheadCache, RetryPolicy, Worker};
use diram_mem::{EnhancedAllocator, ProtectionFlags, TracedAllocator};

fn worker(capacity: usize) -> Worker {
    Worker::new(
        EnhancedAllocator::new(TracedAllocator::new(8), ProtectionFlags::default()),
        LookaheadCache::new(capacity),
        RetryPolicy::disabled(),
    )
}

#[test]
fn test_confidence_at_threshold_is_not_applied() {
    let w = worker(64);
    w.cache().record(7, 4096, CONFIDENCE_THRESHOLD);

    let plan = w.plan(100, Some(7));
    assert_eq!(plan.requested_size, 100);
    assert_eq!(plan.lookahead_size, 100);
    assert!(!plan.prefetch_enabled);
    assert!((plan.prediction_confidence - CONFIDENCE_THRESHOLD).abs() < 1e-12);
}

#[test]
fn test_confidence_above_threshold_is_applied() {
    let w = worker(64);
    w.cache().record(7, 4096, 0.71);

    let plan = w.plan(100, Some(7));
    assert_eq!(plan.lookahead_size, 4096);
    assert!(plan.prefetch_enabled);
    assert_eq!(plan.access_pattern_hint, Some(7));
}

#[test]
fn test_no_hint_never_consults_cache() {
    let w = worker(64);
    w.cache().record(0, 4096, 1.0);
    let plan = w.plan(100, None);
    assert_eq!(plan.lookahead_size, 100);
    assert_eq!(w.cache().hits() + w.cache().misses(), 0);
}

#[test]
fn test_unknown_hint_starts_from_prior() {
    let w = worker(64);
    let plan = w.plan(100, Some(3));
    assert_eq!(plan.lookahead_size, 100);
    assert_eq!(plan.prediction_confidence, INITIAL_CONFIDENCE);
    assert_eq!(w.cache().misses(), 1);
}

#[test]
fn test_colliding_hints_overwrite() {
    let cache = LookaheadCache::new(16);
    assert_eq!(cache.slot_of(3), cache.slot_of(19));

    assert!(cache.record(3, 100, 0.9).is_none());
    let displaced = cache.record(19, 200, 0.9).expect("slot taken over");
    assert_eq!(displaced.pattern_hint, 3);
    assert_eq!(displaced.predicted_size, 100);

    assert!(cache.lookup(3).is_none());
    let e = cache.lookup(19).expect("last writer wins");
    assert_eq!(e.predicted_size, 200);
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_rewrite_same_hint_is_not_a_displacement() {
    let cache = LookaheadCache::new(4);
    cache.record(2, 10, 0.2);
    assert!(cache.record(2, 20, 0.3).is_none());
    assert_eq!(cache.lookup(2).map(|e| e.predicted_size), Some(20));
}

#[test]
fn test_confidence_is_clamped() {
    let cache = LookaheadCache::new(4);
    cache.record(1, 10, 1.7);
    assert_eq!(cache.lookup(1).map(|e| e.confidence), Some(1.0));
    cache.record(1, 10, -0.5);
    assert_eq!(cache.lookup(1).map(|e| e.confidence), Some(0.0));
}

#[test]
fn test_repeated_sizes_build_confidence() {
    let cache = LookaheadCache::new(32);
    let mut confidence = INITIAL_CONFIDENCE;
    let mut history = Vec::new();
    for _ in 0..4 {
        confidence = cache.learn(9, 256, confidence);
        history.push(confidence);
    }

    // First write has nothing to confirm.
    assert_eq!(history[0], INITIAL_CONFIDENCE);
    let second = INITIAL_CONFIDENCE + (1.0 - INITIAL_CONFIDENCE) * LEARNING_RATE;
    assert!((history[1] - second).abs() < 1e-12);
    assert!(history[1] <= CONFIDENCE_THRESHOLD);
    assert!(history[2] > CONFIDENCE_THRESHOLD);
    assert!(history.windows(2).all(|w| w[1] > w[0]));
    assert!(cache.lookup(9).expect("entry").applies());
}

#[test]
fn test_changed_size_decays_confidence() {
    let cache = LookaheadCache::new(32);
    cache.record(5, 512, 0.9);
    let after = cache.learn(5, 128, 0.9);
    assert!((after - 0.9 * (1.0 - LEARNING_RATE)).abs() < 1e-12);
    let e = cache.lookup(5).expect("entry");
    assert_eq!(e.predicted_size, 128);
    assert!(!e.applies());
}
