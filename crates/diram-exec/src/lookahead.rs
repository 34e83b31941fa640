//! Direct-mapped lookahead cache.
//!
//! One entry per slot, `slot = hint % capacity`. Each entry remembers which
//! hint wrote it, so a lookup for a colliding hint misses instead of reading
//! someone else's prediction. Collisions overwrite: last writer wins, no
//! chaining, no recency eviction.

use std::sync::atomic::{AtomicU64, Ordering};

use diram_core::clock::unix_millis;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::trace;

/// A prediction is applied only strictly above this confidence.
pub const CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Prior for a hint with no entry yet.
pub const INITIAL_CONFIDENCE: f64 = 0.5;

/// Step towards 1.0 on a confirmed prediction, towards 0.0 on a miss.
pub const LEARNING_RATE: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LookaheadEntry {
    pub pattern_hint: u32,
    pub predicted_size: usize,
    pub last_access_ms: u64,
    pub confidence: f64,
}

impl LookaheadEntry {
    pub fn applies(&self) -> bool {
        self.confidence > CONFIDENCE_THRESHOLD
    }
}

pub struct LookaheadCache {
    slots: RwLock<Vec<Option<LookaheadEntry>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LookaheadCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(vec![None; capacity.max(1)]),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.read().len()
    }

    pub fn slot_of(&self, hint: u32) -> usize {
        hint as usize % self.capacity()
    }

    /// Entry for exactly `hint`, if its slot currently holds one.
    pub fn lookup(&self, hint: u32) -> Option<LookaheadEntry> {
        let slots = self.slots.read();
        let found = slots[hint as usize % slots.len()].filter(|e| e.pattern_hint == hint);
        drop(slots);
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Overwrite the slot for `hint`. Returns the entry displaced, if it
    /// belonged to a different hint.
    pub fn record(&self, hint: u32, size: usize, confidence: f64) -> Option<LookaheadEntry> {
        let entry = LookaheadEntry {
            pattern_hint: hint,
            predicted_size: size,
            last_access_ms: unix_millis(),
            confidence: confidence.clamp(0.0, 1.0),
        };
        let mut slots = self.slots.write();
        let idx = hint as usize % slots.len();
        let prev = slots[idx].replace(entry);
        drop(slots);
        trace!(hint, size, confidence = entry.confidence, slot = idx, "lookahead recorded");
        prev.filter(|p| p.pattern_hint != hint)
    }

    /// Write back the size a request actually used.
    ///
    /// `prior` is the confidence observed when the request was planned. If
    /// the slot still predicts `size_used` for this hint, confidence moves
    /// towards 1.0; otherwise it decays towards 0.0. Returns the new
    /// confidence.
    pub fn learn(&self, hint: u32, size_used: usize, prior: f64) -> f64 {
        let mut slots = self.slots.write();
        let idx = hint as usize % slots.len();
        let confidence = match slots[idx] {
            Some(e) if e.pattern_hint == hint && e.predicted_size == size_used => {
                prior + (1.0 - prior) * LEARNING_RATE
            }
            Some(e) if e.pattern_hint == hint => prior * (1.0 - LEARNING_RATE),
            _ => prior,
        }
        .clamp(0.0, 1.0);
        slots[idx] = Some(LookaheadEntry {
            pattern_hint: hint,
            predicted_size: size_used,
            last_access_ms: unix_millis(),
            confidence,
        });
        drop(slots);
        trace!(hint, size_used, confidence, slot = idx, "lookahead learned");
        confidence
    }

    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.slots.write().iter_mut().for_each(|s| *s = None);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for LookaheadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookaheadCache")
            .field("capacity", &self.capacity())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}
