//! Peak, governance and allocator counters.
//!
//! All counters are relaxed atomics: cheap, advisory, never used for control
//! flow.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use crate::gate::EPSILON_LIMIT;

#[derive(Default)]
pub struct PeakTracker {
    peak_bytes: AtomicUsize,
}

impl PeakTracker {
    pub fn new() -> Self {
        Self {
            peak_bytes: AtomicUsize::new(0),
        }
    }

    /// Record a new "used bytes" value; updates peak if higher.
    pub fn record_used(&self, used_bytes: usize) {
        let mut cur = self.peak_bytes.load(Ordering::Relaxed);
        while used_bytes > cur {
            match self.peak_bytes.compare_exchange(
                cur,
                used_bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
        tracing::trace!(
            used_bytes,
            peak = self.peak_bytes.load(Ordering::Relaxed),
            "space usage"
        );
    }

    pub fn peak(&self) -> usize {
        self.peak_bytes.load(Ordering::Relaxed)
    }
}

/// Admission outcomes across every context that went through one allocator.
#[derive(Default)]
pub struct GovernanceStats {
    epsilon_bits: AtomicU64,
    violations: AtomicU64,
    enforcements: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GovernanceSnapshot {
    /// ε of the most recently admitted event.
    pub epsilon_current: f64,
    pub epsilon_limit: f64,
    pub violations: u64,
    pub enforcements: u64,
}

impl GovernanceStats {
    pub fn record_enforcement(&self, epsilon: f64) {
        self.enforcements.fetch_add(1, Ordering::Relaxed);
        self.epsilon_bits.store(epsilon.to_bits(), Ordering::Relaxed);
    }

    pub fn record_violation(&self) {
        self.violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GovernanceSnapshot {
        GovernanceSnapshot {
            epsilon_current: f64::from_bits(self.epsilon_bits.load(Ordering::Relaxed)),
            epsilon_limit: EPSILON_LIMIT,
            violations: self.violations.load(Ordering::Relaxed),
            enforcements: self.enforcements.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
pub struct AllocStats {
    allocated_bytes: AtomicU64,
    freed_bytes: AtomicU64,
    live: AtomicUsize,
    trace_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocSnapshot {
    pub total_allocated: u64,
    pub total_freed: u64,
    pub live_allocations: usize,
    pub trace_failures: u64,
}

impl AllocStats {
    pub fn record_alloc(&self, bytes: usize) {
        self.allocated_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_free(&self, bytes: usize) {
        self.freed_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        // Saturate instead of wrapping if frees ever outrun allocations.
        let _ = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_trace_failure(&self) {
        self.trace_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AllocSnapshot {
        AllocSnapshot {
            total_allocated: self.allocated_bytes.load(Ordering::Relaxed),
            total_freed: self.freed_bytes.load(Ordering::Relaxed),
            live_allocations: self.live.load(Ordering::Relaxed),
            trace_failures: self.trace_failures.load(Ordering::Relaxed),
        }
    }
}
