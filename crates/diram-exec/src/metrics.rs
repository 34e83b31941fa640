//! Worker counters and tracing hooks.
//!
//! Counters are cheap and advisory. Wire them to a metrics backend in the
//! binary layer if needed.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub fn emit_span(event: &str, key_values: &[(&str, String)]) {
    let span = tracing::span!(tracing::Level::TRACE, "diram_worker", event);
    let _entered = span.enter();
    for (k, v) in key_values {
        tracing::trace!(%event, %k, %v, "metric");
    }
}

#[derive(Default)]
pub struct WorkerMetrics {
    dispatched: AtomicU64,
    refused: AtomicU64,
    resolved: AtomicU64,
    rejected: AtomicU64,
    retries: AtomicU64,
    reclaimed: AtomicU64,
    predictions_applied: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub dispatched: u64,
    /// Turned away at the in-flight cap.
    pub refused: u64,
    pub resolved: u64,
    pub rejected: u64,
    pub retries: u64,
    /// Allocations freed because their promise was already cancelled.
    pub reclaimed: u64,
    pub predictions_applied: u64,
}

impl WorkerMetrics {
    pub fn dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn refused(&self) {
        self.refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resolved(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retried(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reclaimed(&self) {
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn prediction_applied(&self) {
        self.predictions_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            predictions_applied: self.predictions_applied.load(Ordering::Relaxed),
        }
    }
}
