//! The per-request worker.
//!
//! Sequence: read the lookahead cache, allocate (retrying transient
//! failures), settle the promise, write the outcome back to the cache.
//! Every worker uses its own gate context, so the epoch limit applies per
//! worker thread, not across workers.

use std::time::{Duration, Instant};

use diram_core::config::DiramConfig;
use diram_mem::telemetry::{EventDraft, Layer, Operation};
use diram_mem::{AllocError, EnhancedAllocation, EnhancedAllocator, MemorySpace};
use tracing::{debug, warn};

use crate::lookahead::{LookaheadCache, INITIAL_CONFIDENCE};
use crate::metrics::{emit_span, WorkerMetrics};
use crate::promise::{AlreadySettled, LookaheadPlan, Promise, RejectReason, Rejection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub exponential: bool,
}

impl RetryPolicy {
    pub fn from_config(cfg: &DiramConfig) -> Self {
        Self {
            enabled: cfg.retry_on_transient_failure,
            max_attempts: cfg.max_retry_attempts,
            initial_backoff: Duration::from_millis(cfg.retry_initial_backoff_ms),
            exponential: cfg.exponential_backoff,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_attempts: 0,
            initial_backoff: Duration::ZERO,
            exponential: false,
        }
    }

    /// Sleep before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.exponential {
            self.initial_backoff
                .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
        } else {
            self.initial_backoff
        }
    }

    fn allows(&self, err: &AllocError, attempts_so_far: u32) -> bool {
        self.enabled && err.is_transient() && attempts_so_far < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DiramConfig::default())
    }
}

/// Map an allocation failure to a rejection reason.
pub fn classify(err: &AllocError, plan: &LookaheadPlan) -> RejectReason {
    match err {
        AllocError::OutOfMemory { .. } => RejectReason::Fatal,
        AllocError::ConstraintViolation { .. } => RejectReason::GovernanceViolation,
        AllocError::MemoryExhausted { .. } => {
            // A hinted request whose hint did not produce a usable prediction.
            if plan.access_pattern_hint.is_some() && !plan.prefetch_enabled {
                RejectReason::LookaheadMiss
            } else {
                RejectReason::MemoryExhausted
            }
        }
        _ => RejectReason::Fatal,
    }
}

pub(crate) struct Job {
    pub promise: Promise<EnhancedAllocation>,
    pub size: usize,
    pub tag: String,
    pub space: Option<MemorySpace>,
    pub hint: Option<u32>,
}

pub struct Worker {
    allocator: EnhancedAllocator,
    cache: LookaheadCache,
    retry: RetryPolicy,
    metrics: WorkerMetrics,
}

impl Worker {
    pub fn new(allocator: EnhancedAllocator, cache: LookaheadCache, retry: RetryPolicy) -> Self {
        Self {
            allocator,
            cache,
            retry,
            metrics: WorkerMetrics::default(),
        }
    }

    pub fn allocator(&self) -> &EnhancedAllocator {
        &self.allocator
    }

    pub fn cache(&self) -> &LookaheadCache {
        &self.cache
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Build the plan for a request from the cache's current state.
    pub fn plan(&self, size: usize, hint: Option<u32>) -> LookaheadPlan {
        let mut plan = LookaheadPlan::requested(size, hint);
        let Some(hint) = hint else {
            return plan;
        };
        match self.cache.lookup(hint) {
            Some(entry) => {
                plan.prediction_confidence = entry.confidence;
                if entry.applies() {
                    plan.lookahead_size = entry.predicted_size;
                    plan.prefetch_enabled = true;
                    self.metrics.prediction_applied();
                }
                self.allocator.emit(
                    EventDraft::new(Layer::Cache, Operation::CacheHit)
                        .region(0, entry.predicted_size),
                );
            }
            None => {
                plan.prediction_confidence = INITIAL_CONFIDENCE;
                self.allocator
                    .emit(EventDraft::new(Layer::Cache, Operation::CacheMiss).region(0, size));
            }
        }
        plan
    }

    pub(crate) fn run(&self, job: Job) {
        let started = Instant::now();
        let Job {
            promise,
            size,
            tag,
            space,
            hint,
        } = job;

        let plan = self.plan(size, hint);
        promise.set_plan(plan);

        let mut ctx = self.allocator.new_context();
        let mut attempts = 0u32;
        let result = loop {
            match self.allocator.allocate_enhanced(
                &mut ctx,
                plan.lookahead_size,
                &tag,
                space.as_ref(),
            ) {
                Ok(alloc) => break Ok(alloc),
                Err(e) if self.retry.allows(&e, attempts) => {
                    attempts += 1;
                    self.metrics.retried();
                    debug!(attempt = attempts, error = %e, "retrying transient allocation failure");
                    std::thread::sleep(self.retry.backoff(attempts));
                }
                Err(e) => break Err(e),
            }
        };

        match result {
            Ok(alloc) => {
                let used = alloc.size();
                let address = alloc.address();
                let receipt = *alloc.receipt();
                promise.set_allocation_receipt(receipt);
                match promise.resolve(alloc) {
                    Ok(()) => {
                        self.metrics.resolved();
                        self.allocator.emit(
                            EventDraft::new(Layer::Promise, Operation::PromiseResolved)
                                .region(address, used)
                                .receipt(&receipt)
                                .tag(&tag),
                        );
                    }
                    Err(AlreadySettled(orphan)) => {
                        // Cancelled while in flight; give the space its bytes back.
                        debug!(promise = %promise.id(), address, "promise settled early, reclaiming");
                        let _ = self.allocator.free_enhanced(orphan);
                        self.metrics.reclaimed();
                    }
                }
                if let Some(hint) = hint {
                    let confidence = self.cache.learn(hint, used, plan.prediction_confidence);
                    self.allocator.emit(
                        EventDraft::new(Layer::Cache, Operation::CacheUpdate)
                            .region(0, used)
                            .tag(&tag),
                    );
                    emit_span(
                        "cache_update",
                        &[("hint", hint.to_string()), ("confidence", confidence.to_string())],
                    );
                }
            }
            Err(e) => {
                let reason = classify(&e, &plan);
                let pid = self.allocator.traced().current_pid();
                let rejection = Rejection::new(reason, e.to_string()).with_pid(pid);
                if promise.reject_with(rejection).is_ok() {
                    self.metrics.rejected();
                    self.allocator.emit(
                        EventDraft::new(Layer::Promise, Operation::PromiseRejected)
                            .code(reason.code())
                            .region(0, plan.lookahead_size)
                            .tag(&tag),
                    );
                }
                warn!(promise = %promise.id(), ?reason, error = %e, "async allocation rejected");
            }
        }

        emit_span(
            "worker_done",
            &[
                ("promise", promise.id().to_string()),
                ("attempts", (attempts + 1).to_string()),
                ("elapsed_us", started.elapsed().as_micros().to_string()),
            ],
        );
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("allocator", &self.allocator)
            .field("cache", &self.cache)
            .field("retry", &self.retry)
            .finish()
    }
}
