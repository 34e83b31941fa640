//! AsyncAllocator: request intake, in-flight cap and worker dispatch.
//!
//! - `request_async` never blocks and never fails: problems surface as a
//!   rejected promise.
//! - At most `max_pending` workers are in flight. Requests beyond that are
//!   rejected immediately with `GovernanceViolation`.
//! - One worker per request, on its own OS thread, or on tokio's blocking
//!   pool when `async-scheduler` is enabled and a runtime is current.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use diram_core::config::DiramConfig;
use diram_core::error::ErrorCode;
use diram_mem::traced::FreeOutcome;
use diram_mem::{EnhancedAllocation, EnhancedAllocator, FreeReport, MemorySpace};

use crate::lookahead::LookaheadCache;
use crate::metrics::WorkerSnapshot;
use crate::promise::{AwaitStatus, Promise, RejectReason, Rejection};
use crate::worker::{Job, RetryPolicy, Worker};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid configuration: {0}")]
    Config(#[from] diram_core::error::Error),
}

/// Count of workers in flight, with a condvar signalled when it drains.
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    drained: Condvar,
}

impl InFlight {
    fn current(&self) -> usize {
        *self.count.lock()
    }

    /// Block until the count reaches zero. Returns false on timeout.
    fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut count = self.count.lock();
        while *count > 0 {
            match deadline {
                Some(deadline) => {
                    if self.drained.wait_until(&mut count, deadline).timed_out() {
                        return *count == 0;
                    }
                }
                None => self.drained.wait(&mut count),
            }
        }
        true
    }
}

/// Holds one in-flight slot; dropping it returns the slot (panic-safe).
struct InFlightSlot {
    in_flight: Arc<InFlight>,
}

impl InFlightSlot {
    fn try_acquire(in_flight: &Arc<InFlight>, max: usize) -> Option<Self> {
        let mut count = in_flight.count.lock();
        if *count >= max {
            return None;
        }
        *count += 1;
        Some(Self {
            in_flight: Arc::clone(in_flight),
        })
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        let mut count = self.in_flight.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.in_flight.drained.notify_all();
        }
    }
}

pub struct AsyncAllocator {
    worker: Arc<Worker>,
    in_flight: Arc<InFlight>,
    max_pending: usize,
    default_timeout: Duration,
}

impl AsyncAllocator {
    pub fn new(worker: Worker) -> Self {
        let defaults = DiramConfig::default();
        Self {
            worker: Arc::new(worker),
            in_flight: Arc::new(InFlight::default()),
            max_pending: defaults.max_pending_promises,
            default_timeout: defaults.default_timeout(),
        }
    }

    pub fn from_config(cfg: &DiramConfig) -> Result<Self, ExecError> {
        cfg.validate()?;
        let worker = Worker::new(
            EnhancedAllocator::from_config(cfg),
            LookaheadCache::new(cfg.lookahead_cache_size),
            RetryPolicy::from_config(cfg),
        );
        Ok(Self::new(worker)
            .with_max_pending(cfg.max_pending_promises)
            .with_default_timeout(cfg.default_timeout()))
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn allocator(&self) -> &EnhancedAllocator {
        self.worker.allocator()
    }

    pub fn cache(&self) -> &LookaheadCache {
        self.worker.cache()
    }

    pub fn metrics(&self) -> WorkerSnapshot {
        self.worker.metrics().snapshot()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.current()
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Create a pending promise and dispatch a worker for it.
    pub fn request_async(
        &self,
        size: usize,
        tag: impl Into<String>,
        space: Option<MemorySpace>,
        pattern_hint: Option<u32>,
    ) -> Promise<EnhancedAllocation> {
        let pid = self.allocator().traced().current_pid();
        let promise = Promise::for_process(pid);
        let tag = tag.into();

        let Some(slot) = InFlightSlot::try_acquire(&self.in_flight, self.max_pending) else {
            self.worker.metrics().refused();
            let msg = format!(
                "{} requests already in flight (max {})",
                self.in_flight(),
                self.max_pending
            );
            warn!(size, tag = %tag, "async request refused: {msg}");
            self.allocator().errors().record(ErrorCode::GovernanceFail, msg.clone());
            let _ = promise
                .reject_with(Rejection::new(RejectReason::GovernanceViolation, msg).with_pid(pid));
            return promise;
        };

        self.worker.metrics().dispatched();
        debug!(promise = %promise.id(), size, tag = %tag, ?pattern_hint, "dispatching worker");
        self.dispatch(
            Job {
                promise: promise.clone(),
                size,
                tag,
                space,
                hint: pattern_hint,
            },
            slot,
        );
        promise
    }

    fn dispatch(&self, job: Job, slot: InFlightSlot) {
        let worker = Arc::clone(&self.worker);
        let promise = job.promise.clone();
        let task = move || {
            let _slot = slot;
            worker.run(job);
        };

        #[cfg(feature = "async-scheduler")]
        {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let _ = handle.spawn_blocking(task);
                return;
            }
        }

        let spawned = std::thread::Builder::new()
            .name(format!("diram-worker-{}", promise.id().get()))
            .spawn(task);
        if let Err(e) = spawned {
            warn!(error = %e, "worker spawn failed");
            let pid = self.allocator().traced().current_pid();
            let _ = promise.reject_with(
                Rejection::new(RejectReason::Fatal, format!("worker spawn failed: {e}")).with_pid(pid),
            );
        }
    }

    /// Wait using the configured default timeout.
    pub fn await_default(&self, promise: &Promise<EnhancedAllocation>) -> AwaitStatus {
        promise.wait(self.default_timeout)
    }

    /// Enhanced free through the shared allocator.
    pub fn free(
        &self,
        alloc: EnhancedAllocation,
    ) -> FreeOutcome<EnhancedAllocation, FreeReport> {
        self.allocator().free_enhanced(alloc)
    }

    /// Block until no worker is in flight. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.in_flight.wait_drained(timeout)
    }
}

impl std::fmt::Debug for AsyncAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncAllocator")
            .field("worker", &self.worker)
            .field("in_flight", &self.in_flight())
            .field("max_pending", &self.max_pending)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
