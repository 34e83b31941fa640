//! Traced allocation.
//!
//! Every allocation passes the epoch gate, gets a receipt over
//! `(address, size, timestamp, tag)`, is bound to the creating process and is
//! written to the trace log as one pipe-delimited line:
//!
//! ```text
//! TIMESTAMP|PID|OPERATION|ADDRESS|SIZE|RECEIPT|TAG
//! ```

use std::sync::Arc;

use diram_core::clock::{EpochClock, MonotonicClock};
use diram_core::config::DiramConfig;
use diram_core::hash::{Blake3Receipts, Receipt, ReceiptHasher, ReceiptInput};
use diram_core::heap::{HeapPrimitive, Region, SystemHeap};
use diram_core::process::{OsProcess, ProcessIdentity};
use tracing::{debug, trace, warn};

use crate::error::{AllocError, Result};
use crate::gate::HeapContext;
use crate::sink::LineSink;
use crate::tracking::{AllocSnapshot, AllocStats, GovernanceSnapshot, GovernanceStats};

/// A live, traced allocation. Owns its region until freed.
#[derive(Debug)]
pub struct Allocation {
    region: Region,
    address: usize,
    size: usize,
    timestamp_ns: u64,
    receipt: Receipt,
    tag: String,
    owner_pid: u32,
    heap_events: u32,
}

impl Allocation {
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub fn receipt(&self) -> &Receipt {
        &self.receipt
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    /// Epoch event count at creation (1-based).
    pub fn heap_events(&self) -> u32 {
        self.heap_events
    }

    pub fn as_slice(&self) -> &[u8] {
        self.region.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.region.as_mut_slice()
    }

    #[cfg(any(test, feature = "failpoints"))]
    pub fn receipt_mut(&mut self) -> &mut Receipt {
        &mut self.receipt
    }

    /// Zero the region and the metadata, handing back the region.
    fn scrub(mut self) -> Region {
        self.region.scrub();
        self.address = 0;
        self.size = 0;
        self.timestamp_ns = 0;
        self.receipt = Receipt::ZERO;
        self.tag.clear();
        self.heap_events = 0;
        self.region
    }
}

/// Result of a free.
///
/// `Foreign` hands the allocation back untouched: it belongs to another
/// process (an ancestor, after a fork), so freeing it here is a no-op.
#[derive(Debug)]
pub enum FreeOutcome<T, R = ()> {
    Released(R),
    Foreign(T),
}

impl<T, R> FreeOutcome<T, R> {
    pub fn is_released(&self) -> bool {
        matches!(self, FreeOutcome::Released(_))
    }

    pub fn released(self) -> Option<R> {
        match self {
            FreeOutcome::Released(r) => Some(r),
            FreeOutcome::Foreign(_) => None,
        }
    }

    pub fn foreign(self) -> Option<T> {
        match self {
            FreeOutcome::Released(_) => None,
            FreeOutcome::Foreign(t) => Some(t),
        }
    }
}

pub struct TracedAllocator {
    heap: Arc<dyn HeapPrimitive>,
    clock: Arc<dyn EpochClock>,
    hasher: Arc<dyn ReceiptHasher>,
    identity: Arc<dyn ProcessIdentity>,
    trace: Option<Arc<dyn LineSink>>,
    max_events: u32,
    governance: GovernanceStats,
    stats: AllocStats,
}

impl TracedAllocator {
    /// System heap, monotonic 1s epochs, BLAKE3 receipts, OS process id.
    pub fn new(max_events: u32) -> Self {
        Self {
            heap: Arc::new(SystemHeap),
            clock: Arc::new(MonotonicClock::default()),
            hasher: Arc::new(Blake3Receipts),
            identity: Arc::new(OsProcess),
            trace: None,
            max_events: max_events.max(1),
            governance: GovernanceStats::default(),
            stats: AllocStats::default(),
        }
    }

    /// Event limit and epoch width from `cfg`. The trace sink is attached by
    /// the caller since opening it is IO.
    pub fn from_config(cfg: &DiramConfig) -> Self {
        Self::new(cfg.max_heap_events).with_clock(Arc::new(MonotonicClock::new(cfg.epoch_width())))
    }

    pub fn with_heap(mut self, heap: Arc<dyn HeapPrimitive>) -> Self {
        self.heap = heap;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn EpochClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn ReceiptHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn ProcessIdentity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn LineSink>) -> Self {
        self.trace = Some(sink);
        self
    }

    /// Fresh gate context using this allocator's event limit.
    pub fn new_context(&self) -> HeapContext {
        HeapContext::new(self.max_events)
    }

    pub fn max_events(&self) -> u32 {
        self.max_events
    }

    pub fn current_pid(&self) -> u32 {
        self.identity.current_pid()
    }

    pub fn identity(&self) -> Arc<dyn ProcessIdentity> {
        Arc::clone(&self.identity)
    }

    pub fn now_nanos(&self) -> u64 {
        self.clock.now_nanos()
    }

    pub fn governance(&self) -> GovernanceSnapshot {
        self.governance.snapshot()
    }

    pub fn stats(&self) -> AllocSnapshot {
        self.stats.snapshot()
    }

    pub fn allocate(&self, ctx: &mut HeapContext, size: usize, tag: &str) -> Result<Allocation> {
        let epoch = self.clock.epoch();
        let heap_events = match ctx.admit(epoch) {
            Ok(n) => n,
            Err(e) => {
                self.governance.record_violation();
                warn!(epoch, size, tag, max = ctx.max_events(), "heap constraint violated");
                return Err(e);
            }
        };

        let region = match self.heap.allocate(size) {
            Some(r) => r,
            None => {
                ctx.rollback();
                warn!(size, tag, heap = self.heap.name(), "underlying allocation failed");
                return Err(AllocError::OutOfMemory {
                    tag: tag.to_string(),
                    bytes: size,
                });
            }
        };
        self.governance.record_enforcement(ctx.epsilon());

        let timestamp_ns = self.clock.now_nanos();
        let address = region.address();
        let receipt = self.hasher.digest(&ReceiptInput {
            address,
            size,
            timestamp_ns,
            tag,
        });
        let owner_pid = self.identity.current_pid();

        self.stats.record_alloc(size);
        self.write_trace(timestamp_ns, owner_pid, "ALLOC", address, size, &receipt, tag);
        trace!(address, size, tag, heap_events, "traced alloc");

        Ok(Allocation {
            region,
            address,
            size,
            timestamp_ns,
            receipt,
            tag: tag.to_string(),
            owner_pid,
            heap_events,
        })
    }

    /// Free `alloc` if this process owns it.
    pub fn free(&self, alloc: Allocation) -> FreeOutcome<Allocation> {
        let pid = self.identity.current_pid();
        if alloc.owner_pid != pid {
            debug!(
                address = alloc.address,
                owner = alloc.owner_pid,
                pid,
                "free from non-owning process ignored"
            );
            return FreeOutcome::Foreign(alloc);
        }

        let ts = self.clock.now_nanos();
        self.write_trace(
            ts,
            pid,
            "FREE",
            alloc.address,
            alloc.size,
            &alloc.receipt,
            &alloc.tag,
        );
        self.stats.record_free(alloc.size);
        trace!(address = alloc.address, size = alloc.size, "traced free");

        let region = alloc.scrub();
        self.heap.release(region);
        FreeOutcome::Released(())
    }

    /// Recompute the receipt from the allocation's own fields.
    pub fn verify(&self, alloc: &Allocation) -> bool {
        let expected = self.hasher.digest(&ReceiptInput {
            address: alloc.address,
            size: alloc.size,
            timestamp_ns: alloc.timestamp_ns,
            tag: &alloc.tag,
        });
        expected == alloc.receipt
    }

    #[allow(clippy::too_many_arguments)]
    fn write_trace(
        &self,
        ts: u64,
        pid: u32,
        op: &str,
        address: usize,
        size: usize,
        receipt: &Receipt,
        tag: &str,
    ) {
        let Some(sink) = &self.trace else {
            return;
        };
        let line = format!("{ts}|{pid}|{op}|0x{address:x}|{size}|{receipt}|{tag}");
        // Trace failures never fail the allocation.
        if let Err(e) = sink.append_line(&line) {
            self.stats.record_trace_failure();
            warn!(error = %e, op, "trace write failed");
        }
    }
}

impl std::fmt::Debug for TracedAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracedAllocator")
            .field("heap", &self.heap.name())
            .field("hasher", &self.hasher.name())
            .field("max_events", &self.max_events)
            .field("traced", &self.trace.is_some())
            .finish()
    }
}
