//! End-to-end async allocation: workers, promises, cache and spaces together

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use diram_core::clock::ManualClock;
use diram_core::config::DiramConfig;
use diram_core::error::{ErrorCode, StatusPair};
use diram_core::heap::{HeapPrimitive, Region, SystemHeap};
use diram_core::process::FixedPid;
use diram_exec::{
    AsyncAllocator, AwaitStatus, ExecError, LookaheadCache, PromiseState, RejectReason,
    RetryPolicy, Worker,
};
use diram_io::MemoryTelemetrySink;
use diram_mem::{
    EnhancedAllocator, MemorySpace, Operation, ProtectionFlags, Telemetry, TracedAllocator,
};

const IDLE: Duration = Duration::from_secs(5);

struct ExhaustedHeap;

impl HeapPrimitive for ExhaustedHeap {
    fn allocate(&self, _size: usize) -> Option<Region> {
        None
    }

    fn release(&self, _region: Region) {}
}

/// Holds every allocation until opened, so workers stay in flight.
#[derive(Default)]
struct GateHeap {
    open: Mutex<bool>,
    opened: Condvar,
    waiting: AtomicUsize,
}

impl GateHeap {
    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }

    fn wait_for_waiters(&self, n: usize) {
        while self.waiting.load(Ordering::SeqCst) < n {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl HeapPrimitive for GateHeap {
    fn allocate(&self, size: usize) -> Option<Region> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
        drop(open);
        SystemHeap.allocate(size)
    }

    fn release(&self, region: Region) {
        SystemHeap.release(region);
    }
}

fn enhanced(traced: TracedAllocator) -> EnhancedAllocator {
    EnhancedAllocator::new(traced, ProtectionFlags::default())
}

fn runtime(allocator: EnhancedAllocator, retry: RetryPolicy, max_pending: usize) -> AsyncAllocator {
    AsyncAllocator::new(Worker::new(allocator, LookaheadCache::new(64), retry))
        .with_max_pending(max_pending)
        .with_default_timeout(IDLE)
}

fn default_runtime() -> AsyncAllocator {
    runtime(enhanced(TracedAllocator::new(8)), RetryPolicy::disabled(), 16)
}

#[test]
fn test_request_async_resolves_into_space() {
    let rt = default_runtime();
    let space = MemorySpace::create("async", 4096);

    let p = rt.request_async(512, "async", Some(space.clone()), None);
    assert_eq!(rt.await_default(&p), AwaitStatus::Resolved);
    assert_eq!(p.status(), StatusPair::ok());

    let plan = p.plan().expect("worker stored its plan");
    assert_eq!(plan.lookahead_size, 512);
    assert!(!plan.prefetch_enabled);

    let alloc = p.take_value().expect("value");
    assert_eq!(alloc.size(), 512);
    assert_eq!(p.receipt().allocation_receipt, Some(*alloc.receipt()));
    assert_eq!(space.used_bytes(), 512);

    assert!(rt.free(alloc).is_released());
    assert_eq!(space.used_bytes(), 0);

    assert!(rt.wait_idle(IDLE));
    let m = rt.metrics();
    assert_eq!(m.dispatched, 1);
    assert_eq!(m.resolved, 1);
}

#[test]
fn test_confident_prediction_overrides_requested_size() {
    let rt = default_runtime();
    rt.cache().record(42, 4096, 0.9);

    let p = rt.request_async(100, "predicted", None, Some(42));
    assert_eq!(rt.await_default(&p), AwaitStatus::Resolved);

    let plan = p.plan().expect("plan");
    assert_eq!(plan.requested_size, 100);
    assert_eq!(plan.lookahead_size, 4096);
    assert!(plan.prefetch_enabled);

    let alloc = p.take_value().expect("value");
    assert_eq!(alloc.size(), 4096);
    rt.free(alloc);
    assert!(rt.wait_idle(IDLE));
    assert_eq!(rt.metrics().predictions_applied, 1);
}

#[test]
fn test_workers_train_the_cache() {
    let rt = default_runtime();

    for _ in 0..3 {
        let p = rt.request_async(256, "train", None, Some(9));
        assert_eq!(rt.await_default(&p), AwaitStatus::Resolved);
        let alloc = p.take_value().expect("value");
        assert_eq!(alloc.size(), 256);
        rt.free(alloc);
        // The cache write happens after resolve.
        assert!(rt.wait_idle(IDLE));
    }

    let p = rt.request_async(64, "train", None, Some(9));
    assert_eq!(rt.await_default(&p), AwaitStatus::Resolved);
    let alloc = p.take_value().expect("value");
    assert_eq!(alloc.size(), 256);
    assert!(p.plan().map(|pl| pl.prefetch_enabled).unwrap_or(false));
    rt.free(alloc);
}

#[test]
fn test_space_exhaustion_rejections_are_classified() {
    let rt = default_runtime();
    let space = MemorySpace::create("tiny", 64);

    let plain = rt.request_async(128, "plain", Some(space.clone()), None);
    assert_eq!(rt.await_default(&plain), AwaitStatus::Rejected);
    assert_eq!(
        plain.rejection().map(|r| r.reason),
        Some(RejectReason::MemoryExhausted)
    );

    let hinted = rt.request_async(128, "hinted", Some(space.clone()), Some(5));
    assert_eq!(rt.await_default(&hinted), AwaitStatus::Rejected);
    assert_eq!(
        hinted.rejection().map(|r| r.reason),
        Some(RejectReason::LookaheadMiss)
    );
    assert_eq!(hinted.status(), StatusPair::failed(ErrorCode::LookaheadMiss));
    assert_eq!(space.used_bytes(), 0);
}

#[test]
fn test_underlying_failure_rejects_fatal() {
    let rt = runtime(
        enhanced(TracedAllocator::new(8).with_heap(Arc::new(ExhaustedHeap))),
        RetryPolicy::default(),
        4,
    );
    let p = rt.request_async(1 << 20, "oom", None, None);
    assert_eq!(rt.await_default(&p), AwaitStatus::Rejected);
    let r = p.rejection().expect("rejected");
    assert_eq!(r.reason, RejectReason::Fatal);
    assert_eq!(r.code, ErrorCode::Fatal);
    assert!(rt.wait_idle(IDLE));
    // Out-of-memory is not transient, so it was never retried.
    assert_eq!(rt.metrics().retries, 0);
}

#[test]
fn test_transient_failures_are_retried() {
    let retry = RetryPolicy {
        enabled: true,
        max_attempts: 2,
        initial_backoff: Duration::from_millis(1),
        exponential: true,
    };
    let rt = runtime(enhanced(TracedAllocator::new(8)), retry, 4);
    let space = MemorySpace::create("full", 16);

    let p = rt.request_async(32, "retry", Some(space), None);
    assert_eq!(rt.await_default(&p), AwaitStatus::Rejected);
    assert!(rt.wait_idle(IDLE));
    assert_eq!(rt.metrics().retries, 2);
    assert_eq!(rt.metrics().rejected, 1);
    assert_eq!(rt.allocator().errors().count_of(ErrorCode::MemoryExhausted), 3);
}

#[test]
fn test_requests_beyond_cap_are_refused() {
    let heap = Arc::new(GateHeap::default());
    let rt = runtime(
        enhanced(TracedAllocator::new(8).with_heap(heap.clone())),
        RetryPolicy::disabled(),
        2,
    );

    let p1 = rt.request_async(32, "held", None, None);
    let p2 = rt.request_async(32, "held", None, None);
    heap.wait_for_waiters(2);
    assert_eq!(rt.in_flight(), 2);

    let p3 = rt.request_async(32, "refused", None, None);
    assert_eq!(p3.state(), PromiseState::Rejected);
    assert_eq!(
        p3.rejection().map(|r| r.reason),
        Some(RejectReason::GovernanceViolation)
    );
    assert_eq!(p3.status().code, ErrorCode::GovernanceFail);

    heap.open();
    for p in [&p1, &p2] {
        assert_eq!(rt.await_default(p), AwaitStatus::Resolved);
        rt.free(p.take_value().expect("value"));
    }
    assert!(rt.wait_idle(IDLE));
    assert_eq!(rt.in_flight(), 0);
    assert_eq!(rt.metrics().refused, 1);
    assert_eq!(rt.allocator().errors().count_of(ErrorCode::GovernanceFail), 1);
}

#[test]
fn test_cancelled_request_is_reclaimed() {
    let heap = Arc::new(GateHeap::default());
    let rt = runtime(
        enhanced(TracedAllocator::new(8).with_heap(heap.clone())),
        RetryPolicy::disabled(),
        4,
    );
    let space = MemorySpace::create("reclaim", 1024);

    let p = rt.request_async(256, "cancelled", Some(space.clone()), None);
    heap.wait_for_waiters(1);
    assert!(p.cancel());
    heap.open();

    assert!(rt.wait_idle(IDLE));
    assert_eq!(p.status(), StatusPair::failed(ErrorCode::Cancelled));
    assert_eq!(space.used_bytes(), 0);
    assert_eq!(space.allocation_count(), 0);
    assert_eq!(rt.metrics().reclaimed, 1);
    assert_eq!(rt.allocator().traced().stats().live_allocations, 0);
}

#[test]
fn test_each_worker_has_its_own_epoch_budget() {
    let clock = Arc::new(ManualClock::at_epoch(1));
    let rt = runtime(
        enhanced(TracedAllocator::new(1).with_clock(clock)),
        RetryPolicy::disabled(),
        16,
    );

    let promises: Vec<_> = (0..6)
        .map(|i| rt.request_async(64, format!("w{i}"), None, None))
        .collect();
    for p in &promises {
        assert_eq!(rt.await_default(p), AwaitStatus::Resolved);
        rt.free(p.take_value().expect("value"));
    }
    let gov = rt.allocator().traced().governance();
    assert_eq!(gov.enforcements, 6);
    assert_eq!(gov.violations, 0);
}

#[test]
fn test_promise_and_cache_telemetry() {
    let sink = MemoryTelemetrySink::new();
    let allocator = enhanced(TracedAllocator::new(8))
        .with_telemetry(Telemetry::new(3).with_sink(Arc::new(sink.clone())));
    let rt = runtime(allocator, RetryPolicy::disabled(), 4);

    let p = rt.request_async(128, "observed", None, Some(77));
    assert_eq!(rt.await_default(&p), AwaitStatus::Resolved);
    assert!(rt.wait_idle(IDLE));

    let ops: Vec<Operation> = sink.events().iter().map(|e| e.operation).collect();
    assert_eq!(
        ops,
        vec![
            Operation::CacheMiss,
            Operation::Alloc,
            Operation::PromiseResolved,
            Operation::CacheUpdate,
        ]
    );
    rt.free(p.take_value().expect("value"));
}

#[test]
fn test_unbounded_timeouts_block_instead_of_failing() {
    let rt = default_runtime().with_default_timeout(Duration::MAX);
    let p = rt.request_async(64, "forever", None, None);
    assert_eq!(rt.await_default(&p), AwaitStatus::Resolved);
    assert!(rt.wait_idle(Duration::MAX));
    rt.free(p.take_value().expect("value"));

    let cfg = DiramConfig {
        default_timeout_ms: u64::MAX,
        ..DiramConfig::default()
    };
    let rt = AsyncAllocator::from_config(&cfg).expect("valid config");
    let p = rt.request_async(64, "configured", None, None);
    assert_eq!(rt.await_default(&p), AwaitStatus::Resolved);
    rt.free(p.take_value().expect("value"));
}

#[test]
fn test_wait_idle_times_out_while_workers_are_held() {
    let heap = Arc::new(GateHeap::default());
    let rt = runtime(
        enhanced(TracedAllocator::new(8).with_heap(heap.clone())),
        RetryPolicy::disabled(),
        4,
    );
    let p = rt.request_async(32, "held", None, None);
    heap.wait_for_waiters(1);
    assert!(!rt.wait_idle(Duration::from_millis(20)));

    heap.open();
    assert!(rt.wait_idle(IDLE));
    assert_eq!(rt.in_flight(), 0);
    rt.free(p.take_value().expect("value"));
}

#[test]
fn test_promises_carry_the_allocator_process_id() {
    let traced = TracedAllocator::new(8).with_identity(Arc::new(FixedPid(4242)));
    let rt = runtime(enhanced(traced), RetryPolicy::disabled(), 1);
    let space = MemorySpace::create("tiny", 16);

    let p = rt.request_async(64, "too-big", Some(space), None);
    assert_eq!(rt.await_default(&p), AwaitStatus::Rejected);
    assert_eq!(p.receipt().creator_pid, 4242);
    assert_eq!(p.rejection().map(|r| r.pid), Some(4242));
    assert!(rt.wait_idle(IDLE));

    // Refusals at the in-flight cap are attributed the same way.
    let heap = Arc::new(GateHeap::default());
    let traced = TracedAllocator::new(8)
        .with_heap(heap.clone())
        .with_identity(Arc::new(FixedPid(4242)));
    let rt = runtime(enhanced(traced), RetryPolicy::disabled(), 1);
    let held = rt.request_async(32, "held", None, None);
    heap.wait_for_waiters(1);
    let refused = rt.request_async(32, "refused", None, None);
    assert_eq!(refused.rejection().map(|r| r.pid), Some(4242));
    heap.open();
    assert_eq!(rt.await_default(&held), AwaitStatus::Resolved);
    rt.free(held.take_value().expect("value"));
}

#[test]
fn test_from_config() {
    let cfg = DiramConfig {
        max_pending_promises: 7,
        lookahead_cache_size: 32,
        ..DiramConfig::default()
    };
    let rt = AsyncAllocator::from_config(&cfg).expect("valid config");
    assert_eq!(rt.max_pending(), 7);
    assert_eq!(rt.cache().capacity(), 32);
    assert_eq!(rt.allocator().traced().max_events(), cfg.max_heap_events);

    let bad = DiramConfig {
        telemetry_level: 9,
        ..DiramConfig::default()
    };
    assert!(matches!(
        AsyncAllocator::from_config(&bad),
        Err(ExecError::Config(_))
    ));
}

#[cfg(feature = "async-scheduler")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_dispatch() {
    let rt = Arc::new(default_runtime());
    let p = rt.request_async(64, "tokio", None, None);
    let rt2 = Arc::clone(&rt);
    let status = tokio::task::spawn_blocking(move || rt2.await_default(&p))
        .await
        .expect("join");
    assert_eq!(status, AwaitStatus::Resolved);
}
