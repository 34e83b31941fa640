//! Traced allocator: epoch admission, receipts, trace lines, fork safety

use std::sync::{Arc, Mutex};
use std::thread;

use diram_core::clock::ManualClock;
use diram_core::hash::{Blake3Receipts, FoldReceipts, ReceiptHasher, ReceiptInput};
use diram_core::heap::{HeapPrimitive, Region, SystemHeap};
use diram_core::process::FixedPid;
use diram_io::MemoryLineSink;
use diram_mem::{AllocError, FreeOutcome, HeapContext, TracedAllocator};

/// Never hands out memory.
struct ExhaustedHeap;

impl HeapPrimitive for ExhaustedHeap {
    fn allocate(&self, _size: usize) -> Option<Region> {
        None
    }

    fn release(&self, _region: Region) {}
}

/// System heap that keeps a copy of every region it gets back.
#[derive(Default)]
struct RecordingHeap {
    released: Mutex<Vec<Vec<u8>>>,
}

impl HeapPrimitive for RecordingHeap {
    fn allocate(&self, size: usize) -> Option<Region> {
        SystemHeap.allocate(size)
    }

    fn release(&self, region: Region) {
        self.released.lock().unwrap().push(region.as_slice().to_vec());
    }
}

fn manual_allocator(max_events: u32) -> (TracedAllocator, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_epoch(10));
    let traced = TracedAllocator::new(max_events).with_clock(clock.clone());
    (traced, clock)
}

#[test]
fn test_fourth_allocation_in_epoch_is_denied() {
    let (traced, _clock) = manual_allocator(3);
    let mut ctx = traced.new_context();

    let a = traced.allocate(&mut ctx, 64, "a").expect("first");
    let b = traced.allocate(&mut ctx, 64, "b").expect("second");
    let c = traced.allocate(&mut ctx, 64, "c").expect("third");
    assert_eq!(a.heap_events(), 1);
    assert_eq!(b.heap_events(), 2);
    assert_eq!(c.heap_events(), 3);

    let err = traced.allocate(&mut ctx, 64, "d").unwrap_err();
    assert_eq!(
        err,
        AllocError::ConstraintViolation {
            epoch: 10,
            events: 3,
            max: 3
        }
    );
    assert!(err.is_transient());
    assert_eq!(ctx.event_count(), 3);

    let gov = traced.governance();
    assert_eq!(gov.enforcements, 3);
    assert_eq!(gov.violations, 1);
    assert!((gov.epsilon_current - gov.epsilon_limit).abs() < 1e-9);

    for alloc in [a, b, c] {
        assert!(traced.free(alloc).is_released());
    }
}

#[test]
fn test_new_epoch_resets_event_count() {
    let (traced, clock) = manual_allocator(3);
    let mut ctx = traced.new_context();

    let mut live = Vec::new();
    for _ in 0..3 {
        live.push(traced.allocate(&mut ctx, 16, "e").expect("alloc"));
    }
    assert!(traced.allocate(&mut ctx, 16, "e").is_err());

    let next = clock.advance_epoch();
    let fresh = traced.allocate(&mut ctx, 16, "e").expect("alloc in new epoch");
    assert_eq!(fresh.heap_events(), 1);
    assert_eq!(ctx.command_epoch(), Some(next));
    live.push(fresh);

    for alloc in live {
        traced.free(alloc);
    }
    assert_eq!(traced.stats().live_allocations, 0);
}

#[test]
fn test_contexts_are_independent_per_thread() {
    let (traced, _clock) = manual_allocator(3);
    let traced = Arc::new(traced);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let traced = Arc::clone(&traced);
            thread::spawn(move || {
                let mut ctx = HeapContext::new(traced.max_events());
                let mut ok = 0u32;
                let mut live = Vec::new();
                for _ in 0..5 {
                    if let Ok(a) = traced.allocate(&mut ctx, 8, "thread") {
                        ok += 1;
                        live.push(a);
                    }
                }
                for a in live {
                    traced.free(a);
                }
                ok
            })
        })
        .collect();

    let total: u32 = handles
        .into_iter()
        .map(|h| h.join().expect("thread panicked"))
        .sum();
    // Each thread gets the full budget within the same epoch.
    assert_eq!(total, 4 * 3);
    assert_eq!(traced.governance().violations, 4 * 2);
}

#[test]
fn test_underlying_failure_rolls_back_admission() {
    let traced = TracedAllocator::new(3).with_heap(Arc::new(ExhaustedHeap));
    let mut ctx = traced.new_context();

    let err = traced.allocate(&mut ctx, 1 << 20, "big").unwrap_err();
    assert!(matches!(err, AllocError::OutOfMemory { bytes, .. } if bytes == 1 << 20));
    assert_eq!(ctx.event_count(), 0);
    assert_eq!(traced.governance().enforcements, 0);
}

#[test]
fn test_free_from_other_process_is_noop() {
    let clock = Arc::new(ManualClock::new());
    let parent = TracedAllocator::new(3)
        .with_clock(clock.clone())
        .with_identity(Arc::new(FixedPid(100)));
    let child = TracedAllocator::new(3)
        .with_clock(clock)
        .with_identity(Arc::new(FixedPid(200)));

    let mut ctx = parent.new_context();
    let mut alloc = parent.allocate(&mut ctx, 32, "shared").expect("alloc");
    alloc.as_mut_slice().copy_from_slice(&[7u8; 32]);
    let receipt = *alloc.receipt();

    let alloc = child
        .free(alloc)
        .foreign()
        .expect("child must not free parent's allocation");
    assert_eq!(alloc.owner_pid(), 100);
    assert_eq!(alloc.as_slice(), &[7u8; 32]);
    assert_eq!(alloc.receipt(), &receipt);
    assert_eq!(child.stats().total_freed, 0);

    assert!(parent.free(alloc).is_released());
    assert_eq!(parent.stats().total_freed, 32);
}

#[test]
fn test_free_scrubs_region_before_release() {
    let heap = Arc::new(RecordingHeap::default());
    let traced = TracedAllocator::new(3).with_heap(heap.clone());
    let mut ctx = traced.new_context();

    let mut alloc = traced.allocate(&mut ctx, 48, "secret").expect("alloc");
    alloc.as_mut_slice().fill(0xAB);
    traced.free(alloc);

    let released = heap.released.lock().unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].len(), 48);
    assert!(released[0].iter().all(|b| *b == 0));
}

#[test]
fn test_receipt_is_recomputable() {
    for hasher in [
        Arc::new(Blake3Receipts) as Arc<dyn ReceiptHasher>,
        Arc::new(FoldReceipts),
    ] {
        let traced = TracedAllocator::new(3).with_hasher(Arc::clone(&hasher));
        let mut ctx = traced.new_context();
        let alloc = traced.allocate(&mut ctx, 100, "rcpt").expect("alloc");

        let expected = hasher.digest(&ReceiptInput {
            address: alloc.address(),
            size: alloc.size(),
            timestamp_ns: alloc.timestamp_ns(),
            tag: alloc.tag(),
        });
        assert_eq!(alloc.receipt(), &expected, "{}", hasher.name());
        assert!(traced.verify(&alloc));
        traced.free(alloc);
    }
}

#[test]
fn test_trace_lines_are_pipe_delimited() {
    let sink = MemoryLineSink::new();
    let traced = TracedAllocator::new(3)
        .with_identity(Arc::new(FixedPid(4242)))
        .with_trace_sink(Arc::new(sink.clone()));
    let mut ctx = traced.new_context();

    let alloc = traced.allocate(&mut ctx, 64, "buf").expect("alloc");
    let address = alloc.address();
    let receipt = alloc.receipt().to_hex();
    traced.free(alloc);

    let lines = sink.lines();
    assert_eq!(lines.len(), 2);
    for (line, op) in lines.iter().zip(["ALLOC", "FREE"]) {
        let fields: Vec<&str> = line.split('|').collect();
        assert_eq!(fields.len(), 7, "{line}");
        assert!(fields[0].parse::<u64>().is_ok());
        assert_eq!(fields[1], "4242");
        assert_eq!(fields[2], op);
        assert_eq!(fields[3], format!("0x{address:x}"));
        assert_eq!(fields[4], "64");
        assert_eq!(fields[5], receipt);
        assert_eq!(fields[6], "buf");
    }
}
