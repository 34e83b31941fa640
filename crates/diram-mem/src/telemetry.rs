//! Structured lifecycle events.
//!
//! Level gating: 0 off, 1 failures and violations, 2 adds allocation/free
//! lifecycle, 3 adds promise and cache events. Every emitted event goes to
//! `tracing` and to the optional [`TelemetrySink`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use diram_core::error::ErrorCode;
use diram_core::hash::Receipt;
use diram_core::id::{EventId, IdSequence};
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::Result;
use crate::sink::TelemetrySink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Traced,
    Enhanced,
    Space,
    Promise,
    Cache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Alloc,
    Free,
    AllocFailed,
    SpaceExhausted,
    BoundaryViolation,
    ReceiptInvalid,
    IsolationBreach,
    PromiseResolved,
    PromiseRejected,
    CacheHit,
    CacheMiss,
    CacheUpdate,
}

impl Operation {
    /// Minimum telemetry level at which this operation is emitted.
    pub fn level(self) -> u8 {
        match self {
            Operation::AllocFailed
            | Operation::SpaceExhausted
            | Operation::BoundaryViolation
            | Operation::ReceiptInvalid
            | Operation::IsolationBreach => 1,
            Operation::Alloc | Operation::Free => 2,
            Operation::PromiseResolved
            | Operation::PromiseRejected
            | Operation::CacheHit
            | Operation::CacheMiss
            | Operation::CacheUpdate => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryEvent {
    pub event_id: EventId,
    pub layer: Layer,
    pub error_code: ErrorCode,
    pub address: usize,
    pub size: usize,
    pub operation: Operation,
    /// Hex receipt, empty when the event has none.
    pub receipt: String,
    pub tag: String,
}

/// Event fields before an id is assigned.
#[derive(Debug, Clone, Copy)]
pub struct EventDraft<'a> {
    pub layer: Layer,
    pub operation: Operation,
    pub error_code: ErrorCode,
    pub address: usize,
    pub size: usize,
    pub receipt: Option<&'a Receipt>,
    pub tag: &'a str,
}

impl<'a> EventDraft<'a> {
    pub fn new(layer: Layer, operation: Operation) -> Self {
        Self {
            layer,
            operation,
            error_code: ErrorCode::None,
            address: 0,
            size: 0,
            receipt: None,
            tag: "",
        }
    }

    pub fn code(mut self, code: ErrorCode) -> Self {
        self.error_code = code;
        self
    }

    pub fn region(mut self, address: usize, size: usize) -> Self {
        self.address = address;
        self.size = size;
        self
    }

    pub fn receipt(mut self, receipt: &'a Receipt) -> Self {
        self.receipt = Some(receipt);
        self
    }

    pub fn tag(mut self, tag: &'a str) -> Self {
        self.tag = tag;
        self
    }
}

pub struct Telemetry {
    level: u8,
    sink: Option<Arc<dyn TelemetrySink>>,
    ids: IdSequence,
    emitted: AtomicU64,
    lost: AtomicU64,
}

impl Telemetry {
    pub fn new(level: u8) -> Self {
        Self {
            level: level.min(3),
            sink: None,
            ids: IdSequence::new(),
            emitted: AtomicU64::new(0),
            lost: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn enabled_for(&self, op: Operation) -> bool {
        self.level >= op.level()
    }

    /// Emit `draft` if the level allows it.
    ///
    /// Returns `Ok(None)` when gated out. A sink failure is returned after the
    /// event has been counted as lost; the caller decides how to record it.
    pub fn emit(&self, draft: EventDraft<'_>) -> Result<Option<EventId>> {
        if !self.enabled_for(draft.operation) {
            return Ok(None);
        }
        let event = TelemetryEvent {
            event_id: EventId::new(self.ids.next_raw()),
            layer: draft.layer,
            error_code: draft.error_code,
            address: draft.address,
            size: draft.size,
            operation: draft.operation,
            receipt: draft.receipt.map(|r| r.to_hex()).unwrap_or_default(),
            tag: draft.tag.to_string(),
        };

        if draft.error_code == ErrorCode::None {
            trace!(
                id = event.event_id.get(),
                layer = ?event.layer,
                op = ?event.operation,
                address = event.address,
                size = event.size,
                tag = %event.tag,
                "telemetry"
            );
        } else {
            debug!(
                id = event.event_id.get(),
                layer = ?event.layer,
                op = ?event.operation,
                code = %event.error_code,
                address = event.address,
                size = event.size,
                tag = %event.tag,
                "telemetry"
            );
        }

        self.emitted.fetch_add(1, Ordering::Relaxed);
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.emit(&event) {
                self.lost.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        }
        Ok(Some(event.event_id))
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("level", &self.level)
            .field("sink", &self.sink.is_some())
            .field("emitted", &self.emitted())
            .field("lost", &self.lost())
            .finish()
    }
}
