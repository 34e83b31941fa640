//! Enhanced allocation: traced allocation plus space accounting, boundary
//! sentinels, error indexing and telemetry.
//!
//! Sentinels live in the allocation's metadata, not inside the user's bytes.
//! Corruption is detected at free time, never prevented.

use std::sync::Arc;

use diram_core::config::DiramConfig;
use diram_core::error::ErrorCode;
use diram_core::hash::Receipt;
use serde::Serialize;
use tracing::warn;

use crate::error::{AllocError, Result};
use crate::error_index::ErrorIndex;
use crate::gate::HeapContext;
use crate::space::{MemorySpace, WeakSpace};
use crate::telemetry::{EventDraft, Layer, Operation, Telemetry};
use crate::traced::{Allocation, FreeOutcome, TracedAllocator};

/// Leading sentinel word.
pub const GUARD_PATTERN: u64 = 0xDEAD_BEEF_CAFE_BABE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProtectionFlags {
    pub guard_pages: bool,
    pub canary: bool,
    pub zero_trust: bool,
}

impl ProtectionFlags {
    pub fn from_config(cfg: &DiramConfig) -> Self {
        Self {
            guard_pages: cfg.guard_pages,
            canary: cfg.canary_values,
            zero_trust: cfg.zero_trust,
        }
    }

    pub fn none() -> Self {
        Self {
            guard_pages: false,
            canary: false,
            zero_trust: false,
        }
    }
}

impl Default for ProtectionFlags {
    fn default() -> Self {
        Self {
            guard_pages: true,
            canary: true,
            zero_trust: true,
        }
    }
}

/// Leading and trailing boundary words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sentinels {
    pub head: u64,
    pub tail: u64,
}

impl Sentinels {
    /// The tail is keyed to the receipt so sentinels from one allocation do
    /// not validate another.
    pub fn expected(receipt: &Receipt) -> Self {
        Self {
            head: GUARD_PATTERN,
            tail: GUARD_PATTERN ^ receipt.fold_u64(),
        }
    }
}

#[derive(Debug)]
pub struct EnhancedAllocation {
    inner: Allocation,
    space: Option<WeakSpace>,
    sentinels: Option<Sentinels>,
    flags: ProtectionFlags,
    last_error: ErrorCode,
    error_count: u32,
}

impl EnhancedAllocation {
    pub fn allocation(&self) -> &Allocation {
        &self.inner
    }

    pub fn address(&self) -> usize {
        self.inner.address()
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn receipt(&self) -> &Receipt {
        self.inner.receipt()
    }

    pub fn tag(&self) -> &str {
        self.inner.tag()
    }

    pub fn owner_pid(&self) -> u32 {
        self.inner.owner_pid()
    }

    pub fn data(&self) -> &[u8] {
        self.inner.as_slice()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.inner.as_mut_slice()
    }

    /// The bound space, if any and still alive.
    pub fn space(&self) -> Option<MemorySpace> {
        self.space.as_ref().and_then(WeakSpace::upgrade)
    }

    pub fn flags(&self) -> ProtectionFlags {
        self.flags
    }

    pub fn sentinels(&self) -> Option<Sentinels> {
        self.sentinels
    }

    pub fn last_error(&self) -> ErrorCode {
        self.last_error
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    #[cfg(any(test, feature = "failpoints"))]
    pub fn sentinels_mut(&mut self) -> Option<&mut Sentinels> {
        self.sentinels.as_mut()
    }

    #[cfg(any(test, feature = "failpoints"))]
    pub fn receipt_mut(&mut self) -> &mut Receipt {
        self.inner.receipt_mut()
    }

    fn note_error(&mut self, code: ErrorCode) {
        self.last_error = code;
        self.error_count = self.error_count.saturating_add(1);
    }
}

/// What a successful enhanced free observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FreeReport {
    pub boundary_violation: bool,
    /// `None` when zero-trust verification is off.
    pub receipt_valid: Option<bool>,
    /// The allocation was bound to a space that no longer exists.
    pub space_missing: bool,
}

pub struct EnhancedAllocator {
    traced: TracedAllocator,
    errors: Arc<ErrorIndex>,
    telemetry: Telemetry,
    flags: ProtectionFlags,
}

impl EnhancedAllocator {
    pub fn new(traced: TracedAllocator, flags: ProtectionFlags) -> Self {
        let errors = ErrorIndex::default().with_identity(traced.identity());
        Self {
            traced,
            errors: Arc::new(errors),
            telemetry: Telemetry::disabled(),
            flags,
        }
    }

    /// Traced allocator, protection flags, error index size and telemetry
    /// level from `cfg`. Sinks are attached by the caller.
    pub fn from_config(cfg: &DiramConfig) -> Self {
        let traced = TracedAllocator::from_config(cfg);
        let errors = ErrorIndex::new(cfg.max_error_index_size).with_identity(traced.identity());
        Self {
            traced,
            errors: Arc::new(errors),
            telemetry: Telemetry::new(cfg.telemetry_level),
            flags: ProtectionFlags::from_config(cfg),
        }
    }

    pub fn with_error_index(mut self, errors: Arc<ErrorIndex>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn traced(&self) -> &TracedAllocator {
        &self.traced
    }

    pub fn errors(&self) -> &Arc<ErrorIndex> {
        &self.errors
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn flags(&self) -> ProtectionFlags {
        self.flags
    }

    pub fn new_context(&self) -> HeapContext {
        self.traced.new_context()
    }

    pub fn allocate_enhanced(
        &self,
        ctx: &mut HeapContext,
        size: usize,
        tag: &str,
        space: Option<&MemorySpace>,
    ) -> Result<EnhancedAllocation> {
        if let Some(space) = space {
            if let Err(e) = space.check_limit(size) {
                self.fail(Layer::Space, Operation::SpaceExhausted, &e, size, tag);
                return Err(e);
            }
        }

        let alloc = match self.traced.allocate(ctx, size, tag) {
            Ok(a) => a,
            Err(e) => {
                self.fail(Layer::Traced, Operation::AllocFailed, &e, size, tag);
                return Err(e);
            }
        };

        if let Some(space) = space {
            // Lost a race against another binder since check_limit.
            if let Err(e) = space.bind(size) {
                if let FreeOutcome::Foreign(orphan) = self.traced.free(alloc) {
                    drop(orphan);
                }
                ctx.rollback();
                self.fail(Layer::Space, Operation::SpaceExhausted, &e, size, tag);
                return Err(e);
            }
        }

        let sentinels = self
            .flags
            .canary
            .then(|| Sentinels::expected(alloc.receipt()));

        self.emit(
            EventDraft::new(Layer::Enhanced, Operation::Alloc)
                .region(alloc.address(), alloc.size())
                .receipt(alloc.receipt())
                .tag(alloc.tag()),
        );

        Ok(EnhancedAllocation {
            inner: alloc,
            space: space.map(MemorySpace::downgrade),
            sentinels,
            flags: self.flags,
            last_error: ErrorCode::None,
            error_count: 0,
        })
    }

    /// Free through the traced allocator and return the space accounting.
    ///
    /// Boundary and receipt problems are reported, never fatal: the free still
    /// happens. An allocation owned by another process comes back untouched.
    pub fn free_enhanced(
        &self,
        mut alloc: EnhancedAllocation,
    ) -> FreeOutcome<EnhancedAllocation, FreeReport> {
        if alloc.owner_pid() != self.traced.current_pid() {
            return FreeOutcome::Foreign(alloc);
        }

        let mut report = FreeReport::default();
        let address = alloc.address();
        let size = alloc.size();

        if self.flags.canary {
            if let Some(found) = alloc.sentinels {
                if found != Sentinels::expected(alloc.receipt()) {
                    report.boundary_violation = true;
                    alloc.note_error(ErrorCode::BoundaryViolation);
                    let e = AllocError::BoundaryViolation { address };
                    self.fail(Layer::Enhanced, Operation::BoundaryViolation, &e, size, alloc.tag());
                }
            }
        }

        if self.flags.zero_trust {
            let valid = self.verify_receipt(&alloc);
            if !valid {
                alloc.note_error(ErrorCode::ReceiptInvalid);
            }
            report.receipt_valid = Some(valid);
        }

        let EnhancedAllocation {
            inner,
            space,
            sentinels,
            flags,
            last_error,
            error_count,
        } = alloc;
        let tag = inner.tag().to_string();

        if let FreeOutcome::Foreign(inner) = self.traced.free(inner) {
            return FreeOutcome::Foreign(EnhancedAllocation {
                inner,
                space,
                sentinels,
                flags,
                last_error,
                error_count,
            });
        }

        if let Some(weak) = space {
            match weak.upgrade() {
                Some(space) => space.release(size),
                None => {
                    report.space_missing = true;
                    self.errors.record(
                        ErrorCode::IsolationBreach,
                        format!("free of {address:#x} after its space was destroyed"),
                    );
                    self.emit(
                        EventDraft::new(Layer::Space, Operation::IsolationBreach)
                            .code(ErrorCode::IsolationBreach)
                            .region(address, size)
                            .tag(&tag),
                    );
                }
            }
        }

        self.emit(EventDraft::new(Layer::Enhanced, Operation::Free).region(address, size).tag(&tag));
        FreeOutcome::Released(report)
    }

    /// Recompute the receipt. A mismatch is indexed as `ReceiptInvalid`.
    pub fn verify_receipt(&self, alloc: &EnhancedAllocation) -> bool {
        if self.traced.verify(&alloc.inner) {
            return true;
        }
        let e = AllocError::ReceiptInvalid {
            address: alloc.address(),
        };
        self.errors.record(e.code(), e.to_string());
        self.emit(
            EventDraft::new(Layer::Enhanced, Operation::ReceiptInvalid)
                .code(e.code())
                .region(alloc.address(), alloc.size())
                .receipt(alloc.receipt())
                .tag(alloc.tag()),
        );
        false
    }

    /// Emit through telemetry; a sink failure is indexed as `TelemetryLost`.
    pub fn emit(&self, draft: EventDraft<'_>) {
        if let Err(e) = self.telemetry.emit(draft) {
            warn!(error = %e, op = ?draft.operation, "telemetry lost");
            self.errors
                .record(ErrorCode::TelemetryLost, format!("{:?}: {e}", draft.operation));
        }
    }

    fn fail(&self, layer: Layer, op: Operation, e: &AllocError, size: usize, tag: &str) {
        self.errors.record(e.code(), e.to_string());
        self.emit(
            EventDraft::new(layer, op)
                .code(e.code())
                .region(0, size)
                .tag(tag),
        );
    }
}

impl std::fmt::Debug for EnhancedAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnhancedAllocator")
            .field("traced", &self.traced)
            .field("flags", &self.flags)
            .field("telemetry", &self.telemetry)
            .field("errors", &self.errors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_depend_on_receipt() {
        let a = Sentinels::expected(&Receipt([1u8; 32]));
        let b = Sentinels::expected(&Receipt([2u8; 32]));
        assert_eq!(a.head, GUARD_PATTERN);
        assert_eq!(a.head, b.head);
        assert_ne!(a.tail, b.tail);
    }

    #[test]
    fn corrupted_sentinel_is_reported_and_freed() {
        let alloc = EnhancedAllocator::new(TracedAllocator::new(8), ProtectionFlags::default());
        let mut ctx = alloc.new_context();
        let mut a = alloc
            .allocate_enhanced(&mut ctx, 64, "canary", None)
            .expect("alloc");
        if let Some(s) = a.sentinels_mut() {
            s.tail ^= 1;
        }
        let report = alloc.free_enhanced(a).released().expect("released");
        assert!(report.boundary_violation);
        assert_eq!(report.receipt_valid, Some(true));
        assert_eq!(alloc.errors().count_of(ErrorCode::BoundaryViolation), 1);
        assert_eq!(alloc.traced().stats().live_allocations, 0);
    }
}
