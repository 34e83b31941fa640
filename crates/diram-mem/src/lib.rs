#![forbid(unsafe_code)]
//! diram-mem: governed, traced allocation.
//!
//! Layering, bottom-up:
//! - [`gate::HeapContext`] bounds allocation events per epoch.
//! - [`traced::TracedAllocator`] runs the gate, stamps receipts, writes the
//!   trace log and binds every allocation to its creating process.
//! - [`space::MemorySpace`] is a named, capacity-bounded accounting record.
//! - [`enhanced::EnhancedAllocator`] composes the two and adds boundary
//!   sentinels, the [`error_index::ErrorIndex`] and [`telemetry::Telemetry`].
//!
//! No file IO lives here. Output goes through the traits in [`sink`], which
//! `diram-io` implements.

pub mod enhanced;
pub mod error;
pub mod error_index;
pub mod gate;
pub mod sink;
pub mod space;
pub mod telemetry;
pub mod traced;
pub mod tracking;

pub use enhanced::{EnhancedAllocation, EnhancedAllocator, FreeReport, ProtectionFlags, Sentinels};
pub use error::{AllocError, Result};
pub use error_index::{ErrorContext, ErrorIndex};
pub use gate::HeapContext;
pub use sink::{LineSink, TelemetrySink};
pub use space::{MemorySpace, WeakSpace};
pub use telemetry::{EventDraft, Layer, Operation, Telemetry, TelemetryEvent};
pub use traced::{Allocation, FreeOutcome, TracedAllocator};
