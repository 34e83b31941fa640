#![forbid(unsafe_code)]
//! diram-io: concrete sinks for `diram-mem`.
//!
//! - [`FileLineSink`]: append-only trace/error log with a `#` header.
//! - [`JsonlTelemetrySink`]: one JSON object per telemetry event.
//! - [`MemoryLineSink`], [`MemoryTelemetrySink`]: capture output in tests.
//! - [`dump_error_index`]: snapshot the error ring to a JSON file.

pub mod dump;
pub mod error;
pub mod file;
pub mod jsonl;
pub mod memory;

pub use dump::{dump_error_index, ErrorDump};
pub use error::{Error, Result};
pub use file::{open_error_log, open_trace_log, FileLineSink};
pub use jsonl::JsonlTelemetrySink;
pub use memory::{MemoryLineSink, MemoryTelemetrySink};
