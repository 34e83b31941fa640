//! Output seams for the trace log, the error log and telemetry.
//!
//! Implemented by `diram-io` (files, JSONL, in-memory capture). Sinks take
//! `&self` and handle their own locking, so one sink can be shared across
//! allocators and worker threads.

use crate::error::Result;
use crate::telemetry::TelemetryEvent;

/// Append-only, line-oriented sink.
pub trait LineSink: Send + Sync {
    /// Append one line. `line` carries no trailing newline.
    fn append_line(&self, line: &str) -> Result<()>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Receives one structured event per lifecycle transition.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &TelemetryEvent) -> Result<()>;
}
