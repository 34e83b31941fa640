//! In-memory sinks for tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use diram_mem::error::{AllocError, Result as MemResult};
use diram_mem::{LineSink, TelemetryEvent, TelemetrySink};
use parking_lot::Mutex;

/// Thread-safe line capture. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemoryLineSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemoryLineSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl LineSink for MemoryLineSink {
    fn append_line(&self, line: &str) -> MemResult<()> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }
}

/// Telemetry capture with a switch to simulate a failing sink.
#[derive(Clone, Default)]
pub struct MemoryTelemetrySink {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryTelemetrySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// While set, every `emit` fails and nothing is captured.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }
}

impl TelemetrySink for MemoryTelemetrySink {
    fn emit(&self, event: &TelemetryEvent) -> MemResult<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(AllocError::Sink("telemetry sink unavailable".into()));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}
