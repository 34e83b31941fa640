//! Bounded ring of recent error contexts.
//!
//! The index is an observability sink. Recording never retries, rolls back or
//! otherwise changes control flow. When full, the oldest quarter is evicted in
//! one go so recent errors stay visible.

use std::collections::VecDeque;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use diram_core::clock::unix_millis;
use diram_core::error::{ErrorCode, Severity};
use diram_core::process::{OsProcess, ProcessIdentity};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::sink::LineSink;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    pub code: ErrorCode,
    pub timestamp_ms: u64,
    pub pid: u32,
    pub file: &'static str,
    pub line: u32,
    pub message: String,
    pub severity: Severity,
}

impl ErrorContext {
    /// Build a context stamped with the caller's location and the wall clock.
    #[track_caller]
    pub fn new(code: ErrorCode, pid: u32, message: impl Into<String>) -> Self {
        let loc = Location::caller();
        Self {
            code,
            timestamp_ms: unix_millis(),
            pid,
            file: loc.file(),
            line: loc.line(),
            message: message.into(),
            severity: code.severity(),
        }
    }

    /// `TIMESTAMP|PID|CODE|SEVERITY|MESSAGE`
    pub fn log_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.timestamp_ms,
            self.pid,
            self.code,
            self.severity.as_u8(),
            self.message.replace(['\n', '|'], " ")
        )
    }
}

pub struct ErrorIndex {
    capacity: usize,
    entries: Mutex<VecDeque<ErrorContext>>,
    identity: Arc<dyn ProcessIdentity>,
    log: Option<Arc<dyn LineSink>>,
    recorded: AtomicU64,
    evicted: AtomicU64,
}

impl ErrorIndex {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            identity: Arc::new(OsProcess),
            log: None,
            recorded: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn with_identity(mut self, identity: Arc<dyn ProcessIdentity>) -> Self {
        self.identity = identity;
        self
    }

    /// Mirror every recorded context to an on-disk style error log.
    pub fn with_log(mut self, log: Arc<dyn LineSink>) -> Self {
        self.log = Some(log);
        self
    }

    #[track_caller]
    pub fn record(&self, code: ErrorCode, message: impl Into<String>) {
        let ctx = ErrorContext::new(code, self.identity.current_pid(), message);
        self.record_context(ctx);
    }

    pub fn record_context(&self, ctx: ErrorContext) {
        match ctx.severity {
            Severity::Critical => error!(code = %ctx.code, name = ctx.code.name(), msg = %ctx.message, "error indexed"),
            Severity::Error => warn!(code = %ctx.code, name = ctx.code.name(), msg = %ctx.message, "error indexed"),
            _ => debug!(code = %ctx.code, name = ctx.code.name(), msg = %ctx.message, "error indexed"),
        }

        if let Some(log) = &self.log {
            if let Err(e) = log.append_line(&ctx.log_line()) {
                warn!(error = %e, "error log write failed");
            }
        }

        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            let evict = (self.capacity / 4).max(1);
            entries.drain(..evict);
            self.evicted.fetch_add(evict as u64, Ordering::Relaxed);
        }
        entries.push_back(ctx);
        self.recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last(&self) -> Option<ErrorContext> {
        self.entries.lock().back().cloned()
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<ErrorContext> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Contexts ever recorded, including evicted ones.
    pub fn total_recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    pub fn total_evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn count_of(&self, code: ErrorCode) -> usize {
        self.entries.lock().iter().filter(|c| c.code == code).count()
    }
}

impl Default for ErrorIndex {
    fn default() -> Self {
        Self::new(256)
    }
}
