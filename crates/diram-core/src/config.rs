//! Runtime configuration for the allocator core.
//!
//! Values are resolved once at startup and treated as read-only afterwards.
//! Config files and hierarchical keys are handled outside this crate; here we
//! only know defaults and `DIRAM_*` environment overrides.

use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiramConfig {
    /// Admission limit: traced allocations allowed per thread per epoch.
    pub max_heap_events: u32,

    /// Width of one epoch bucket on the monotonic clock.
    pub epoch_width_ms: u64,

    /// Capacity used for spaces created without an explicit limit.
    pub default_space_capacity: usize,

    /// Write the line-oriented allocation trace log.
    pub trace_enabled: bool,

    /// Directory holding the trace log and the error log.
    pub log_dir: String,

    pub guard_pages: bool,
    pub canary_values: bool,

    /// Verify receipts on every enhanced free.
    pub zero_trust: bool,

    /// 0 = off, 1 = failures only, 2 = + lifecycle, 3 = + promise/cache.
    pub telemetry_level: u8,

    /// Bounded size of the in-memory error ring.
    pub max_error_index_size: usize,

    pub lookahead_cache_size: usize,
    pub default_timeout_ms: u64,
    pub max_pending_promises: usize,

    /// Retry policy for transient (retriable) allocation failures.
    pub retry_on_transient_failure: bool,
    pub max_retry_attempts: u32,
    pub exponential_backoff: bool,
    pub retry_initial_backoff_ms: u64,
}

impl Default for DiramConfig {
    fn default() -> Self {
        Self {
            max_heap_events: 3,
            epoch_width_ms: 1_000,
            default_space_capacity: 16 * 1024 * 1024, // 16 MiB
            trace_enabled: false,
            log_dir: "logs".to_string(),
            guard_pages: true,
            canary_values: true,
            zero_trust: true,
            telemetry_level: 2,
            max_error_index_size: 256,
            lookahead_cache_size: 1024,
            default_timeout_ms: 10_000,
            max_pending_promises: 100,
            retry_on_transient_failure: true,
            max_retry_attempts: 3,
            exponential_backoff: true,
            retry_initial_backoff_ms: 5,
        }
    }
}

static GLOBAL: OnceCell<DiramConfig> = OnceCell::new();

impl DiramConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Unparseable values are ignored. Environment variables:
    /// - `DIRAM_MAX_HEAP_EVENTS`, `DIRAM_EPOCH_WIDTH_MS`
    /// - `DIRAM_MEMORY_LIMIT` (size, accepts `k`/`m`/`g`)
    /// - `DIRAM_TRACE`, `DIRAM_LOG_DIR`
    /// - `DIRAM_GUARD_PAGES`, `DIRAM_CANARY_VALUES`, `DIRAM_ZERO_TRUST`
    /// - `DIRAM_TELEMETRY_LEVEL`, `DIRAM_MAX_ERROR_INDEX`
    /// - `DIRAM_LOOKAHEAD_CACHE_SIZE`, `DIRAM_DEFAULT_TIMEOUT_MS`, `DIRAM_MAX_PENDING_PROMISES`
    /// - `DIRAM_RETRY_TRANSIENT`, `DIRAM_MAX_RETRY_ATTEMPTS`,
    ///   `DIRAM_EXPONENTIAL_BACKOFF`, `DIRAM_RETRY_INITIAL_MS`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads through `lookup`, so
    /// callers (and tests) can supply their own key/value source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup("DIRAM_MAX_HEAP_EVENTS").and_then(|s| s.trim().parse().ok()) {
            cfg.max_heap_events = v;
        }
        if let Some(v) = lookup("DIRAM_EPOCH_WIDTH_MS").and_then(|s| s.trim().parse().ok()) {
            cfg.epoch_width_ms = v;
        }
        if let Some(v) = lookup("DIRAM_MEMORY_LIMIT").and_then(|s| parse_size(&s)) {
            cfg.default_space_capacity = v;
        }
        if let Some(s) = lookup("DIRAM_TRACE") {
            cfg.trace_enabled = parse_bool(&s);
        }
        if let Some(s) = lookup("DIRAM_LOG_DIR") {
            cfg.log_dir = s;
        }
        if let Some(s) = lookup("DIRAM_GUARD_PAGES") {
            cfg.guard_pages = parse_bool(&s);
        }
        if let Some(s) = lookup("DIRAM_CANARY_VALUES") {
            cfg.canary_values = parse_bool(&s);
        }
        if let Some(s) = lookup("DIRAM_ZERO_TRUST") {
            cfg.zero_trust = parse_bool(&s);
        }
        if let Some(v) = lookup("DIRAM_TELEMETRY_LEVEL").and_then(|s| s.trim().parse().ok()) {
            cfg.telemetry_level = v;
        }
        if let Some(v) = lookup("DIRAM_MAX_ERROR_INDEX").and_then(|s| s.trim().parse().ok()) {
            cfg.max_error_index_size = v;
        }
        if let Some(v) = lookup("DIRAM_LOOKAHEAD_CACHE_SIZE").and_then(|s| s.trim().parse().ok())
        {
            cfg.lookahead_cache_size = v;
        }
        if let Some(v) = lookup("DIRAM_DEFAULT_TIMEOUT_MS").and_then(|s| s.trim().parse().ok()) {
            cfg.default_timeout_ms = v;
        }
        if let Some(v) = lookup("DIRAM_MAX_PENDING_PROMISES").and_then(|s| s.trim().parse().ok())
        {
            cfg.max_pending_promises = v;
        }
        if let Some(s) = lookup("DIRAM_RETRY_TRANSIENT") {
            cfg.retry_on_transient_failure = parse_bool(&s);
        }
        if let Some(v) = lookup("DIRAM_MAX_RETRY_ATTEMPTS").and_then(|s| s.trim().parse().ok()) {
            cfg.max_retry_attempts = v;
        }
        if let Some(s) = lookup("DIRAM_EXPONENTIAL_BACKOFF") {
            cfg.exponential_backoff = parse_bool(&s);
        }
        if let Some(v) = lookup("DIRAM_RETRY_INITIAL_MS").and_then(|s| s.trim().parse().ok()) {
            cfg.retry_initial_backoff_ms = v;
        }

        cfg
    }

    /// Process-wide config, resolved from the environment on first use.
    pub fn global() -> &'static DiramConfig {
        GLOBAL.get_or_init(Self::from_env)
    }

    /// Install `cfg` as the process-wide config. Fails if one is already set.
    pub fn install_global(cfg: DiramConfig) -> Result<()> {
        cfg.validate()?;
        GLOBAL
            .set(cfg)
            .map_err(|_| Error::Config("global config already initialised".into()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_heap_events == 0 {
            return Err(Error::Config("max_heap_events must be >= 1".into()));
        }
        if self.epoch_width_ms == 0 {
            return Err(Error::Config("epoch_width_ms must be >= 1".into()));
        }
        if self.telemetry_level > 3 {
            return Err(Error::Config(format!(
                "telemetry_level {} out of range 0-3",
                self.telemetry_level
            )));
        }
        if self.lookahead_cache_size == 0 {
            return Err(Error::Config("lookahead_cache_size must be >= 1".into()));
        }
        if self.max_error_index_size == 0 {
            return Err(Error::Config("max_error_index_size must be >= 1".into()));
        }
        Ok(())
    }

    pub fn epoch_width(&self) -> Duration {
        Duration::from_millis(self.epoch_width_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn trace_log_path(&self) -> PathBuf {
        PathBuf::from(&self.log_dir).join("diram_trace.log")
    }

    pub fn error_log_path(&self) -> PathBuf {
        PathBuf::from(&self.log_dir).join("diram_errors.log")
    }
}

/// Parse a byte size with an optional `k`, `m` or `g` suffix (binary units).
pub fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let base: usize = digits.parse().ok()?;
    let mult: usize = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        _ => return None,
    };
    base.checked_mul(mult)
}

/// Parse a boolean. `true/yes/1/on/enabled` are true; everything else is false.
pub fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "1" | "on" | "enabled"
    )
}
