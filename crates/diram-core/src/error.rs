use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical result for core.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Hashing error: {0}")]
    Hash(String),

    #[error("Internal invariant failed: {0}")]
    Invariant(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Hash(e.to_string())
    }
}

/// Numeric error taxonomy shared by the allocator, the error index, and the
/// promise status pair. The values are part of the on-disk error log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    None = 0x0000,
    /// Epoch admission denied (ε limit reached).
    HeapConstraint = 0x1001,
    MemoryExhausted = 0x1002,
    /// Free attempted from a process that does not own the allocation.
    PidMismatch = 0x1003,
    BoundaryViolation = 0x1004,
    ReceiptInvalid = 0x1005,
    TraceFailure = 0x1006,
    ConfigInvalid = 0x1007,
    IsolationBreach = 0x1008,
    TelemetryLost = 0x1009,
    GovernanceFail = 0x100A,
    Timeout = 0x100B,
    Cancelled = 0x100C,
    Pending = 0x100D,
    InvalidArg = 0x100E,
    Fatal = 0x100F,
    Unknown = 0x1010,
    LookaheadMiss = 0x1011,
}

impl ErrorCode {
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Severity is derived from the numeric range only.
    pub const fn severity(self) -> Severity {
        match self as u16 {
            0x0000 => Severity::Info,
            0x1001..=0x1003 => Severity::Warning,
            0x1004..=0x1005 => Severity::Critical,
            0x1006..=0x100A => Severity::Error,
            0x100B..=0x100D => Severity::Warning,
            _ => Severity::Error,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ErrorCode::None => "NONE",
            ErrorCode::HeapConstraint => "HEAP_CONSTRAINT",
            ErrorCode::MemoryExhausted => "MEMORY_EXHAUSTED",
            ErrorCode::PidMismatch => "PID_MISMATCH",
            ErrorCode::BoundaryViolation => "BOUNDARY_VIOLATION",
            ErrorCode::ReceiptInvalid => "RECEIPT_INVALID",
            ErrorCode::TraceFailure => "TRACE_FAILURE",
            ErrorCode::ConfigInvalid => "CONFIG_INVALID",
            ErrorCode::IsolationBreach => "ISOLATION_BREACH",
            ErrorCode::TelemetryLost => "TELEMETRY_LOST",
            ErrorCode::GovernanceFail => "GOVERNANCE_FAIL",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Pending => "PENDING",
            ErrorCode::InvalidArg => "INVALID_ARG",
            ErrorCode::Fatal => "FATAL",
            ErrorCode::Unknown => "UNKNOWN",
            ErrorCode::LookaheadMiss => "LOOKAHEAD_MISS",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", self.as_u16())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Severity {
    Info = 0,
    Warning = 1,
    Error = 2,
    Critical = 3,
}

impl Severity {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// `{error code, ok flag}` pair returned by status queries. This is an API
/// status, not a process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPair {
    pub code: ErrorCode,
    pub ok: bool,
}

impl StatusPair {
    pub const fn ok() -> Self {
        Self {
            code: ErrorCode::None,
            ok: true,
        }
    }

    pub const fn failed(code: ErrorCode) -> Self {
        Self { code, ok: false }
    }
}
