use diram_core::error::ErrorCode;
use thiserror::Error;

/// Result type local to diram-mem.
pub type Result<T> = std::result::Result<T, AllocError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocError {
    /// Epoch admission denied. Expected; retry in a later epoch.
    #[error("heap constraint: {events}/{max} events already used in epoch {epoch}")]
    ConstraintViolation { epoch: u64, events: u32, max: u32 },

    #[error("underlying allocation failed for {bytes} bytes (tag '{tag}')")]
    OutOfMemory { tag: String, bytes: usize },

    #[error("memory space '{space}' exhausted: requested {requested} bytes, capacity {capacity}, used {used}")]
    MemoryExhausted {
        space: String,
        requested: usize,
        capacity: usize,
        used: usize,
    },

    #[error("boundary sentinel mismatch at {address:#x}")]
    BoundaryViolation { address: usize },

    #[error("receipt mismatch at {address:#x}")]
    ReceiptInvalid { address: usize },

    #[error("sink error: {0}")]
    Sink(String),
}

impl AllocError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AllocError::ConstraintViolation { .. } => ErrorCode::HeapConstraint,
            AllocError::OutOfMemory { .. } | AllocError::MemoryExhausted { .. } => {
                ErrorCode::MemoryExhausted
            }
            AllocError::BoundaryViolation { .. } => ErrorCode::BoundaryViolation,
            AllocError::ReceiptInvalid { .. } => ErrorCode::ReceiptInvalid,
            AllocError::Sink(_) => ErrorCode::TraceFailure,
        }
    }

    /// Failures a caller may reasonably retry (later epoch, after reclamation).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AllocError::ConstraintViolation { .. } | AllocError::MemoryExhausted { .. }
        )
    }
}

impl From<std::io::Error> for AllocError {
    fn from(e: std::io::Error) -> Self {
        AllocError::Sink(e.to_string())
    }
}

impl From<serde_json::Error> for AllocError {
    fn from(e: serde_json::Error) -> Self {
        AllocError::Sink(e.to_string())
    }
}
