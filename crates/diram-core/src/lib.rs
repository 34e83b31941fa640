#![forbid(unsafe_code)]
//! diram-core: leaf types shared by every DIRAM crate.
//!
//! Holds configuration, the numeric error-code taxonomy, strongly typed ids,
//! allocation receipts, and the three seams the allocator sits on top of:
//! the heap primitive, the epoch clock, and the process identity.
//!
//! Nothing in here allocates on behalf of callers or spawns threads.

pub mod clock;
pub mod config;
pub mod error;
pub mod hash;
pub mod heap;
pub mod id;
pub mod prelude;
pub mod process;

/// Crate version stamped into telemetry and dumps.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
