//! Convenient re-exports for downstream crates.

pub use crate::clock::{EpochClock, ManualClock, MonotonicClock};
pub use crate::config::DiramConfig;
pub use crate::error::{Error, ErrorCode, Result, Severity, StatusPair};
pub use crate::hash::{Blake3Receipts, FoldReceipts, Receipt, ReceiptHasher, ReceiptInput};
pub use crate::heap::{HeapPrimitive, Region, SystemHeap};
pub use crate::id::{EventId, PromiseId};
pub use crate::process::{FixedPid, OsProcess, ProcessIdentity};
