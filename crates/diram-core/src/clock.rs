//! Epoch clocks.
//!
//! An epoch is a coarse bucket of a monotonic clock. The admission gate resets
//! its event counter whenever the epoch id changes. Tests drive epochs by hand
//! through [`ManualClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub trait EpochClock: Send + Sync {
    /// Monotonic nanoseconds since an arbitrary, fixed origin.
    fn now_nanos(&self) -> u64;

    /// Current epoch id. Must be non-decreasing.
    fn epoch(&self) -> u64;
}

/// Buckets `Instant` into fixed-width epochs.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
    width_nanos: u64,
}

impl MonotonicClock {
    pub fn new(epoch_width: Duration) -> Self {
        Self {
            origin: Instant::now(),
            width_nanos: (epoch_width.as_nanos() as u64).max(1),
        }
    }

    pub fn epoch_width(&self) -> Duration {
        Duration::from_nanos(self.width_nanos)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl EpochClock for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn epoch(&self) -> u64 {
        self.now_nanos() / self.width_nanos
    }
}

/// Hand-driven clock. Every `now_nanos` call ticks by one so timestamps stay
/// distinct without real time passing.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
    epoch: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at_epoch(epoch: u64) -> Self {
        Self {
            nanos: AtomicU64::new(0),
            epoch: AtomicU64::new(epoch),
        }
    }

    /// Move to the next epoch and return its id.
    pub fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn set_epoch(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::Release);
    }

    pub fn set_nanos(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::Release);
    }
}

impl EpochClock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.fetch_add(1, Ordering::AcqRel)
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

/// Milliseconds since Unix epoch, for log lines meant to be read by people.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
