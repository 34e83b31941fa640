//! Named, capacity-bounded memory spaces.
//!
//! A space only accounts; it never owns memory. `used` and `count` change only
//! under the space's mutex, and only through the enhanced allocator's
//! bind/release.

use std::sync::{Arc, Weak};

use diram_core::process::{OsProcess, ProcessIdentity};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{AllocError, Result};
use crate::tracking::PeakTracker;

#[derive(Debug, Default)]
struct Counters {
    used: usize,
    count: usize,
}

struct SpaceInner {
    name: String,
    capacity: usize,
    owner_pid: u32,
    counters: Mutex<Counters>,
    peak: PeakTracker,
}

impl SpaceInner {
    fn exhausted(&self, requested: usize, used: usize) -> AllocError {
        AllocError::MemoryExhausted {
            space: self.name.clone(),
            requested,
            capacity: self.capacity,
            used,
        }
    }
}

/// Shared handle to a space. Clones refer to the same counters.
#[derive(Clone)]
pub struct MemorySpace {
    inner: Arc<SpaceInner>,
}

/// Non-owning reference held by allocations bound to a space.
#[derive(Clone)]
pub struct WeakSpace {
    inner: Weak<SpaceInner>,
}

impl WeakSpace {
    pub fn upgrade(&self) -> Option<MemorySpace> {
        self.inner.upgrade().map(|inner| MemorySpace { inner })
    }
}

impl std::fmt::Debug for WeakSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.upgrade() {
            Some(space) => write!(f, "WeakSpace({})", space.name()),
            None => f.write_str("WeakSpace(<destroyed>)"),
        }
    }
}

impl MemorySpace {
    /// Create a space owned by the current OS process.
    pub fn create(name: impl Into<String>, capacity: usize) -> Self {
        Self::create_owned(name, capacity, &OsProcess)
    }

    pub fn create_owned(
        name: impl Into<String>,
        capacity: usize,
        owner: &dyn ProcessIdentity,
    ) -> Self {
        let name = name.into();
        let owner_pid = owner.current_pid();
        debug!(space = %name, capacity, owner_pid, "space created");
        Self {
            inner: Arc::new(SpaceInner {
                name,
                capacity,
                owner_pid,
                counters: Mutex::new(Counters::default()),
                peak: PeakTracker::new(),
            }),
        }
    }

    /// Would `requested` more bytes fit? Does not mutate.
    pub fn check_limit(&self, requested: usize) -> Result<()> {
        let c = self.inner.counters.lock();
        match c.used.checked_add(requested) {
            Some(next) if next <= self.inner.capacity => Ok(()),
            _ => Err(self.inner.exhausted(requested, c.used)),
        }
    }

    /// Account for a new allocation. Rechecks under the lock, since another
    /// thread may have bound bytes after `check_limit`.
    pub(crate) fn bind(&self, size: usize) -> Result<()> {
        let mut c = self.inner.counters.lock();
        let next = match c.used.checked_add(size) {
            Some(next) if next <= self.inner.capacity => next,
            _ => return Err(self.inner.exhausted(size, c.used)),
        };
        c.used = next;
        c.count += 1;
        self.inner.peak.record_used(next);
        Ok(())
    }

    pub(crate) fn release(&self, size: usize) {
        let mut c = self.inner.counters.lock();
        c.used = c.used.saturating_sub(size);
        c.count = c.count.saturating_sub(1);
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity_bytes(&self) -> usize {
        self.inner.capacity
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.counters.lock().used
    }

    pub fn allocation_count(&self) -> usize {
        self.inner.counters.lock().count
    }

    pub fn peak_bytes(&self) -> usize {
        self.inner.peak.peak()
    }

    pub fn owner_pid(&self) -> u32 {
        self.inner.owner_pid
    }

    pub fn downgrade(&self) -> WeakSpace {
        WeakSpace {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Drop this handle. Outstanding allocations are not enumerated or freed;
    /// the bookkeeping goes away once the last handle does.
    pub fn destroy(self) {
        let (used, count) = {
            let c = self.inner.counters.lock();
            (c.used, c.count)
        };
        if used > 0 {
            warn!(space = %self.inner.name, used, count, "space destroyed with live allocations");
        } else {
            debug!(space = %self.inner.name, "space destroyed");
        }
    }
}

impl std::fmt::Debug for MemorySpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = self.inner.counters.lock();
        f.debug_struct("MemorySpace")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("used", &c.used)
            .field("count", &c.count)
            .field("owner_pid", &self.inner.owner_pid)
            .finish()
    }
}
