//! The underlying allocation primitive.
//!
//! DIRAM governs, traces and isolates allocations; it does not manage a heap.
//! Whatever hands out raw regions sits behind [`HeapPrimitive`]. The default
//! [`SystemHeap`] defers to the global allocator and reports failure instead
//! of aborting.

/// An owned, zero-initialised byte region.
///
/// The region's base pointer value doubles as the allocation's opaque address.
#[derive(Debug)]
pub struct Region {
    bytes: Box<[u8]>,
}

impl Region {
    pub fn from_boxed(bytes: Box<[u8]>) -> Self {
        Self { bytes }
    }

    /// Opaque handle. Never dereferenced.
    pub fn address(&self) -> usize {
        self.bytes.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Overwrite the contents with zeros.
    pub fn scrub(&mut self) {
        self.bytes.fill(0);
    }
}

/// A handle representing the raw allocation primitive.
///
/// `allocate` returns `None` on failure; callers map that to an out-of-memory
/// error and roll back any admission they granted.
pub trait HeapPrimitive: Send + Sync {
    fn allocate(&self, size: usize) -> Option<Region>;

    fn release(&self, region: Region);

    fn name(&self) -> &'static str {
        "heap"
    }
}

/// Global-allocator backed primitive.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHeap;

impl HeapPrimitive for SystemHeap {
    fn allocate(&self, size: usize) -> Option<Region> {
        let mut buf: Vec<u8> = Vec::new();
        buf.try_reserve_exact(size).ok()?;
        buf.resize(size, 0u8);
        Some(Region::from_boxed(buf.into_boxed_slice()))
    }

    fn release(&self, region: Region) {
        drop(region);
    }

    fn name(&self) -> &'static str {
        "system"
    }
}

// NOTE: Do *not* add a primitive that silently succeeds on failure.
// Admission rollback depends on honest `None` returns.
