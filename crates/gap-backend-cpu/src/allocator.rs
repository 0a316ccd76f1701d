use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

/// Smallest alignment handed out; covers every element type.
pub const MIN_ALIGNMENT: usize = 8;

/// Largest power of two a `usize` holds. No layout accepts it, so an
/// allocator clamped here refuses every request.
const MAX_ALIGNMENT: usize = 1 << (usize::BITS - 1);

/// Aligned, zero-initialised host memory with a table of live allocations.
///
/// Only pointers recorded in the table are ever freed, so a foreign or
/// already-freed pointer passed to [`HostAllocator::deallocate`] is ignored.
#[derive(Debug)]
pub struct HostAllocator {
    alignment: usize,
    max_allocation_bytes: Option<usize>,
    live: Mutex<HashMap<usize, Layout>>,
    allocations: AtomicU64,
    frees: AtomicU64,
}

impl HostAllocator {
    /// `alignment` is raised to [`MIN_ALIGNMENT`] and rounded up to a power
    /// of two. An alignment with no representable power of two is clamped
    /// to the largest one, and every allocation then fails.
    #[must_use]
    pub fn new(alignment: usize, max_allocation_bytes: Option<usize>) -> Self {
        let alignment = alignment
            .max(MIN_ALIGNMENT)
            .checked_next_power_of_two()
            .unwrap_or_else(|| {
                warn!(alignment, "alignment overflows; allocations will be refused");
                MAX_ALIGNMENT
            });
        Self {
            alignment,
            max_allocation_bytes,
            live: Mutex::new(HashMap::new()),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    #[must_use]
    pub fn max_allocation_bytes(&self) -> Option<usize> {
        self.max_allocation_bytes
    }

    fn table(&self) -> MutexGuard<'_, HashMap<usize, Layout>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Zero-byte requests still get a distinct one-byte block.
    pub fn allocate(&self, owner: &str, nbytes: usize) -> Option<NonNull<u8>> {
        if let Some(cap) = self.max_allocation_bytes.filter(|cap| nbytes > *cap) {
            warn!(backend = owner, nbytes, cap, "allocation exceeds byte cap");
            return None;
        }
        let layout = match Layout::from_size_align(nbytes.max(1), self.alignment) {
            Ok(layout) => layout,
            Err(err) => {
                warn!(backend = owner, nbytes, error = %err, "invalid allocation layout");
                return None;
            }
        };
        // SAFETY: the layout has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        self.table().insert(ptr.as_ptr() as usize, layout);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        debug!(
            backend = owner,
            addr = ptr.as_ptr() as usize,
            nbytes,
            align = self.alignment,
            "allocated"
        );
        Some(ptr)
    }

    /// Returns `false` when the pointer is not a live allocation of this
    /// allocator; nothing is freed in that case.
    pub fn deallocate(&self, owner: &str, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let Some(layout) = self.table().remove(&addr) else {
            warn!(backend = owner, addr, "ignoring deallocation of foreign pointer");
            return false;
        };
        // SAFETY: `addr` was produced by `alloc_zeroed` with `layout` and was
        // removed from the live table, so it is freed exactly once.
        unsafe { dealloc(ptr.as_ptr(), layout) };
        self.frees.fetch_add(1, Ordering::Relaxed);
        debug!(backend = owner, addr, nbytes = layout.size(), "freed");
        true
    }

    #[must_use]
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.table().contains_key(&(ptr.as_ptr() as usize))
    }

    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.table().len()
    }

    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.table().values().map(Layout::size).sum()
    }

    #[must_use]
    pub fn allocation_count(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }
}

impl Drop for HostAllocator {
    fn drop(&mut self) {
        let live = self.table().len();
        if live > 0 {
            warn!(live, "host allocator dropped with outstanding buffers");
        }
    }
}
