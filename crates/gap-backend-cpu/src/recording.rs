use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gap_backend::{Backend, CapabilitySet, DeleterContext, KernelSelection};
use gap_core::{GemvArgs, GemvError};

/// Forwards to another backend and remembers what passed through.
///
/// Tests use it as a counting deleter: every deallocation is logged with its
/// address and context before it reaches the wrapped backend.
pub struct RecordingBackend {
    inner: Arc<dyn Backend>,
    allocations: Mutex<Vec<usize>>,
    releases: Mutex<Vec<(usize, Option<DeleterContext>)>>,
    kernels: Mutex<Vec<String>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RecordingBackend {
    #[must_use]
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        Self {
            inner,
            allocations: Mutex::new(Vec::new()),
            releases: Mutex::new(Vec::new()),
            kernels: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn inner(&self) -> &Arc<dyn Backend> {
        &self.inner
    }

    #[must_use]
    pub fn allocations(&self) -> Vec<usize> {
        locked(&self.allocations).clone()
    }

    #[must_use]
    pub fn releases(&self) -> Vec<(usize, Option<DeleterContext>)> {
        locked(&self.releases).clone()
    }

    #[must_use]
    pub fn release_count(&self) -> usize {
        locked(&self.releases).len()
    }

    /// How many times `addr` was handed back.
    #[must_use]
    pub fn releases_of(&self, addr: usize) -> usize {
        locked(&self.releases)
            .iter()
            .filter(|(released, _)| *released == addr)
            .count()
    }

    #[must_use]
    pub fn kernels(&self) -> Vec<String> {
        locked(&self.kernels).clone()
    }

    /// Allocations not yet handed back through this wrapper.
    ///
    /// Each release settles at most one earlier allocation at the same
    /// address, so foreign and repeated releases never balance a leak.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        let mut open: HashMap<usize, usize> = HashMap::new();
        for addr in &*locked(&self.allocations) {
            *open.entry(*addr).or_default() += 1;
        }
        for (addr, _) in &*locked(&self.releases) {
            if let Some(count) = open.get_mut(addr).filter(|count| **count > 0) {
                *count -= 1;
            }
        }
        open.values().sum()
    }

    /// Releases that did not settle a matching allocation: foreign
    /// pointers and second frees.
    #[must_use]
    pub fn unmatched_releases(&self) -> usize {
        let outstanding = self.outstanding();
        let settled = locked(&self.allocations).len().saturating_sub(outstanding);
        self.release_count().saturating_sub(settled)
    }
}

impl std::fmt::Debug for RecordingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingBackend")
            .field("inner", &self.inner.name())
            .field("releases", &self.release_count())
            .finish_non_exhaustive()
    }
}

// SAFETY: allocation is forwarded unchanged to a backend that already
// upholds the contract.
unsafe impl Backend for RecordingBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn alignment(&self) -> usize {
        self.inner.alignment()
    }

    fn capabilities(&self) -> CapabilitySet {
        self.inner.capabilities()
    }

    fn kernel_variants(&self) -> &[&'static str] {
        self.inner.kernel_variants()
    }

    fn allocate(&self, nbytes: usize) -> Option<NonNull<u8>> {
        let ptr = self.inner.allocate(nbytes)?;
        locked(&self.allocations).push(ptr.as_ptr() as usize);
        Some(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, context: Option<DeleterContext>) {
        locked(&self.releases).push((ptr.as_ptr() as usize, context));
        // SAFETY: `allocate` forwards to `inner`, so the caller's guarantee
        // holds for it too.
        unsafe { self.inner.deallocate(ptr, context) };
    }

    fn gemv(&self, args: &mut GemvArgs<'_>) -> Result<KernelSelection, GemvError> {
        let selection = self.inner.gemv(args)?;
        locked(&self.kernels).push(selection.kernel.clone());
        Ok(selection)
    }
}
