//! Backend capability interface and the ownership protocol around
//! backend-allocated buffers.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use gap_core::{GemvArgs, GemvError, Precision, Sparsity};

/// Opaque token a backend receives back when one of its buffers is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeleterContext(pub u64);

/// The concrete kernel a backend ran for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSelection {
    pub kernel: String,
    pub fallback_used: bool,
}

/// Set of `(precision, sparsity)` pairs a backend has kernels for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CapabilitySet {
    bits: u64,
}

impl CapabilitySet {
    #[must_use]
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    #[must_use]
    pub const fn bit(precision: Precision, sparsity: Sparsity) -> u64 {
        1u64 << (precision.index() * 2 + sparsity.index())
    }

    #[must_use]
    pub fn from_pairs(pairs: &[(Precision, Sparsity)]) -> Self {
        let mut out = Self::empty();
        for (precision, sparsity) in pairs {
            out.add(*precision, *sparsity);
        }
        out
    }

    /// Every precision, dense layout only.
    #[must_use]
    pub fn dense_all() -> Self {
        let mut out = Self::empty();
        for precision in Precision::all() {
            out.add(*precision, Sparsity::Dense);
        }
        out
    }

    pub fn from_bits_checked(bits: u64) -> Result<Self, CapabilityError> {
        let known_mask = Precision::all()
            .iter()
            .flat_map(|precision| {
                Sparsity::all()
                    .iter()
                    .map(move |sparsity| Self::bit(*precision, *sparsity))
            })
            .fold(0u64, |mask, bit| mask | bit);
        let unknown = bits & !known_mask;
        if unknown != 0 {
            return Err(CapabilityError::UnknownBits {
                unknown_mask: unknown,
            });
        }
        Ok(Self { bits })
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.bits
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }

    pub fn add(&mut self, precision: Precision, sparsity: Sparsity) {
        self.bits |= Self::bit(precision, sparsity);
    }

    pub fn remove(&mut self, precision: Precision, sparsity: Sparsity) {
        self.bits &= !Self::bit(precision, sparsity);
    }

    #[must_use]
    pub const fn supports(self, precision: Precision, sparsity: Sparsity) -> bool {
        (self.bits & Self::bit(precision, sparsity)) != 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self {
            bits: self.bits & other.bits,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityError {
    UnknownBits { unknown_mask: u64 },
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownBits { unknown_mask } => {
                write!(f, "capability set has unknown bitmask 0x{unknown_mask:016x}")
            }
        }
    }
}

impl std::error::Error for CapabilityError {}

/// A pluggable compute backend.
///
/// # Safety
///
/// Implementors guarantee that every `Some(ptr)` returned by
/// [`Backend::allocate`] is aligned to [`Backend::alignment`], initialised,
/// valid for reads and writes of the requested byte count, not aliased by
/// any other live allocation, and stays valid until it is passed to
/// [`Backend::deallocate`] on the same backend. Tensor handles rely on this
/// to hand out slices over adopted buffers.
///
/// Implementors may assume every pointer passed to [`Backend::deallocate`]
/// meets that method's precondition; they are not required to detect
/// foreign or already-freed pointers.
pub unsafe trait Backend: Send + Sync {
    /// Stable identity used for diagnostics and backend selection.
    fn name(&self) -> &str;

    /// Minimum alignment of every buffer from [`Backend::allocate`].
    fn alignment(&self) -> usize;

    fn capabilities(&self) -> CapabilitySet;

    /// Kernel hints this backend accepts in `OperationConfig::kernel_hint`.
    fn kernel_variants(&self) -> &[&'static str];

    /// Returns `None` when the request cannot be satisfied. A successful
    /// buffer belongs to the caller until it is handed back through
    /// [`Backend::deallocate`].
    fn allocate(&self, nbytes: usize) -> Option<NonNull<u8>>;

    /// Releases a buffer produced by this backend's `allocate`. Must not
    /// panic.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`Backend::allocate`] on this same
    /// backend and not released since. After the call the buffer must not
    /// be accessed again.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, context: Option<DeleterContext>);

    /// Runs `y = A * x` under `args.config`. On failure nothing is reported
    /// about the kernel and the output contents are unspecified.
    fn gemv(&self, args: &mut GemvArgs<'_>) -> Result<KernelSelection, GemvError>;
}

/// Releases buffers through the backend that allocated them.
///
/// Holding the backend keeps it alive for as long as any buffer bound to it
/// is outstanding. Two deleters are equal when they release into the same
/// backend instance.
#[derive(Clone)]
pub struct Deleter {
    backend: Arc<dyn Backend>,
}

impl Deleter {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    #[must_use]
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Hands `ptr` back to the backend this deleter wraps.
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated by [`Deleter::backend`] and not
    /// released since; see [`Backend::deallocate`].
    pub unsafe fn release(&self, ptr: NonNull<u8>, context: Option<DeleterContext>) {
        tracing::trace!(
            backend = self.backend.name(),
            addr = ptr.as_ptr() as usize,
            "releasing buffer"
        );
        // SAFETY: forwarded from the caller.
        unsafe { self.backend.deallocate(ptr, context) };
    }
}

impl PartialEq for Deleter {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.backend, &other.backend)
    }
}

impl Eq for Deleter {}

impl fmt::Debug for Deleter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deleter")
            .field("backend", &self.backend.name())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocError {
    pub backend: String,
    pub nbytes: usize,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "backend '{}' could not allocate {} bytes",
            self.backend, self.nbytes
        )
    }
}

impl std::error::Error for AllocError {}

/// A buffer owned by the backend that produced it; dropping it frees it.
#[derive(Debug)]
pub struct BackendBuffer {
    ptr: NonNull<u8>,
    len: usize,
    deleter: Deleter,
    context: Option<DeleterContext>,
    disarmed: bool,
}

impl BackendBuffer {
    pub fn allocate(backend: &Arc<dyn Backend>, nbytes: usize) -> Result<Self, AllocError> {
        let ptr = backend.allocate(nbytes).ok_or_else(|| AllocError {
            backend: backend.name().to_string(),
            nbytes,
        })?;
        Ok(Self {
            ptr,
            len: nbytes,
            deleter: Deleter::new(Arc::clone(backend)),
            context: None,
            disarmed: false,
        })
    }

    #[must_use]
    pub fn with_context(mut self, context: DeleterContext) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn alignment(&self) -> usize {
        self.deleter.backend().alignment()
    }

    #[must_use]
    pub fn backend_name(&self) -> &str {
        self.deleter.backend_name()
    }

    #[must_use]
    pub fn context(&self) -> Option<DeleterContext> {
        self.context
    }

    /// Gives up ownership; the caller must eventually pass the pointer and
    /// context to the returned deleter.
    #[must_use]
    pub fn into_raw_parts(mut self) -> (NonNull<u8>, Deleter, Option<DeleterContext>) {
        self.disarmed = true;
        (self.ptr, self.deleter.clone(), self.context)
    }

    /// Re-adopts parts produced by [`BackendBuffer::into_raw_parts`].
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of `len` bytes from `deleter`'s
    /// backend that nothing else will release.
    #[must_use]
    pub unsafe fn from_raw_parts(
        ptr: NonNull<u8>,
        len: usize,
        deleter: Deleter,
        context: Option<DeleterContext>,
    ) -> Self {
        Self {
            ptr,
            len,
            deleter,
            context,
            disarmed: false,
        }
    }
}

impl Drop for BackendBuffer {
    fn drop(&mut self) {
        if !self.disarmed {
            // SAFETY: an armed buffer came from `deleter`'s backend, either
            // through `allocate` or `from_raw_parts`, and is released only here.
            unsafe { self.deleter.release(self.ptr, self.context) };
        }
    }
}

// Safety: the buffer is exclusively owned and the deleter is `Send + Sync`.
unsafe impl Send for BackendBuffer {}
unsafe impl Sync for BackendBuffer {}
