//! Move-only tensor handle over backend-allocated storage.
//!
//! A [`TensorHandle`] carries a name, a 2-D shape, row-major byte strides
//! and, once attached, a pointer to its elements plus the [`Deleter`] that
//! frees them. The handle disposes an owned buffer exactly once: on reset,
//! on re-attach to different storage, or on drop.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use gap_backend::{AllocError, Backend, BackendBuffer, Deleter, DeleterContext};
use gap_core::{DType, Element, TensorArg, TensorArgMut, dense_byte_strides};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    Misaligned { addr: usize, align: usize },
    BufferTooSmall { needed: usize, available: usize },
    LengthMismatch { expected: usize, actual: usize },
    NoData { name: String },
    DeleterMismatch { name: String },
    Allocation(AllocError),
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Misaligned { addr, align } => {
                write!(f, "pointer 0x{addr:x} is not aligned to {align} bytes")
            }
            Self::BufferTooSmall { needed, available } => write!(
                f,
                "buffer too small: needed={needed} bytes, available={available}"
            ),
            Self::LengthMismatch { expected, actual } => write!(
                f,
                "length mismatch: expected {expected} elements, got {actual}"
            ),
            Self::NoData { name } => write!(f, "tensor '{name}' has no storage attached"),
            Self::DeleterMismatch { name } => write!(
                f,
                "tensor '{name}' can only rebind its buffer to the deleter that owns it"
            ),
            Self::Allocation(error) => write!(f, "allocation failed: {error}"),
        }
    }
}

impl std::error::Error for TensorError {}

impl From<AllocError> for TensorError {
    fn from(value: AllocError) -> Self {
        Self::Allocation(value)
    }
}

pub struct TensorHandle<T: Element> {
    name: String,
    shape: [usize; 2],
    stride: [usize; 2],
    data: Option<NonNull<T>>,
    deleter: Option<Deleter>,
    context: Option<DeleterContext>,
    owning: bool,
    _marker: PhantomData<T>,
}

impl<T: Element> TensorHandle<T> {
    pub const ALIGN: usize = T::ALIGN;
    pub const ELEMENT_SIZE: usize = T::SIZE;

    /// A named, non-owning handle with dense strides and no storage.
    #[must_use]
    pub fn new(name: impl Into<String>, rows: usize, cols: usize) -> Self {
        let shape = [rows, cols];
        Self {
            name: name.into(),
            shape,
            stride: dense_byte_strides(shape, T::SIZE),
            data: None,
            deleter: None,
            context: None,
            owning: false,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn type_name() -> &'static str {
        T::type_name()
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        T::DTYPE
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn shape(&self) -> [usize; 2] {
        self.shape
    }

    /// Byte strides, row then column.
    #[must_use]
    pub fn stride(&self) -> [usize; 2] {
        self.stride
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    #[must_use]
    pub fn cols(&self) -> usize {
        self.shape[1]
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape[0].saturating_mul(self.shape[1])
    }

    #[must_use]
    pub fn nbytes(&self) -> usize {
        self.numel().saturating_mul(T::SIZE)
    }

    #[must_use]
    pub fn data(&self) -> Option<NonNull<T>> {
        self.data
    }

    /// Null when nothing is attached.
    #[must_use]
    pub fn data_ptr(&self) -> *mut T {
        self.data.map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    #[must_use]
    pub fn raw_ptr(&self) -> *mut u8 {
        self.data_ptr().cast::<u8>()
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    #[must_use]
    pub fn is_owning(&self) -> bool {
        self.owning
    }

    #[must_use]
    pub fn deleter(&self) -> Option<&Deleter> {
        self.deleter.as_ref()
    }

    #[must_use]
    pub fn context(&self) -> Option<DeleterContext> {
        self.context
    }

    /// Adopts `ptr`; the handle owns it iff both `ptr` and `deleter` are
    /// present.
    ///
    /// Re-attaching the identical `(ptr, deleter, context)` does nothing.
    /// Re-attaching the current pointer with a different deleter or context
    /// rebinds ownership without freeing. Any other attach first frees the
    /// buffer this handle owns.
    ///
    /// # Errors
    ///
    /// [`TensorError::Misaligned`] when `ptr` is not aligned for `T`; the
    /// handle is left untouched.
    ///
    /// # Safety
    ///
    /// A present `ptr` must be valid for reads and writes of
    /// `rows * cols` initialised elements for as long as the handle holds
    /// it, and must not be accessed through any other path meanwhile. A
    /// present `deleter` must be able to free `ptr`.
    pub unsafe fn attach(
        &mut self,
        ptr: Option<NonNull<T>>,
        deleter: Option<Deleter>,
        context: Option<DeleterContext>,
    ) -> Result<(), TensorError> {
        if let Some(ptr) = ptr {
            let addr = ptr.as_ptr() as usize;
            if addr % T::ALIGN != 0 {
                return Err(TensorError::Misaligned {
                    addr,
                    align: T::ALIGN,
                });
            }
        }
        if self.data == ptr && self.deleter == deleter && self.context == context {
            trace!(tensor = %self.name, "identical attach ignored");
            return Ok(());
        }
        if ptr.is_some() && self.data == ptr {
            debug!(tensor = %self.name, "rebinding deleter of attached buffer");
        } else {
            self.dispose();
        }

        self.owning = ptr.is_some() && deleter.is_some();
        self.data = ptr;
        self.deleter = deleter;
        self.context = context;
        debug!(
            tensor = %self.name,
            addr = self.raw_ptr() as usize,
            owning = self.owning,
            backend = self.deleter.as_ref().map(Deleter::backend_name),
            "attached"
        );
        Ok(())
    }

    /// Re-attaches the current pointer under a new context, keeping the
    /// owning deleter or dropping it. Nothing is freed; passing `None`
    /// leaves the handle non-owning.
    ///
    /// # Errors
    ///
    /// [`TensorError::DeleterMismatch`] when `deleter` is present but the
    /// handle holds a pointer that `deleter` does not already own, as for
    /// a view or a buffer from another backend. The handle is left
    /// untouched; moving a buffer to a new deleter goes through `attach`.
    pub fn rebind(
        &mut self,
        deleter: Option<Deleter>,
        context: Option<DeleterContext>,
    ) -> Result<(), TensorError> {
        let grants_foreign = deleter.as_ref().is_some_and(|deleter| {
            self.data.is_some() && !(self.owning && self.deleter.as_ref() == Some(deleter))
        });
        if grants_foreign {
            debug!(tensor = %self.name, owning = self.owning, "rebind refused");
            return Err(TensorError::DeleterMismatch {
                name: self.name.clone(),
            });
        }
        let data = self.data;
        // SAFETY: `data` is already held under the `attach` contract, its
        // alignment was checked then, and `deleter` is either absent or
        // the one that already owns it.
        unsafe { self.attach(data, deleter, context) }
    }

    /// Adopts a backend buffer, taking over its release duty.
    ///
    /// On error the buffer is freed by its backend.
    pub fn attach_buffer(&mut self, buffer: BackendBuffer) -> Result<(), TensorError> {
        let needed = self.nbytes();
        if buffer.len() < needed {
            return Err(TensorError::BufferTooSmall {
                needed,
                available: buffer.len(),
            });
        }
        let addr = buffer.as_ptr().as_ptr() as usize;
        if addr % T::ALIGN != 0 {
            return Err(TensorError::Misaligned {
                addr,
                align: T::ALIGN,
            });
        }

        let (ptr, deleter, context) = buffer.into_raw_parts();
        // SAFETY: the `Backend` contract makes the buffer initialised, aligned
        // and exclusively ours for at least `nbytes` bytes until `deleter`
        // frees it; every bit pattern is a valid `T`.
        let attached =
            unsafe { self.attach(Some(ptr.cast::<T>()), Some(deleter.clone()), context) };
        if attached.is_err() {
            // SAFETY: the handle did not adopt the pointer, so the release
            // duty taken from the buffer is still ours.
            unsafe { deleter.release(ptr, context) };
        }
        attached
    }

    /// Allocates `nbytes()` on `backend` and adopts the result.
    pub fn allocate_on(&mut self, backend: &Arc<dyn Backend>) -> Result<(), TensorError> {
        let buffer = BackendBuffer::allocate(backend, self.nbytes())?;
        self.attach_buffer(buffer)
    }

    /// Hands the pointer back without freeing it and leaves the handle
    /// empty. The caller becomes responsible for the buffer.
    pub fn release(&mut self) -> Option<NonNull<T>> {
        let ptr = self.data.take();
        self.deleter = None;
        self.context = None;
        self.owning = false;
        if ptr.is_some() {
            debug!(tensor = %self.name, "released without freeing");
        }
        ptr
    }

    /// Like [`TensorHandle::release`], but an owned buffer comes back armed
    /// so that dropping it frees through the handle's deleter. A non-owning
    /// handle is detached and yields `None`.
    pub fn release_buffer(&mut self) -> Option<BackendBuffer> {
        let owner = self.deleter.clone().filter(|_| self.owning);
        let context = self.context;
        let nbytes = self.nbytes();
        let ptr = self.release()?;
        let deleter = owner?;
        // SAFETY: an owning handle's pointer can be freed by its deleter and
        // holds at least `nbytes`; `release` just gave up the duty to free it.
        Some(unsafe { BackendBuffer::from_raw_parts(ptr.cast::<u8>(), nbytes, deleter, context) })
    }

    /// Frees an owned buffer and clears the handle. Idempotent.
    pub fn reset(&mut self) {
        self.dispose();
        self.data = None;
        self.deleter = None;
        self.context = None;
        self.owning = false;
    }

    fn dispose(&mut self) {
        if !self.owning {
            return;
        }
        self.owning = false;
        if let (Some(ptr), Some(deleter)) = (self.data.take(), self.deleter.take()) {
            debug!(tensor = %self.name, backend = deleter.backend_name(), "disposing");
            // SAFETY: `attach` requires an owning deleter to be able to free
            // `ptr`, and clearing `owning` above makes this the only release.
            unsafe { deleter.release(ptr.cast::<u8>(), self.context.take()) };
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        match self.data {
            // SAFETY: `attach` requires `numel` valid, initialised elements.
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.numel()) },
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match self.data {
            // SAFETY: as in `as_slice`; `&mut self` guarantees exclusivity.
            Some(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.numel()) },
            None => &mut [],
        }
    }

    pub fn copy_from_slice(&mut self, values: &[T]) -> Result<(), TensorError> {
        if self.data.is_none() {
            return Err(TensorError::NoData {
                name: self.name.clone(),
            });
        }
        let expected = self.numel();
        if values.len() != expected {
            return Err(TensorError::LengthMismatch {
                expected,
                actual: values.len(),
            });
        }
        self.as_mut_slice().copy_from_slice(values);
        Ok(())
    }

    /// Read-only kernel operand, `None` when nothing is attached.
    #[must_use]
    pub fn as_arg(&self) -> Option<TensorArg<'_>> {
        self.data?;
        Some(TensorArg::new(
            T::wrap(self.as_slice()),
            self.shape,
            self.stride,
        ))
    }

    pub fn as_arg_mut(&mut self) -> Option<TensorArgMut<'_>> {
        self.data?;
        let shape = self.shape;
        let stride = self.stride;
        Some(TensorArgMut::new(
            T::wrap_mut(self.as_mut_slice()),
            shape,
            stride,
        ))
    }
}

/// The drained state a moved-from handle is left in by `std::mem::take`.
impl<T: Element> Default for TensorHandle<T> {
    fn default() -> Self {
        Self {
            name: String::new(),
            shape: [0, 0],
            stride: [0, 0],
            data: None,
            deleter: None,
            context: None,
            owning: false,
            _marker: PhantomData,
        }
    }
}

impl<T: Element> Drop for TensorHandle<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: Element> fmt::Debug for TensorHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorHandle")
            .field("name", &self.name)
            .field("dtype", &T::type_name())
            .field("shape", &self.shape)
            .field("stride", &self.stride)
            .field("data", &self.data.map(|ptr| ptr.as_ptr() as usize))
            .field("owning", &self.owning)
            .field("deleter", &self.deleter)
            .field("context", &self.context)
            .finish()
    }
}

// SAFETY: the handle exclusively owns (or exclusively borrows, per the
// `attach` contract) its buffer; shared access only hands out `&[T]`.
unsafe impl<T: Element> Send for TensorHandle<T> {}
unsafe impl<T: Element> Sync for TensorHandle<T> {}

#[cfg(test)]
mod tests {
    use std::alloc::{Layout, alloc_zeroed, dealloc};
    use std::ptr::NonNull;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use gap_backend::{
        Backend, BackendBuffer, CapabilitySet, Deleter, DeleterContext, KernelSelection,
    };
    use gap_backend_cpu::{RecordingBackend, ReferenceBackend};
    use gap_core::{DType, GemvArgs, GemvError, Unsupported};
    use half::f16;
    use proptest::prelude::*;

    use super::{TensorError, TensorHandle};

    struct Fixture {
        host: Arc<ReferenceBackend>,
        recording: Arc<RecordingBackend>,
        backend: Arc<dyn Backend>,
    }

    impl Fixture {
        fn new() -> Self {
            let host = Arc::new(ReferenceBackend::default());
            let recording = Arc::new(RecordingBackend::new(host.clone()));
            let backend: Arc<dyn Backend> = recording.clone();
            Self {
                host,
                recording,
                backend,
            }
        }

        fn deleter(&self) -> Deleter {
            Deleter::new(Arc::clone(&self.backend))
        }

        fn raw(&self, nbytes: usize) -> NonNull<f32> {
            self.backend
                .allocate(nbytes)
                .expect("host memory")
                .cast::<f32>()
        }

        fn free(&self, ptr: NonNull<f32>) {
            // SAFETY: tests only pass pointers from `raw` or handles attached
            // to this backend, each freed once.
            unsafe { self.backend.deallocate(ptr.cast::<u8>(), None) };
        }

        fn addr(ptr: NonNull<f32>) -> usize {
            ptr.as_ptr() as usize
        }
    }

    #[test]
    fn fresh_handle_is_empty_with_dense_strides() {
        let handle = TensorHandle::<f32>::new("A", 3, 4);
        assert_eq!(handle.name(), "A");
        assert_eq!(handle.rows(), 3);
        assert_eq!(handle.cols(), 4);
        assert_eq!(handle.stride(), [16, 4]);
        assert_eq!(handle.numel(), 12);
        assert_eq!(handle.nbytes(), 48);
        assert!(handle.data_ptr().is_null());
        assert!(handle.raw_ptr().is_null());
        assert!(!handle.is_owning());
        assert!(handle.deleter().is_none());
        assert!(handle.as_slice().is_empty());
        assert!(handle.as_arg().is_none());
        assert_eq!(handle.dtype(), DType::F32);
        assert_eq!(TensorHandle::<f32>::type_name(), "f32");
        assert_eq!(TensorHandle::<f32>::ALIGN, 4);
        assert_eq!(TensorHandle::<f32>::ELEMENT_SIZE, 4);

        let half = TensorHandle::<f16>::new("H", 3, 4);
        assert_eq!(half.stride(), [8, 2]);
    }

    #[test]
    fn attach_then_drop_releases_exactly_once() {
        let fx = Fixture::new();
        let ptr = fx.raw(48);
        {
            let mut handle = TensorHandle::<f32>::new("A", 3, 4);
            // SAFETY: 48 fresh bytes from the backend.
            unsafe {
                handle.attach(Some(ptr), Some(fx.deleter()), Some(DeleterContext(9))).expect("aligned");
            }
            assert!(handle.is_owning());
            assert_eq!(handle.data_ptr(), ptr.as_ptr());
            assert_eq!(handle.context(), Some(DeleterContext(9)));
        }
        assert_eq!(
            fx.recording.releases(),
            vec![(Fixture::addr(ptr), Some(DeleterContext(9)))]
        );
        assert_eq!(fx.host.allocator().live_allocations(), 0);
    }

    #[test]
    fn release_hands_back_pointer_without_freeing() {
        let fx = Fixture::new();
        let ptr = fx.raw(48);
        let mut handle = TensorHandle::<f32>::new("A", 3, 4);
        // SAFETY: 48 fresh bytes from the backend.
        unsafe {
            handle.attach(Some(ptr), Some(fx.deleter()), None).expect("aligned");
        }

        assert_eq!(handle.release(), Some(ptr));
        assert!(!handle.is_owning());
        assert!(handle.data_ptr().is_null());
        assert!(handle.release().is_none());
        drop(handle);
        assert_eq!(fx.recording.release_count(), 0);

        fx.free(ptr);
        assert_eq!(fx.recording.release_count(), 1);
    }

    #[test]
    fn sequential_attach_frees_previous_buffer_once() {
        let fx = Fixture::new();
        let first = fx.raw(48);
        let second = fx.raw(48);
        let mut handle = TensorHandle::<f32>::new("A", 3, 4);
        // SAFETY: both buffers are fresh 48-byte allocations.
        unsafe {
            handle.attach(Some(first), Some(fx.deleter()), None).expect("aligned");
            handle.attach(Some(second), Some(fx.deleter()), None).expect("aligned");
        }
        assert_eq!(fx.recording.releases_of(Fixture::addr(first)), 1);
        assert_eq!(fx.recording.releases_of(Fixture::addr(second)), 0);

        drop(handle);
        assert_eq!(fx.recording.release_count(), 2);
        assert_eq!(fx.recording.outstanding(), 0);
    }

    #[test]
    fn identical_reattach_is_a_no_op() {
        let fx = Fixture::new();
        let ptr = fx.raw(48);
        let mut handle = TensorHandle::<f32>::new("A", 3, 4);
        let ctx = Some(DeleterContext(1));
        // SAFETY: fresh 48-byte allocation.
        unsafe {
            handle.attach(Some(ptr), Some(fx.deleter()), ctx).expect("aligned");
            handle.attach(Some(ptr), Some(fx.deleter()), ctx).expect("aligned");
        }
        assert_eq!(fx.recording.release_count(), 0);
        assert!(handle.is_owning());
        drop(handle);
        assert_eq!(fx.recording.release_count(), 1);
    }

    #[test]
    fn same_pointer_new_context_rebinds_without_freeing() {
        let fx = Fixture::new();
        let ptr = fx.raw(48);
        let mut handle = TensorHandle::<f32>::new("A", 3, 4);
        // SAFETY: fresh 48-byte allocation.
        unsafe {
            handle
                .attach(Some(ptr), Some(fx.deleter()), Some(DeleterContext(1)))
                .expect("aligned");
            handle
                .attach(Some(ptr), Some(fx.deleter()), Some(DeleterContext(2)))
                .expect("aligned");
        }
        assert_eq!(fx.recording.release_count(), 0);
        drop(handle);
        assert_eq!(
            fx.recording.releases(),
            vec![(Fixture::addr(ptr), Some(DeleterContext(2)))]
        );
    }

    #[test]
    fn rebind_swaps_context_and_can_drop_ownership() {
        let fx = Fixture::new();
        let mut handle = TensorHandle::<f32>::new("A", 3, 4);
        handle.allocate_on(&fx.backend).expect("host memory");
        let addr = handle.raw_ptr() as usize;

        handle
            .rebind(Some(fx.deleter()), Some(DeleterContext(7)))
            .expect("same owner");
        assert!(handle.is_owning());
        assert_eq!(handle.context(), Some(DeleterContext(7)));
        assert_eq!(fx.recording.release_count(), 0);

        handle.rebind(None, None).expect("dropping ownership");
        assert!(!handle.is_owning());
        assert_eq!(
            handle.rebind(Some(fx.deleter()), None),
            Err(TensorError::DeleterMismatch {
                name: "A".to_string()
            })
        );
        assert!(!handle.is_owning());
        assert_eq!(handle.raw_ptr() as usize, addr);
        let ptr = handle.release().expect("pointer kept");
        fx.free(ptr);
        assert_eq!(fx.recording.releases_of(addr), 1);
    }

    #[test]
    fn view_over_caller_memory_cannot_gain_a_deleter() {
        let fx = Fixture::new();
        let mut values = vec![1.0f32; 12];
        let ptr = NonNull::new(values.as_mut_ptr()).expect("heap address");
        let mut view = TensorHandle::<f32>::new("view", 3, 4);
        // SAFETY: `values` outlives the view and is only read through it.
        unsafe {
            view.attach(Some(ptr), None, None).expect("aligned");
        }

        let err = view
            .rebind(Some(fx.deleter()), Some(DeleterContext(1)))
            .expect_err("view is not owned");
        assert_eq!(
            err.to_string(),
            "tensor 'view' can only rebind its buffer to the deleter that owns it"
        );
        assert!(!view.is_owning());
        assert!(view.deleter().is_none());
        assert_eq!(view.context(), None);
        assert!(view.release_buffer().is_none());
        drop(view);

        assert_eq!(fx.recording.release_count(), 0);
        assert_eq!(values, vec![1.0f32; 12]);
    }

    /// Frees straight into the global allocator, so any second free or
    /// free of borrowed memory would abort the test process.
    struct SystemBackend {
        frees: AtomicUsize,
    }

    const SYSTEM_BLOCK: usize = 64;

    fn system_layout() -> Layout {
        Layout::from_size_align(SYSTEM_BLOCK, 16).expect("constant layout is valid")
    }

    unsafe impl Backend for SystemBackend {
        fn name(&self) -> &str {
            "test.system"
        }

        fn alignment(&self) -> usize {
            16
        }

        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::dense_all()
        }

        fn kernel_variants(&self) -> &[&'static str] {
            &[]
        }

        fn allocate(&self, nbytes: usize) -> Option<NonNull<u8>> {
            if nbytes > SYSTEM_BLOCK {
                return None;
            }
            // SAFETY: the layout has non-zero size.
            NonNull::new(unsafe { alloc_zeroed(system_layout()) })
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, _context: Option<DeleterContext>) {
            self.frees.fetch_add(1, Ordering::Relaxed);
            // SAFETY: the caller guarantees `ptr` came from `allocate` above.
            unsafe { dealloc(ptr.as_ptr(), system_layout()) };
        }

        fn gemv(&self, args: &mut GemvArgs<'_>) -> Result<KernelSelection, GemvError> {
            Err(Unsupported::Sparsity {
                precision: args.config.precision(),
                sparsity: args.config.sparsity(),
            }
            .into())
        }
    }

    #[test]
    fn unchecked_backend_frees_each_handle_buffer_once() {
        let system = Arc::new(SystemBackend {
            frees: AtomicUsize::new(0),
        });
        let backend: Arc<dyn Backend> = system.clone();
        let deleter = Deleter::new(Arc::clone(&backend));

        let mut owned = TensorHandle::<f32>::new("A", 4, 4);
        owned.allocate_on(&backend).expect("one block");
        owned
            .rebind(Some(deleter.clone()), Some(DeleterContext(1)))
            .expect("same owner");
        owned.reset();
        owned.reset();
        assert_eq!(system.frees.load(Ordering::Relaxed), 1);

        let mut values = vec![0.5f32; 4];
        let mut view = TensorHandle::<f32>::new("view", 2, 2);
        // SAFETY: `values` outlives the view.
        unsafe {
            view.attach(NonNull::new(values.as_mut_ptr()), None, None).expect("aligned");
        }
        assert!(view.rebind(Some(deleter), None).is_err());
        drop(view);
        drop(owned);

        assert_eq!(system.frees.load(Ordering::Relaxed), 1);
        assert_eq!(values, vec![0.5f32; 4]);
    }

    #[test]
    fn rebind_refuses_a_deleter_from_another_backend() {
        let fx = Fixture::new();
        let other = Fixture::new();
        let mut handle = TensorHandle::<f32>::new("A", 2, 2);
        handle.allocate_on(&fx.backend).expect("host memory");
        let context = handle.context();

        assert!(handle.rebind(Some(other.deleter()), None).is_err());
        assert!(handle.is_owning());
        assert_eq!(handle.deleter(), Some(&fx.deleter()));
        assert_eq!(handle.context(), context);

        drop(handle);
        assert_eq!(fx.recording.release_count(), 1);
        assert_eq!(other.recording.release_count(), 0);
    }

    #[test]
    fn empty_handle_rebinds_freely() {
        let fx = Fixture::new();
        let mut handle = TensorHandle::<f32>::new("A", 2, 2);
        handle.rebind(None, None).expect("nothing attached");
        handle
            .rebind(Some(fx.deleter()), Some(DeleterContext(3)))
            .expect("nothing attached");
        assert!(!handle.is_owning());
        drop(handle);
        assert_eq!(fx.recording.release_count(), 0);
    }

    #[test]
    fn release_buffer_returns_an_armed_buffer() {
        let fx = Fixture::new();
        let mut handle = TensorHandle::<f32>::new("A", 3, 4);
        handle.allocate_on(&fx.backend).expect("host memory");
        handle
            .rebind(Some(fx.deleter()), Some(DeleterContext(4)))
            .expect("same owner");
        let addr = handle.raw_ptr() as usize;

        let buffer = handle.release_buffer().expect("owned buffer");
        assert!(!handle.has_data());
        assert_eq!(buffer.len(), 48);
        assert_eq!(buffer.context(), Some(DeleterContext(4)));
        assert_eq!(fx.recording.release_count(), 0);

        drop(buffer);
        assert_eq!(fx.recording.releases(), vec![(addr, Some(DeleterContext(4)))]);
        assert_eq!(fx.recording.outstanding(), 0);
    }

    #[test]
    fn take_drains_the_source() {
        let fx = Fixture::new();
        let mut source = TensorHandle::<f32>::new("A", 3, 4);
        source.allocate_on(&fx.backend).expect("host memory");
        let addr = source.raw_ptr() as usize;

        let moved = std::mem::take(&mut source);
        assert_eq!(moved.name(), "A");
        assert_eq!(moved.raw_ptr() as usize, addr);
        assert!(moved.is_owning());
        assert!(source.data_ptr().is_null());
        assert!(!source.is_owning());
        assert_eq!(source.name(), "");

        drop(source);
        assert_eq!(fx.recording.release_count(), 0);
        drop(moved);
        assert_eq!(fx.recording.releases_of(addr), 1);
    }

    #[test]
    fn non_owning_attach_never_frees() {
        let fx = Fixture::new();
        let ptr = fx.raw(48);
        let mut handle = TensorHandle::<f32>::new("view", 3, 4);
        // SAFETY: fresh 48-byte allocation, freed below after the handle.
        unsafe {
            handle.attach(Some(ptr), None, Some(DeleterContext(5))).expect("aligned");
        }
        assert!(!handle.is_owning());
        assert_eq!(handle.as_slice().len(), 12);
        handle.reset();
        drop(handle);
        assert_eq!(fx.recording.release_count(), 0);
        fx.free(ptr);
    }

    #[test]
    fn misaligned_pointer_is_rejected_and_handle_unchanged() {
        let fx = Fixture::new();
        let base = fx.raw(64);
        let skewed = NonNull::new(base.as_ptr().cast::<u8>().wrapping_add(1))
            .expect("non-null")
            .cast::<f32>();
        let mut handle = TensorHandle::<f32>::new("A", 3, 4);
        // SAFETY: the call fails before the pointer is stored.
        let err = unsafe { handle.attach(Some(skewed), Some(fx.deleter()), None) }
            .expect_err("misaligned");
        assert_eq!(
            err,
            TensorError::Misaligned {
                addr: skewed.as_ptr() as usize,
                align: 4
            }
        );
        assert!(handle.data_ptr().is_null());
        drop(handle);
        assert_eq!(fx.recording.release_count(), 0);
        fx.free(base);
    }

    #[test]
    fn allocate_on_gives_zeroed_writable_storage() {
        let fx = Fixture::new();
        let mut handle = TensorHandle::<f32>::new("A", 3, 4);
        handle.allocate_on(&fx.backend).expect("host memory");
        assert!(handle.is_owning());
        assert_eq!(handle.raw_ptr() as usize % fx.backend.alignment(), 0);
        assert!(handle.as_slice().iter().all(|v| *v == 0.0));

        let values: Vec<f32> = (0..12u8).map(f32::from).collect();
        handle.copy_from_slice(&values).expect("matching length");
        assert_eq!(handle.as_slice(), values.as_slice());
        let arg = handle.as_arg().expect("attached");
        assert_eq!(arg.shape(), [3, 4]);
        assert_eq!(arg.stride(), [16, 4]);
        assert_eq!(arg.dtype(), DType::F32);

        drop(handle);
        assert_eq!(fx.recording.release_count(), 1);
        assert_eq!(fx.host.allocator().live_allocations(), 0);
    }

    #[test]
    fn undersized_buffer_is_refused_and_freed() {
        let fx = Fixture::new();
        let buffer = BackendBuffer::allocate(&fx.backend, 16).expect("host memory");
        let mut handle = TensorHandle::<f32>::new("A", 3, 4);
        let err = handle.attach_buffer(buffer).expect_err("16 < 48");
        assert_eq!(
            err,
            TensorError::BufferTooSmall {
                needed: 48,
                available: 16
            }
        );
        assert_eq!(fx.recording.release_count(), 1);
        assert!(!handle.has_data());
    }

    #[test]
    fn reset_is_idempotent() {
        let fx = Fixture::new();
        let mut handle = TensorHandle::<f32>::new("A", 2, 2);
        handle.allocate_on(&fx.backend).expect("host memory");
        handle.reset();
        handle.reset();
        drop(handle);
        assert_eq!(fx.recording.release_count(), 1);
    }

    #[test]
    fn copy_requires_storage_and_matching_length() {
        let fx = Fixture::new();
        let mut handle = TensorHandle::<f32>::new("A", 2, 2);
        assert_eq!(
            handle.copy_from_slice(&[1.0; 4]),
            Err(TensorError::NoData {
                name: "A".to_string()
            })
        );
        handle.allocate_on(&fx.backend).expect("host memory");
        assert_eq!(
            handle.copy_from_slice(&[1.0; 3]),
            Err(TensorError::LengthMismatch {
                expected: 4,
                actual: 3
            })
        );
        let mut arg = handle.as_arg_mut().expect("attached");
        assert_eq!(arg.len(), 4);
        assert!(!arg.data_mut().is_empty());
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        AttachFresh,
        AttachSame,
        Rebind,
        Release,
        Reset,
        Take,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::AttachFresh),
            Just(Op::AttachSame),
            Just(Op::Rebind),
            Just(Op::Release),
            Just(Op::Reset),
            Just(Op::Take),
        ]
    }

    proptest! {
        #[test]
        fn prop_every_buffer_is_freed_exactly_once(ops in prop::collection::vec(op_strategy(), 0..16)) {
            let fx = Fixture::new();
            let mut handle = TensorHandle::<f32>::new("A", 2, 3);
            let mut drained = Vec::new();

            for op in ops {
                match op {
                    Op::AttachFresh => {
                        let ptr = fx.raw(handle.nbytes().max(24));
                        // SAFETY: fresh allocation of at least 24 bytes.
                        unsafe {
                            handle.attach(Some(ptr), Some(fx.deleter()), None).expect("aligned");
                        }
                    }
                    Op::AttachSame => {
                        let (data, deleter, context) =
                            (handle.data(), handle.deleter().cloned(), handle.context());
                        // SAFETY: re-attaching what the handle already holds.
                        unsafe {
                            handle.attach(data, deleter, context).expect("aligned");
                        }
                    }
                    Op::Rebind => {
                        let data = handle.data();
                        let deleter = data.map(|_| fx.deleter());
                        handle
                            .rebind(deleter, Some(DeleterContext(42)))
                            .expect("attached buffers are owned by the fixture");
                    }
                    Op::Release => drop(handle.release_buffer()),
                    Op::Reset => handle.reset(),
                    Op::Take => drained.push(std::mem::take(&mut handle)),
                }
            }
            drop(handle);
            drop(drained);

            prop_assert_eq!(fx.recording.release_count(), fx.recording.allocations().len());
            prop_assert_eq!(fx.recording.outstanding(), 0);
            prop_assert_eq!(fx.recording.unmatched_releases(), 0);
            prop_assert_eq!(fx.host.allocator().live_allocations(), 0);
            prop_assert_eq!(
                fx.host.allocator().free_count(),
                fx.host.allocator().allocation_count()
            );
        }
    }
}
