//! Host-memory backends over the software GEMV kernels.

mod allocator;
mod recording;

use std::ptr::NonNull;

use gap_backend::{Backend, CapabilitySet, DeleterContext, KernelSelection};
use gap_core::{ExecutionMode, GemvArgs, GemvError, OperationConfig, Sparsity, Unsupported};
use gap_kernel_cpu::{GemvVariant, plan_gemv, run_gemv};
use tracing::{debug, warn};

pub use allocator::{HostAllocator, MIN_ALIGNMENT};
pub use recording::RecordingBackend;

pub const REFERENCE_BACKEND_NAME: &str = "cpu.reference";
pub const TILED_BACKEND_NAME: &str = "cpu.tiled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuBackendConfig {
    pub mode: ExecutionMode,
    pub alignment: usize,
    /// Rows sharing one pass over `x` in the tiled kernel.
    pub row_block: usize,
    pub max_allocation_bytes: Option<usize>,
}

impl Default for CpuBackendConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Strict,
            alignment: 64,
            row_block: 4,
            max_allocation_bytes: None,
        }
    }
}

impl CpuBackendConfig {
    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }
}

/// `"{backend}::gemv.{precision}.{math}.{sparsity}.{variant}"`, where the
/// sparsity is the layout the chosen kernel actually exploits.
#[must_use]
pub fn kernel_name(backend: &str, config: &OperationConfig, variant: GemvVariant) -> String {
    let sparsity = match variant {
        GemvVariant::Sparse2of4 => Sparsity::Block2of4,
        GemvVariant::Naive | GemvVariant::Tiled { .. } => Sparsity::Dense,
    };
    format!(
        "{backend}::gemv.{}.{}.{}.{}",
        config.precision().label(),
        config.math().label(),
        sparsity.label(),
        variant.label()
    )
}

/// Plans, picks a variant, runs, and names the kernel.
fn execute(
    backend: &str,
    args: &mut GemvArgs<'_>,
    select: impl FnOnce(&OperationConfig) -> Result<(GemvVariant, bool), GemvError>,
) -> Result<KernelSelection, GemvError> {
    let config = args.config.clone();
    let plan = plan_gemv(&config, args.a.dtype(), args.x.dtype(), args.y.dtype())?;
    let (variant, fallback_used) = select(&config)?;
    run_gemv(plan, variant, args)?;
    let kernel = kernel_name(backend, &config, variant);
    debug!(backend, kernel = %kernel, fallback_used, "gemv complete");
    Ok(KernelSelection {
        kernel,
        fallback_used,
    })
}

/// Hardened mode swaps an unsupported 2:4 request for `dense`; strict mode
/// refuses it.
fn sparsity_fallback(
    backend: &str,
    mode: ExecutionMode,
    capabilities: CapabilitySet,
    config: &OperationConfig,
    dense: GemvVariant,
) -> Result<(GemvVariant, bool), GemvError> {
    match mode {
        ExecutionMode::Hardened
            if capabilities.supports(config.precision(), Sparsity::Dense) =>
        {
            warn!(
                backend,
                config = %config,
                fallback = dense.label(),
                "structured sparsity unavailable; using dense kernel"
            );
            Ok((dense, true))
        }
        ExecutionMode::Strict | ExecutionMode::Hardened => Err(Unsupported::Sparsity {
            precision: config.precision(),
            sparsity: config.sparsity(),
        }
        .into()),
    }
}

fn unknown_hint(hint: &str) -> GemvError {
    Unsupported::KernelHint {
        hint: hint.to_string(),
    }
    .into()
}

/// Dense naive kernels for every precision.
#[derive(Debug)]
pub struct ReferenceBackend {
    config: CpuBackendConfig,
    allocator: HostAllocator,
}

impl ReferenceBackend {
    #[must_use]
    pub fn new(config: CpuBackendConfig) -> Self {
        Self {
            allocator: HostAllocator::new(config.alignment, config.max_allocation_bytes),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &CpuBackendConfig {
        &self.config
    }

    #[must_use]
    pub fn allocator(&self) -> &HostAllocator {
        &self.allocator
    }

    fn select(&self, config: &OperationConfig) -> Result<(GemvVariant, bool), GemvError> {
        if let Some(hint) = config.kernel_hint().filter(|hint| *hint != "naive") {
            return Err(unknown_hint(hint));
        }
        if self
            .capabilities()
            .supports(config.precision(), config.sparsity())
        {
            return Ok((GemvVariant::Naive, false));
        }
        sparsity_fallback(
            REFERENCE_BACKEND_NAME,
            self.config.mode,
            self.capabilities(),
            config,
            GemvVariant::Naive,
        )
    }
}

impl Default for ReferenceBackend {
    fn default() -> Self {
        Self::new(CpuBackendConfig::default())
    }
}

// SAFETY: buffers come from `HostAllocator`, which returns zeroed blocks of
// at least the requested size aligned to `alignment()` and frees only
// pointers in its live table.
unsafe impl Backend for ReferenceBackend {
    fn name(&self) -> &str {
        REFERENCE_BACKEND_NAME
    }

    fn alignment(&self) -> usize {
        self.allocator.alignment()
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::dense_all()
    }

    fn kernel_variants(&self) -> &[&'static str] {
        &["naive"]
    }

    fn allocate(&self, nbytes: usize) -> Option<NonNull<u8>> {
        self.allocator.allocate(REFERENCE_BACKEND_NAME, nbytes)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _context: Option<DeleterContext>) {
        self.allocator.deallocate(REFERENCE_BACKEND_NAME, ptr);
    }

    fn gemv(&self, args: &mut GemvArgs<'_>) -> Result<KernelSelection, GemvError> {
        execute(REFERENCE_BACKEND_NAME, args, |config| self.select(config))
    }
}

/// Row-tiled dense kernels plus 2:4 structured-sparse kernels for the
/// floating point precisions.
#[derive(Debug)]
pub struct TiledBackend {
    config: CpuBackendConfig,
    allocator: HostAllocator,
    capabilities: CapabilitySet,
}

impl TiledBackend {
    #[must_use]
    pub fn new(config: CpuBackendConfig) -> Self {
        let mut capabilities = CapabilitySet::dense_all();
        for precision in gap_core::Precision::all() {
            if precision.is_float() {
                capabilities.add(*precision, Sparsity::Block2of4);
            }
        }
        Self {
            allocator: HostAllocator::new(config.alignment, config.max_allocation_bytes),
            config,
            capabilities,
        }
    }

    #[must_use]
    pub fn config(&self) -> &CpuBackendConfig {
        &self.config
    }

    #[must_use]
    pub fn allocator(&self) -> &HostAllocator {
        &self.allocator
    }

    fn select(&self, config: &OperationConfig) -> Result<(GemvVariant, bool), GemvError> {
        let tiled = GemvVariant::Tiled {
            row_block: self.config.row_block,
        };
        let sparse = config.sparsity() == Sparsity::Block2of4;
        let dense = match config.kernel_hint() {
            None | Some("tiled") => tiled,
            Some("naive") => GemvVariant::Naive,
            Some("sparse24") if sparse => GemvVariant::Sparse2of4,
            Some(other) => return Err(unknown_hint(other)),
        };
        if !sparse {
            return Ok((dense, false));
        }
        if self.capabilities.supports(config.precision(), config.sparsity()) {
            // An explicit dense hint on 2:4 data is honoured; the result is the same.
            let variant = match config.kernel_hint() {
                None => GemvVariant::Sparse2of4,
                Some(_) => dense,
            };
            return Ok((variant, false));
        }
        let dense = match dense {
            GemvVariant::Sparse2of4 => tiled,
            other => other,
        };
        sparsity_fallback(
            TILED_BACKEND_NAME,
            self.config.mode,
            self.capabilities,
            config,
            dense,
        )
    }
}

impl Default for TiledBackend {
    fn default() -> Self {
        Self::new(CpuBackendConfig::default())
    }
}

// SAFETY: same allocator contract as `ReferenceBackend`.
unsafe impl Backend for TiledBackend {
    fn name(&self) -> &str {
        TILED_BACKEND_NAME
    }

    fn alignment(&self) -> usize {
        self.allocator.alignment()
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    fn kernel_variants(&self) -> &[&'static str] {
        &["tiled", "naive", "sparse24"]
    }

    fn allocate(&self, nbytes: usize) -> Option<NonNull<u8>> {
        self.allocator.allocate(TILED_BACKEND_NAME, nbytes)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _context: Option<DeleterContext>) {
        self.allocator.deallocate(TILED_BACKEND_NAME, ptr);
    }

    fn gemv(&self, args: &mut GemvArgs<'_>) -> Result<KernelSelection, GemvError> {
        execute(TILED_BACKEND_NAME, args, |config| self.select(config))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gap_backend::{Backend, BackendBuffer, Deleter, DeleterContext};
    use gap_core::{
        ExecutionMode, GemvArgs, GemvError, MathPath, OperationConfig, Precision, Sparsity,
        TensorArg, TensorArgMut, Unsupported,
    };
    use half::f16;
    use proptest::prelude::*;

    use super::{
        CpuBackendConfig, RecordingBackend, ReferenceBackend, TILED_BACKEND_NAME, TiledBackend,
        kernel_name,
    };
    use gap_kernel_cpu::GemvVariant;

    fn hardened() -> CpuBackendConfig {
        CpuBackendConfig::default().with_mode(ExecutionMode::Hardened)
    }

    fn run_f32(
        backend: &dyn Backend,
        config: OperationConfig,
        a: &[f32],
        rows: usize,
        cols: usize,
        x: &[f32],
    ) -> Result<(Vec<f32>, gap_backend::KernelSelection), GemvError> {
        let mut y = vec![0.0f32; rows];
        let mut args = GemvArgs::new(
            TensorArg::from_slice(a, [rows, cols]),
            TensorArg::from_slice(x, [cols, 1]),
            TensorArgMut::from_slice(&mut y, [rows, 1]),
            config,
        );
        let selection = backend.gemv(&mut args)?;
        Ok((y, selection))
    }

    const SPARSE_A: [f32; 8] = [1.0, 0.0, 2.0, 0.0, 0.0, 3.0, 0.0, 4.0];
    const SPARSE_X: [f32; 4] = [1.0, 10.0, 100.0, 1000.0];

    #[test]
    fn allocate_48_bytes_is_aligned_and_freed_once() {
        let recording = Arc::new(RecordingBackend::new(Arc::new(ReferenceBackend::default())));
        let backend: Arc<dyn Backend> = recording.clone();

        let ptr = backend.allocate(48).expect("host memory");
        assert_eq!(ptr.as_ptr() as usize % 4, 0);
        assert_eq!(ptr.as_ptr() as usize % backend.alignment(), 0);

        let deleter = Deleter::new(Arc::clone(&backend));
        // SAFETY: `ptr` was allocated by this backend just above.
        unsafe { deleter.release(ptr, Some(DeleterContext(3))) };
        assert_eq!(
            recording.releases(),
            vec![(ptr.as_ptr() as usize, Some(DeleterContext(3)))]
        );
        assert_eq!(recording.outstanding(), 0);
    }

    #[test]
    fn zero_byte_allocation_is_distinct_and_freeable() {
        let backend = ReferenceBackend::default();
        let first = backend.allocate(0).expect("one byte block");
        let second = backend.allocate(0).expect("one byte block");
        assert_ne!(first, second);
        // SAFETY: both blocks are live allocations of this backend.
        unsafe {
            backend.deallocate(first, None);
            backend.deallocate(second, None);
        }
        assert_eq!(backend.allocator().live_allocations(), 0);
    }

    #[test]
    fn allocation_cap_yields_none() {
        let backend = TiledBackend::new(CpuBackendConfig {
            max_allocation_bytes: Some(64),
            ..CpuBackendConfig::default()
        });
        assert!(backend.allocate(65).is_none());

        let shared: Arc<dyn Backend> = Arc::new(backend);
        let err = BackendBuffer::allocate(&shared, 1024).expect_err("over cap");
        assert_eq!(err.backend, "cpu.tiled");
    }

    #[test]
    fn foreign_deallocation_is_ignored() {
        let backend = TiledBackend::default();
        let mut local = vec![0u8; 16];
        let foreign = std::ptr::NonNull::new(local.as_mut_ptr()).expect("heap address");
        // The host allocator checks its live table, so a foreign pointer is
        // dropped with a warning instead of reaching `dealloc`.
        assert!(!backend.allocator().deallocate(TILED_BACKEND_NAME, foreign));
        assert_eq!(backend.allocator().free_count(), 0);
        assert_eq!(local.len(), 16);
    }

    #[test]
    fn reference_dense_f32_names_naive_kernel() {
        let backend = ReferenceBackend::default();
        let (y, selection) = run_f32(
            &backend,
            OperationConfig::dense(Precision::F32),
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            2,
            3,
            &[1.0, 1.0, 1.0],
        )
        .expect("dense f32 is supported");
        assert_eq!(y, vec![6.0, 15.0]);
        assert_eq!(selection.kernel, "cpu.reference::gemv.f32.full.dense.naive");
        assert!(!selection.fallback_used);
    }

    #[test]
    fn reference_strict_rejects_structured_sparsity() {
        let backend = ReferenceBackend::default();
        let err = run_f32(
            &backend,
            OperationConfig::dense(Precision::F32).with_sparsity(Sparsity::Block2of4),
            &SPARSE_A,
            2,
            4,
            &SPARSE_X,
        )
        .expect_err("reference has no 2:4 kernels");
        assert_eq!(
            err,
            GemvError::Unsupported(Unsupported::Sparsity {
                precision: Precision::F32,
                sparsity: Sparsity::Block2of4
            })
        );
    }

    #[test]
    fn reference_hardened_falls_back_to_dense() {
        let backend = ReferenceBackend::new(hardened());
        let (y, selection) = run_f32(
            &backend,
            OperationConfig::dense(Precision::F32).with_sparsity(Sparsity::Block2of4),
            &SPARSE_A,
            2,
            4,
            &SPARSE_X,
        )
        .expect("hardened falls back");
        assert_eq!(y, vec![201.0, 4030.0]);
        assert!(selection.fallback_used);
        assert!(selection.kernel.ends_with("dense.naive"));
    }

    #[test]
    fn tiled_picks_sparse_kernel_for_float_two_of_four() {
        let backend = TiledBackend::default();
        let (y, selection) = run_f32(
            &backend,
            OperationConfig::dense(Precision::F32).with_sparsity(Sparsity::Block2of4),
            &SPARSE_A,
            2,
            4,
            &SPARSE_X,
        )
        .expect("tiled supports 2:4 f32");
        assert_eq!(y, vec![201.0, 4030.0]);
        assert_eq!(
            selection.kernel,
            "cpu.tiled::gemv.f32.full.block2of4.sparse24"
        );
    }

    #[test]
    fn tiled_reports_sparsity_violations() {
        let backend = TiledBackend::default();
        let err = run_f32(
            &backend,
            OperationConfig::dense(Precision::F32).with_sparsity(Sparsity::Block2of4),
            &[1.0, 1.0, 1.0, 0.0],
            1,
            4,
            &[1.0; 4],
        )
        .expect_err("three non-zeros in one group");
        assert_eq!(
            err,
            GemvError::SparsityPattern {
                row: 0,
                group: 0,
                nonzeros: 3
            }
        );
    }

    #[test]
    fn tiled_integer_two_of_four_depends_on_mode() {
        let config = OperationConfig::dense(Precision::I32).with_sparsity(Sparsity::Block2of4);
        let a = [1i32, 0, 2, 0];
        let x = [3i32, 4, 5, 6];

        for (mode, expect_ok) in [
            (ExecutionMode::Strict, false),
            (ExecutionMode::Hardened, true),
        ] {
            let backend = TiledBackend::new(CpuBackendConfig::default().with_mode(mode));
            let mut y = [0i32; 1];
            let mut args = GemvArgs::new(
                TensorArg::from_slice(&a, [1, 4]),
                TensorArg::from_slice(&x, [4, 1]),
                TensorArgMut::from_slice(&mut y, [1, 1]),
                config.clone(),
            );
            let outcome = backend.gemv(&mut args);
            assert_eq!(outcome.is_ok(), expect_ok, "mode={mode:?}");
            if let Ok(selection) = outcome {
                assert!(selection.fallback_used);
                assert_eq!(selection.kernel, "cpu.tiled::gemv.i32.full.dense.tiled");
                assert_eq!(y, [13]);
            }
        }
    }

    #[test]
    fn kernel_hints_select_or_reject_variants() {
        let backend = TiledBackend::default();
        let a = [1.0f32, 2.0, 3.0, 4.0];
        let x = [1.0f32, 1.0];

        let (_, naive) = run_f32(
            &backend,
            OperationConfig::dense(Precision::F32).with_kernel_hint("naive"),
            &a,
            2,
            2,
            &x,
        )
        .expect("naive hint");
        assert!(naive.kernel.ends_with(".naive"));

        let err = run_f32(
            &backend,
            OperationConfig::dense(Precision::F32).with_kernel_hint("winograd"),
            &a,
            2,
            2,
            &x,
        )
        .expect_err("unknown hint");
        assert_eq!(
            err,
            GemvError::Unsupported(Unsupported::KernelHint {
                hint: "winograd".to_string()
            })
        );

        let err = run_f32(
            &ReferenceBackend::default(),
            OperationConfig::dense(Precision::F32).with_kernel_hint("tiled"),
            &a,
            2,
            2,
            &x,
        )
        .expect_err("reference has no tiled kernel");
        assert!(err.is_unsupported());
    }

    #[test]
    fn f16_mixed_accumulate_through_tiled_backend() {
        let backend = TiledBackend::default();
        let a: Vec<f16> = [1.0, 2.0, 3.0, 4.0].map(f16::from_f32).to_vec();
        let x: Vec<f16> = [1.0, 1.0].map(f16::from_f32).to_vec();
        let mut y = [0.0f32; 2];
        let mut args = GemvArgs::new(
            TensorArg::from_slice(&a, [2, 2]),
            TensorArg::from_slice(&x, [2, 1]),
            TensorArgMut::from_slice(&mut y, [2, 1]),
            OperationConfig::dense(Precision::F16).with_math(MathPath::MixedAccumulate),
        );
        let selection = backend.gemv(&mut args).expect("mixed f16 is supported");
        assert_eq!(y, [3.0, 7.0]);
        assert_eq!(
            selection.kernel,
            kernel_name(
                "cpu.tiled",
                &OperationConfig::dense(Precision::F16).with_math(MathPath::MixedAccumulate),
                GemvVariant::Tiled { row_block: 4 }
            )
        );
    }

    #[test]
    fn recording_backend_logs_kernels() {
        let recording = RecordingBackend::new(Arc::new(TiledBackend::default()));
        run_f32(
            &recording,
            OperationConfig::dense(Precision::Tf32),
            &[1.0, 2.0],
            1,
            2,
            &[1.0, 1.0],
        )
        .expect("tf32 is supported");
        assert_eq!(
            recording.kernels(),
            vec!["cpu.tiled::gemv.tf32.full.dense.tiled".to_string()]
        );
        assert_eq!(recording.name(), "cpu.tiled");
    }

    #[test]
    fn concurrent_allocations_are_tracked() {
        let backend = Arc::new(TiledBackend::default());
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let backend = Arc::clone(&backend);
                scope.spawn(move || {
                    for size in 1..=16usize {
                        let ptr = backend.allocate(size * 8).expect("host memory");
                        // SAFETY: freshly allocated by this backend.
                        unsafe { backend.deallocate(ptr, None) };
                    }
                });
            }
        });
        assert_eq!(backend.allocator().allocation_count(), 64);
        assert_eq!(backend.allocator().free_count(), 64);
        assert_eq!(backend.allocator().live_allocations(), 0);
    }

    proptest! {
        #[test]
        fn prop_backends_agree_on_dense_f32(
            rows in 1usize..=8,
            cols in 1usize..=10,
            values in prop::collection::vec(-4i8..=4, 1..=20),
        ) {
            let a: Vec<f32> = (0..rows * cols).map(|i| f32::from(values[i % values.len()])).collect();
            let x: Vec<f32> = (0..cols).map(|i| f32::from(values[(i * 3) % values.len()])).collect();
            let config = OperationConfig::dense(Precision::F32);

            let (reference, _) = run_f32(&ReferenceBackend::default(), config.clone(), &a, rows, cols, &x)
                .expect("reference");
            let (tiled, _) = run_f32(&TiledBackend::default(), config, &a, rows, cols, &x)
                .expect("tiled");
            prop_assert_eq!(reference, tiled);
        }
    }
}
