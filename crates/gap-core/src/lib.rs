#![forbid(unsafe_code)]

use std::fmt;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// Storage representation of a buffer element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    #[serde(rename = "f32")]
    F32,
    #[serde(rename = "f16")]
    F16,
    #[serde(rename = "bf16")]
    BF16,
    #[serde(rename = "i8")]
    I8,
    #[serde(rename = "i32")]
    I32,
}

impl DType {
    #[must_use]
    pub const fn all() -> &'static [DType] {
        &[DType::F32, DType::F16, DType::BF16, DType::I8, DType::I32]
    }

    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::I8 => 1,
        }
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F16 | Self::BF16)
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::I8 => "i8",
            Self::I32 => "i32",
        }
    }
}

/// Arithmetic representation requested for a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "f32")]
    F32,
    /// f32 storage, 10-bit mantissa compute.
    #[serde(rename = "tf32")]
    Tf32,
    #[serde(rename = "f16")]
    F16,
    #[serde(rename = "bf16")]
    Bf16,
    #[serde(rename = "i8")]
    I8,
    #[serde(rename = "i32")]
    I32,
}

impl Precision {
    #[must_use]
    pub const fn all() -> &'static [Precision] {
        &[
            Precision::F32,
            Precision::Tf32,
            Precision::F16,
            Precision::Bf16,
            Precision::I8,
            Precision::I32,
        ]
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        match self {
            Self::F32 => 0,
            Self::Tf32 => 1,
            Self::F16 => 2,
            Self::Bf16 => 3,
            Self::I8 => 4,
            Self::I32 => 5,
        }
    }

    /// Element type a buffer must have to be computed in this precision.
    #[must_use]
    pub const fn storage_dtype(self) -> DType {
        match self {
            Self::F32 | Self::Tf32 => DType::F32,
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
            Self::I8 => DType::I8,
            Self::I32 => DType::I32,
        }
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        self.storage_dtype().is_float()
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::Tf32 => "tf32",
            Self::F16 => "f16",
            Self::Bf16 => "bf16",
            Self::I8 => "i8",
            Self::I32 => "i32",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MathPath {
    /// Compute and accumulate in the requested representation.
    #[default]
    Full,
    /// Compute in the requested representation, accumulate wider.
    MixedAccumulate,
}

impl MathPath {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::MixedAccumulate => "mixed_acc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sparsity {
    #[default]
    Dense,
    /// At most two non-zeros in every group of four consecutive row elements.
    #[serde(rename = "block2of4")]
    Block2of4,
}

impl Sparsity {
    #[must_use]
    pub const fn all() -> &'static [Sparsity] {
        &[Sparsity::Dense, Sparsity::Block2of4]
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        match self {
            Self::Dense => 0,
            Self::Block2of4 => 1,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Dense => "dense",
            Self::Block2of4 => "block2of4",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Strict,
    Hardened,
}

impl ExecutionMode {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Hardened => "hardened",
        }
    }
}

/// Operation policy handed to a backend alongside the call arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationConfig {
    precision: Precision,
    #[serde(default)]
    math: MathPath,
    #[serde(default)]
    sparsity: Sparsity,
    #[serde(default)]
    kernel_hint: Option<String>,
}

impl OperationConfig {
    #[must_use]
    pub fn new(precision: Precision, math: MathPath, sparsity: Sparsity) -> Self {
        Self {
            precision,
            math,
            sparsity,
            kernel_hint: None,
        }
    }

    #[must_use]
    pub fn dense(precision: Precision) -> Self {
        Self::new(precision, MathPath::Full, Sparsity::Dense)
    }

    #[must_use]
    pub fn with_kernel_hint(mut self, hint: impl Into<String>) -> Self {
        self.kernel_hint = Some(hint.into());
        self
    }

    #[must_use]
    pub fn with_sparsity(mut self, sparsity: Sparsity) -> Self {
        self.sparsity = sparsity;
        self
    }

    #[must_use]
    pub fn with_math(mut self, math: MathPath) -> Self {
        self.math = math;
        self
    }

    #[must_use]
    pub fn precision(&self) -> Precision {
        self.precision
    }

    #[must_use]
    pub fn math(&self) -> MathPath {
        self.math
    }

    #[must_use]
    pub fn sparsity(&self) -> Sparsity {
        self.sparsity
    }

    #[must_use]
    pub fn kernel_hint(&self) -> Option<&str> {
        self.kernel_hint.as_deref()
    }
}

impl fmt::Display for OperationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.precision.label(),
            self.math.label(),
            self.sparsity.label()
        )?;
        if let Some(hint) = &self.kernel_hint {
            write!(f, "[{hint}]")?;
        }
        Ok(())
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Element types a tensor handle can hold.
///
/// Sealed: the kernels route on [`ElementSlice`] variants, so the set of
/// implementors is closed.
pub trait Element:
    sealed::Sealed + Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static
{
    const DTYPE: DType;
    const SIZE: usize = std::mem::size_of::<Self>();
    const ALIGN: usize = std::mem::align_of::<Self>();

    /// Diagnostic identifier of the representation. Not a wire name.
    #[must_use]
    fn type_name() -> &'static str {
        Self::DTYPE.label()
    }

    fn wrap(data: &[Self]) -> ElementSlice<'_>;

    fn wrap_mut(data: &mut [Self]) -> ElementSliceMut<'_>;

    /// Lossy conversion used by fixtures and tests.
    fn from_f64(value: f64) -> Self;

    fn to_f64(self) -> f64;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:ident, $variant:ident, |$from:ident| $from_body:expr, |$to:ident| $to_body:expr) => {
        impl sealed::Sealed for $ty {}

        impl Element for $ty {
            const DTYPE: DType = DType::$dtype;

            fn wrap(data: &[Self]) -> ElementSlice<'_> {
                ElementSlice::$variant(data)
            }

            fn wrap_mut(data: &mut [Self]) -> ElementSliceMut<'_> {
                ElementSliceMut::$variant(data)
            }

            #[allow(clippy::cast_possible_truncation)]
            fn from_f64($from: f64) -> Self {
                $from_body
            }

            fn to_f64(self) -> f64 {
                let $to = self;
                $to_body
            }
        }
    };
}

impl_element!(f32, F32, F32, |v| v as f32, |v| f64::from(v));
impl_element!(f16, F16, F16, |v| f16::from_f64(v), |v| v.to_f64());
impl_element!(bf16, BF16, BF16, |v| bf16::from_f64(v), |v| v.to_f64());
impl_element!(i8, I8, I8, |v| v.round() as i8, |v| f64::from(v));
impl_element!(i32, I32, I32, |v| v.round() as i32, |v| f64::from(v));

/// Borrowed element data tagged with its representation.
#[derive(Debug, Clone, Copy)]
pub enum ElementSlice<'a> {
    F32(&'a [f32]),
    F16(&'a [f16]),
    BF16(&'a [bf16]),
    I8(&'a [i8]),
    I32(&'a [i32]),
}

impl ElementSlice<'_> {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::F16(_) => DType::F16,
            Self::BF16(_) => DType::BF16,
            Self::I8(_) => DType::I8,
            Self::I32(_) => DType::I32,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F32(data) => data.len(),
            Self::F16(data) => data.len(),
            Self::BF16(data) => data.len(),
            Self::I8(data) => data.len(),
            Self::I32(data) => data.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub enum ElementSliceMut<'a> {
    F32(&'a mut [f32]),
    F16(&'a mut [f16]),
    BF16(&'a mut [bf16]),
    I8(&'a mut [i8]),
    I32(&'a mut [i32]),
}

impl ElementSliceMut<'_> {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::F16(_) => DType::F16,
            Self::BF16(_) => DType::BF16,
            Self::I8(_) => DType::I8,
            Self::I32(_) => DType::I32,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F32(data) => data.len(),
            Self::F16(data) => data.len(),
            Self::BF16(data) => data.len(),
            Self::I8(data) => data.len(),
            Self::I32(data) => data.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Row-major dense byte strides: the innermost stride is the element size
/// and every outer stride is the next extent times the next stride.
#[must_use]
pub fn dense_byte_strides<const N: usize>(shape: [usize; N], element_size: usize) -> [usize; N] {
    let mut strides = [0usize; N];
    let mut running = element_size;
    for idx in (0..N).rev() {
        strides[idx] = running;
        running = running.saturating_mul(shape[idx]);
    }
    strides
}

/// One read-only operand of a call: data, shape and byte strides.
#[derive(Debug, Clone, Copy)]
pub struct TensorArg<'a> {
    data: ElementSlice<'a>,
    shape: [usize; 2],
    stride: [usize; 2],
}

impl<'a> TensorArg<'a> {
    #[must_use]
    pub fn new(data: ElementSlice<'a>, shape: [usize; 2], stride: [usize; 2]) -> Self {
        Self {
            data,
            shape,
            stride,
        }
    }

    #[must_use]
    pub fn dense(data: ElementSlice<'a>, shape: [usize; 2]) -> Self {
        let stride = dense_byte_strides(shape, data.dtype().size_in_bytes());
        Self::new(data, shape, stride)
    }

    #[must_use]
    pub fn from_slice<T: Element>(data: &'a [T], shape: [usize; 2]) -> Self {
        Self::dense(T::wrap(data), shape)
    }

    #[must_use]
    pub fn data(&self) -> ElementSlice<'a> {
        self.data
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    #[must_use]
    pub fn shape(&self) -> [usize; 2] {
        self.shape
    }

    #[must_use]
    pub fn stride(&self) -> [usize; 2] {
        self.stride
    }
}

/// The written operand of a call.
#[derive(Debug)]
pub struct TensorArgMut<'a> {
    data: ElementSliceMut<'a>,
    shape: [usize; 2],
    stride: [usize; 2],
}

impl<'a> TensorArgMut<'a> {
    #[must_use]
    pub fn new(data: ElementSliceMut<'a>, shape: [usize; 2], stride: [usize; 2]) -> Self {
        Self {
            data,
            shape,
            stride,
        }
    }

    #[must_use]
    pub fn dense(data: ElementSliceMut<'a>, shape: [usize; 2]) -> Self {
        let stride = dense_byte_strides(shape, data.dtype().size_in_bytes());
        Self::new(data, shape, stride)
    }

    #[must_use]
    pub fn from_slice<T: Element>(data: &'a mut [T], shape: [usize; 2]) -> Self {
        Self::dense(T::wrap_mut(data), shape)
    }

    pub fn data_mut(&mut self) -> &mut ElementSliceMut<'a> {
        &mut self.data
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn shape(&self) -> [usize; 2] {
        self.shape
    }

    #[must_use]
    pub fn stride(&self) -> [usize; 2] {
        self.stride
    }
}

/// Type-erased argument bundle for `y = A * x`.
///
/// `a` is `[rows, cols]`, `x` is `[cols, 1]` and `y` is `[rows, 1]`. The
/// bundle borrows every buffer and cannot outlive them.
#[derive(Debug)]
pub struct GemvArgs<'a> {
    pub a: TensorArg<'a>,
    pub x: TensorArg<'a>,
    pub y: TensorArgMut<'a>,
    pub config: OperationConfig,
}

impl<'a> GemvArgs<'a> {
    #[must_use]
    pub fn new(
        a: TensorArg<'a>,
        x: TensorArg<'a>,
        y: TensorArgMut<'a>,
        config: OperationConfig,
    ) -> Self {
        Self { a, x, y, config }
    }
}

/// Why a backend declined a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unsupported {
    Precision { precision: Precision, dtype: DType },
    MathPath { precision: Precision, math: MathPath },
    Sparsity { precision: Precision, sparsity: Sparsity },
    OutputDType { input: DType, output: DType, math: MathPath },
    KernelHint { hint: String },
}

impl fmt::Display for Unsupported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Precision { precision, dtype } => write!(
                f,
                "precision {} cannot compute on {} storage",
                precision.label(),
                dtype.label()
            ),
            Self::MathPath { precision, math } => write!(
                f,
                "math path {} is not available for precision {}",
                math.label(),
                precision.label()
            ),
            Self::Sparsity {
                precision,
                sparsity,
            } => write!(
                f,
                "sparsity {} is not supported for precision {}",
                sparsity.label(),
                precision.label()
            ),
            Self::OutputDType {
                input,
                output,
                math,
            } => write!(
                f,
                "output dtype {} is not produced from {} inputs under {}",
                output.label(),
                input.label(),
                math.label()
            ),
            Self::KernelHint { hint } => write!(f, "unknown kernel hint '{hint}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GemvError {
    Unsupported(Unsupported),
    DTypeMismatch {
        operand: &'static str,
        expected: DType,
        actual: DType,
    },
    ShapeMismatch {
        operand: &'static str,
        expected: [usize; 2],
        actual: [usize; 2],
    },
    StrideMismatch {
        operand: &'static str,
        stride: usize,
        element_size: usize,
    },
    InsufficientStorage {
        operand: &'static str,
        needed: usize,
        available: usize,
    },
    SparsityPattern {
        row: usize,
        group: usize,
        nonzeros: usize,
    },
}

impl GemvError {
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

impl fmt::Display for GemvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported(reason) => write!(f, "unsupported configuration: {reason}"),
            Self::DTypeMismatch {
                operand,
                expected,
                actual,
            } => write!(
                f,
                "dtype mismatch on {operand}: expected {}, got {}",
                expected.label(),
                actual.label()
            ),
            Self::ShapeMismatch {
                operand,
                expected,
                actual,
            } => write!(
                f,
                "shape mismatch on {operand}: expected {expected:?}, got {actual:?}"
            ),
            Self::StrideMismatch {
                operand,
                stride,
                element_size,
            } => write!(
                f,
                "stride {stride} on {operand} is not a multiple of element size {element_size}"
            ),
            Self::InsufficientStorage {
                operand,
                needed,
                available,
            } => write!(
                f,
                "insufficient storage on {operand}: needed={needed}, available={available}"
            ),
            Self::SparsityPattern {
                row,
                group,
                nonzeros,
            } => write!(
                f,
                "2:4 sparsity violated at row={row}, group={group}: {nonzeros} non-zeros"
            ),
        }
    }
}

impl std::error::Error for GemvError {}

impl From<Unsupported> for GemvError {
    fn from(value: Unsupported) -> Self {
        Self::Unsupported(value)
    }
}
