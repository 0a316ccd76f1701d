#![forbid(unsafe_code)]

use std::fmt;
use std::num::Wrapping;
use std::ops::{Add, Mul};

use gap_core::{
    DType, ElementSlice, ElementSliceMut, GemvArgs, GemvError, MathPath, OperationConfig,
    Precision, Unsupported,
};
use half::{bf16, f16};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
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
    DTypeMismatch {
        operand: &'static str,
        expected: DType,
        actual: DType,
    },
    SparsityPattern {
        row: usize,
        group: usize,
        nonzeros: usize,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
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

impl std::error::Error for KernelError {}

impl From<KernelError> for GemvError {
    fn from(value: KernelError) -> Self {
        match value {
            KernelError::ShapeMismatch {
                operand,
                expected,
                actual,
            } => Self::ShapeMismatch {
                operand,
                expected,
                actual,
            },
            KernelError::StrideMismatch {
                operand,
                stride,
                element_size,
            } => Self::StrideMismatch {
                operand,
                stride,
                element_size,
            },
            KernelError::InsufficientStorage {
                operand,
                needed,
                available,
            } => Self::InsufficientStorage {
                operand,
                needed,
                available,
            },
            KernelError::DTypeMismatch {
                operand,
                expected,
                actual,
            } => Self::DTypeMismatch {
                operand,
                expected,
                actual,
            },
            KernelError::SparsityPattern {
                row,
                group,
                nonzeros,
            } => Self::SparsityPattern {
                row,
                group,
                nonzeros,
            },
        }
    }
}

/// Validated extents and element (not byte) strides of one GEMV call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemvGeometry {
    pub rows: usize,
    pub cols: usize,
    pub a_row_stride: usize,
    pub a_col_stride: usize,
    pub x_stride: usize,
    pub y_stride: usize,
}

pub fn resolve_geometry(args: &GemvArgs<'_>) -> Result<GemvGeometry, KernelError> {
    let [rows, cols] = args.a.shape();
    if args.x.shape() != [cols, 1] {
        return Err(KernelError::ShapeMismatch {
            operand: "x",
            expected: [cols, 1],
            actual: args.x.shape(),
        });
    }
    if args.y.shape() != [rows, 1] {
        return Err(KernelError::ShapeMismatch {
            operand: "y",
            expected: [rows, 1],
            actual: args.y.shape(),
        });
    }

    let a_stride = element_strides("a", args.a.stride(), args.a.dtype())?;
    let x_stride = element_strides("x", args.x.stride(), args.x.dtype())?;
    let y_stride = element_strides("y", args.y.stride(), args.y.dtype())?;

    ensure_span("a", [rows, cols], a_stride, args.a.data().len())?;
    ensure_span("x", [cols, 1], x_stride, args.x.data().len())?;
    ensure_span("y", [rows, 1], y_stride, args.y.len())?;

    Ok(GemvGeometry {
        rows,
        cols,
        a_row_stride: a_stride[0],
        a_col_stride: a_stride[1],
        x_stride: x_stride[0],
        y_stride: y_stride[0],
    })
}

fn element_strides(
    operand: &'static str,
    stride: [usize; 2],
    dtype: DType,
) -> Result<[usize; 2], KernelError> {
    let element_size = dtype.size_in_bytes();
    let mut out = [0usize; 2];
    for (slot, bytes) in out.iter_mut().zip(stride) {
        if bytes % element_size != 0 {
            return Err(KernelError::StrideMismatch {
                operand,
                stride: bytes,
                element_size,
            });
        }
        *slot = bytes / element_size;
    }
    Ok(out)
}

fn ensure_span(
    operand: &'static str,
    shape: [usize; 2],
    stride: [usize; 2],
    available: usize,
) -> Result<(), KernelError> {
    if shape[0] == 0 || shape[1] == 0 {
        return Ok(());
    }
    let needed = (shape[0] - 1)
        .checked_mul(stride[0])
        .and_then(|rows| {
            (shape[1] - 1)
                .checked_mul(stride[1])
                .and_then(|cols| rows.checked_add(cols))
        })
        .and_then(|last| last.checked_add(1))
        .unwrap_or(usize::MAX);
    if needed > available {
        return Err(KernelError::InsufficientStorage {
            operand,
            needed,
            available,
        });
    }
    Ok(())
}

/// How one precision/math-path combination loads, accumulates and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemvPlan {
    /// f32 inputs; `wide_accumulator` sums in f64.
    F32 { wide_accumulator: bool },
    /// f32 storage rounded to a 10-bit mantissa before multiplying.
    Tf32,
    F16 {
        wide_accumulator: bool,
        widen_output: bool,
    },
    Bf16 {
        wide_accumulator: bool,
        widen_output: bool,
    },
    /// i8 inputs, wrapping i32 accumulator and output.
    I8ToI32,
    I32,
}

impl GemvPlan {
    #[must_use]
    pub const fn input_dtype(self) -> DType {
        match self {
            Self::F32 { .. } | Self::Tf32 => DType::F32,
            Self::F16 { .. } => DType::F16,
            Self::Bf16 { .. } => DType::BF16,
            Self::I8ToI32 => DType::I8,
            Self::I32 => DType::I32,
        }
    }

    #[must_use]
    pub const fn output_dtype(self) -> DType {
        match self {
            Self::F32 { .. } | Self::Tf32 => DType::F32,
            Self::F16 { widen_output, .. } | Self::Bf16 { widen_output, .. } => {
                if widen_output {
                    DType::F32
                } else {
                    self.input_dtype()
                }
            }
            Self::I8ToI32 | Self::I32 => DType::I32,
        }
    }

    /// The 2:4 kernel compares against zero after loading, which is only
    /// meaningful for the floating point plans.
    #[must_use]
    pub const fn supports_structured_sparsity(self) -> bool {
        !matches!(self, Self::I8ToI32 | Self::I32)
    }
}

/// Maps a policy and the operand dtypes onto a plan, or says why not.
pub fn plan_gemv(
    config: &OperationConfig,
    a: DType,
    x: DType,
    y: DType,
) -> Result<GemvPlan, GemvError> {
    let precision = config.precision();
    if a != precision.storage_dtype() {
        return Err(Unsupported::Precision {
            precision,
            dtype: a,
        }
        .into());
    }
    if x != a {
        return Err(GemvError::DTypeMismatch {
            operand: "x",
            expected: a,
            actual: x,
        });
    }

    let math = config.math();
    let mixed = math == MathPath::MixedAccumulate;
    let output = |allowed: bool| -> Result<(), GemvError> {
        if allowed {
            Ok(())
        } else {
            Err(Unsupported::OutputDType {
                input: a,
                output: y,
                math,
            }
            .into())
        }
    };

    match precision {
        Precision::F32 => {
            output(y == DType::F32)?;
            Ok(GemvPlan::F32 {
                wide_accumulator: mixed,
            })
        }
        Precision::Tf32 => {
            output(y == DType::F32)?;
            Ok(GemvPlan::Tf32)
        }
        Precision::F16 => {
            output(y == DType::F16 || (mixed && y == DType::F32))?;
            Ok(GemvPlan::F16 {
                wide_accumulator: mixed,
                widen_output: y == DType::F32,
            })
        }
        Precision::Bf16 => {
            output(y == DType::BF16 || (mixed && y == DType::F32))?;
            Ok(GemvPlan::Bf16 {
                wide_accumulator: mixed,
                widen_output: y == DType::F32,
            })
        }
        Precision::I8 => {
            if !mixed {
                return Err(Unsupported::MathPath { precision, math }.into());
            }
            output(y == DType::I32)?;
            Ok(GemvPlan::I8ToI32)
        }
        Precision::I32 => {
            output(y == DType::I32)?;
            Ok(GemvPlan::I32)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemvVariant {
    Naive,
    /// Rows processed in blocks sharing each loaded chunk of `x`.
    Tiled { row_block: usize },
    /// Skips the structural zeros of a 2:4 sparse matrix.
    Sparse2of4,
}

impl GemvVariant {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Naive => "naive",
            Self::Tiled { .. } => "tiled",
            Self::Sparse2of4 => "sparse24",
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn narrow_f64(acc: f64) -> f32 {
    acc as f32
}

/// Rounds to the nearest tf32 value (ties to even), keeping 10 mantissa bits.
#[must_use]
pub fn round_to_tf32(value: f32) -> f32 {
    if !value.is_finite() {
        return value;
    }
    let bits = value.to_bits();
    let lsb = (bits >> 13) & 1;
    f32::from_bits(bits.wrapping_add(0x0fff + lsb) & !0x1fff)
}

pub trait Accumulator: Copy + Default + PartialEq + Add<Output = Self> + Mul<Output = Self> {}

impl<T> Accumulator for T where T: Copy + Default + PartialEq + Add<Output = T> + Mul<Output = T> {}

/// Runs `args.y = args.a * args.x` with the given plan and variant.
pub fn run_gemv(
    plan: GemvPlan,
    variant: GemvVariant,
    args: &mut GemvArgs<'_>,
) -> Result<(), KernelError> {
    let geometry = resolve_geometry(args)?;
    let a = args.a.data();
    let x = args.x.data();

    match (plan, a, x, args.y.data_mut()) {
        (
            GemvPlan::F32 {
                wide_accumulator: false,
            },
            ElementSlice::F32(a),
            ElementSlice::F32(x),
            ElementSliceMut::F32(y),
        ) => execute(
            variant,
            &geometry,
            a,
            x,
            y,
            |v: f32| v,
            |v: f32| v,
            |acc: f32| acc,
        ),
        (
            GemvPlan::F32 {
                wide_accumulator: true,
            },
            ElementSlice::F32(a),
            ElementSlice::F32(x),
            ElementSliceMut::F32(y),
        ) => execute(
            variant,
            &geometry,
            a,
            x,
            y,
            f64::from,
            f64::from,
            narrow_f64,
        ),
        (GemvPlan::Tf32, ElementSlice::F32(a), ElementSlice::F32(x), ElementSliceMut::F32(y)) => {
            execute(
                variant,
                &geometry,
                a,
                x,
                y,
                round_to_tf32,
                round_to_tf32,
                |acc: f32| acc,
            )
        }
        (
            GemvPlan::F16 {
                wide_accumulator: false,
                widen_output: false,
            },
            ElementSlice::F16(a),
            ElementSlice::F16(x),
            ElementSliceMut::F16(y),
        ) => execute(
            variant,
            &geometry,
            a,
            x,
            y,
            |v: f16| v,
            |v: f16| v,
            |acc: f16| acc,
        ),
        (
            GemvPlan::F16 {
                wide_accumulator: true,
                widen_output: false,
            },
            ElementSlice::F16(a),
            ElementSlice::F16(x),
            ElementSliceMut::F16(y),
        ) => execute(
            variant,
            &geometry,
            a,
            x,
            y,
            f16::to_f32,
            f16::to_f32,
            f16::from_f32,
        ),
        (
            GemvPlan::F16 {
                wide_accumulator: true,
                widen_output: true,
            },
            ElementSlice::F16(a),
            ElementSlice::F16(x),
            ElementSliceMut::F32(y),
        ) => execute(
            variant,
            &geometry,
            a,
            x,
            y,
            f16::to_f32,
            f16::to_f32,
            |acc: f32| acc,
        ),
        (
            GemvPlan::Bf16 {
                wide_accumulator: false,
                widen_output: false,
            },
            ElementSlice::BF16(a),
            ElementSlice::BF16(x),
            ElementSliceMut::BF16(y),
        ) => execute(
            variant,
            &geometry,
            a,
            x,
            y,
            |v: bf16| v,
            |v: bf16| v,
            |acc: bf16| acc,
        ),
        (
            GemvPlan::Bf16 {
                wide_accumulator: true,
                widen_output: false,
            },
            ElementSlice::BF16(a),
            ElementSlice::BF16(x),
            ElementSliceMut::BF16(y),
        ) => execute(
            variant,
            &geometry,
            a,
            x,
            y,
            bf16::to_f32,
            bf16::to_f32,
            bf16::from_f32,
        ),
        (
            GemvPlan::Bf16 {
                wide_accumulator: true,
                widen_output: true,
            },
            ElementSlice::BF16(a),
            ElementSlice::BF16(x),
            ElementSliceMut::F32(y),
        ) => execute(
            variant,
            &geometry,
            a,
            x,
            y,
            bf16::to_f32,
            bf16::to_f32,
            |acc: f32| acc,
        ),
        (GemvPlan::I8ToI32, ElementSlice::I8(a), ElementSlice::I8(x), ElementSliceMut::I32(y)) => {
            execute(
                variant,
                &geometry,
                a,
                x,
                y,
                |v: i8| Wrapping(i32::from(v)),
                |v: i8| Wrapping(i32::from(v)),
                |acc: Wrapping<i32>| acc.0,
            )
        }
        (GemvPlan::I32, ElementSlice::I32(a), ElementSlice::I32(x), ElementSliceMut::I32(y)) => {
            execute(
                variant,
                &geometry,
                a,
                x,
                y,
                Wrapping,
                Wrapping,
                |acc: Wrapping<i32>| acc.0,
            )
        }
        (plan, a, x, y) => {
            let (operand, expected, actual) = if a.dtype() != plan.input_dtype() {
                ("a", plan.input_dtype(), a.dtype())
            } else if x.dtype() != plan.input_dtype() {
                ("x", plan.input_dtype(), x.dtype())
            } else {
                ("y", plan.output_dtype(), y.dtype())
            };
            Err(KernelError::DTypeMismatch {
                operand,
                expected,
                actual,
            })
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn execute<A, X, Y, C, LA, LX, S>(
    variant: GemvVariant,
    geometry: &GemvGeometry,
    a: &[A],
    x: &[X],
    y: &mut [Y],
    load_a: LA,
    load_x: LX,
    store: S,
) -> Result<(), KernelError>
where
    A: Copy,
    X: Copy,
    C: Accumulator,
    LA: Fn(A) -> C,
    LX: Fn(X) -> C,
    S: Fn(C) -> Y,
{
    match variant {
        GemvVariant::Naive => {
            gemv_naive(geometry, a, x, y, &load_a, &load_x, &store);
            Ok(())
        }
        GemvVariant::Tiled { row_block } => {
            gemv_tiled(geometry, row_block, a, x, y, &load_a, &load_x, &store);
            Ok(())
        }
        GemvVariant::Sparse2of4 => gemv_sparse_2of4(geometry, a, x, y, &load_a, &load_x, &store),
    }
}

fn gemv_naive<A: Copy, X: Copy, Y, C: Accumulator>(
    g: &GemvGeometry,
    a: &[A],
    x: &[X],
    y: &mut [Y],
    load_a: &impl Fn(A) -> C,
    load_x: &impl Fn(X) -> C,
    store: &impl Fn(C) -> Y,
) {
    for row in 0..g.rows {
        let base = row * g.a_row_stride;
        let mut acc = C::default();
        for col in 0..g.cols {
            acc = acc + load_a(a[base + col * g.a_col_stride]) * load_x(x[col * g.x_stride]);
        }
        y[row * g.y_stride] = store(acc);
    }
}

const LANES: usize = 4;

#[allow(clippy::too_many_arguments)]
fn gemv_tiled<A: Copy, X: Copy, Y, C: Accumulator>(
    g: &GemvGeometry,
    row_block: usize,
    a: &[A],
    x: &[X],
    y: &mut [Y],
    load_a: &impl Fn(A) -> C,
    load_x: &impl Fn(X) -> C,
    store: &impl Fn(C) -> Y,
) {
    let block = row_block.max(1);
    let mut lanes = vec![[C::default(); LANES]; block];
    let full_cols = g.cols - g.cols % LANES;

    let mut row = 0;
    while row < g.rows {
        let height = block.min(g.rows - row);
        for lane in lanes.iter_mut().take(height) {
            *lane = [C::default(); LANES];
        }

        for col in (0..full_cols).step_by(LANES) {
            let mut xv = [C::default(); LANES];
            for (k, slot) in xv.iter_mut().enumerate() {
                *slot = load_x(x[(col + k) * g.x_stride]);
            }
            for (offset, lane) in lanes.iter_mut().take(height).enumerate() {
                let base = (row + offset) * g.a_row_stride;
                for k in 0..LANES {
                    lane[k] = lane[k] + load_a(a[base + (col + k) * g.a_col_stride]) * xv[k];
                }
            }
        }

        for (offset, lane) in lanes.iter().take(height).enumerate() {
            let r = row + offset;
            let base = r * g.a_row_stride;
            let mut acc = (lane[0] + lane[1]) + (lane[2] + lane[3]);
            for col in full_cols..g.cols {
                acc = acc + load_a(a[base + col * g.a_col_stride]) * load_x(x[col * g.x_stride]);
            }
            y[r * g.y_stride] = store(acc);
        }
        row += height;
    }
}

fn gemv_sparse_2of4<A: Copy, X: Copy, Y, C: Accumulator>(
    g: &GemvGeometry,
    a: &[A],
    x: &[X],
    y: &mut [Y],
    load_a: &impl Fn(A) -> C,
    load_x: &impl Fn(X) -> C,
    store: &impl Fn(C) -> Y,
) -> Result<(), KernelError> {
    let zero = C::default();
    for row in 0..g.rows {
        let base = row * g.a_row_stride;
        let mut acc = zero;
        for (group, start) in (0..g.cols).step_by(LANES).enumerate() {
            let end = (start + LANES).min(g.cols);
            let mut kept = [(0usize, zero); 2];
            let mut nonzeros = 0usize;
            for col in start..end {
                let value = load_a(a[base + col * g.a_col_stride]);
                if value != zero {
                    if let Some(slot) = kept.get_mut(nonzeros) {
                        *slot = (col, value);
                    }
                    nonzeros += 1;
                }
            }
            if nonzeros > 2 {
                return Err(KernelError::SparsityPattern {
                    row,
                    group,
                    nonzeros,
                });
            }
            for &(col, value) in kept.iter().take(nonzeros) {
                acc = acc + value * load_x(x[col * g.x_stride]);
            }
        }
        y[row * g.y_stride] = store(acc);
    }
    Ok(())
}
