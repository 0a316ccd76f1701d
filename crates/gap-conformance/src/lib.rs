#![forbid(unsafe_code)]

pub mod logging;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gap_api::{GapSession, SessionError};
use gap_backend::{Backend, BackendBuffer, Deleter, DeleterContext};
use gap_backend_cpu::{CpuBackendConfig, RecordingBackend, ReferenceBackend};
use gap_core::{DType, Element, ExecutionMode, OperationConfig, Precision};
use gap_dispatch::GemvDecision;
use gap_tensor::TensorHandle;
use half::{bf16, f16};
use logging::{StructuredCaseLog, mode_label};
use serde::Deserialize;
use serde_json::{Value, json};

const MAX_FIXTURE_BYTES: u64 = 1_048_576;
const GEMV_FIXTURE: &str = "gemv_cases.json";
const OWNERSHIP_FIXTURE: &str = "ownership_cases.json";
/// Every GEMV operand lives here; dispatch may still run on any CPU backend.
const ALLOCATION_BACKEND: &str = "cpu.reference";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub strict_mode: bool,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            strict_mode: true,
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub strict_mode: bool,
    pub cases_total: usize,
    pub cases_passed: usize,
}

impl HarnessReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.cases_total == self.cases_passed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GemvCaseReport {
    pub name: String,
    pub mode: ExecutionMode,
    pub output_ok: bool,
    pub backend_ok: bool,
    pub kernel_ok: bool,
    pub fallback_ok: bool,
    pub rerouted_ok: bool,
    pub error_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl GemvCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.output_ok
            && self.backend_ok
            && self.kernel_ok
            && self.fallback_ok
            && self.rerouted_ok
            && self.error_ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OwnershipCaseReport {
    pub name: String,
    pub mode: ExecutionMode,
    pub frees_ok: bool,
    pub live_ok: bool,
    pub errors_ok: bool,
    /// Everything allocated was freed once the case tore down.
    pub balanced_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl OwnershipCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.frees_ok && self.live_ok && self.errors_ok && self.balanced_ok
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GemvFixtureFile {
    cases: Vec<GemvCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct GemvCase {
    name: String,
    config: OperationConfig,
    backend: Option<String>,
    rows: usize,
    cols: usize,
    a: Vec<f64>,
    x: Vec<f64>,
    output_dtype: Option<DType>,
    /// Overrides the row count of `y` to provoke shape errors.
    y_rows: Option<usize>,
    tolerance: Option<f64>,
    strict: GemvExpectation,
    hardened: GemvExpectation,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GemvExpectation {
    expect_error: Option<bool>,
    expected_error_contains: Option<String>,
    expected_output: Option<Vec<f64>>,
    expected_backend: Option<String>,
    expected_kernel_contains: Option<String>,
    expected_fallback: Option<bool>,
    expected_rerouted: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct OwnershipFixtureFile {
    cases: Vec<OwnershipCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct OwnershipCase {
    name: String,
    rows: usize,
    cols: usize,
    ops: Vec<OwnershipOp>,
    expected_frees: usize,
    expected_live: usize,
    #[serde(default)]
    expected_errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum OwnershipOp {
    /// Allocate fresh storage and attach it.
    Attach,
    /// Attach the pointer, deleter and context already held.
    AttachSame,
    /// Keep the pointer, rebind it to a new context.
    AttachOther,
    /// Offer a buffer smaller than the handle needs.
    AttachUndersized,
    Release,
    Reset,
    /// Move the handle out, leaving the drained state behind.
    Take,
    Drop,
}

impl OwnershipOp {
    fn label(self) -> &'static str {
        match self {
            Self::Attach => "attach",
            Self::AttachSame => "attach_same",
            Self::AttachOther => "attach_other",
            Self::AttachUndersized => "attach_undersized",
            Self::Release => "release",
            Self::Reset => "reset",
            Self::Take => "take",
            Self::Drop => "drop",
        }
    }
}

pub fn run_gemv_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<GemvCaseReport>), String> {
    let fixture_path = config.fixture_root.join(GEMV_FIXTURE);
    let fixture: GemvFixtureFile = load_fixture(&fixture_path)?;
    run_gemv_conformance_with_fixture(mode, &fixture)
}

fn run_gemv_conformance_with_fixture(
    mode: ExecutionMode,
    fixture: &GemvFixtureFile,
) -> Result<(HarnessReport, Vec<GemvCaseReport>), String> {
    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        case_reports.push(run_gemv_case(case, mode)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(GemvCaseReport::passed));

    let report = HarnessReport {
        suite: "gemv",
        fixture_count: 1,
        strict_mode: mode == ExecutionMode::Strict,
        cases_total,
        cases_passed,
    };

    Ok((report, case_reports))
}

pub fn run_ownership_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<OwnershipCaseReport>), String> {
    let fixture_path = config.fixture_root.join(OWNERSHIP_FIXTURE);
    let fixture: OwnershipFixtureFile = load_fixture(&fixture_path)?;
    run_ownership_conformance_with_fixture(mode, &fixture)
}

fn run_ownership_conformance_with_fixture(
    mode: ExecutionMode,
    fixture: &OwnershipFixtureFile,
) -> Result<(HarnessReport, Vec<OwnershipCaseReport>), String> {
    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        case_reports.push(run_ownership_case(case, mode)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(OwnershipCaseReport::passed));

    let report = HarnessReport {
        suite: "ownership",
        fixture_count: 1,
        strict_mode: mode == ExecutionMode::Strict,
        cases_total,
        cases_passed,
    };

    Ok((report, case_reports))
}

#[must_use]
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixture_count = fs::read_dir(&config.fixture_root)
        .ok()
        .into_iter()
        .flat_map(|it| it.filter_map(Result::ok))
        .count();

    let mode = if config.strict_mode {
        ExecutionMode::Strict
    } else {
        ExecutionMode::Hardened
    };

    let (gemv_total, gemv_passed) = run_gemv_conformance(config, mode)
        .map_or((0, 0), |(_, cases)| {
            summarize_passes(cases.iter().map(GemvCaseReport::passed))
        });
    let (ownership_total, ownership_passed) = run_ownership_conformance(config, mode)
        .map_or((0, 0), |(_, cases)| {
            summarize_passes(cases.iter().map(OwnershipCaseReport::passed))
        });

    HarnessReport {
        suite: "smoke",
        fixture_count,
        strict_mode: config.strict_mode,
        cases_total: gemv_total + ownership_total,
        cases_passed: gemv_passed + ownership_passed,
    }
}

/// Forensic records of every case in every requested mode, in run order.
pub fn collect_case_logs(
    config: &HarnessConfig,
    modes: &[ExecutionMode],
) -> Result<Vec<StructuredCaseLog>, String> {
    let mut logs = Vec::new();
    for mode in modes {
        let (_, gemv) = run_gemv_conformance(config, *mode)?;
        logs.extend(gemv.into_iter().map(|case| case.forensic_log));
        let (_, ownership) = run_ownership_conformance(config, *mode)?;
        logs.extend(ownership.into_iter().map(|case| case.forensic_log));
    }
    Ok(logs)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseLogSummary {
    pub output_path: PathBuf,
    pub modes: Vec<ExecutionMode>,
    pub log_entries: usize,
    pub failed_entries: usize,
}

/// Writes [`collect_case_logs`] to `output_path` as JSON lines.
pub fn emit_case_logs(
    config: &HarnessConfig,
    output_path: &Path,
    modes: &[ExecutionMode],
) -> Result<CaseLogSummary, String> {
    let logs = collect_case_logs(config, modes)?;
    let mut lines = String::new();
    for log in &logs {
        lines.push_str(&log.to_json_line()?);
        lines.push('\n');
    }
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            format!("failed to create log dir {}: {error}", parent.display())
        })?;
    }
    fs::write(output_path, lines)
        .map_err(|error| format!("failed to write {}: {error}", output_path.display()))?;

    Ok(CaseLogSummary {
        output_path: output_path.to_path_buf(),
        modes: modes.to_vec(),
        log_entries: logs.len(),
        failed_entries: logs.iter().filter(|log| log.outcome != "pass").count(),
    })
}

struct GemvObservation {
    result: Result<GemvDecision, String>,
    output: Vec<f64>,
}

/// Binds the element type matching `$dtype` to `$ty` and evaluates `$body`.
macro_rules! with_element_type {
    ($dtype:expr, $ty:ident => $body:expr) => {
        match $dtype {
            DType::F32 => {
                type $ty = f32;
                $body
            }
            DType::F16 => {
                type $ty = f16;
                $body
            }
            DType::BF16 => {
                type $ty = bf16;
                $body
            }
            DType::I8 => {
                type $ty = i8;
                $body
            }
            DType::I32 => {
                type $ty = i32;
                $body
            }
        }
    };
}

fn default_output_dtype(precision: Precision) -> DType {
    match precision {
        Precision::I8 => DType::I32,
        other => other.storage_dtype(),
    }
}

fn observe_gemv<A: Element, Y: Element>(
    session: &mut GapSession,
    case: &GemvCase,
) -> Result<GemvObservation, String> {
    let setup = |error: SessionError| format!("gemv case '{}' setup failed: {error}", case.name);
    let a_values: Vec<A> = case.a.iter().copied().map(A::from_f64).collect();
    let x_values: Vec<A> = case.x.iter().copied().map(A::from_f64).collect();

    let a = session
        .tensor_from::<A>("A", case.rows, case.cols, &a_values, ALLOCATION_BACKEND)
        .map_err(setup)?;
    let x = session
        .tensor_from::<A>("x", case.cols, 1, &x_values, ALLOCATION_BACKEND)
        .map_err(setup)?;
    let y_rows = case.y_rows.unwrap_or(case.rows);
    let mut y = session
        .tensor::<Y>("y", y_rows, 1, ALLOCATION_BACKEND)
        .map_err(setup)?;

    let result = session
        .gemv(&a, &x, &mut y, case.config.clone(), case.backend.as_deref())
        .map_err(|error| error.to_string());
    let output = y.as_slice().iter().copied().map(Element::to_f64).collect();

    session.dispose(a);
    session.dispose(x);
    session.dispose(y);
    Ok(GemvObservation { result, output })
}

fn run_gemv_case(case: &GemvCase, mode: ExecutionMode) -> Result<GemvCaseReport, String> {
    let expectation = match mode {
        ExecutionMode::Strict => &case.strict,
        ExecutionMode::Hardened => &case.hardened,
    };

    let mut session = GapSession::with_cpu_backends(mode)
        .map_err(|error| format!("gemv case '{}' session setup failed: {error}", case.name))?;
    let input_dtype = case.config.precision().storage_dtype();
    let output_dtype = case
        .output_dtype
        .unwrap_or_else(|| default_output_dtype(case.config.precision()));
    let observation = with_element_type!(input_dtype, A => {
        with_element_type!(output_dtype, Y => observe_gemv::<A, Y>(&mut session, case))
    })?;

    let expected_error = expectation.expect_error.unwrap_or(false);
    let tolerance = case.tolerance.unwrap_or(1e-6);

    if expected_error {
        let error_message = observation.result.as_ref().err().cloned();
        let error_ok = error_message.as_deref().is_some_and(|message| {
            expectation
                .expected_error_contains
                .as_deref()
                .is_none_or(|needle| message.contains(needle))
        });
        let reason_code = match (&error_message, error_ok) {
            (_, true) => "expected_error_observed",
            (Some(_), false) => "expected_error_mismatch",
            (None, false) => "expected_error_missing",
        };
        return Ok(GemvCaseReport {
            name: case.name.clone(),
            mode,
            output_ok: true,
            backend_ok: true,
            kernel_ok: true,
            fallback_ok: true,
            rerouted_ok: true,
            error_ok,
            forensic_log: gemv_case_log(case, mode, error_ok, reason_code)
                .with_extra_fields(gemv_error_forensic_fields(case, error_message)),
        });
    }

    let decision = observation
        .result
        .map_err(|error| format!("gemv case '{}' failed: {error}", case.name))?;

    let output_ok = expectation
        .expected_output
        .as_deref()
        .is_none_or(|expected| vec_within(&observation.output, expected, tolerance));
    let backend_ok = expectation
        .expected_backend
        .as_deref()
        .is_none_or(|expected| expected == decision.backend);
    let kernel_ok = expectation
        .expected_kernel_contains
        .as_deref()
        .is_none_or(|expected| decision.kernel.contains(expected));
    let fallback_ok = expectation
        .expected_fallback
        .is_none_or(|expected| expected == decision.fallback_used);
    let rerouted_ok = expectation
        .expected_rerouted
        .is_none_or(|expected| expected == decision.rerouted);
    let passed = output_ok && backend_ok && kernel_ok && fallback_ok && rerouted_ok;
    let reason_code = if passed {
        "gemv_parity_ok"
    } else {
        "gemv_expectation_mismatch"
    };

    Ok(GemvCaseReport {
        name: case.name.clone(),
        mode,
        output_ok,
        backend_ok,
        kernel_ok,
        fallback_ok,
        rerouted_ok,
        error_ok: true,
        forensic_log: gemv_case_log(case, mode, passed, reason_code).with_extra_fields(
            gemv_forensic_fields(case, &decision, &observation.output),
        ),
    })
}

fn gemv_case_log(
    case: &GemvCase,
    mode: ExecutionMode,
    passed: bool,
    reason_code: &str,
) -> StructuredCaseLog {
    StructuredCaseLog::new(
        "gemv",
        GEMV_FIXTURE,
        case.name.as_str(),
        mode,
        vec![format!("crates/gap-conformance/fixtures/{GEMV_FIXTURE}")],
        format!(
            "cargo test -p gap-conformance gemv_fixture_executes_in_both_modes -- --nocapture # mode={}",
            mode_label(mode)
        ),
        if passed { "pass" } else { "fail" },
        reason_code,
    )
}

fn gemv_forensic_fields(
    case: &GemvCase,
    decision: &GemvDecision,
    output: &[f64],
) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    fields.insert("config".to_string(), json!(case.config.to_string()));
    fields.insert("preferred_backend".to_string(), json!(case.backend));
    fields.insert("backend".to_string(), json!(decision.backend));
    fields.insert("kernel".to_string(), json!(decision.kernel));
    fields.insert("rerouted".to_string(), json!(decision.rerouted));
    fields.insert("fallback_used".to_string(), json!(decision.fallback_used));
    fields.insert(
        "capability_bits".to_string(),
        json!(format!("0x{:016x}", decision.capability_bits)),
    );
    fields.insert("output".to_string(), json!(output));
    fields
}

fn gemv_error_forensic_fields(
    case: &GemvCase,
    error_message: Option<String>,
) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    fields.insert("config".to_string(), json!(case.config.to_string()));
    fields.insert("preferred_backend".to_string(), json!(case.backend));
    fields.insert("error".to_string(), json!(error_message));
    fields
}

struct OwnershipObservation {
    frees: usize,
    live: usize,
    errors: usize,
    leaked: usize,
    unreleased: usize,
    unmatched: usize,
    trace: Vec<String>,
}

fn observe_ownership(
    case: &OwnershipCase,
    mode: ExecutionMode,
) -> Result<OwnershipObservation, String> {
    let reference = Arc::new(ReferenceBackend::new(
        CpuBackendConfig::default().with_mode(mode),
    ));
    let recorder = Arc::new(RecordingBackend::new(reference.clone()));
    let backend: Arc<dyn Backend> = recorder.clone();

    let mut handle = TensorHandle::<f32>::new(case.name.as_str(), case.rows, case.cols);
    let mut taken: Vec<TensorHandle<f32>> = Vec::new();
    let mut released: Vec<BackendBuffer> = Vec::new();
    let mut errors = 0usize;
    let mut trace = Vec::with_capacity(case.ops.len());

    for (step, op) in (1u64..).zip(&case.ops) {
        match op {
            OwnershipOp::Attach | OwnershipOp::AttachUndersized => {
                let nbytes = match op {
                    OwnershipOp::AttachUndersized => handle.nbytes() / 2,
                    _ => handle.nbytes(),
                };
                let buffer = BackendBuffer::allocate(&backend, nbytes)
                    .map_err(|error| format!("ownership case '{}': {error}", case.name))?
                    .with_context(DeleterContext(step));
                if handle.attach_buffer(buffer).is_err() {
                    errors += 1;
                }
            }
            OwnershipOp::AttachSame => {
                let deleter = handle.deleter().cloned();
                let context = handle.context();
                if handle.rebind(deleter, context).is_err() {
                    errors += 1;
                }
            }
            OwnershipOp::AttachOther => {
                let rebound = handle.rebind(
                    Some(Deleter::new(Arc::clone(&backend))),
                    Some(DeleterContext(step)),
                );
                if rebound.is_err() {
                    errors += 1;
                }
            }
            OwnershipOp::Release => released.extend(handle.release_buffer()),
            OwnershipOp::Reset => handle.reset(),
            OwnershipOp::Take => taken.push(std::mem::take(&mut handle)),
            OwnershipOp::Drop => drop(std::mem::take(&mut handle)),
        }
        trace.push(format!(
            "{}:frees={},live={}",
            op.label(),
            recorder.release_count(),
            reference.allocator().live_allocations()
        ));
    }

    let frees = recorder.release_count();
    let live = reference.allocator().live_allocations();

    drop(handle);
    drop(taken);
    drop(released);

    Ok(OwnershipObservation {
        frees,
        live,
        errors,
        leaked: reference.allocator().live_allocations(),
        unreleased: recorder.outstanding(),
        unmatched: recorder.unmatched_releases(),
        trace,
    })
}

fn run_ownership_case(
    case: &OwnershipCase,
    mode: ExecutionMode,
) -> Result<OwnershipCaseReport, String> {
    let observation = observe_ownership(case, mode)?;

    let frees_ok = observation.frees == case.expected_frees;
    let live_ok = observation.live == case.expected_live;
    let errors_ok = observation.errors == case.expected_errors;
    let balanced_ok =
        observation.leaked == 0 && observation.unreleased == 0 && observation.unmatched == 0;
    let passed = frees_ok && live_ok && errors_ok && balanced_ok;
    let reason_code = if !balanced_ok {
        "ownership_leak_detected"
    } else if passed {
        "ownership_parity_ok"
    } else {
        "ownership_expectation_mismatch"
    };

    let mut fields = BTreeMap::new();
    fields.insert(
        "ops".to_string(),
        json!(case.ops.iter().map(|op| op.label()).collect::<Vec<_>>()),
    );
    fields.insert("frees".to_string(), json!(observation.frees));
    fields.insert("live".to_string(), json!(observation.live));
    fields.insert("errors".to_string(), json!(observation.errors));
    fields.insert("leaked".to_string(), json!(observation.leaked));
    fields.insert("unmatched_releases".to_string(), json!(observation.unmatched));
    fields.insert("trace".to_string(), json!(observation.trace));

    Ok(OwnershipCaseReport {
        name: case.name.clone(),
        mode,
        frees_ok,
        live_ok,
        errors_ok,
        balanced_ok,
        forensic_log: StructuredCaseLog::new(
            "ownership",
            OWNERSHIP_FIXTURE,
            case.name.as_str(),
            mode,
            vec![format!("crates/gap-conformance/fixtures/{OWNERSHIP_FIXTURE}")],
            format!(
                "cargo test -p gap-conformance ownership_fixture_executes_in_both_modes -- --nocapture # mode={}",
                mode_label(mode)
            ),
            if passed { "pass" } else { "fail" },
            reason_code,
        )
        .with_extra_fields(fields),
    })
}

fn load_fixture<T>(path: &Path) -> Result<T, String>
where
    T: for<'de> Deserialize<'de>,
{
    let metadata = fs::metadata(path).map_err(|error| {
        format!(
            "failed reading fixture metadata {}: {error}",
            path.display()
        )
    })?;
    let size = metadata.len();
    if size > MAX_FIXTURE_BYTES {
        return Err(format!(
            "fixture {} exceeds max bytes: actual={size} max={MAX_FIXTURE_BYTES}",
            path.display()
        ));
    }

    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed reading fixture {}: {error}", path.display()))?;
    serde_json::from_str::<T>(&raw)
        .map_err(|error| format!("failed parsing fixture {}: {error}", path.display()))
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for is_passed in iter {
        total += 1;
        if is_passed {
            passed += 1;
        }
    }
    (total, passed)
}

fn within(actual: f64, expected: f64, tolerance: f64) -> bool {
    (actual - expected).abs() <= tolerance
}

fn vec_within(actual: &[f64], expected: &[f64], tolerance: f64) -> bool {
    actual.len() == expected.len()
        && actual
            .iter()
            .zip(expected.iter())
            .all(|(actual, expected)| within(*actual, *expected, tolerance))
}
