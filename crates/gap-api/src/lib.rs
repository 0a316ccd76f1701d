#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use gap_backend::Backend;
use gap_backend_cpu::{CpuBackendConfig, ReferenceBackend, TiledBackend};
use gap_core::{Element, ExecutionMode, GemvArgs, OperationConfig};
use gap_dispatch::{BackendRegistry, DispatchError, GemvDecision, RegistryError, dispatch_gemv};
use gap_runtime::{EvidenceEntry, EvidenceKind, RuntimeContext};
use gap_tensor::{TensorError, TensorHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    EmptyTensor { name: String },
    UnknownBackend { name: String },
    Tensor(TensorError),
    Dispatch(DispatchError),
    Registry(RegistryError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyTensor { name } => write!(f, "tensor '{name}' has no storage attached"),
            Self::UnknownBackend { name } => write!(f, "unknown backend '{name}'"),
            Self::Tensor(error) => write!(f, "tensor failure: {error}"),
            Self::Dispatch(error) => write!(f, "dispatch failure: {error}"),
            Self::Registry(error) => write!(f, "registry failure: {error}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<TensorError> for SessionError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

impl From<DispatchError> for SessionError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

impl From<RegistryError> for SessionError {
    fn from(value: RegistryError) -> Self {
        Self::Registry(value)
    }
}

/// Backends, execution mode and evidence for one caller.
#[derive(Debug)]
pub struct GapSession {
    runtime: RuntimeContext,
    registry: BackendRegistry,
}

impl GapSession {
    /// A session with no backends registered.
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            runtime: RuntimeContext::new(mode),
            registry: BackendRegistry::new(),
        }
    }

    /// Registers `cpu.reference` then `cpu.tiled`, both running in `mode`.
    pub fn with_cpu_backends(mode: ExecutionMode) -> Result<Self, SessionError> {
        let mut session = Self::new(mode);
        let config = CpuBackendConfig::default().with_mode(mode);
        session.register_backend(Arc::new(ReferenceBackend::new(config)))?;
        session.register_backend(Arc::new(TiledBackend::new(config)))?;
        Ok(session)
    }

    pub fn register_backend(&mut self, backend: Arc<dyn Backend>) -> Result<(), SessionError> {
        let name = backend.name().to_string();
        self.registry.register(backend)?;
        self.runtime
            .ledger_mut()
            .record(EvidenceKind::Policy, format!("backend registered: {name}"));
        Ok(())
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.runtime.mode()
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.runtime.set_mode(mode);
    }

    #[must_use]
    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn backend(&self, name: &str) -> Result<Arc<dyn Backend>, SessionError> {
        self.registry
            .get(name)
            .cloned()
            .ok_or_else(|| SessionError::UnknownBackend {
                name: name.to_string(),
            })
    }

    /// A handle whose storage lives on `backend`.
    pub fn tensor<T: Element>(
        &mut self,
        name: &str,
        rows: usize,
        cols: usize,
        backend: &str,
    ) -> Result<TensorHandle<T>, SessionError> {
        let target = self.backend(backend)?;
        let mut handle = TensorHandle::<T>::new(name, rows, cols);
        if let Err(error) = handle.allocate_on(&target) {
            self.runtime
                .record_failure(EvidenceKind::Allocation, "allocate", &error);
            return Err(error.into());
        }
        self.runtime
            .record_allocation(name, target.name(), handle.nbytes());
        Ok(handle)
    }

    pub fn tensor_from<T: Element>(
        &mut self,
        name: &str,
        rows: usize,
        cols: usize,
        values: &[T],
        backend: &str,
    ) -> Result<TensorHandle<T>, SessionError> {
        let mut handle = self.tensor::<T>(name, rows, cols, backend)?;
        handle.copy_from_slice(values)?;
        Ok(handle)
    }

    /// `y = a * x` on a backend picked by dispatch.
    pub fn gemv<A: Element, X: Element, Y: Element>(
        &mut self,
        a: &TensorHandle<A>,
        x: &TensorHandle<X>,
        y: &mut TensorHandle<Y>,
        config: OperationConfig,
        preferred: Option<&str>,
    ) -> Result<GemvDecision, SessionError> {
        let a_arg = a.as_arg().ok_or_else(|| empty(a.name()))?;
        let x_arg = x.as_arg().ok_or_else(|| empty(x.name()))?;
        let y_name = y.name().to_string();
        let y_arg = y.as_arg_mut().ok_or_else(|| empty(&y_name))?;
        let summary_config = config.to_string();

        let mut args = GemvArgs::new(a_arg, x_arg, y_arg, config);
        match dispatch_gemv(&self.registry, self.mode(), preferred, &mut args) {
            Ok(decision) => {
                self.runtime.ledger_mut().record(
                    EvidenceKind::Dispatch,
                    format!(
                        "op=gemv config={summary_config} mode={} backend={} kernel={} rerouted={} fallback={} caps=0x{:016x}",
                        decision.mode.label(),
                        decision.backend,
                        decision.kernel,
                        decision.rerouted,
                        decision.fallback_used,
                        decision.capability_bits
                    ),
                );
                Ok(decision)
            }
            Err(error) => {
                self.runtime
                    .record_failure(EvidenceKind::Dispatch, "gemv", &error);
                Err(error.into())
            }
        }
    }

    /// Drops `handle`, freeing its storage if it owns any.
    pub fn dispose<T: Element>(&mut self, handle: TensorHandle<T>) {
        let event = if handle.is_owning() {
            "dispose"
        } else {
            "drop_non_owning"
        };
        self.runtime.record_ownership(handle.name(), event);
        drop(handle);
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.runtime.ledger().entries()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.runtime.ledger().len()
    }
}

fn empty(name: &str) -> SessionError {
    SessionError::EmptyTensor {
        name: name.to_string(),
    }
}
