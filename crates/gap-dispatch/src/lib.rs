#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use gap_backend::{Backend, CapabilitySet, KernelSelection};
use gap_core::{ExecutionMode, GemvArgs, GemvError, Precision, Sparsity};
use tracing::{debug, warn};

/// Backends in priority order: earlier registrations win ties.
#[derive(Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn Backend>>,
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn Backend>) -> Result<(), RegistryError> {
        if self.get(backend.name()).is_some() {
            return Err(RegistryError::DuplicateName {
                name: backend.name().to_string(),
            });
        }
        debug!(
            backend = backend.name(),
            priority = self.backends.len(),
            capabilities = backend.capabilities().bits(),
            "backend registered"
        );
        self.backends.push(backend);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Backend>> {
        self.backends.iter().find(|backend| backend.name() == name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|backend| backend.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Backend>> {
        self.backends.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Union of every registered backend's capabilities.
    #[must_use]
    pub fn capabilities(&self) -> CapabilitySet {
        self.backends
            .iter()
            .fold(CapabilitySet::empty(), |acc, backend| {
                acc.union(backend.capabilities())
            })
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateName { name: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateName { name } => write!(f, "backend '{name}' is already registered"),
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GemvDecision {
    pub backend: String,
    pub kernel: String,
    pub mode: ExecutionMode,
    /// An explicitly preferred backend was passed over.
    pub rerouted: bool,
    pub fallback_used: bool,
    pub capability_bits: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    NoBackends,
    UnknownBackend {
        name: String,
    },
    NoCapableBackend {
        precision: Precision,
        sparsity: Sparsity,
    },
    Backend {
        backend: String,
        error: GemvError,
    },
}

impl DispatchError {
    /// The underlying kernel error, when a backend was actually invoked.
    #[must_use]
    pub fn gemv_error(&self) -> Option<&GemvError> {
        match self {
            Self::Backend { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBackends => write!(f, "no backends registered"),
            Self::UnknownBackend { name } => write!(f, "unknown backend '{name}'"),
            Self::NoCapableBackend {
                precision,
                sparsity,
            } => write!(
                f,
                "no backend supports {}/{}",
                precision.label(),
                sparsity.label()
            ),
            Self::Backend { backend, error } => {
                write!(f, "backend '{backend}' failed: {error}")
            }
        }
    }
}

impl std::error::Error for DispatchError {}

fn decision(
    backend: &Arc<dyn Backend>,
    selection: KernelSelection,
    mode: ExecutionMode,
    rerouted: bool,
    dense_retry: bool,
) -> GemvDecision {
    GemvDecision {
        backend: backend.name().to_string(),
        kernel: selection.kernel,
        mode,
        rerouted,
        fallback_used: selection.fallback_used || dense_retry,
        capability_bits: backend.capabilities().bits(),
    }
}

/// Picks a backend for `args` and runs it.
///
/// Strict mode runs the preferred backend, or the first registered backend
/// whose capabilities cover the request, and surfaces any failure. Hardened
/// mode additionally moves on to the next capable backend when one declines
/// the configuration, and finally retries a 2:4 request as dense.
pub fn dispatch_gemv(
    registry: &BackendRegistry,
    mode: ExecutionMode,
    preferred: Option<&str>,
    args: &mut GemvArgs<'_>,
) -> Result<GemvDecision, DispatchError> {
    if registry.is_empty() {
        return Err(DispatchError::NoBackends);
    }
    let preferred = match preferred {
        Some(name) => Some(Arc::clone(registry.get(name).ok_or_else(|| {
            DispatchError::UnknownBackend {
                name: name.to_string(),
            }
        })?)),
        None => None,
    };
    let precision = args.config.precision();
    let sparsity = args.config.sparsity();

    let result = match mode {
        ExecutionMode::Strict => dispatch_strict(registry, preferred.as_ref(), args),
        ExecutionMode::Hardened => dispatch_hardened(registry, preferred.as_ref(), args),
    };
    match &result {
        Ok(decision) => debug!(
            backend = %decision.backend,
            kernel = %decision.kernel,
            mode = mode.label(),
            rerouted = decision.rerouted,
            fallback_used = decision.fallback_used,
            "gemv dispatched"
        ),
        Err(error) => debug!(
            precision = precision.label(),
            sparsity = sparsity.label(),
            mode = mode.label(),
            error = %error,
            "gemv dispatch failed"
        ),
    }
    result
}

fn dispatch_strict(
    registry: &BackendRegistry,
    preferred: Option<&Arc<dyn Backend>>,
    args: &mut GemvArgs<'_>,
) -> Result<GemvDecision, DispatchError> {
    let precision = args.config.precision();
    let sparsity = args.config.sparsity();
    let backend = match preferred {
        Some(backend) => backend,
        None => registry
            .iter()
            .find(|backend| backend.capabilities().supports(precision, sparsity))
            .ok_or(DispatchError::NoCapableBackend {
                precision,
                sparsity,
            })?,
    };
    if !backend.capabilities().supports(precision, sparsity) {
        return Err(DispatchError::NoCapableBackend {
            precision,
            sparsity,
        });
    }
    let selection = backend
        .gemv(args)
        .map_err(|error| DispatchError::Backend {
            backend: backend.name().to_string(),
            error,
        })?;
    Ok(decision(
        backend,
        selection,
        ExecutionMode::Strict,
        false,
        false,
    ))
}

fn dispatch_hardened(
    registry: &BackendRegistry,
    preferred: Option<&Arc<dyn Backend>>,
    args: &mut GemvArgs<'_>,
) -> Result<GemvDecision, DispatchError> {
    let precision = args.config.precision();
    let sparsity = args.config.sparsity();

    let mut candidates: Vec<&Arc<dyn Backend>> = Vec::with_capacity(registry.len());
    candidates.extend(preferred);
    candidates.extend(
        registry
            .iter()
            .filter(|backend| preferred.is_none_or(|p| !Arc::ptr_eq(p, backend))),
    );

    let mut last_error = None;
    if let Some(found) =
        try_candidates(&candidates, preferred, sparsity, args, false, &mut last_error)?
    {
        return Ok(found);
    }

    if sparsity != Sparsity::Dense {
        let original = args.config.clone();
        args.config = original.clone().with_sparsity(Sparsity::Dense);
        let retried = try_candidates(
            &candidates,
            preferred,
            Sparsity::Dense,
            args,
            true,
            &mut last_error,
        );
        args.config = original;
        if let Some(found) = retried? {
            return Ok(found);
        }
    }

    Err(last_error.unwrap_or(DispatchError::NoCapableBackend {
        precision,
        sparsity,
    }))
}

/// `Ok(None)` means every capable candidate declined the configuration.
fn try_candidates(
    candidates: &[&Arc<dyn Backend>],
    preferred: Option<&Arc<dyn Backend>>,
    sparsity: Sparsity,
    args: &mut GemvArgs<'_>,
    dense_retry: bool,
    last_error: &mut Option<DispatchError>,
) -> Result<Option<GemvDecision>, DispatchError> {
    let precision = args.config.precision();
    for backend in candidates {
        if !backend.capabilities().supports(precision, sparsity) {
            continue;
        }
        match backend.gemv(args) {
            Ok(selection) => {
                let rerouted = preferred.is_some_and(|p| !Arc::ptr_eq(p, backend));
                if rerouted || dense_retry {
                    warn!(
                        backend = backend.name(),
                        rerouted,
                        dense_retry,
                        "hardened dispatch used a fallback"
                    );
                }
                return Ok(Some(decision(
                    backend,
                    selection,
                    ExecutionMode::Hardened,
                    rerouted,
                    dense_retry,
                )));
            }
            Err(error) if error.is_unsupported() => {
                warn!(backend = backend.name(), error = %error, "backend declined; trying next");
                *last_error = Some(DispatchError::Backend {
                    backend: backend.name().to_string(),
                    error,
                });
            }
            Err(error) => {
                return Err(DispatchError::Backend {
                    backend: backend.name().to_string(),
                    error,
                });
            }
        }
    }
    Ok(None)
}
