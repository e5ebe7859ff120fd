//! Capability probe for accelerator driver libraries
//!
//! Each vendor's management library is opened at runtime from a short,
//! ordered list of candidates, never linked. A vendor counts as present only
//! when its library opened, every required symbol resolved, its init call
//! succeeded and a memory query answered. Anything less is reported as a
//! [`ProbeFailure`] value and the library is unloaded again; a missing
//! accelerator is the common case, not a fault.

mod nvml;
mod rocm;

use crate::config::ProbeConfig;
use libloading::Library;
use serde::{Deserialize, Serialize};
use std::ffi::c_void;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Accelerator family a driver library or backend variant belongs to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum AcceleratorKind {
    /// No accelerator; CPU-only variants.
    #[default]
    None,
    /// NVIDIA GPUs, probed through NVML.
    Cuda,
    /// AMD GPUs, probed through ROCm SMI.
    Rocm,
}

impl AcceleratorKind {
    /// Hardware vendor behind this accelerator kind
    pub fn vendor(&self) -> &'static str {
        match self {
            AcceleratorKind::None => "none",
            AcceleratorKind::Cuda => "NVIDIA",
            AcceleratorKind::Rocm => "AMD",
        }
    }
}

impl fmt::Display for AcceleratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceleratorKind::None => write!(f, "none"),
            AcceleratorKind::Cuda => write!(f, "CUDA"),
            AcceleratorKind::Rocm => write!(f, "ROCm"),
        }
    }
}

/// Why a vendor was left out of the inventory
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeError {
    #[error("unable to load {library} to query for {vendor} GPUs: {reason}")]
    LibraryNotFound {
        vendor: &'static str,
        library: String,
        reason: String,
    },

    #[error("symbol lookup for {symbol} failed: {reason}")]
    SymbolMismatch { symbol: String, reason: String },

    #[error("{vendor} driver init failure: {status}")]
    InitFailed { vendor: &'static str, status: i32 },

    #[error("{query} lookup failure: {status}")]
    QueryFailed { query: &'static str, status: i32 },

    #[error("no probe available for accelerator kind {accelerator}")]
    Unsupported { accelerator: AcceleratorKind },
}

/// A vendor that did not make it into the inventory, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeFailure {
    pub kind: AcceleratorKind,
    pub error: ProbeError,
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.error)
    }
}

/// Resolves symbol addresses from a loaded library
pub trait SymbolSource: Send + Sync {
    /// Address of `name` (NUL-terminated), or the loader's error message.
    fn symbol_address(&self, name: &[u8]) -> Result<*const c_void, String>;
}

/// A driver library opened with `libloading`
pub struct DriverLibrary {
    origin: String,
    library: Library,
}

impl DriverLibrary {
    /// Open the first candidate that loads, returning the last error otherwise.
    pub fn open_first(candidates: &[PathBuf]) -> Result<Self, String> {
        let mut last_error = String::from("no candidate libraries");
        for candidate in candidates {
            match unsafe { Library::new(candidate) } {
                Ok(library) => {
                    debug!(library = %candidate.display(), "opened driver library");
                    return Ok(Self {
                        origin: candidate.display().to_string(),
                        library,
                    });
                }
                Err(e) => {
                    debug!(library = %candidate.display(), error = %e, "driver library candidate failed");
                    last_error = e.to_string();
                }
            }
        }
        Err(last_error)
    }

    /// Path or name the library was opened from
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

impl SymbolSource for DriverLibrary {
    fn symbol_address(&self, name: &[u8]) -> Result<*const c_void, String> {
        let symbol = unsafe { self.library.get::<*mut c_void>(name) }.map_err(|e| e.to_string())?;
        Ok(*symbol as *const c_void)
    }
}

impl Drop for DriverLibrary {
    fn drop(&mut self) {
        debug!(library = %self.origin, "unloading driver library");
    }
}

/// Resolve a symbol and reinterpret it as the function pointer type `F`.
///
/// # Safety
/// `F` must be the exact `extern "C"` signature of the symbol.
pub(crate) unsafe fn resolve_fn<F: Copy>(
    source: &dyn SymbolSource,
    name: &'static [u8],
) -> Result<F, ProbeError> {
    let symbol = String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name)).into_owned();
    let address = source
        .symbol_address(name)
        .map_err(|reason| ProbeError::SymbolMismatch {
            symbol: symbol.clone(),
            reason,
        })?;
    if address.is_null() {
        return Err(ProbeError::SymbolMismatch {
            symbol,
            reason: "resolved to null".to_string(),
        });
    }
    debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*const c_void>());
    Ok(unsafe { std::mem::transmute_copy::<*const c_void, F>(&address) })
}

/// Memory figures reported by a driver, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MemoryReport {
    pub total: u64,
    pub used: u64,
}

/// Resolved vendor management API
pub(crate) trait DriverApi: Send + Sync {
    fn init(&self) -> Result<(), ProbeError>;
    fn memory(&self) -> Result<MemoryReport, ProbeError>;
    fn version(&self) -> Result<String, ProbeError>;
    fn shutdown(&self);
}

/// Owns an initialized driver: shuts it down and unloads it exactly once on drop
pub struct DriverHandle {
    kind: AcceleratorKind,
    origin: String,
    api: Box<dyn DriverApi>,
    _source: Arc<dyn SymbolSource>,
}

impl DriverHandle {
    pub fn kind(&self) -> AcceleratorKind {
        self.kind
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }
}

impl fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverHandle")
            .field("kind", &self.kind)
            .field("origin", &self.origin)
            .finish()
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.api.shutdown();
        debug!(kind = %self.kind, "driver shut down");
    }
}

/// One detected accelerator
#[derive(Debug, Clone, Serialize)]
pub struct AcceleratorInfo {
    pub kind: AcceleratorKind,
    pub total_memory: u64,
    pub free_memory: u64,
    pub driver_version: String,
    /// Where the driver library was loaded from.
    pub library: String,
    #[serde(skip)]
    driver: Option<Arc<DriverHandle>>,
}

impl AcceleratorInfo {
    /// Build an entry without an owned driver, for inventories assembled by
    /// the caller (remote reports, tests).
    pub fn new(
        kind: AcceleratorKind,
        total_memory: u64,
        free_memory: u64,
        driver_version: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            total_memory,
            free_memory: free_memory.min(total_memory),
            driver_version: driver_version.into(),
            library: String::new(),
            driver: None,
        }
    }

    /// The driver this entry keeps loaded, if it came from a probe.
    pub fn driver(&self) -> Option<&DriverHandle> {
        self.driver.as_deref()
    }
}

/// Candidate driver libraries for `kind`, in the order they are tried.
///
/// Explicit library override first, then the runtime root, then the bare
/// library name (default loader search path), then absolute fallbacks.
pub fn candidate_libraries(kind: AcceleratorKind, config: &ProbeConfig) -> Vec<PathBuf> {
    let (explicit, root, root_subdir, defaults): (_, _, _, &[&str]) = match kind {
        AcceleratorKind::Cuda => (
            config.nvml_library.as_ref(),
            config.cuda_root.as_ref(),
            nvml::ROOT_LIB_DIR,
            nvml::LIBRARY_NAMES,
        ),
        AcceleratorKind::Rocm => (
            config.rocm_smi_library.as_ref(),
            config.rocm_root.as_ref(),
            rocm::ROOT_LIB_DIR,
            rocm::LIBRARY_NAMES,
        ),
        AcceleratorKind::None => return Vec::new(),
    };

    let mut candidates = Vec::with_capacity(defaults.len() + 2);
    if let Some(path) = explicit {
        candidates.push(path.clone());
    }
    if let (Some(root), Some(name)) = (root, defaults.first()) {
        candidates.push(root.join(root_subdir).join(name));
    }
    candidates.extend(defaults.iter().map(PathBuf::from));
    candidates.dedup();
    candidates
}

/// Probe one vendor using the configured discovery paths.
pub fn probe(kind: AcceleratorKind, config: &ProbeConfig) -> Result<AcceleratorInfo, ProbeFailure> {
    probe_candidates(kind, &candidate_libraries(kind, config))
}

/// Probe one vendor from an explicit candidate list.
pub fn probe_candidates(
    kind: AcceleratorKind,
    candidates: &[PathBuf],
) -> Result<AcceleratorInfo, ProbeFailure> {
    let failure = |error| ProbeFailure { kind, error };
    if kind == AcceleratorKind::None {
        return Err(failure(ProbeError::Unsupported { accelerator: kind }));
    }

    let library = DriverLibrary::open_first(candidates).map_err(|reason| {
        failure(ProbeError::LibraryNotFound {
            vendor: kind.vendor(),
            library: candidates
                .first()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            reason,
        })
    })?;
    let origin = library.origin().to_string();
    probe_source(kind, Arc::new(library), origin)
}

/// Probe one vendor against an already opened symbol source.
///
/// Any failure drops the last reference to `source`, unloading it.
pub fn probe_source(
    kind: AcceleratorKind,
    source: Arc<dyn SymbolSource>,
    origin: impl Into<String>,
) -> Result<AcceleratorInfo, ProbeFailure> {
    let origin = origin.into();
    let failure = |error| ProbeFailure { kind, error };

    let api: Box<dyn DriverApi> = match kind {
        AcceleratorKind::Cuda => Box::new(nvml::NvmlApi::resolve(source.as_ref()).map_err(failure)?),
        AcceleratorKind::Rocm => Box::new(rocm::RocmApi::resolve(source.as_ref()).map_err(failure)?),
        AcceleratorKind::None => return Err(failure(ProbeError::Unsupported { accelerator: kind })),
    };

    api.init().map_err(failure)?;

    let memory = match api.memory() {
        Ok(memory) => memory,
        Err(e) => {
            api.shutdown();
            return Err(failure(e));
        }
    };

    let driver_version = api.version().unwrap_or_else(|e| {
        debug!(kind = %kind, error = %e, "driver version unavailable");
        "unknown".to_string()
    });

    let driver = DriverHandle {
        kind,
        origin: origin.clone(),
        api,
        _source: source,
    };

    Ok(AcceleratorInfo {
        kind,
        total_memory: memory.total,
        free_memory: memory.total.saturating_sub(memory.used),
        driver_version,
        library: origin,
        driver: Some(Arc::new(driver)),
    })
}

/// Log a probe outcome the way operators expect to read it.
pub(crate) fn log_outcome(result: &Result<AcceleratorInfo, ProbeFailure>) {
    match result {
        Ok(info) => info!(
            kind = %info.kind,
            total_memory = info.total_memory,
            free_memory = info.free_memory,
            driver_version = %info.driver_version,
            library = %info.library,
            "accelerator detected"
        ),
        Err(failure) => match &failure.error {
            ProbeError::SymbolMismatch { .. } => warn!(
                kind = %failure.kind,
                error = %failure.error,
                "driver library present but incompatible"
            ),
            _ => debug!(kind = %failure.kind, error = %failure.error, "accelerator unavailable"),
        },
    }
}
