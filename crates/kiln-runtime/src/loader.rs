//! Backend artifact loader
//!
//! Opens a variant's shared library, checks that it speaks the same contract
//! version as this runtime and resolves every entry point. Nothing is
//! initialized here; the dispatcher turns a [`LoadedArtifact`] into a
//! [`LoadedBackend`](crate::backend::LoadedBackend) by calling its init entry
//! point with the model.

use crate::variant::BackendVariant;
use kiln_abi::{ABI_VERSION, BackendInfo, EntryPoints, symbols};
use libloading::Library;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::ffi::{CStr, c_char};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info};

/// Artifact load error types
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LoadError {
    #[error("Artifact not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to load library: {0}")]
    LibraryLoad(String),

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("ABI version mismatch: expected {expected}, got {actual}")]
    AbiMismatch { expected: u32, actual: u32 },

    #[error("Invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("Backend init failed: {0}")]
    InitFailed(String),

    #[error("Artifact already loaded: {0}")]
    AlreadyLoaded(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A variant artifact with its entry points resolved
pub struct LoadedArtifact {
    entry_points: EntryPoints,
    library: Option<Library>,
    digest: String,
    info: BackendInfo,
}

impl LoadedArtifact {
    /// Wrap entry points that are already part of this process.
    ///
    /// Used for engines linked in directly, where there is no library to own.
    pub fn from_entry_points(entry_points: EntryPoints) -> Result<Self, LoadError> {
        let info = verify(&entry_points)?;
        Ok(Self {
            entry_points,
            library: None,
            digest: String::new(),
            info,
        })
    }

    pub fn entry_points(&self) -> &EntryPoints {
        &self.entry_points
    }

    /// SHA-256 of the artifact file, lowercase hex; empty for in-process engines.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn info(&self) -> &BackendInfo {
        &self.info
    }

    pub(crate) fn into_parts(self) -> (EntryPoints, Option<Library>, String, BackendInfo) {
        (self.entry_points, self.library, self.digest, self.info)
    }
}

impl std::fmt::Debug for LoadedArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedArtifact")
            .field("info", &self.info)
            .field("digest", &self.digest)
            .field("dynamic", &self.library.is_some())
            .finish()
    }
}

/// Turns a variant's artifact location into resolved entry points
pub trait ArtifactLoader {
    fn load(&self, variant: &BackendVariant, location: &Path) -> Result<LoadedArtifact, LoadError>;
}

impl<L: ArtifactLoader + ?Sized> ArtifactLoader for &L {
    fn load(&self, variant: &BackendVariant, location: &Path) -> Result<LoadedArtifact, LoadError> {
        (**self).load(variant, location)
    }
}

/// Loads artifacts as shared libraries with `libloading`
#[derive(Debug, Clone, Copy, Default)]
pub struct DynamicLoader;

impl DynamicLoader {
    pub fn new() -> Self {
        Self
    }

    /// Calculate file hash
    fn calculate_hash(path: &Path) -> Result<String, LoadError> {
        let contents = std::fs::read(path)?;
        let mut hasher = Sha256::new();
        hasher.update(&contents);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

impl ArtifactLoader for DynamicLoader {
    fn load(&self, variant: &BackendVariant, location: &Path) -> Result<LoadedArtifact, LoadError> {
        if !location.is_file() {
            return Err(LoadError::NotFound(location.to_path_buf()));
        }

        debug!(variant = %variant.id, artifact = %location.display(), "loading backend artifact");
        let digest = Self::calculate_hash(location)?;

        let library =
            unsafe { Library::new(location) }.map_err(|e| LoadError::LibraryLoad(e.to_string()))?;

        // Check the contract version before touching anything else in the library.
        let abi_version: kiln_abi::AbiVersionFn = unsafe { resolve(&library, symbols::ABI_VERSION)? };
        let actual = unsafe { abi_version() };
        if actual != ABI_VERSION {
            return Err(LoadError::AbiMismatch {
                expected: ABI_VERSION,
                actual,
            });
        }

        let entry_points = unsafe {
            EntryPoints {
                abi_version,
                info: resolve(&library, symbols::INFO)?,
                init: resolve(&library, symbols::INIT)?,
                predict: resolve(&library, symbols::PREDICT)?,
                embedding: resolve(&library, symbols::EMBEDDING)?,
                tokenize: resolve(&library, symbols::TOKENIZE)?,
                detokenize: resolve(&library, symbols::DETOKENIZE)?,
                shutdown: resolve(&library, symbols::SHUTDOWN)?,
                free_string: resolve(&library, symbols::FREE_STRING)?,
            }
        };

        let info = verify(&entry_points)?;
        info!(
            variant = %variant.id,
            artifact = %location.display(),
            engine = %info.name,
            engine_version = %info.version,
            "backend artifact loaded"
        );

        Ok(LoadedArtifact {
            entry_points,
            library: Some(library),
            digest,
            info,
        })
    }
}

/// # Safety
/// `T` must be the exact function pointer type of the symbol.
unsafe fn resolve<T: Copy>(library: &Library, name: &[u8]) -> Result<T, LoadError> {
    let symbol = unsafe { library.get::<T>(name) }
        .map_err(|e| LoadError::SymbolNotFound(format!("{}: {}", symbols::display(name), e)))?;
    Ok(*symbol)
}

/// Check the contract version and read the engine description.
fn verify(entry_points: &EntryPoints) -> Result<BackendInfo, LoadError> {
    let actual = unsafe { (entry_points.abi_version)() };
    if actual != ABI_VERSION {
        return Err(LoadError::AbiMismatch {
            expected: ABI_VERSION,
            actual,
        });
    }

    let raw = unsafe { (entry_points.info)() };
    let text = unsafe { take_string(entry_points, raw) }
        .ok_or_else(|| LoadError::InvalidArtifact("kiln_backend_info returned null".to_string()))?;
    serde_json::from_str(&text)
        .map_err(|e| LoadError::InvalidArtifact(format!("malformed backend info: {e}")))
}

/// Copy a library-allocated string and release it through the library.
///
/// # Safety
/// `ptr` must be null or a string allocated by the library `entry_points` came from.
pub(crate) unsafe fn take_string(entry_points: &EntryPoints, ptr: *mut c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let text = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
    unsafe { (entry_points.free_string)(ptr) };
    Some(text)
}

static LIVE_ARTIFACTS: LazyLock<Mutex<HashSet<PathBuf>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Exclusive claim on an artifact location for the lifetime of one backend
///
/// At most one lease per location exists in the process; it is released on drop.
#[derive(Debug)]
pub struct ArtifactLease {
    path: PathBuf,
}

impl ArtifactLease {
    pub fn acquire(location: &Path) -> Result<Self, LoadError> {
        let path = std::fs::canonicalize(location).unwrap_or_else(|_| location.to_path_buf());
        let mut live = LIVE_ARTIFACTS.lock();
        if !live.insert(path.clone()) {
            return Err(LoadError::AlreadyLoaded(path));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether some backend currently holds `location`.
    pub fn is_held(location: &Path) -> bool {
        let path = std::fs::canonicalize(location).unwrap_or_else(|_| location.to_path_buf());
        LIVE_ARTIFACTS.lock().contains(&path)
    }
}

impl Drop for ArtifactLease {
    fn drop(&mut self) {
        LIVE_ARTIFACTS.lock().remove(&self.path);
        debug!(artifact = %self.path.display(), "artifact lease released");
    }
}
