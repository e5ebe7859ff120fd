//! Shared fixtures for `kiln-runtime` integration tests.
//!
//! [`TestLoader`] stands in for the dynamic loader: variants whose artifact
//! exists on disk are opened for real through [`DynamicLoader`], everything
//! else is served by the reference engine linked into the test binary.
//! Variants can be marked broken to simulate artifacts that fail to open.

use kiln_runtime::config::RuntimeConfig;
use kiln_runtime::inventory::{CpuInfo, HardwareInventory, SystemMemory};
use kiln_runtime::{
    AcceleratorInfo, AcceleratorKind, ArtifactLoader, BackendVariant, DynamicLoader, LoadError,
    LoadedArtifact, ModelDescriptor,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

pub const GB: u64 = 1_000_000_000;

#[derive(Default)]
pub struct TestLoader {
    broken: HashSet<String>,
    loads: AtomicUsize,
}

impl TestLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every load of `variant` as if its library could not be opened.
    pub fn broken(mut self, variant: &str) -> Self {
        self.broken.insert(variant.to_string());
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ArtifactLoader for TestLoader {
    fn load(&self, variant: &BackendVariant, location: &Path) -> Result<LoadedArtifact, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if location.exists() {
            return DynamicLoader::new().load(variant, location);
        }
        if self.broken.contains(&variant.id) {
            return Err(LoadError::LibraryLoad(format!(
                "{}: cannot open shared object file",
                location.display()
            )));
        }
        LoadedArtifact::from_entry_points(kiln_engine::kiln_entry_points())
    }
}

/// A library directory and a model file, both removed on drop.
pub struct Fixture {
    pub dir: TempDir,
    pub model: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = dir.path().join("model.gguf");
        std::fs::write(&model, b"GGUF reference weights").expect("write model");
        Self { dir, model }
    }

    pub fn library_dir(&self) -> PathBuf {
        self.dir.path().join("lib")
    }

    pub fn config(&self) -> RuntimeConfig {
        RuntimeConfig::default().with_library_dir(self.library_dir())
    }

    pub fn descriptor(&self, size_class: &str, file_type: &str) -> ModelDescriptor {
        ModelDescriptor::new(&self.model, size_class, file_type, 32)
    }

    /// Place a file that is not a shared library where `variant`'s artifact belongs.
    pub fn corrupt_artifact(&self, variant: &BackendVariant) -> PathBuf {
        let location = variant.location(&self.library_dir());
        std::fs::create_dir_all(location.parent().expect("artifact dir")).expect("create dir");
        std::fs::write(&location, b"\x7fELF truncated").expect("write artifact");
        location
    }
}

/// CPU-only host with `ram` bytes of system memory.
pub fn host(ram: u64, cpu_features: &[&str]) -> HardwareInventory {
    HardwareInventory::new(
        SystemMemory {
            total: ram,
            available: ram / 2,
        },
        CpuInfo {
            logical_cores: 16,
            brand: "Test CPU".to_string(),
            features: cpu_features.iter().map(|f| f.to_string()).collect(),
        },
    )
}

pub fn gpu(kind: AcceleratorKind, free: u64) -> AcceleratorInfo {
    AcceleratorInfo::new(kind, free + 2 * GB, free, "test-driver")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
