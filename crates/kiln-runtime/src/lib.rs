//! # kiln-runtime
//!
//! Hardware-aware backend selection and admission control for Kiln.
//!
//! At startup the runtime probes the host for accelerator driver libraries,
//! checks whether the requested model fits the memory it would run from, and
//! loads the best backend variant that works, falling back down the ranked
//! list to the CPU baseline when a variant cannot be loaded.
//!
//! ```text
//! probe ──▶ HardwareInventory ──▶ Dispatcher::plan ──▶ admission ──▶ load/init ──▶ LoadedBackend
//!                                       ▲                                 │
//!                                 VariantCatalog                 DispatchReport (per candidate)
//! ```
//!
//! No vendor library is linked. A host without NVIDIA or AMD drivers simply
//! has an inventory without accelerators.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kiln_runtime::{InferenceBackend, ModelDescriptor, RuntimeConfig};
//!
//! let config = RuntimeConfig::load(None)?;
//! let model = ModelDescriptor::new("/models/llama-7b.gguf", "7B", "Q4_0", 32);
//! let backend = kiln_runtime::start(&config, &model)?;
//! println!("serving with {}", backend.variant_id());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod estimator;
pub mod inventory;
pub mod loader;
pub mod probe;
pub mod variant;

pub use backend::{BackendError, InferenceBackend, LoadedBackend};
pub use config::{ConfigError, RuntimeConfig};
pub use dispatch::{Candidate, DispatchError, DispatchReport, Dispatcher};
pub use error::{RuntimeError, RuntimeResult};
pub use estimator::{Admission, MemoryPool, ModelDescriptor, ModelRequirement, Rejected};
pub use inventory::HardwareInventory;
pub use kiln_abi::{ModelParams, PredictChunk, PredictRequest};
pub use loader::{ArtifactLoader, DynamicLoader, LoadError, LoadedArtifact};
pub use probe::{AcceleratorInfo, AcceleratorKind, ProbeError, ProbeFailure};
pub use variant::{BackendVariant, CatalogError, VariantCatalog};

use tracing::info;

/// Probe the host (once per process), then select and load a backend for `model`.
pub fn start(config: &RuntimeConfig, model: &ModelDescriptor) -> RuntimeResult<LoadedBackend> {
    config.validate()?;
    let inventory = inventory::global(&config.probe);
    let catalog = VariantCatalog::load(&config.variants)?;
    info!(
        variants = catalog.len(),
        library_dir = %config.variants.library_dir.display(),
        model = %model.model_path.display(),
        "starting backend dispatch"
    );
    Dispatcher::new(catalog, config).select(inventory, model)
}
