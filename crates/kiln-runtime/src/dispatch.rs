//! Backend dispatcher
//!
//! Planning is pure: the inventory and the catalog decide which variants are
//! candidates and in which order. Selection then walks that plan, loading
//! each candidate until one initializes, and records why every other
//! candidate was passed over.
//!
//! The baseline variant is always the last candidate, so a host without any
//! accelerator (or with a broken one) still ends up with a working backend.

use crate::backend::LoadedBackend;
use crate::config::{AdmissionConfig, BackendConfig, RuntimeConfig};
use crate::error::RuntimeError;
use crate::estimator::{
    Admission, AvailableMemory, MemoryPool, ModelDescriptor, ModelRequirement, Rejected, estimate,
};
use crate::inventory::HardwareInventory;
use crate::loader::{ArtifactLease, ArtifactLoader, DynamicLoader, LoadError};
use crate::variant::{BackendVariant, CatalogError, VariantCatalog};
use kiln_abi::ModelParams;
use serde::Serialize;
use std::cmp::Reverse;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A variant eligible on this host, with where it would be loaded from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub variant: BackendVariant,
    pub location: PathBuf,
    /// Memory the model would be allocated from.
    pub pool: MemoryPool,
}

/// What happened to one candidate during dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Loaded,
    /// Skipped by admission control before loading.
    Rejected(String),
    /// Load, symbol resolution or init failed.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchAttempt {
    pub variant: String,
    pub location: PathBuf,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

/// Every attempt made while selecting a backend, in dispatch order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    attempts: Vec<DispatchAttempt>,
}

impl DispatchReport {
    fn record(&mut self, candidate: &Candidate, outcome: AttemptOutcome) {
        self.attempts.push(DispatchAttempt {
            variant: candidate.variant.id.clone(),
            location: candidate.location.clone(),
            outcome,
        });
    }

    pub fn attempts(&self) -> &[DispatchAttempt] {
        &self.attempts
    }

    /// Attempts that did not produce a backend.
    pub fn failures(&self) -> impl Iterator<Item = &DispatchAttempt> {
        self.attempts
            .iter()
            .filter(|a| a.outcome != AttemptOutcome::Loaded)
    }

    /// Variant that was loaded, if any.
    pub fn selected(&self) -> Option<&str> {
        self.attempts
            .iter()
            .find(|a| a.outcome == AttemptOutcome::Loaded)
            .map(|a| a.variant.as_str())
    }
}

/// One line per failed candidate: `<variant>: <reason>`
impl fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for attempt in self.failures() {
            if !first {
                writeln!(f)?;
            }
            first = false;
            match &attempt.outcome {
                AttemptOutcome::Rejected(reason) => write!(f, "{}: rejected: {reason}", attempt.variant)?,
                AttemptOutcome::Failed(reason) => write!(f, "{}: {reason}", attempt.variant)?,
                AttemptOutcome::Loaded => {}
            }
        }
        Ok(())
    }
}

/// Every candidate, baseline included, failed to load
#[derive(Debug, Clone, thiserror::Error)]
#[error("no backend variant could be loaded:\n{report}")]
pub struct DispatchError {
    pub report: DispatchReport,
}

fn eligible(variant: &BackendVariant, inventory: &HardwareInventory) -> bool {
    inventory.has(variant.requires) && inventory.cpu().supports_all(&variant.cpu_features)
}

/// Order the catalog's variants for this host.
///
/// Eligible variants by descending rank (declaration order breaks ties),
/// then the baseline. With `backend_override`, only that variant (if
/// eligible) precedes the baseline.
pub fn plan(
    inventory: &HardwareInventory,
    catalog: &VariantCatalog,
    library_dir: &Path,
    backend_override: Option<&str>,
) -> Result<Vec<Candidate>, CatalogError> {
    let baseline = catalog.baseline();

    let mut selected: Vec<&BackendVariant> = match backend_override {
        Some(id) => {
            let variant = catalog.require(id)?;
            if variant.id == baseline.id {
                Vec::new()
            } else if eligible(variant, inventory) {
                vec![variant]
            } else {
                warn!(variant = %id, "backend override is not supported on this host, using baseline");
                Vec::new()
            }
        }
        None => catalog
            .variants()
            .iter()
            .filter(|v| v.id != baseline.id && eligible(v, inventory))
            .collect(),
    };
    selected.sort_by_key(|v| Reverse(v.rank));
    selected.push(baseline);

    Ok(selected
        .into_iter()
        .map(|variant| Candidate {
            variant: variant.clone(),
            location: variant.location(library_dir),
            pool: MemoryPool::for_accelerator(variant.requires),
        })
        .collect())
}

/// Init parameters for a model, as passed to the backend.
pub fn model_params(descriptor: &ModelDescriptor, backend: &BackendConfig) -> ModelParams {
    ModelParams {
        model_path: descriptor.model_path.clone(),
        size_class: descriptor.size_class.clone(),
        file_type: descriptor.file_type.clone(),
        num_layers: descriptor.num_layers,
        adapters: descriptor.adapters.clone(),
        projectors: descriptor.projectors.clone(),
        num_ctx: backend.num_ctx,
        num_threads: backend.num_threads,
        num_gpu_layers: backend.num_gpu_layers,
    }
}

/// Selects and loads the best backend variant for a model
pub struct Dispatcher<L: ArtifactLoader = DynamicLoader> {
    catalog: VariantCatalog,
    loader: L,
    library_dir: PathBuf,
    admission: AdmissionConfig,
    backend: BackendConfig,
}

impl Dispatcher<DynamicLoader> {
    pub fn new(catalog: VariantCatalog, config: &RuntimeConfig) -> Self {
        Self::with_loader(catalog, config, DynamicLoader::new())
    }
}

impl<L: ArtifactLoader> Dispatcher<L> {
    pub fn with_loader(catalog: VariantCatalog, config: &RuntimeConfig, loader: L) -> Self {
        Self {
            catalog,
            loader,
            library_dir: config.variants.library_dir.clone(),
            admission: config.admission.clone(),
            backend: config.backend.clone(),
        }
    }

    pub fn catalog(&self) -> &VariantCatalog {
        &self.catalog
    }

    /// Candidate order for `inventory`, without loading anything.
    pub fn plan(&self, inventory: &HardwareInventory) -> Result<Vec<Candidate>, CatalogError> {
        plan(
            inventory,
            &self.catalog,
            &self.library_dir,
            self.backend.backend_override.as_deref(),
        )
    }

    /// Admission decision for every planned candidate, in plan order.
    pub fn admit(
        &self,
        inventory: &HardwareInventory,
        requirement: &ModelRequirement,
    ) -> Result<Vec<(Candidate, Admission)>, CatalogError> {
        let candidates = self.plan(inventory)?;
        Ok(candidates
            .into_iter()
            .map(|candidate| {
                let admission = if self.admission.enforce {
                    let available = candidate
                        .pool
                        .available(inventory, self.admission.system_memory)
                        .unwrap_or_else(|| AvailableMemory::new(candidate.pool, 0));
                    estimate(requirement, &available)
                } else {
                    Admission::Fits
                };
                (candidate, admission)
            })
            .collect())
    }

    /// Load the best admitted candidate for `descriptor`.
    ///
    /// Returns [`RuntimeError::Rejected`] without loading anything when no
    /// candidate's memory pool can hold the model, and
    /// [`RuntimeError::Dispatch`] when every admitted candidate failed.
    pub fn select(
        &self,
        inventory: &HardwareInventory,
        descriptor: &ModelDescriptor,
    ) -> Result<LoadedBackend, RuntimeError> {
        let requirement = ModelRequirement::from_descriptor(descriptor);
        let checked = self.admit(inventory, &requirement)?;

        if !checked.iter().any(|(_, admission)| admission.fits()) {
            let closest = checked
                .into_iter()
                .filter_map(|(_, admission)| match admission {
                    Admission::Rejected(rejected) => Some(rejected),
                    Admission::Fits => None,
                })
                .min_by_key(Rejected::shortfall_bytes);
            if let Some(rejected) = closest {
                warn!(
                    model = %descriptor.model_path.display(),
                    required = rejected.required_bytes,
                    available = rejected.available_bytes,
                    "model rejected by admission control"
                );
                return Err(RuntimeError::Rejected(rejected));
            }
            return Err(DispatchError {
                report: DispatchReport::default(),
            }
            .into());
        }

        let params = model_params(descriptor, &self.backend);
        let mut report = DispatchReport::default();

        for (candidate, admission) in checked {
            if let Admission::Rejected(rejected) = admission {
                warn!(variant = %candidate.variant.id, reason = %rejected, "backend candidate rejected");
                report.record(&candidate, AttemptOutcome::Rejected(rejected.reason));
                continue;
            }

            match self.try_candidate(&candidate, &params) {
                Ok(mut backend) => {
                    report.record(&candidate, AttemptOutcome::Loaded);
                    info!(
                        variant = %candidate.variant.id,
                        artifact = %candidate.location.display(),
                        pool = %candidate.pool,
                        skipped = report.failures().count(),
                        "backend selected"
                    );
                    backend.set_report(report);
                    return Ok(backend);
                }
                Err(e) => {
                    warn!(variant = %candidate.variant.id, error = %e, "backend candidate failed");
                    report.record(&candidate, AttemptOutcome::Failed(e.to_string()));
                }
            }
        }

        Err(DispatchError { report }.into())
    }

    fn try_candidate(
        &self,
        candidate: &Candidate,
        params: &ModelParams,
    ) -> Result<LoadedBackend, LoadError> {
        let lease = ArtifactLease::acquire(&candidate.location)?;
        let artifact = self.loader.load(&candidate.variant, &candidate.location)?;
        LoadedBackend::initialize(&candidate.variant, &candidate.location, artifact, lease, params)
    }
}
