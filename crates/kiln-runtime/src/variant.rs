//! Backend variant catalog
//!
//! Describes the artifacts produced by the variant matrix: what each one
//! needs from the host, how it ranks, and where it lives on disk. The
//! built-in matrix is compiled in from `variants.toml`; deployments can point
//! `variants.manifest` at their own.

use crate::config::VariantsConfig;
use crate::probe::AcceleratorKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::{Path, PathBuf};

const BUILTIN_MANIFEST: &str = include_str!("../variants.toml");

/// File stem of every engine artifact.
pub const ARTIFACT_STEM: &str = "kiln_engine";

/// Catalog errors
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CatalogError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Variant manifest lists no variants")]
    Empty,

    #[error("Duplicate variant id: {0}")]
    DuplicateId(String),

    #[error("Variant manifest has no baseline variant")]
    NoBaseline,

    #[error("Variant manifest has more than one baseline: {0:?}")]
    MultipleBaselines(Vec<String>),

    #[error("Baseline variant '{id}' requires accelerator {accelerator}")]
    BaselineRequiresAccelerator {
        id: String,
        accelerator: AcceleratorKind,
    },

    #[error("Baseline variant '{id}' requires CPU features {features:?}")]
    BaselineRequiresCpuFeatures { id: String, features: Vec<String> },

    #[error("Unknown variant: {0}")]
    UnknownVariant(String),
}

/// One build of the engine with a fixed capability profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendVariant {
    /// Stable identifier, also the artifact sub-directory name.
    pub id: String,

    /// Accelerator the variant needs; `none` for CPU builds.
    #[serde(default)]
    pub requires: AcceleratorKind,

    /// Higher is preferred.
    #[serde(default)]
    pub rank: i32,

    /// The universal fallback. Exactly one per catalog.
    #[serde(default)]
    pub baseline: bool,

    /// CPU extensions the build assumes; the host must report all of them.
    #[serde(default)]
    pub cpu_features: Vec<String>,

    /// Cargo features enabled on `kiln-engine` for this build.
    #[serde(default)]
    pub features: Vec<String>,

    /// Extra compiler flags for this build.
    #[serde(default)]
    pub rustflags: Vec<String>,

    /// Artifact path, relative to the library directory unless absolute.
    /// Defaults to `<id>/<platform library name>`.
    #[serde(default)]
    pub artifact: Option<PathBuf>,
}

impl BackendVariant {
    /// Where the artifact of this variant is expected under `library_dir`.
    pub fn location(&self, library_dir: &Path) -> PathBuf {
        match &self.artifact {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => library_dir.join(path),
            None => library_dir.join(&self.id).join(artifact_file_name()),
        }
    }
}

/// Platform file name of an engine artifact, e.g. `libkiln_engine.so`.
pub fn artifact_file_name() -> String {
    format!("{DLL_PREFIX}{ARTIFACT_STEM}{DLL_SUFFIX}")
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(rename = "variant", default)]
    variants: Vec<BackendVariant>,
}

/// Validated set of variants, in declaration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantCatalog {
    variants: Vec<BackendVariant>,
    baseline: usize,
}

impl VariantCatalog {
    /// Validate a list of variants into a catalog.
    pub fn new(variants: Vec<BackendVariant>) -> Result<Self, CatalogError> {
        if variants.is_empty() {
            return Err(CatalogError::Empty);
        }

        let mut seen = HashSet::new();
        for variant in &variants {
            if !seen.insert(variant.id.as_str()) {
                return Err(CatalogError::DuplicateId(variant.id.clone()));
            }
        }

        let baselines: Vec<usize> = variants
            .iter()
            .enumerate()
            .filter(|(_, v)| v.baseline)
            .map(|(i, _)| i)
            .collect();
        let baseline = match baselines.as_slice() {
            [] => return Err(CatalogError::NoBaseline),
            [index] => *index,
            _ => {
                return Err(CatalogError::MultipleBaselines(
                    baselines.iter().map(|&i| variants[i].id.clone()).collect(),
                ));
            }
        };

        let base = &variants[baseline];
        if base.requires != AcceleratorKind::None {
            return Err(CatalogError::BaselineRequiresAccelerator {
                id: base.id.clone(),
                accelerator: base.requires,
            });
        }
        if !base.cpu_features.is_empty() {
            return Err(CatalogError::BaselineRequiresCpuFeatures {
                id: base.id.clone(),
                features: base.cpu_features.clone(),
            });
        }

        Ok(Self { variants, baseline })
    }

    /// The matrix shipped with this release.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_toml(BUILTIN_MANIFEST)
    }

    pub fn from_toml(content: &str) -> Result<Self, CatalogError> {
        let manifest: Manifest = toml::from_str(content)?;
        Self::new(manifest.variants)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Catalog named by the configuration, or the built-in one.
    pub fn load(config: &VariantsConfig) -> Result<Self, CatalogError> {
        match &config.manifest {
            Some(path) => Self::from_file(path),
            None => Self::builtin(),
        }
    }

    pub fn variants(&self) -> &[BackendVariant] {
        &self.variants
    }

    pub fn get(&self, id: &str) -> Option<&BackendVariant> {
        self.variants.iter().find(|v| v.id == id)
    }

    /// Look up a variant that must exist.
    pub fn require(&self, id: &str) -> Result<&BackendVariant, CatalogError> {
        self.get(id)
            .ok_or_else(|| CatalogError::UnknownVariant(id.to_string()))
    }

    pub fn baseline(&self) -> &BackendVariant {
        &self.variants[self.baseline]
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}
