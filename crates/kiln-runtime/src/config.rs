//! Runtime configuration
//!
//! Layered the usual way: built-in defaults, then an optional file (format
//! detected from the extension, `${VAR}` references substituted), then
//! `KILN_`-prefixed environment variables using `__` as the section separator
//! (`KILN_BACKEND__NUM_THREADS=8`).
//!
//! Driver discovery additionally honours the well-known variables
//! `KILN_NVML_LIBRARY`, `KILN_ROCM_SMI_LIBRARY`, `CUDA_PATH` and `ROCM_PATH`
//! when the corresponding setting is not configured explicitly.

use crate::probe::AcceleratorKind;
use config::{Config as Cfg, Environment, File, FileFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Configuration error types
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid config value: {0}")]
    InvalidValue(&'static str),
}

/// Top-level configuration of the backend runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub probe: ProbeConfig,
    pub variants: VariantsConfig,
    pub admission: AdmissionConfig,
    pub backend: BackendConfig,
}

/// Where the capability probe looks for vendor driver libraries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Vendors to probe, in probe order.
    pub vendors: Vec<AcceleratorKind>,

    /// Explicit NVML library, tried before every other candidate.
    pub nvml_library: Option<PathBuf>,

    /// Explicit ROCm SMI library, tried before every other candidate.
    pub rocm_smi_library: Option<PathBuf>,

    /// CUDA installation root; `<root>/lib64` is searched after the explicit library.
    pub cuda_root: Option<PathBuf>,

    /// ROCm installation root; `<root>/lib` is searched after the explicit library.
    pub rocm_root: Option<PathBuf>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            vendors: vec![AcceleratorKind::Cuda, AcceleratorKind::Rocm],
            nvml_library: None,
            rocm_smi_library: None,
            cuda_root: None,
            rocm_root: None,
        }
    }
}

impl ProbeConfig {
    /// Fill unset discovery paths from the well-known environment variables.
    pub fn apply_discovery_env(&mut self) {
        self.apply_discovery(|name| std::env::var_os(name));
    }

    /// Fill unset discovery paths from `lookup`; explicit paths are kept.
    pub fn apply_discovery(&mut self, lookup: impl Fn(&str) -> Option<OsString>) {
        let path = |name: &str| lookup(name).filter(|v| !v.is_empty()).map(PathBuf::from);

        if self.nvml_library.is_none() {
            self.nvml_library = path("KILN_NVML_LIBRARY");
        }
        if self.rocm_smi_library.is_none() {
            self.rocm_smi_library = path("KILN_ROCM_SMI_LIBRARY");
        }
        if self.cuda_root.is_none() {
            self.cuda_root = path("CUDA_PATH");
        }
        if self.rocm_root.is_none() {
            self.rocm_root = path("ROCM_PATH");
        }
    }

    /// A copy with the discovery environment applied.
    pub fn with_discovery_env(&self) -> Self {
        let mut config = self.clone();
        config.apply_discovery_env();
        config
    }
}

/// Location of the variant matrix and its built artifacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VariantsConfig {
    /// Variant manifest (TOML). The built-in matrix is used when unset.
    pub manifest: Option<PathBuf>,

    /// Directory holding one sub-directory of artifacts per variant id.
    pub library_dir: PathBuf,
}

impl Default for VariantsConfig {
    fn default() -> Self {
        Self {
            manifest: None,
            library_dir: PathBuf::from("dist/lib"),
        }
    }
}

/// Which system-memory figure admission compares against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemMemorySource {
    /// Physical RAM installed.
    #[default]
    Total,
    /// RAM available at probe time.
    Available,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Refuse to load models that do not fit. Disable only to overcommit knowingly.
    pub enforce: bool,

    pub system_memory: SystemMemorySource,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enforce: true,
            system_memory: SystemMemorySource::Total,
        }
    }
}

/// Parameters forwarded to the selected backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Restrict dispatch to this variant id (the baseline is still kept as fallback).
    pub backend_override: Option<String>,

    /// Context window in tokens.
    pub num_ctx: u32,

    /// CPU threads; `None` lets the backend decide.
    pub num_threads: Option<usize>,

    /// Layers to offload to the accelerator; `None` offloads as many as fit.
    pub num_gpu_layers: Option<u32>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_override: None,
            num_ctx: 2048,
            num_threads: None,
            num_gpu_layers: None,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration: defaults, then `path` (if any), then environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = Cfg::try_from(&RuntimeConfig::default())
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut builder = Cfg::builder().add_source(defaults);

        if let Some(path) = path {
            let format = detect_format(path)?;
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content);
            builder = builder.add_source(File::from_str(&substituted, format));
        }

        builder = builder.add_source(
            Environment::with_prefix("KILN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("probe.vendors"),
        );

        let mut config: RuntimeConfig = builder
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.probe.apply_discovery_env();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.num_ctx == 0 {
            return Err(ConfigError::InvalidValue("backend.num_ctx must be > 0"));
        }
        if self.backend.num_threads == Some(0) {
            return Err(ConfigError::InvalidValue("backend.num_threads must be > 0"));
        }
        if self.probe.vendors.contains(&AcceleratorKind::None) {
            return Err(ConfigError::InvalidValue(
                "probe.vendors must only list accelerator vendors",
            ));
        }
        Ok(())
    }

    /// Force dispatch onto one variant
    pub fn with_backend_override(mut self, variant: impl Into<String>) -> Self {
        self.backend.backend_override = Some(variant.into());
        self
    }

    pub fn with_library_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.variants.library_dir = dir.into();
        self
    }

    pub fn with_manifest(mut self, manifest: impl Into<PathBuf>) -> Self {
        self.variants.manifest = Some(manifest.into());
        self
    }

    pub fn with_num_threads(mut self, threads: usize) -> Result<Self, ConfigError> {
        if threads == 0 {
            return Err(ConfigError::InvalidValue("backend.num_threads must be > 0"));
        }
        self.backend.num_threads = Some(threads);
        Ok(self)
    }

    pub fn with_num_ctx(mut self, num_ctx: u32) -> Result<Self, ConfigError> {
        if num_ctx == 0 {
            return Err(ConfigError::InvalidValue("backend.num_ctx must be > 0"));
        }
        self.backend.num_ctx = num_ctx;
        Ok(self)
    }

    pub fn without_admission(mut self) -> Self {
        self.admission.enforce = false;
        self
    }
}

/// Detect configuration format from file extension
pub fn detect_format(path: &Path) -> Result<FileFormat, ConfigError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

static BRACED_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var pattern")
});

/// Substitute `${VAR}` references with environment values.
///
/// Unset variables are left untouched so the parse error points at them.
pub fn substitute_env_vars(content: &str) -> String {
    BRACED_VAR
        .replace_all(content, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}
