//! Memory estimator: pre-flight admission for a model on a memory pool
//!
//! The requirement is a coarse class table keyed by the declared parameter
//! size, scaled up for unquantized wide floating-point files. It is a gate,
//! not a profiler: a model that passes can still run short, but a model that
//! fails would certainly not have loaded.

use crate::config::SystemMemorySource;
use crate::inventory::HardwareInventory;
use crate::probe::AcceleratorKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// One decimal gigabyte.
pub const GIGABYTE: u64 = 1_000_000_000;

/// Model description as decoded from the model file
///
/// Passed through unchanged to the selected backend's init entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub model_path: PathBuf,
    /// Declared parameter-size class, e.g. `7B`.
    pub size_class: String,
    /// Quantization or file type, e.g. `Q4_0` or `F16`.
    pub file_type: String,
    pub num_layers: u32,
    #[serde(default)]
    pub adapters: Vec<PathBuf>,
    #[serde(default)]
    pub projectors: Vec<PathBuf>,
}

impl ModelDescriptor {
    pub fn new(
        model_path: impl Into<PathBuf>,
        size_class: impl Into<String>,
        file_type: impl Into<String>,
        num_layers: u32,
    ) -> Self {
        Self {
            model_path: model_path.into(),
            size_class: size_class.into(),
            file_type: file_type.into(),
            num_layers,
            adapters: Vec::new(),
            projectors: Vec::new(),
        }
    }

    pub fn with_adapter(mut self, adapter: impl Into<PathBuf>) -> Self {
        self.adapters.push(adapter.into());
        self
    }

    pub fn with_projector(mut self, projector: impl Into<PathBuf>) -> Self {
        self.projectors.push(projector.into());
        self
    }
}

/// Storage format of the weights, as far as memory is concerned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    F32,
    F16,
    BF16,
    /// Any packed or quantized format (`Q4_0`, `Q8_0`, ...).
    Quantized(String),
}

impl FileType {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "F32" => FileType::F32,
            "F16" => FileType::F16,
            "BF16" => FileType::BF16,
            other => FileType::Quantized(other.to_string()),
        }
    }

    /// Whether weights are stored unpacked at 16 bits or more.
    pub fn is_wide(&self) -> bool {
        !matches!(self, FileType::Quantized(_))
    }

    /// Multiplier applied to a size tier's baseline for this format.
    pub fn multiplier(&self, tier_multiplier: u64) -> u64 {
        match self {
            FileType::F32 => tier_multiplier * 2,
            FileType::F16 | FileType::BF16 => tier_multiplier,
            FileType::Quantized(_) => 1,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileType::F32 => write!(f, "F32"),
            FileType::F16 => write!(f, "F16"),
            FileType::BF16 => write!(f, "BF16"),
            FileType::Quantized(name) => write!(f, "{name}"),
        }
    }
}

/// Baseline bytes and wide-format multiplier for a parameter-size class.
///
/// Unlisted classes have no baseline and are always admitted.
pub fn size_class_baseline(size_class: &str) -> (u64, u64) {
    match size_class.trim().to_ascii_uppercase().as_str() {
        "3B" | "7B" => (8 * GIGABYTE, 2),
        "13B" => (16 * GIGABYTE, 2),
        "30B" | "34B" | "40B" => (32 * GIGABYTE, 2),
        "47B" => (48 * GIGABYTE, 2),
        "65B" | "70B" => (64 * GIGABYTE, 2),
        "180B" => (128 * GIGABYTE, 4),
        _ => (0, 2),
    }
}

/// Memory a model needs before it may be loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelRequirement {
    pub size_class: String,
    pub file_type: FileType,
    pub baseline_bytes: u64,
    /// Format-dependent multiplier applied to the baseline.
    pub multiplier: u64,
    pub required_bytes: u64,
}

impl ModelRequirement {
    pub fn new(size_class: &str, file_type: &str) -> Self {
        let (baseline_bytes, tier_multiplier) = size_class_baseline(size_class);
        let file_type = FileType::parse(file_type);
        let multiplier = file_type.multiplier(tier_multiplier);
        Self {
            size_class: size_class.to_string(),
            baseline_bytes,
            multiplier,
            required_bytes: baseline_bytes.saturating_mul(multiplier),
            file_type,
        }
    }

    pub fn from_descriptor(descriptor: &ModelDescriptor) -> Self {
        Self::new(&descriptor.size_class, &descriptor.file_type)
    }

    /// No baseline is known for this class; every pool admits it.
    pub fn is_unconstrained(&self) -> bool {
        self.required_bytes == 0
    }
}

/// Memory a backend variant would allocate the model from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "pool", content = "accelerator", rename_all = "lowercase")]
pub enum MemoryPool {
    /// Host RAM, used by CPU variants.
    System,
    /// Free VRAM of the given accelerator.
    Accelerator(AcceleratorKind),
}

impl MemoryPool {
    /// Pool a variant requiring `kind` draws from.
    pub fn for_accelerator(kind: AcceleratorKind) -> Self {
        match kind {
            AcceleratorKind::None => MemoryPool::System,
            other => MemoryPool::Accelerator(other),
        }
    }

    /// Bytes this pool offers on `inventory`, or `None` if the pool is absent.
    pub fn available(
        &self,
        inventory: &HardwareInventory,
        source: SystemMemorySource,
    ) -> Option<AvailableMemory> {
        let bytes = match self {
            MemoryPool::System => inventory.system_memory().bytes(source),
            MemoryPool::Accelerator(kind) => inventory.accelerator(*kind)?.free_memory,
        };
        Some(AvailableMemory { pool: *self, bytes })
    }
}

impl fmt::Display for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryPool::System => write!(f, "system memory"),
            MemoryPool::Accelerator(kind) => write!(f, "{kind} memory"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AvailableMemory {
    pub pool: MemoryPool,
    pub bytes: u64,
}

impl AvailableMemory {
    pub fn new(pool: MemoryPool, bytes: u64) -> Self {
        Self { pool, bytes }
    }
}

/// A model refused by admission control
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[error("{reason}")]
pub struct Rejected {
    pub pool: MemoryPool,
    pub required_bytes: u64,
    pub available_bytes: u64,
    pub reason: String,
}

impl Rejected {
    fn new(requirement: &ModelRequirement, available: &AvailableMemory) -> Self {
        let prefix = if requirement.file_type.is_wide() {
            format!("{} ", requirement.file_type)
        } else {
            String::new()
        };
        let shortfall = requirement.required_bytes.saturating_sub(available.bytes);
        let reason = format!(
            "{prefix}model requires at least {} of memory, {} has {} (short by {shortfall} bytes)",
            human_bytes(requirement.required_bytes),
            available.pool,
            human_bytes(available.bytes),
        );
        Self {
            pool: available.pool,
            required_bytes: requirement.required_bytes,
            available_bytes: available.bytes,
            reason,
        }
    }

    pub fn shortfall_bytes(&self) -> u64 {
        self.required_bytes.saturating_sub(self.available_bytes)
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Fits,
    Rejected(Rejected),
}

impl Admission {
    pub fn fits(&self) -> bool {
        matches!(self, Admission::Fits)
    }

    pub fn into_result(self) -> Result<(), Rejected> {
        match self {
            Admission::Fits => Ok(()),
            Admission::Rejected(rejected) => Err(rejected),
        }
    }
}

/// Check `requirement` against one memory pool.
pub fn estimate(requirement: &ModelRequirement, available: &AvailableMemory) -> Admission {
    if requirement.required_bytes > available.bytes {
        Admission::Rejected(Rejected::new(requirement, available))
    } else {
        Admission::Fits
    }
}

/// Render a byte count with decimal units (`16 GB`, `1.5 GB`, `512 MB`).
///
/// The unit is picked after rounding to one decimal, so `999_950_000` is `1.0 GB`.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [(u64, &str); 4] = [
        (1_000_000_000_000, "TB"),
        (GIGABYTE, "GB"),
        (1_000_000, "MB"),
        (1_000, "KB"),
    ];

    for (index, &(scale, unit)) in UNITS.iter().enumerate() {
        if bytes < scale {
            continue;
        }
        if bytes % scale == 0 {
            return format!("{} {unit}", bytes / scale);
        }
        let tenths = round_tenths(bytes, scale);
        if tenths >= 10_000 && index > 0 {
            let (larger, larger_unit) = UNITS[index - 1];
            let tenths = round_tenths(bytes, larger);
            return format!("{}.{} {larger_unit}", tenths / 10, tenths % 10);
        }
        return format!("{}.{} {unit}", tenths / 10, tenths % 10);
    }
    format!("{bytes} B")
}

/// `bytes / scale` in tenths, rounded half up.
fn round_tenths(bytes: u64, scale: u64) -> u128 {
    (u128::from(bytes) * 10 + u128::from(scale) / 2) / u128::from(scale)
}
