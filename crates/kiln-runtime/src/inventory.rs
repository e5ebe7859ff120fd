//! Hardware inventory built once at startup
//!
//! The inventory is assembled on the startup path, never mutated afterwards,
//! and handed to the dispatcher by reference. [`global`] offers a process-wide
//! instance for callers that want one; the dispatcher itself works with any
//! inventory, which keeps it testable with synthetic ones.

use crate::config::{ProbeConfig, SystemMemorySource};
use crate::probe::{self, AcceleratorInfo, AcceleratorKind, ProbeFailure};
use serde::Serialize;
use std::sync::OnceLock;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tracing::info;

/// System RAM at probe time, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SystemMemory {
    pub total: u64,
    pub available: u64,
}

impl SystemMemory {
    pub fn bytes(&self, source: SystemMemorySource) -> u64 {
        match source {
            SystemMemorySource::Total => self.total,
            // Some platforms cannot report available memory; fall back to total.
            SystemMemorySource::Available if self.available > 0 => self.available,
            SystemMemorySource::Available => self.total,
        }
    }
}

/// Host CPU capabilities relevant to variant selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CpuInfo {
    pub logical_cores: usize,
    pub brand: String,
    /// SIMD extensions detected at runtime, e.g. `avx2`.
    pub features: Vec<String>,
}

impl CpuInfo {
    pub fn supports(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    pub fn supports_all<S: AsRef<str>>(&self, features: &[S]) -> bool {
        features.iter().all(|f| self.supports(f.as_ref()))
    }
}

/// Everything the dispatcher needs to know about the host
#[derive(Debug, Clone, Default, Serialize)]
pub struct HardwareInventory {
    accelerators: Vec<AcceleratorInfo>,
    system: SystemMemory,
    cpu: CpuInfo,
    failures: Vec<ProbeFailure>,
}

impl HardwareInventory {
    /// An inventory with no accelerators.
    pub fn new(system: SystemMemory, cpu: CpuInfo) -> Self {
        Self {
            accelerators: Vec::new(),
            system,
            cpu,
            failures: Vec::new(),
        }
    }

    /// Add an accelerator entry. A second entry for the same kind replaces the first.
    pub fn with_accelerator(mut self, accelerator: AcceleratorInfo) -> Self {
        self.accelerators.retain(|a| a.kind != accelerator.kind);
        self.accelerators.push(accelerator);
        self
    }

    pub fn with_failure(mut self, failure: ProbeFailure) -> Self {
        self.failures.push(failure);
        self
    }

    /// Probe every configured vendor and read system memory and CPU features.
    ///
    /// Runs synchronously; a vendor that cannot be probed is recorded as a
    /// failure and otherwise ignored. Discovery variables (`KILN_NVML_LIBRARY`,
    /// `CUDA_PATH`, ...) fill any driver path `config` leaves unset.
    pub fn detect(config: &ProbeConfig) -> Self {
        let config = config.with_discovery_env();
        let mut inventory = Self::new(detect_system_memory(), detect_cpu());

        for &kind in &config.vendors {
            let result = probe::probe(kind, &config);
            probe::log_outcome(&result);
            inventory = match result {
                Ok(accelerator) => inventory.with_accelerator(accelerator),
                Err(failure) => inventory.with_failure(failure),
            };
        }

        info!(
            accelerators = inventory.accelerators.len(),
            total_ram = inventory.system.total,
            available_ram = inventory.system.available,
            cpu_cores = inventory.cpu.logical_cores,
            cpu_features = ?inventory.cpu.features,
            "hardware inventory ready"
        );
        inventory
    }

    pub fn accelerators(&self) -> &[AcceleratorInfo] {
        &self.accelerators
    }

    pub fn accelerator(&self, kind: AcceleratorKind) -> Option<&AcceleratorInfo> {
        self.accelerators.iter().find(|a| a.kind == kind)
    }

    /// Whether variants requiring `kind` can run here. `None` is always present.
    pub fn has(&self, kind: AcceleratorKind) -> bool {
        kind == AcceleratorKind::None || self.accelerator(kind).is_some()
    }

    pub fn system_memory(&self) -> SystemMemory {
        self.system
    }

    pub fn cpu(&self) -> &CpuInfo {
        &self.cpu
    }

    /// Vendors that were probed but left out, with the reason.
    pub fn failures(&self) -> &[ProbeFailure] {
        &self.failures
    }
}

static GLOBAL: OnceLock<HardwareInventory> = OnceLock::new();

/// Process-wide inventory, detected on first use.
///
/// `config` only matters for the first call; later calls return the same
/// inventory. Driver libraries probed here stay loaded for the process
/// lifetime.
pub fn global(config: &ProbeConfig) -> &'static HardwareInventory {
    GLOBAL.get_or_init(|| HardwareInventory::detect(config))
}

fn detect_system_memory() -> SystemMemory {
    let mut sys =
        System::new_with_specifics(RefreshKind::new().with_memory(MemoryRefreshKind::everything()));
    sys.refresh_memory();
    SystemMemory {
        total: sys.total_memory(),
        available: sys.available_memory(),
    }
}

fn detect_cpu() -> CpuInfo {
    let sys = System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::new()));
    let brand = sys
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .unwrap_or_default();
    let logical_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    CpuInfo {
        logical_cores,
        brand,
        features: detect_cpu_features(),
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn detect_cpu_features() -> Vec<String> {
    let mut features = Vec::new();
    if std::is_x86_feature_detected!("avx") {
        features.push("avx".to_string());
    }
    if std::is_x86_feature_detected!("avx2") {
        features.push("avx2".to_string());
    }
    if std::is_x86_feature_detected!("avx512f") {
        features.push("avx512f".to_string());
    }
    if std::is_x86_feature_detected!("fma") {
        features.push("fma".to_string());
    }
    if std::is_x86_feature_detected!("f16c") {
        features.push("f16c".to_string());
    }
    features
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn detect_cpu_features() -> Vec<String> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeError;

    const GB: u64 = 1_000_000_000;

    #[test]
    fn test_none_is_always_present() {
        let inventory = HardwareInventory::default();
        assert!(inventory.has(AcceleratorKind::None));
        assert!(!inventory.has(AcceleratorKind::Cuda));
    }

    #[test]
    fn test_with_accelerator_replaces_same_kind() {
        let inventory = HardwareInventory::default()
            .with_accelerator(AcceleratorInfo::new(AcceleratorKind::Cuda, 8 * GB, 8 * GB, "1"))
            .with_accelerator(AcceleratorInfo::new(AcceleratorKind::Cuda, 24 * GB, 20 * GB, "2"));
        assert_eq!(inventory.accelerators().len(), 1);
        assert_eq!(
            inventory.accelerator(AcceleratorKind::Cuda).unwrap().free_memory,
            20 * GB
        );
    }

    #[test]
    fn test_available_memory_falls_back_to_total() {
        let memory = SystemMemory {
            total: 16 * GB,
            available: 0,
        };
        assert_eq!(memory.bytes(SystemMemorySource::Available), 16 * GB);
        let memory = SystemMemory {
            total: 16 * GB,
            available: 4 * GB,
        };
        assert_eq!(memory.bytes(SystemMemorySource::Available), 4 * GB);
        assert_eq!(memory.bytes(SystemMemorySource::Total), 16 * GB);
    }

    #[test]
    fn test_cpu_supports_all() {
        let cpu = CpuInfo {
            logical_cores: 8,
            brand: "test".into(),
            features: vec!["avx".into(), "avx2".into()],
        };
        assert!(cpu.supports_all(&["avx", "avx2"]));
        assert!(!cpu.supports_all(&["avx", "avx512f"]));
        assert!(cpu.supports_all::<&str>(&[]));
    }

    #[test]
    fn test_detect_without_vendors_reads_host() {
        let config = ProbeConfig {
            vendors: vec![],
            ..ProbeConfig::default()
        };
        let inventory = HardwareInventory::detect(&config);
        assert!(inventory.accelerators().is_empty());
        assert!(inventory.failures().is_empty());
        assert!(inventory.system_memory().total > 0);
        assert!(inventory.cpu().logical_cores > 0);
    }

    #[test]
    fn test_detect_with_unreachable_driver_records_failure() {
        let config = ProbeConfig {
            vendors: vec![AcceleratorKind::Rocm],
            rocm_smi_library: Some("/nonexistent/kiln/librocm_smi64.so".into()),
            ..ProbeConfig::default()
        };
        let inventory = HardwareInventory::detect(&config);
        // A host with ROCm installed still resolves it from the default list.
        if inventory.accelerator(AcceleratorKind::Rocm).is_none() {
            assert_eq!(inventory.failures().len(), 1);
            assert!(matches!(
                inventory.failures()[0].error,
                ProbeError::LibraryNotFound { .. }
                    | ProbeError::SymbolMismatch { .. }
                    | ProbeError::InitFailed { .. }
                    | ProbeError::QueryFailed { .. }
            ));
        }
    }

    #[test]
    fn test_inventory_serializes_without_driver_handles() {
        let inventory = HardwareInventory::new(
            SystemMemory {
                total: 32 * GB,
                available: 30 * GB,
            },
            CpuInfo::default(),
        )
        .with_accelerator(AcceleratorInfo::new(AcceleratorKind::Rocm, 16 * GB, 14 * GB, "6"));
        let json = serde_json::to_value(&inventory).unwrap();
        assert_eq!(json["accelerators"][0]["kind"], "rocm");
        assert_eq!(json["accelerators"][0]["free_memory"], 14 * GB);
        assert!(json["accelerators"][0].get("driver").is_none());
    }

    #[test]
    fn test_inventory_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HardwareInventory>();
    }
}
