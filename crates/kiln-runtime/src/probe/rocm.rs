//! ROCm System Management Interface (ROCm SMI) bindings resolved at runtime

use super::{DriverApi, MemoryReport, ProbeError, SymbolSource, resolve_fn};
use std::ffi::{c_char, c_int};

#[cfg(not(windows))]
pub(crate) const LIBRARY_NAMES: &[&str] = &["librocm_smi64.so", "/opt/rocm/lib/librocm_smi64.so"];

#[cfg(windows)]
pub(crate) const LIBRARY_NAMES: &[&str] = &["rocm_smi64.dll", "/opt/rocm/lib/rocm_smi64.dll"];

/// Sub-directory of a ROCm root holding the library.
pub(crate) const ROOT_LIB_DIR: &str = "lib";

const RSMI_STATUS_SUCCESS: c_int = 0;
const RSMI_MEM_TYPE_VRAM: c_int = 0;

pub(crate) const SYM_INIT: &[u8] = b"rsmi_init\0";
pub(crate) const SYM_SHUTDOWN: &[u8] = b"rsmi_shut_down\0";
pub(crate) const SYM_MEMORY_TOTAL: &[u8] = b"rsmi_dev_memory_total_get\0";
pub(crate) const SYM_MEMORY_USAGE: &[u8] = b"rsmi_dev_memory_usage_get\0";
pub(crate) const SYM_VERSION: &[u8] = b"rsmi_version_get\0";

#[repr(C)]
#[derive(Debug)]
pub(crate) struct RsmiVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: *const c_char,
}

type InitFn = unsafe extern "C" fn(init_flags: u64) -> c_int;
type ShutdownFn = unsafe extern "C" fn() -> c_int;
type MemoryFn = unsafe extern "C" fn(device: u32, mem_type: c_int, bytes: *mut u64) -> c_int;
type VersionFn = unsafe extern "C" fn(version: *mut RsmiVersion) -> c_int;

pub(crate) struct RocmApi {
    init: InitFn,
    shutdown: ShutdownFn,
    memory_total: MemoryFn,
    memory_usage: MemoryFn,
    version: VersionFn,
}

impl RocmApi {
    /// Resolve every required symbol; the first missing one fails the whole probe.
    pub(crate) fn resolve(source: &dyn SymbolSource) -> Result<Self, ProbeError> {
        unsafe {
            Ok(Self {
                init: resolve_fn(source, SYM_INIT)?,
                shutdown: resolve_fn(source, SYM_SHUTDOWN)?,
                memory_total: resolve_fn(source, SYM_MEMORY_TOTAL)?,
                memory_usage: resolve_fn(source, SYM_MEMORY_USAGE)?,
                version: resolve_fn(source, SYM_VERSION)?,
            })
        }
    }
}

impl DriverApi for RocmApi {
    fn init(&self) -> Result<(), ProbeError> {
        let status = unsafe { (self.init)(0) };
        if status != RSMI_STATUS_SUCCESS {
            return Err(ProbeError::InitFailed {
                vendor: "AMD",
                status,
            });
        }
        Ok(())
    }

    // Device 0 VRAM; free is derived from total minus used.
    fn memory(&self) -> Result<MemoryReport, ProbeError> {
        let mut total = 0u64;
        let status = unsafe { (self.memory_total)(0, RSMI_MEM_TYPE_VRAM, &mut total) };
        if status != RSMI_STATUS_SUCCESS {
            return Err(ProbeError::QueryFailed {
                query: "rocm total mem",
                status,
            });
        }

        let mut used = 0u64;
        let status = unsafe { (self.memory_usage)(0, RSMI_MEM_TYPE_VRAM, &mut used) };
        if status != RSMI_STATUS_SUCCESS {
            return Err(ProbeError::QueryFailed {
                query: "rocm usage mem",
                status,
            });
        }

        Ok(MemoryReport { total, used })
    }

    fn version(&self) -> Result<String, ProbeError> {
        let mut version = RsmiVersion {
            major: 0,
            minor: 0,
            patch: 0,
            build: std::ptr::null(),
        };
        let status = unsafe { (self.version)(&mut version) };
        if status != RSMI_STATUS_SUCCESS {
            return Err(ProbeError::QueryFailed {
                query: "rocm version",
                status,
            });
        }
        Ok(version.major.to_string())
    }

    fn shutdown(&self) {
        unsafe { (self.shutdown)() };
    }
}
