//! NVIDIA management library (NVML) bindings resolved at runtime

use super::{DriverApi, MemoryReport, ProbeError, SymbolSource, resolve_fn};
use std::ffi::{CStr, c_char, c_int, c_uint, c_void};

#[cfg(not(windows))]
pub(crate) const LIBRARY_NAMES: &[&str] = &[
    "libnvidia-ml.so",
    "libnvidia-ml.so.1",
    "/usr/lib/x86_64-linux-gnu/libnvidia-ml.so.1",
    "/usr/lib/wsl/lib/libnvidia-ml.so.1",
    "/usr/local/cuda/lib64/libnvidia-ml.so",
];

#[cfg(windows)]
pub(crate) const LIBRARY_NAMES: &[&str] = &[
    "nvml.dll",
    "C:\\Program Files\\NVIDIA Corporation\\NVSMI\\nvml.dll",
];

/// Sub-directory of a CUDA root holding the library.
pub(crate) const ROOT_LIB_DIR: &str = if cfg!(windows) { "bin" } else { "lib64" };

const NVML_SUCCESS: c_int = 0;
const VERSION_BUFFER_LEN: usize = 80;

pub(crate) const SYM_INIT: &[u8] = b"nvmlInit_v2\0";
pub(crate) const SYM_SHUTDOWN: &[u8] = b"nvmlShutdown\0";
pub(crate) const SYM_DEVICE_BY_INDEX: &[u8] = b"nvmlDeviceGetHandleByIndex_v2\0";
pub(crate) const SYM_MEMORY_INFO: &[u8] = b"nvmlDeviceGetMemoryInfo\0";
pub(crate) const SYM_DRIVER_VERSION: &[u8] = b"nvmlSystemGetDriverVersion\0";

type NvmlDevice = *mut c_void;

#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct NvmlMemory {
    pub total: u64,
    pub free: u64,
    pub used: u64,
}

type InitFn = unsafe extern "C" fn() -> c_int;
type ShutdownFn = unsafe extern "C" fn() -> c_int;
type DeviceByIndexFn = unsafe extern "C" fn(index: c_uint, device: *mut NvmlDevice) -> c_int;
type MemoryInfoFn = unsafe extern "C" fn(device: NvmlDevice, memory: *mut NvmlMemory) -> c_int;
type DriverVersionFn = unsafe extern "C" fn(version: *mut c_char, length: c_uint) -> c_int;

pub(crate) struct NvmlApi {
    init: InitFn,
    shutdown: ShutdownFn,
    device_by_index: DeviceByIndexFn,
    memory_info: MemoryInfoFn,
    driver_version: DriverVersionFn,
}

impl NvmlApi {
    /// Resolve every required symbol; the first missing one fails the whole probe.
    pub(crate) fn resolve(source: &dyn SymbolSource) -> Result<Self, ProbeError> {
        unsafe {
            Ok(Self {
                init: resolve_fn(source, SYM_INIT)?,
                shutdown: resolve_fn(source, SYM_SHUTDOWN)?,
                device_by_index: resolve_fn(source, SYM_DEVICE_BY_INDEX)?,
                memory_info: resolve_fn(source, SYM_MEMORY_INFO)?,
                driver_version: resolve_fn(source, SYM_DRIVER_VERSION)?,
            })
        }
    }
}

impl DriverApi for NvmlApi {
    fn init(&self) -> Result<(), ProbeError> {
        let status = unsafe { (self.init)() };
        if status != NVML_SUCCESS {
            return Err(ProbeError::InitFailed {
                vendor: "NVIDIA",
                status,
            });
        }
        Ok(())
    }

    // Device 0 only; multi-GPU placement belongs to the engine.
    fn memory(&self) -> Result<MemoryReport, ProbeError> {
        let mut device: NvmlDevice = std::ptr::null_mut();
        let status = unsafe { (self.device_by_index)(0, &mut device) };
        if status != NVML_SUCCESS {
            return Err(ProbeError::QueryFailed {
                query: "nvml device",
                status,
            });
        }

        let mut memory = NvmlMemory::default();
        let status = unsafe { (self.memory_info)(device, &mut memory) };
        if status != NVML_SUCCESS {
            return Err(ProbeError::QueryFailed {
                query: "nvml memory",
                status,
            });
        }

        Ok(MemoryReport {
            total: memory.total,
            used: memory.used,
        })
    }

    fn version(&self) -> Result<String, ProbeError> {
        let mut buffer = [0 as c_char; VERSION_BUFFER_LEN];
        let status = unsafe { (self.driver_version)(buffer.as_mut_ptr(), VERSION_BUFFER_LEN as c_uint) };
        if status != NVML_SUCCESS {
            return Err(ProbeError::QueryFailed {
                query: "nvml driver version",
                status,
            });
        }
        buffer[VERSION_BUFFER_LEN - 1] = 0;
        let version = unsafe { CStr::from_ptr(buffer.as_ptr()) };
        Ok(version.to_string_lossy().into_owned())
    }

    fn shutdown(&self) {
        unsafe { (self.shutdown)() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::testing::FakeLibrary;
    use crate::probe::{AcceleratorKind, probe_source};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const GIB: u64 = 1024 * 1024 * 1024;

    unsafe extern "C" fn init_ok() -> c_int {
        NVML_SUCCESS
    }

    unsafe extern "C" fn init_fail() -> c_int {
        9
    }

    unsafe extern "C" fn shutdown() -> c_int {
        NVML_SUCCESS
    }

    unsafe extern "C" fn device_by_index(_index: c_uint, device: *mut NvmlDevice) -> c_int {
        unsafe { *device = 0x1 as NvmlDevice };
        NVML_SUCCESS
    }

    unsafe extern "C" fn memory_info(_device: NvmlDevice, memory: *mut NvmlMemory) -> c_int {
        unsafe {
            (*memory).total = 24 * GIB;
            (*memory).used = 4 * GIB;
            (*memory).free = 20 * GIB;
        }
        NVML_SUCCESS
    }

    unsafe extern "C" fn memory_info_fail(_device: NvmlDevice, _memory: *mut NvmlMemory) -> c_int {
        999
    }

    unsafe extern "C" fn driver_version(version: *mut c_char, length: c_uint) -> c_int {
        let text = b"535.104.05\0";
        assert!(text.len() <= length as usize);
        unsafe { std::ptr::copy_nonoverlapping(text.as_ptr() as *const c_char, version, text.len()) };
        NVML_SUCCESS
    }

    fn full_library() -> FakeLibrary {
        FakeLibrary::default()
            .with(SYM_INIT, init_ok as *const c_void)
            .with(SYM_SHUTDOWN, shutdown as *const c_void)
            .with(SYM_DEVICE_BY_INDEX, device_by_index as *const c_void)
            .with(SYM_MEMORY_INFO, memory_info as *const c_void)
            .with(SYM_DRIVER_VERSION, driver_version as *const c_void)
    }

    #[test]
    fn test_full_library_produces_accelerator() {
        let info = probe_source(AcceleratorKind::Cuda, Arc::new(full_library()), "fake-nvml").unwrap();
        assert_eq!(info.kind, AcceleratorKind::Cuda);
        assert_eq!(info.total_memory, 24 * GIB);
        assert_eq!(info.free_memory, 20 * GIB);
        assert_eq!(info.driver_version, "535.104.05");
        assert_eq!(info.library, "fake-nvml");
        assert!(info.driver().is_some());
    }

    #[test]
    fn test_each_missing_symbol_yields_unavailable() {
        for symbol in [
            SYM_INIT,
            SYM_SHUTDOWN,
            SYM_DEVICE_BY_INDEX,
            SYM_MEMORY_INFO,
            SYM_DRIVER_VERSION,
        ] {
            let library = full_library().without(symbol);
            let failure = probe_source(AcceleratorKind::Cuda, Arc::new(library), "fake").unwrap_err();
            match failure.error {
                ProbeError::SymbolMismatch { symbol: name, .. } => {
                    assert_eq!(name.as_bytes(), &symbol[..symbol.len() - 1]);
                }
                other => panic!("expected symbol mismatch, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_init_failure_yields_unavailable() {
        let library = full_library().with(SYM_INIT, init_fail as *const c_void);
        let failure = probe_source(AcceleratorKind::Cuda, Arc::new(library), "fake").unwrap_err();
        assert_eq!(
            failure.error,
            ProbeError::InitFailed {
                vendor: "NVIDIA",
                status: 9
            }
        );
    }

    #[test]
    fn test_memory_failure_shuts_driver_down() {
        static SHUT_DOWN: AtomicUsize = AtomicUsize::new(0);
        unsafe extern "C" fn counting_shutdown() -> c_int {
            SHUT_DOWN.fetch_add(1, Ordering::SeqCst);
            NVML_SUCCESS
        }

        let library = full_library()
            .with(SYM_SHUTDOWN, counting_shutdown as *const c_void)
            .with(SYM_MEMORY_INFO, memory_info_fail as *const c_void);
        let failure = probe_source(AcceleratorKind::Cuda, Arc::new(library), "fake").unwrap_err();
        assert!(matches!(failure.error, ProbeError::QueryFailed { status: 999, .. }));
        assert_eq!(SHUT_DOWN.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_driver_shut_down_once_after_last_clone() {
        static SHUT_DOWN: AtomicUsize = AtomicUsize::new(0);
        unsafe extern "C" fn counting_shutdown() -> c_int {
            SHUT_DOWN.fetch_add(1, Ordering::SeqCst);
            NVML_SUCCESS
        }

        let library = full_library().with(SYM_SHUTDOWN, counting_shutdown as *const c_void);
        let info = probe_source(AcceleratorKind::Cuda, Arc::new(library), "fake-nvml").unwrap();
        let copy = info.clone();
        assert_eq!(SHUT_DOWN.load(Ordering::SeqCst), 0);

        drop(info);
        assert_eq!(SHUT_DOWN.load(Ordering::SeqCst), 0);
        assert_eq!(copy.driver().unwrap().origin(), "fake-nvml");

        drop(copy);
        assert_eq!(SHUT_DOWN.load(Ordering::SeqCst), 1);
    }
}
