//! Loading real shared objects through `DynamicLoader`.
//!
//! The engine artifact is the `kiln-engine` cdylib from this build; if the
//! build did not leave one behind it is compiled into the test's scratch
//! directory. Broken artifacts are tiny cdylibs compiled with `rustc`.

use kiln_runtime::config::RuntimeConfig;
use kiln_runtime::inventory::{CpuInfo, HardwareInventory, SystemMemory};
use kiln_runtime::variant::{ARTIFACT_STEM, artifact_file_name};
use kiln_runtime::{
    AcceleratorKind, ArtifactLoader, BackendVariant, Dispatcher, DynamicLoader, InferenceBackend,
    LoadError, ModelDescriptor, PredictRequest, VariantCatalog,
};
use sha2::{Digest, Sha256};
use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

const GB: u64 = 1_000_000_000;

fn variant(id: &str) -> BackendVariant {
    BackendVariant {
        id: id.to_string(),
        requires: AcceleratorKind::None,
        rank: 0,
        baseline: true,
        cpu_features: Vec::new(),
        features: Vec::new(),
        rustflags: Vec::new(),
        artifact: None,
    }
}

fn engine_library() -> &'static Path {
    static ENGINE: OnceLock<PathBuf> = OnceLock::new();
    ENGINE.get_or_init(|| built_engine().unwrap_or_else(build_engine))
}

/// Newest engine cdylib next to this test binary, if any.
fn built_engine() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let deps = exe.parent()?;
    let profile = deps.parent()?;
    let hashed_prefix = format!("{DLL_PREFIX}{ARTIFACT_STEM}-");

    let mut found: Vec<PathBuf> = std::fs::read_dir(deps)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            name.starts_with(&hashed_prefix) && name.ends_with(DLL_SUFFIX)
        })
        .collect();
    found.push(profile.join(artifact_file_name()));
    found
        .into_iter()
        .filter(|path| path.is_file())
        .max_by_key(|path| std::fs::metadata(path).and_then(|m| m.modified()).ok())
}

fn build_engine() -> PathBuf {
    let target_dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join("engine");
    let cargo = std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    let status = Command::new(cargo)
        .args(["build", "--lib", "-p", "kiln-engine"])
        .env("CARGO_TARGET_DIR", &target_dir)
        .current_dir(env!("CARGO_MANIFEST_DIR"))
        .status()
        .expect("run cargo");
    assert!(status.success(), "building kiln-engine failed");
    target_dir.join("debug").join(artifact_file_name())
}

/// Compile `source` into a cdylib under `dir`.
fn compile_cdylib(dir: &Path, name: &str, source: &str) -> PathBuf {
    let src = dir.join(format!("{name}.rs"));
    std::fs::write(&src, source).unwrap();
    let out = dir.join(format!("{DLL_PREFIX}{name}{DLL_SUFFIX}"));
    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let status = Command::new(rustc)
        .args(["--edition", "2024", "--crate-type", "cdylib", "--crate-name", name, "-o"])
        .arg(&out)
        .arg(&src)
        .status()
        .expect("run rustc");
    assert!(status.success(), "compiling {name} failed");
    out
}

fn abi_only_library(dir: &Path, name: &str, version: u32) -> PathBuf {
    let source = format!(
        "#[unsafe(no_mangle)]\npub extern \"C\" fn kiln_backend_abi_version() -> u32 {{ {version} }}\n"
    );
    compile_cdylib(dir, name, &source)
}

#[test]
fn engine_artifact_loads_with_info_and_digest() {
    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().join("cpu").join(artifact_file_name());
    std::fs::create_dir_all(location.parent().unwrap()).unwrap();
    std::fs::copy(engine_library(), &location).unwrap();

    let artifact = DynamicLoader::new().load(&variant("cpu"), &location).unwrap();
    assert_eq!(artifact.info().name, "kiln-engine");
    assert!(!artifact.info().version.is_empty());

    let expected = format!("{:x}", Sha256::digest(std::fs::read(&location).unwrap()));
    assert_eq!(artifact.digest(), expected);
    assert_eq!(artifact.digest().len(), 64);
}

#[test]
fn dispatch_loads_engine_from_library_dir() {
    let dir = tempfile::tempdir().unwrap();
    let library_dir = dir.path().join("lib");
    let catalog = VariantCatalog::builtin().unwrap();
    let location = catalog.baseline().location(&library_dir);
    std::fs::create_dir_all(location.parent().unwrap()).unwrap();
    std::fs::copy(engine_library(), &location).unwrap();
    let model = dir.path().join("model.gguf");
    std::fs::write(&model, b"GGUF").unwrap();

    let inventory = HardwareInventory::new(
        SystemMemory {
            total: 64 * GB,
            available: 32 * GB,
        },
        CpuInfo::default(),
    );
    let config = RuntimeConfig::default().with_library_dir(&library_dir);
    let backend = Dispatcher::new(catalog, &config)
        .select(&inventory, &ModelDescriptor::new(&model, "7B", "Q4_0", 32))
        .unwrap();

    assert_eq!(backend.variant_id(), "cpu");
    assert_eq!(backend.digest().len(), 64);
    let mut text = String::new();
    backend
        .predict(&PredictRequest::new("from disk"), &mut |chunk| {
            text.push_str(&chunk.content)
        })
        .unwrap();
    assert_eq!(text, "from disk");
    backend.shutdown().unwrap();
}

#[test]
fn library_without_version_symbol_is_symbol_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let location = compile_cdylib(
        dir.path(),
        "kiln_unrelated",
        "#[unsafe(no_mangle)]\npub extern \"C\" fn unrelated_entry() -> i32 { 7 }\n",
    );

    let err = DynamicLoader::new().load(&variant("cpu"), &location).unwrap_err();
    match err {
        LoadError::SymbolNotFound(message) => {
            assert!(message.starts_with("kiln_backend_abi_version"), "{message}")
        }
        other => panic!("expected SymbolNotFound, got {other:?}"),
    }
}

#[test]
fn version_mismatch_is_reported_before_other_symbols() {
    let dir = tempfile::tempdir().unwrap();
    // Exports only the version symbol, so resolving anything else would fail differently.
    let location = abi_only_library(dir.path(), "kiln_future_abi", kiln_abi::ABI_VERSION + 98);

    let err = DynamicLoader::new().load(&variant("cpu"), &location).unwrap_err();
    match err {
        LoadError::AbiMismatch { expected, actual } => {
            assert_eq!(expected, kiln_abi::ABI_VERSION);
            assert_eq!(actual, kiln_abi::ABI_VERSION + 98);
        }
        other => panic!("expected AbiMismatch, got {other:?}"),
    }
}

#[test]
fn matching_version_with_missing_entry_points_is_symbol_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let location = abi_only_library(dir.path(), "kiln_partial", kiln_abi::ABI_VERSION);

    let err = DynamicLoader::new().load(&variant("cpu"), &location).unwrap_err();
    match err {
        LoadError::SymbolNotFound(message) => {
            assert!(message.starts_with("kiln_backend_info"), "{message}")
        }
        other => panic!("expected SymbolNotFound, got {other:?}"),
    }
}
