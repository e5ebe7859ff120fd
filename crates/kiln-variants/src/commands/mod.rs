//! Command implementations

pub mod build;
pub mod list;
pub mod probe;

use crate::CliError;
use kiln_runtime::{RuntimeConfig, VariantCatalog};
use std::path::Path;

/// Load the runtime configuration, applying the `--manifest` override.
pub fn load_config(path: Option<&Path>, manifest: Option<&Path>) -> Result<RuntimeConfig, CliError> {
    let config = RuntimeConfig::load(path)?;
    Ok(match manifest {
        Some(manifest) => config.with_manifest(manifest),
        None => config,
    })
}

pub fn catalog(config: &RuntimeConfig) -> Result<VariantCatalog, CliError> {
    Ok(VariantCatalog::load(&config.variants)?)
}
