//! CLI error types

use kiln_runtime::{CatalogError, ConfigError};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Variant manifest error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Build of variant '{variant}' failed ({status})")]
    BuildFailed { variant: String, status: String },

    #[error("Build produced no artifact at {0}")]
    MissingArtifact(std::path::PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
