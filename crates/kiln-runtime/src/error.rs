//! Top-level runtime errors

use crate::config::ConfigError;
use crate::dispatch::DispatchError;
use crate::estimator::Rejected;
use crate::variant::CatalogError;

/// Everything that can stop [`start`](crate::start) from producing a backend
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Variant catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Model rejected: {0}")]
    Rejected(#[from] Rejected),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
