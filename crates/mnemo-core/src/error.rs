//! Engine error type
//!
//! Coordinator-level errors. Provider failures are caught at the coordinator
//! boundaries and degrade to soft outcomes wherever the contract allows;
//! what escapes here maps onto the HTTP error taxonomy in the server crate.

use crate::providers::ProviderError;
use crate::search::{KeywordIndexError, VectorIndexError};
use crate::storage::StorageError;

/// Engine error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Document store failure
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Vector index failure
    #[error(transparent)]
    Vector(#[from] VectorIndexError),
    /// Inverted index failure
    #[error(transparent)]
    Keyword(#[from] KeywordIndexError),
    /// Provider failure that could not be absorbed
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Caller-supplied arguments are invalid (HTTP 400)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// Referenced entity does not exist (HTTP 404)
    #[error("Not found: {0}")]
    NotFound(String),
    /// A field failed domain validation (HTTP 400)
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
    /// The episode record could not be written during sync
    #[error("Sync failed: {0}")]
    SyncFailed(String),
}

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;
