mod did;
mod protocol;
mod rse;
mod tools;

pub use did::*;
pub use protocol::*;
pub use rse::*;
pub use tools::*;

use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("replica not found: {0}")]
    ReplicaNotFound(String),
    #[error("did not found: {0}")]
    DidNotFound(String),
    #[error("rse not found: {0}")]
    RseNotFound(String),
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("did already exists: {0}")]
    DidAlreadyExists(String),
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("resource temporary unavailable: {0}")]
    ResourceTemporaryUnavailable(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("ambiguous: {0}")]
    Ambiguous(String),
    #[error("protocol not supported: {0}")]
    ProtocolNotSupported(String),
    #[error("row locked: {0}")]
    RowLocked(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CatalogError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CatalogError::ReplicaNotFound(_)
                | CatalogError::DidNotFound(_)
                | CatalogError::RseNotFound(_)
        )
    }

    /// Errors a caller may resolve by retrying later without changing the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CatalogError::RowLocked(_) | CatalogError::ResourceTemporaryUnavailable(_)
        )
    }
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

impl From<std::io::Error> for CatalogError {
    fn from(err: std::io::Error) -> Self {
        CatalogError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        CatalogError::InvalidInput(err.to_string())
    }
}

/// Upper bound on container nesting followed by hierarchy walks.
pub const MAX_HIERARCHY_DEPTH: usize = 64;
