//! Error types for the sync layer.

use crate::types::{DocRef, Version};
use thiserror::Error;

/// Main error type for sync operations.
///
/// Every public operation resolves to one of these variants. Callers that
/// only need a coarse classification should match on [`SyncError::kind`].
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SyncError {
    #[error("Document not found: {0}")]
    NotFound(DocRef),

    #[error("Document already exists: {0}")]
    AlreadyExists(DocRef),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Composite field was modified concurrently and the retry budget ran out.
    #[error("Concurrent modification of {doc}.{field} (last seen {seen:?})")]
    Conflict {
        doc: DocRef,
        field: String,
        seen: Version,
    },

    /// Version precondition failed at the store.
    #[error("Version mismatch on {doc}: expected {expected:?}, found {found:?}")]
    VersionMismatch {
        doc: DocRef,
        expected: Version,
        found: Version,
    },

    /// The store cannot serve this filter/order combination.
    #[error("Query unsupported: {0}")]
    QueryUnsupported(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Coarse error classification exposed to consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    Conflict,
    QueryUnsupported,
    Unavailable,
    InvalidArgument,
    Unknown,
}

impl SyncError {
    /// Project onto the consumer-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            SyncError::Conflict { .. }
            | SyncError::VersionMismatch { .. }
            | SyncError::AlreadyExists(_) => ErrorKind::Conflict,
            SyncError::QueryUnsupported(_) => ErrorKind::QueryUnsupported,
            SyncError::Unavailable(_) => ErrorKind::Unavailable,
            SyncError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            SyncError::Serialization(_) | SyncError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Transient failures that the retry policy may reattempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Unavailable(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
