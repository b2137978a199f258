//! Error types for depguard-state

use thiserror::Error;

/// Errors surfaced by the persistence seam.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A record with the same uniqueness key already exists.
    #[error("remediation record already exists: {key}")]
    Conflict { key: String },

    /// A lock guarding in-memory state was poisoned.
    #[error("storage lock poisoned: {0}")]
    Poisoned(String),

    /// Backend failure (connection, query, decoding).
    #[error("storage backend failed: {0}")]
    Backend(String),
}
