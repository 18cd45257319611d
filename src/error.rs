//! Error types for the storage core.

use thiserror::Error;

/// Errors produced by the write engine, the change-feed publisher, and
/// the read paths.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Revision mismatch on a client write (HTTP-style status 409).
    #[error("conflict on document '{id}': revision mismatch")]
    Conflict {
        id: String,
        /// The revision the caller expected, if any was supplied.
        expected: Option<String>,
        /// The revision actually stored.
        actual: String,
    },

    /// `bulkWrite` called with zero rows.
    #[error("bulkWrite requires at least one write row")]
    EmptyBatch,

    /// The categorizer fell through without producing INSERT/UPDATE/DELETE.
    #[error("should not happen: {0}")]
    ShouldNotHappen(String),

    /// Attachment access is always unsupported by this core.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Operation attempted after `close()`.
    #[error("storage instance is closed")]
    Closed,

    /// A malformed revision string was encountered.
    #[error("invalid revision '{0}'")]
    InvalidRevision(String),

    /// The substrate (KV store) reported a failure.
    #[error("substrate error: {0}")]
    Substrate(#[from] anyhow::Error),

    /// A document failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StorageError>;
