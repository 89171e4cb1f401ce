//! Storage error types.

use crate::ObjectId;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested object does not exist.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// An object id could not be parsed.
    #[error("invalid object id: {0}")]
    InvalidObjectId(String),

    /// An object's encoding is invalid.
    #[error("malformed object: {0}")]
    MalformedObject(String),

    /// Compressing or inflating a loose object failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// The requested reference does not exist.
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// A reference name or value is invalid.
    #[error("invalid ref: {0}")]
    InvalidRef(String),

    /// A compare-and-swap ref update observed a different current value.
    #[error(
        "ref update conflict on {name}: expected {}, found {}",
        display_opt(.expected),
        display_opt(.actual)
    )]
    RefUpdateConflict {
        /// The ref being updated.
        name: String,
        /// The value the caller expected.
        expected: Option<ObjectId>,
        /// The value actually stored.
        actual: Option<ObjectId>,
    },

    /// An object graph references an object that is not stored.
    #[error("incomplete object graph: missing {missing}")]
    IncompleteObjectGraph {
        /// The first missing object encountered.
        missing: ObjectId,
    },
}

fn display_opt(id: &Option<ObjectId>) -> String {
    match id {
        Some(id) => id.to_hex(),
        None => "absent".to_string(),
    }
}
