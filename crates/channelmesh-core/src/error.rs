//! Error types for channelmesh

use thiserror::Error;

/// Main error type for channelmesh operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// A drive or bee key failed the 64-hex-character format check
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Network-related error (endpoint, topic join, dialing)
    #[error("Network error: {0}")]
    Network(String),

    /// Send attempted on a protocol channel whose connection is gone
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// An encoded frame exceeds the connection's frame limit
    #[error("Frame too large: {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// The local search engine failed
    #[error("Search error: {0}")]
    Search(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}

/// Result type alias using MeshError
pub type MeshResult<T> = Result<T, MeshError>;
