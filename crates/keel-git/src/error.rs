//! Git protocol error types.

use keel_storage::{ObjectId, StorageError};
use std::io;
use thiserror::Error;

/// Errors that can occur during git protocol operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// Invalid pack file format.
    #[error("invalid pack file: {0}")]
    InvalidPack(String),

    /// The pack trailer does not match the bytes received.
    #[error("pack checksum mismatch: trailer {expected}, computed {actual}")]
    PackChecksumMismatch {
        /// Checksum carried in the trailer.
        expected: String,
        /// Checksum of the bytes actually read.
        actual: String,
    },

    /// A delta chain loops back on itself or exceeds the depth bound.
    #[error("delta cycle: {0}")]
    DeltaCycle(String),

    /// A ref-delta names a base that is neither in the pack nor in the store.
    #[error("missing delta base {0}")]
    MissingDeltaBase(ObjectId),

    /// Delta instructions are malformed.
    #[error("invalid delta: {0}")]
    InvalidDelta(String),

    /// Invalid pkt-line format.
    #[error("invalid pkt-line: {0}")]
    InvalidPktLine(String),

    /// The client asked for an object we do not have.
    #[error("not our ref {0}")]
    UnknownWant(ObjectId),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer sent an `ERR` packet.
    #[error("remote error: {0}")]
    RemoteError(String),

    /// The transport stopped delivering data within the allowed time.
    #[error("timed out waiting for the peer")]
    Timeout,

    /// The peer closed the connection mid-conversation.
    #[error("peer disconnected")]
    Disconnect,

    /// Storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for GitError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => Self::Disconnect,
            _ => Self::Io(e),
        }
    }
}

impl GitError {
    /// Returns true when the peer is gone and nothing more can be sent.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Timeout | Self::Disconnect)
    }
}
