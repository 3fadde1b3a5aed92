//! Error types for geoquad.
//!
//! Lookup misses and stale snapshots are expected during normal operation and
//! are absorbed where they happen. Only the variants below that describe a
//! broken invariant or a failed store write ever reach the caller of a
//! mutating operation.

use crate::quadtree::IndexState;
use geoquad_types::record::RecordId;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GeoquadError>;

#[derive(Debug, Error)]
pub enum GeoquadError {
    /// A record could not be resolved, usually because it was deleted after
    /// its snapshot was taken.
    #[error("record not found: {0}")]
    NotFound(RecordId),

    /// A point lies outside the root node's world box.
    #[error("point (x: {x}, y: {y}) lies outside the index bounds")]
    OutOfBounds { x: f64, y: f64 },

    /// A partially built index was found on activation.
    #[error("index {0:#018x} was interrupted while indexing")]
    InterruptedIndex(u64),

    /// A node holds points and children at the same time.
    #[error("capacity invariant violated at node '{0}'")]
    CapacityInvariantViolation(String),

    /// The index is being built and cannot answer queries yet.
    #[error("index is not ready (state: {0})")]
    NotReady(IndexState),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    SerializationErrorWithContext(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid geohash: {0}")]
    InvalidGeohash(String),

    #[error("invalid snapshot file format")]
    InvalidFormat,

    /// The index manager's writer has shut down.
    #[error("index manager is closed")]
    ManagerClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<bincode::Error> for GeoquadError {
    fn from(e: bincode::Error) -> Self {
        GeoquadError::SerializationErrorWithContext(e.to_string())
    }
}

impl From<geohash::GeohashError> for GeoquadError {
    fn from(e: geohash::GeohashError) -> Self {
        GeoquadError::InvalidGeohash(e.to_string())
    }
}
