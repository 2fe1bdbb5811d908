//! Core identifier, error, and limit types shared across the engine.

use std::fmt;
use std::io;

use thiserror::Error;

/// Address of one fixed-size block within the metadata area.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maximum root-to-leaf path length any traversal will follow.
///
/// A deeper path means the on-disk tree is malformed (or cyclic) and the
/// operation fails with [`CopseError::TooDeep`] instead of looping.
pub const MAX_SPINE_DEPTH: usize = 64;

/// Block size used by [`crate::store::MemoryBlockStore`] unless overridden.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, CopseError>;

/// Errors surfaced by the B+ tree engine.
#[derive(Debug, Error)]
pub enum CopseError {
    /// I/O error from the underlying block store.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The requested key is not present. An expected lookup outcome.
    #[error("key not found")]
    NotFound,
    /// The block store could not allocate a new block.
    #[error("out of metadata space")]
    OutOfSpace,
    /// A node ran out of entry slots where the algorithm guaranteed room.
    #[error("node capacity exceeded: {0}")]
    CapacityExceeded(&'static str),
    /// An on-disk structure violated an invariant the engine relies on.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    /// A caller-supplied argument does not fit the tree's configuration.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A cursor was used in a state that does not permit the operation.
    #[error("cursor misuse: {0}")]
    InvalidState(&'static str),
    /// A traversal exceeded [`MAX_SPINE_DEPTH`].
    #[error("tree exceeds maximum depth")]
    TooDeep,
}
