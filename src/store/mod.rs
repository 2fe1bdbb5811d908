//! Block store contract: locked, reference-counted access to fixed-size
//! blocks.
//!
//! The tree never touches physical storage directly. Every read descends
//! through [`BlockStore::read_lock`], and every mutation goes through
//! [`BlockStore::shadow_block`], which copies the block first when its
//! reference count says another tree still points at it. Lock guards unlock
//! on drop, so traversal state unwinds cleanly on every error path.

use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    RawRwLock, RwLock,
};

use crate::types::{BlockId, Result};

mod memory;

pub use memory::MemoryBlockStore;

/// Shared buffer backing one block.
pub type BlockBuf = Arc<RwLock<Box<[u8]>>>;

/// Read guard over one block's contents. Unlocks on drop.
pub struct ReadBlock {
    id: BlockId,
    data: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
}

impl ReadBlock {
    /// Wraps an acquired read guard. Used by [`BlockStore`] implementations.
    pub fn new(id: BlockId, data: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>) -> Self {
        Self { id, data }
    }

    /// Address of the locked block.
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// The block's bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Write guard over one block's contents. Unlocks on drop.
pub struct WriteBlock {
    id: BlockId,
    data: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
}

impl WriteBlock {
    /// Wraps an acquired write guard. Used by [`BlockStore`] implementations.
    pub fn new(id: BlockId, data: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>) -> Self {
        Self { id, data }
    }

    /// Address of the locked block.
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// The block's bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The block's bytes, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Read-locked and shadow (copy-on-write) access to fixed-size blocks,
/// plus the per-block reference counts that drive sharing decisions.
///
/// Implementations own allocation and refcount bookkeeping; the tree only
/// ever sees guards and counts. A production deployment backs this with a
/// transaction manager and space map; [`MemoryBlockStore`] is the stock
/// in-memory implementation.
pub trait BlockStore: Send + Sync {
    /// Size in bytes of every block served by this store.
    fn block_size(&self) -> usize;

    /// Allocates a zeroed block with reference count 1 and write-locks it.
    fn new_block(&self) -> Result<WriteBlock>;

    /// Read-locks an existing block.
    fn read_lock(&self, b: BlockId) -> Result<ReadBlock>;

    /// Write-locks `b` for mutation, copying it first if it is shared.
    ///
    /// Returns the locked (possibly fresh) block and whether a copy was
    /// made. On copy the origin's reference count is decremented and the
    /// copy starts at count 1; the caller is responsible for incrementing
    /// the copied node's children.
    fn shadow_block(&self, b: BlockId) -> Result<(WriteBlock, bool)>;

    /// Current reference count of `b`.
    fn ref_count(&self, b: BlockId) -> Result<u32>;

    /// Increments the reference count of `b`.
    fn inc_ref(&self, b: BlockId) -> Result<()>;

    /// Decrements the reference count of `b`, freeing the block when the
    /// count reaches zero. Returns the new count.
    fn dec_ref(&self, b: BlockId) -> Result<u32>;

    /// Whether more than one reference to `b` exists.
    fn is_shared(&self, b: BlockId) -> Result<bool> {
        Ok(self.ref_count(b)? > 1)
    }

    /// Hints that `b` will be read soon. Advisory; the default does nothing.
    fn prefetch(&self, b: BlockId) {
        let _ = b;
    }
}
