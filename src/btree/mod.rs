//! The copy-on-write B+ tree: construction, value lifecycle, and the
//! public operation surface.
//!
//! Every operation takes a root block address and returns a (possibly new)
//! root reflecting any copy-on-write. Roots are plain block addresses, so
//! snapshotting a tree is `inc_ref(root)` plus remembering the address —
//! the engine shadows shared nodes lazily as each tree diverges.

use std::sync::Arc;

use crate::store::BlockStore;
use crate::types::{BlockId, CopseError, Result};

mod cursor;
mod del;
mod insert;
mod lookup;
mod node;
mod spine;
mod stats;


pub use cursor::Cursor;
pub use stats::{BTreeStats, BTreeStatsSnapshot};

use node::{calc_max_entries, NodeMut, NODE_HEADER_LEN};

/// Lifecycle hooks for the values stored in a tree.
///
/// Values are opaque fixed-size byte strings. Trees whose values reference
/// other managed objects (nested tree roots, refcounted data blocks)
/// implement `inc`/`dec` so the engine can maintain those references when
/// nodes are shadowed, overwritten, or destroyed.
pub trait ValueType: Send + Sync {
    /// Number of bytes each value occupies in a leaf entry.
    fn size(&self) -> usize;

    /// Takes an extra reference to every value in `values`, a packed array
    /// of [`ValueType::size`]-byte entries. Called when a shadow copies a
    /// leaf. The default does nothing.
    fn inc(&self, values: &[u8]) -> Result<()> {
        let _ = values;
        Ok(())
    }

    /// Releases one reference to every value in `values`, a packed array of
    /// [`ValueType::size`]-byte entries. Called on overwrite and tree
    /// deletion. The default does nothing.
    fn dec(&self, values: &[u8]) -> Result<()> {
        let _ = values;
        Ok(())
    }

    /// Whether two encoded values are interchangeable. Overwriting a value
    /// with an equal one skips the `dec` of the old value. Defaults to byte
    /// equality.
    fn equal(&self, a: &[u8], b: &[u8]) -> bool {
        a == b
    }
}

/// Stock [`ValueType`] for values with no external references.
pub struct PlainValue {
    size: usize,
}

impl PlainValue {
    /// A plain value type of `size` bytes per value.
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl ValueType for PlainValue {
    fn size(&self) -> usize {
        self.size
    }
}

/// Value type for the outer levels of composite-key trees: each value is
/// the block address of a nested subtree root, and references are tracked
/// through the store's block counts.
pub(crate) struct SubtreeValueType<'a> {
    store: &'a dyn BlockStore,
}

impl<'a> SubtreeValueType<'a> {
    pub(crate) fn new(store: &'a dyn BlockStore) -> Self {
        Self { store }
    }
}

impl ValueType for SubtreeValueType<'_> {
    fn size(&self) -> usize {
        8
    }

    fn inc(&self, values: &[u8]) -> Result<()> {
        for chunk in values.chunks_exact(8) {
            let root = u64::from_le_bytes(chunk.try_into().expect("chunks are 8 bytes"));
            self.store.inc_ref(BlockId(root))?;
        }
        Ok(())
    }

    fn dec(&self, values: &[u8]) -> Result<()> {
        for chunk in values.chunks_exact(8) {
            let root = u64::from_le_bytes(chunk.try_into().expect("chunks are 8 bytes"));
            self.store.dec_ref(BlockId(root))?;
        }
        Ok(())
    }
}

/// Shape of one tree: how many key levels it has and what its values are.
pub struct TreeInfo {
    /// Number of key components. `1` for a plain tree; `n > 1` encodes an
    /// `n`-tuple key as nested trees.
    pub levels: usize,
    /// Lifecycle and size of the final level's values.
    pub value_type: Arc<dyn ValueType>,
}

/// A copy-on-write B+ tree over a [`BlockStore`].
///
/// The handle itself is stateless between operations; all persistent state
/// lives behind root block addresses. One handle may serve any number of
/// roots that share the same [`TreeInfo`].
pub struct BTree {
    store: Arc<dyn BlockStore>,
    info: TreeInfo,
    stats: Arc<BTreeStats>,
}

impl BTree {
    /// Creates a tree handle, validating that the value geometry fits the
    /// store's block size.
    pub fn new(store: Arc<dyn BlockStore>, info: TreeInfo) -> Result<Self> {
        if info.levels == 0 {
            return Err(CopseError::Invalid("tree must have at least one key level"));
        }
        if info.value_type.size() == 0 {
            return Err(CopseError::Invalid("value size must be non-zero"));
        }
        if store.block_size() <= NODE_HEADER_LEN
            || calc_max_entries(8, store.block_size()) < 3
        {
            return Err(CopseError::Invalid("block size too small for btree nodes"));
        }
        if calc_max_entries(info.value_type.size(), store.block_size()) < 3 {
            return Err(CopseError::Invalid("value too large for block size"));
        }
        Ok(Self {
            store,
            info,
            stats: Arc::new(BTreeStats::default()),
        })
    }

    /// Creates an empty tree and returns its root address.
    pub fn empty(&self) -> Result<BlockId> {
        self.empty_subtree(self.leaf_value_size(0))
    }

    /// Live operation counters for this handle.
    pub fn stats(&self) -> Arc<BTreeStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot of the current operation counters.
    pub fn stats_snapshot(&self) -> BTreeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Emits the current operation counters to the tracing sink.
    pub fn emit_stats(&self) {
        self.stats.emit_tracing();
    }

    pub(crate) fn store(&self) -> &dyn BlockStore {
        &*self.store
    }

    /// Leaf value size for the tree rooted at key level `level`.
    fn leaf_value_size(&self, level: usize) -> usize {
        if level + 1 == self.info.levels {
            self.info.value_type.size()
        } else {
            8
        }
    }

    /// Allocates a single empty leaf sized for `value_size`-byte values.
    fn empty_subtree(&self, value_size: usize) -> Result<BlockId> {
        let mut block = self.store.new_block()?;
        let max_entries = calc_max_entries(value_size, self.store.block_size());
        NodeMut::of(&mut block).init(0, max_entries, value_size);
        Ok(block.id())
    }

    fn check_key_levels(&self, keys: &[u64]) -> Result<()> {
        if keys.len() != self.info.levels {
            return Err(CopseError::Invalid("key count does not match tree levels"));
        }
        Ok(())
    }
}
