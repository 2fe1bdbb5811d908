//! Root-to-leaf traversal helpers.
//!
//! A spine holds at most two locked blocks: the node being visited and its
//! immediate parent (whose child pointer may need patching after a shadow
//! or split). Older ancestors are unlocked as the spine advances, keeping
//! the peak lock count at 2 regardless of tree height.

use tracing::trace;

use crate::btree::node::{NodeMut, NodeRef};
use crate::btree::stats::BTreeStats;
use crate::btree::ValueType;
use crate::store::{BlockStore, ReadBlock, WriteBlock};
use crate::types::{BlockId, CopseError, Result, MAX_SPINE_DEPTH};

/// Read-locked traversal for pure lookups.
pub(crate) struct ReadSpine<'a> {
    store: &'a dyn BlockStore,
    /// Held only to keep the parent locked while its child is examined.
    #[allow(dead_code)]
    parent: Option<ReadBlock>,
    current: Option<ReadBlock>,
    depth: usize,
}

impl<'a> ReadSpine<'a> {
    pub(crate) fn new(store: &'a dyn BlockStore) -> Self {
        Self {
            store,
            parent: None,
            current: None,
            depth: 0,
        }
    }

    /// Descends to `b`, releasing the oldest held lock.
    pub(crate) fn step(&mut self, b: BlockId) -> Result<()> {
        if self.depth >= MAX_SPINE_DEPTH {
            return Err(CopseError::TooDeep);
        }
        let block = self.store.read_lock(b)?;
        NodeRef::of(&block).check()?;
        self.parent = self.current.take();
        self.current = Some(block);
        self.depth += 1;
        Ok(())
    }

    pub(crate) fn current(&self) -> &ReadBlock {
        self.current.as_ref().expect("spine has stepped")
    }
}

/// Shadowing traversal for mutations.
///
/// Each step asks the store to shadow the visited block; when the shadow
/// made a copy, the copied node's children gain a reference
/// ([`inc_children`]). The first shadowed block becomes the operation's
/// new root.
pub(crate) struct ShadowSpine<'a> {
    store: &'a dyn BlockStore,
    stats: &'a BTreeStats,
    root: BlockId,
    parent: Option<WriteBlock>,
    current: Option<WriteBlock>,
    depth: usize,
}

impl<'a> ShadowSpine<'a> {
    pub(crate) fn new(store: &'a dyn BlockStore, stats: &'a BTreeStats) -> Self {
        Self {
            store,
            stats,
            root: BlockId(0),
            parent: None,
            current: None,
            depth: 0,
        }
    }

    /// Shadows `b` and descends to the (possibly fresh) copy.
    pub(crate) fn step(&mut self, b: BlockId, vt: &dyn ValueType) -> Result<()> {
        if self.depth >= MAX_SPINE_DEPTH {
            return Err(CopseError::TooDeep);
        }
        let (block, was_copied) = self.store.shadow_block(b)?;
        NodeRef::new(block.data()).check()?;
        if was_copied {
            inc_children(self.store, NodeRef::new(block.data()), vt)?;
            self.stats.inc_shadow_copies();
            trace!(
                target: "copse::spine",
                origin = %b,
                shadow = %block.id(),
                "copied shared node before mutation"
            );
        }
        if self.depth == 0 {
            self.root = block.id();
        }
        self.parent = self.current.take();
        self.current = Some(block);
        self.depth += 1;
        Ok(())
    }

    /// Root address after shadowing; valid once a step has been taken.
    pub(crate) fn root(&self) -> BlockId {
        self.root
    }

    pub(crate) fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    pub(crate) fn current(&self) -> &WriteBlock {
        self.current.as_ref().expect("spine has stepped")
    }

    pub(crate) fn current_mut(&mut self) -> &mut WriteBlock {
        self.current.as_mut().expect("spine has stepped")
    }

    pub(crate) fn parent_mut(&mut self) -> &mut WriteBlock {
        self.parent.as_mut().expect("spine has a parent")
    }

    pub(crate) fn parent(&self) -> &WriteBlock {
        self.parent.as_ref().expect("spine has a parent")
    }

    /// Detaches the current node, e.g. so a split can decide which sibling
    /// the spine should continue through.
    pub(crate) fn take_current(&mut self) -> WriteBlock {
        self.current.take().expect("spine has stepped")
    }

    pub(crate) fn set_current(&mut self, block: WriteBlock) {
        self.current = Some(block);
    }

    pub(crate) fn store(&self) -> &'a dyn BlockStore {
        self.store
    }

    pub(crate) fn stats(&self) -> &'a BTreeStats {
        self.stats
    }
}

/// Adds one reference to everything `node` points at: child blocks for an
/// internal node, values (via the tree's [`ValueType`]) for a leaf.
pub(crate) fn inc_children(
    store: &dyn BlockStore,
    node: NodeRef<'_>,
    vt: &dyn ValueType,
) -> Result<()> {
    let count = node.entry_count();
    if node.is_internal() {
        for i in 0..count {
            store.inc_ref(node.child_at(i))?;
        }
    } else {
        vt.inc(node.value_range(0, count))?;
    }
    Ok(())
}

/// Shadows the `index`th child of `parent`, patching the parent's child
/// pointer to the shadow's address. Used when a split or rebalance needs to
/// mutate a sibling.
pub(crate) fn shadow_child(
    store: &dyn BlockStore,
    vt: &dyn ValueType,
    stats: &BTreeStats,
    parent: &mut WriteBlock,
    index: usize,
) -> Result<WriteBlock> {
    let child = NodeRef::new(parent.data()).child_at(index);
    let (block, was_copied) = store.shadow_block(child)?;
    {
        let node = NodeRef::new(block.data());
        node.check()?;
        if was_copied {
            inc_children(store, node, vt)?;
            stats.inc_shadow_copies();
        }
    }
    NodeMut::of(parent).set_child(index, block.id());
    Ok(block)
}
