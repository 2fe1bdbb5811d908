//! Stateful forward iteration over a tree's leaf entries.
//!
//! A cursor is the one long-lived lock holder in the engine: it keeps a
//! read-locked path from the root to its current leaf until advanced past
//! the end, explicitly ended, or dropped.

use smallvec::SmallVec;

use crate::btree::node::{read_node, NodeRef};
use crate::btree::BTree;
use crate::types::{BlockId, CopseError, Result};

use crate::store::ReadBlock;

/// Maximum path length a cursor will hold locks for.
const CURSOR_MAX_DEPTH: usize = 16;

struct CursorFrame {
    block: ReadBlock,
    index: usize,
}

/// Forward iterator over a tree's entries in ascending key order.
///
/// Holds read locks on its current root-to-leaf path; call
/// [`Cursor::end`] (or drop the cursor) to release them.
pub struct Cursor<'a> {
    tree: &'a BTree,
    prefetch_leaves: bool,
    frames: SmallVec<[CursorFrame; CURSOR_MAX_DEPTH]>,
}

impl BTree {
    /// Opens a cursor positioned on the tree's smallest key.
    ///
    /// Internal levels prefetch their children as they are entered; pass
    /// `prefetch_leaves` to also hint leaf values, which is only useful
    /// when those values are block addresses. Fails with
    /// [`CopseError::NotFound`] on an empty tree, retaining no locks.
    pub fn cursor(&self, root: BlockId, prefetch_leaves: bool) -> Result<Cursor<'_>> {
        let mut cursor = Cursor {
            tree: self,
            prefetch_leaves,
            frames: SmallVec::new(),
        };
        cursor.push_node(root)?;
        cursor.find_leaf()?;
        Ok(cursor)
    }
}

impl Cursor<'_> {
    /// Advances to the next entry. [`CopseError::NotFound`] means the
    /// cursor has moved past the last entry and released its locks.
    pub fn next(&mut self) -> Result<()> {
        self.inc_or_backtrack()?;
        self.find_leaf()
    }

    /// Advances `count` times, stopping early at the end of the tree.
    pub fn skip(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.next()?;
        }
        Ok(())
    }

    /// The key and value at the cursor's current position.
    pub fn get_value(&self) -> Result<(u64, &[u8])> {
        let frame = self.frames.last().ok_or(CopseError::NotFound)?;
        let node = NodeRef::new(frame.block.data());
        if node.is_internal() {
            return Err(CopseError::InvalidState("cursor is not positioned on a leaf"));
        }
        if frame.index >= node.entry_count() {
            return Err(CopseError::InvalidState("cursor index out of range"));
        }
        Ok((node.key_at(frame.index), node.value_at(frame.index)))
    }

    /// Releases the cursor's locks. Equivalent to dropping it.
    pub fn end(self) {}

    fn push_node(&mut self, b: BlockId) -> Result<()> {
        if self.frames.len() >= CURSOR_MAX_DEPTH {
            return Err(CopseError::TooDeep);
        }
        let block = self.tree.store.read_lock(b)?;
        let is_internal = read_node(&block)?.is_internal();
        self.frames.push(CursorFrame { block, index: 0 });
        if self.prefetch_leaves || is_internal {
            self.prefetch_values();
        }
        Ok(())
    }

    fn prefetch_values(&self) {
        let frame = self.frames.last().expect("a frame was just pushed");
        let node = NodeRef::new(frame.block.data());
        if node.value_size() != 8 {
            // Only block-address values are worth hinting.
            return;
        }
        for i in 0..node.entry_count() {
            self.tree.store.prefetch(BlockId(node.value_u64(i)));
        }
    }

    /// Steps the deepest unexhausted frame forward, popping exhausted ones.
    fn inc_or_backtrack(&mut self) -> Result<()> {
        loop {
            let Some(frame) = self.frames.last_mut() else {
                return Err(CopseError::NotFound);
            };
            let entry_count = NodeRef::new(frame.block.data()).entry_count();
            frame.index += 1;
            if frame.index < entry_count {
                return Ok(());
            }
            self.frames.pop();
        }
    }

    /// Descends through current child pointers until a leaf is on top.
    fn find_leaf(&mut self) -> Result<()> {
        loop {
            let child = {
                let frame = self.frames.last().ok_or(CopseError::NotFound)?;
                let node = NodeRef::new(frame.block.data());
                if !node.is_internal() {
                    if node.entry_count() == 0 {
                        self.frames.clear();
                        return Err(CopseError::NotFound);
                    }
                    return Ok(());
                }
                node.child_at(frame.index)
            };
            self.push_node(child)?;
        }
    }
}
