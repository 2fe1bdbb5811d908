//! Pure queries: point lookup, successor search, key-range extremes, and
//! leaf-order traversal.

use crate::btree::node::{read_node, NodeRef};
use crate::btree::spine::ReadSpine;
use crate::btree::BTree;
use crate::types::{BlockId, CopseError, Result};

/// Descends one key level, returning the located key and a copy of its
/// value. `value_size` is what the caller expects at the leaves; a node
/// disagreeing with it is treated as corruption.
fn lookup_raw(
    spine: &mut ReadSpine<'_>,
    mut block: BlockId,
    key: u64,
    value_size: usize,
) -> Result<(u64, Vec<u8>)> {
    loop {
        spine.step(block)?;
        let node = NodeRef::of(spine.current());
        let Some(i) = node.lower_bound(key) else {
            return Err(CopseError::NotFound);
        };
        if node.is_internal() {
            block = node.child_at(i);
            continue;
        }
        if node.value_size() != value_size {
            return Err(CopseError::Corruption("leaf value size does not match tree"));
        }
        return Ok((node.key_at(i), node.value_at(i).to_vec()));
    }
}

fn subtree_root(value: &[u8]) -> BlockId {
    BlockId(u64::from_le_bytes(
        value.try_into().expect("subtree pointers are 8 bytes"),
    ))
}

impl BTree {
    /// Looks up the value stored under the composite key `keys`.
    pub fn lookup(&self, root: BlockId, keys: &[u64]) -> Result<Vec<u8>> {
        self.check_key_levels(keys)?;
        let last = self.info.levels - 1;
        let mut spine = ReadSpine::new(self.store());
        let mut block = root;
        for &level_key in &keys[..last] {
            let (rkey, value) = lookup_raw(&mut spine, block, level_key, 8)?;
            if rkey != level_key {
                return Err(CopseError::NotFound);
            }
            block = subtree_root(&value);
        }
        let (rkey, value) = lookup_raw(
            &mut spine,
            block,
            keys[last],
            self.info.value_type.size(),
        )?;
        if rkey != keys[last] {
            return Err(CopseError::NotFound);
        }
        Ok(value)
    }

    /// Finds the smallest key `>=` the target in the final key level, after
    /// exact-matching the outer levels. Returns the located key and value.
    pub fn lookup_next(&self, root: BlockId, keys: &[u64]) -> Result<(u64, Vec<u8>)> {
        self.check_key_levels(keys)?;
        let last = self.info.levels - 1;
        let mut spine = ReadSpine::new(self.store());
        let mut block = root;
        for &level_key in &keys[..last] {
            let (rkey, value) = lookup_raw(&mut spine, block, level_key, 8)?;
            if rkey != level_key {
                return Err(CopseError::NotFound);
            }
            block = subtree_root(&value);
        }
        self.lookup_next_single(block, keys[last])
    }

    fn lookup_next_single(&self, block: BlockId, key: u64) -> Result<(u64, Vec<u8>)> {
        let guard = self.store.read_lock(block)?;
        let node = read_node(&guard)?;
        let nr_entries = node.entry_count();

        if node.is_internal() {
            // All keys above the target still mean child 0 may hold the
            // successor; only an empty node is a miss here.
            let i = node.lower_bound(key).unwrap_or(0);
            if i >= nr_entries {
                return Err(CopseError::NotFound);
            }
            match self.lookup_next_single(node.child_at(i), key) {
                // The successor may sit just past this child's key range.
                Err(CopseError::NotFound) if i + 1 < nr_entries => {
                    self.lookup_next_single(node.child_at(i + 1), key)
                }
                result => result,
            }
        } else {
            let i = node.upper_bound(key);
            if i >= nr_entries {
                return Err(CopseError::NotFound);
            }
            Ok((node.key_at(i), node.value_at(i).to_vec()))
        }
    }

    /// The largest key at each level, following rightmost children.
    ///
    /// Returns one key per level reached; an empty subtree stops the
    /// descent early, so callers must check the length against
    /// [`TreeInfo::levels`](crate::btree::TreeInfo::levels).
    pub fn find_highest_key(&self, root: BlockId) -> Result<Vec<u64>> {
        self.find_key_path(root, true)
    }

    /// The smallest key at each level, following leftmost children.
    ///
    /// Same early-stop contract as [`BTree::find_highest_key`].
    pub fn find_lowest_key(&self, root: BlockId) -> Result<Vec<u64>> {
        self.find_key_path(root, false)
    }

    fn find_key_path(&self, root: BlockId, find_highest: bool) -> Result<Vec<u64>> {
        let mut keys = Vec::with_capacity(self.info.levels);
        let mut spine = ReadSpine::new(self.store());
        let mut block = root;
        for level in 0..self.info.levels {
            let want_next = level + 1 < self.info.levels;
            match find_key_raw(&mut spine, block, find_highest, want_next)? {
                None => break,
                Some((key, next)) => {
                    keys.push(key);
                    if let Some(next) = next {
                        block = next;
                    }
                }
            }
        }
        Ok(keys)
    }

    /// Visits every leaf entry of a single-level tree in key order. An
    /// `Err` from `visit` aborts the traversal and propagates.
    pub fn walk(
        &self,
        root: BlockId,
        mut visit: impl FnMut(u64, &[u8]) -> Result<()>,
    ) -> Result<()> {
        if self.info.levels > 1 {
            return Err(CopseError::Invalid("walk requires a single-level tree"));
        }
        self.walk_node(root, &mut visit)
    }

    fn walk_node<F>(&self, block: BlockId, visit: &mut F) -> Result<()>
    where
        F: FnMut(u64, &[u8]) -> Result<()>,
    {
        let guard = self.store.read_lock(block)?;
        let node = read_node(&guard)?;
        for i in 0..node.entry_count() {
            if node.is_internal() {
                self.walk_node(node.child_at(i), visit)?;
            } else {
                visit(node.key_at(i), node.value_at(i))?;
            }
        }
        Ok(())
    }
}

/// Walks one level toward its extreme key. `Ok(None)` means the subtree is
/// empty.
fn find_key_raw(
    spine: &mut ReadSpine<'_>,
    mut block: BlockId,
    find_highest: bool,
    want_next: bool,
) -> Result<Option<(u64, Option<BlockId>)>> {
    loop {
        spine.step(block)?;
        let node = NodeRef::of(spine.current());
        let nr_entries = node.entry_count();
        if nr_entries == 0 {
            return Ok(None);
        }
        let i = if find_highest { nr_entries - 1 } else { 0 };
        if node.is_internal() {
            block = node.child_at(i);
            continue;
        }
        let next = if want_next {
            Some(BlockId(node.value_u64(i)))
        } else {
            None
        };
        return Ok(Some((node.key_at(i), next)));
    }
}
