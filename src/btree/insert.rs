//! Insertion: shadowed descent with preemptive space-making.
//!
//! Every node on the descent path is guaranteed a free slot *before* the
//! descent continues, so a leaf insert never propagates splits back up.
//! Space is made by rebalancing into an unshared sibling when one has room
//! to spare, otherwise by splitting — one node into two at the edges of a
//! parent (which is also the shape sequential workloads hit), or two nodes
//! into three elsewhere for denser packing.

use tracing::trace;

use crate::btree::node::{calc_max_entries, NodeMut, NodeRef, INTERNAL_NODE_FLAG};
use crate::btree::spine::{shadow_child, ShadowSpine};
use crate::btree::{BTree, SubtreeValueType, ValueType};
use crate::store::BlockStore;
use crate::types::{BlockId, CopseError, Result};

/// Minimum free slots a sibling must have for a rebalance to beat a split.
const SPACE_THRESHOLD: usize = 8;

/// Rebalances two nodes so each holds half of their combined entries.
fn redistribute2(left: &mut NodeMut<'_>, right: &mut NodeMut<'_>) {
    let nr_left = left.as_ref().entry_count();
    let nr_right = right.as_ref().entry_count();
    let total = nr_left + nr_right;
    let target_left = total / 2;
    let target_right = total - target_left;

    if nr_left < target_left {
        let delta = target_left - nr_left;
        left.copy_from(nr_left, right.as_ref(), 0, delta);
        right.shift_down(delta);
    } else if nr_left > target_left {
        let delta = nr_left - target_left;
        if nr_right > 0 {
            right.shift_up(delta);
        }
        right.copy_from(0, left.as_ref(), target_left, delta);
    }

    left.set_entry_count(target_left);
    right.set_entry_count(target_right);
}

/// Redistributes entries across three nodes. The center node is empty on
/// entry.
fn redistribute3(left: &mut NodeMut<'_>, center: &mut NodeMut<'_>, right: &mut NodeMut<'_>) {
    let nr_left = left.as_ref().entry_count();
    let nr_right = right.as_ref().entry_count();
    debug_assert_eq!(center.as_ref().entry_count(), 0);

    let total = nr_left + nr_right;
    let target_left = total / 3;
    let target_center = (total - target_left) / 2;
    let target_right = total - target_left - target_center;

    if nr_left < target_left {
        let left_short = target_left - nr_left;
        left.copy_from(nr_left, right.as_ref(), 0, left_short);
        center.copy_from(0, right.as_ref(), left_short, target_center);
        right.shift_down(nr_right - target_right);
    } else if nr_left < target_left + target_center {
        let left_to_center = nr_left - target_left;
        center.copy_from(0, left.as_ref(), target_left, left_to_center);
        center.copy_from(left_to_center, right.as_ref(), 0, target_center - left_to_center);
        right.shift_down(nr_right - target_right);
    } else {
        let right_short = target_right - nr_right;
        right.shift_up(right_short);
        right.copy_from(0, left.as_ref(), nr_left - right_short, right_short);
        center.copy_from(0, left.as_ref(), target_left, target_center);
    }

    left.set_entry_count(target_left);
    center.set_entry_count(target_center);
    right.set_entry_count(target_right);
}

/// Splits the spine's current node by moving half its entries into a fresh
/// sibling linked into the parent. The spine continues through whichever
/// half covers `key`.
fn split_one_into_two(spine: &mut ShadowSpine<'_>, parent_index: usize, key: u64) -> Result<()> {
    let store = spine.store();
    let mut left = spine.take_current();
    let mut right = store.new_block()?;

    {
        let view = NodeRef::new(left.data());
        NodeMut::of(&mut right).init(view.flags(), view.max_entries(), view.value_size());
    }
    {
        let mut ln = NodeMut::of(&mut left);
        let mut rn = NodeMut::of(&mut right);
        redistribute2(&mut ln, &mut rn);
    }

    let right_low = NodeRef::new(right.data()).key_at(0);
    let right_id = right.id();
    NodeMut::of(spine.parent_mut()).insert_at(parent_index + 1, right_low, &right_id.0.to_le_bytes())?;

    if key < right_low {
        spine.set_current(left);
    } else {
        spine.set_current(right);
    }
    spine.stats().inc_splits_one_into_two();
    trace!(target: "copse::insert", sibling = %right_id, "split one node into two");
    Ok(())
}

/// Splits the current node and a shadowed neighbor into three nodes.
/// More work than a plain split, but the fuller nodes save metadata space
/// over repeated insert/delete cycles.
fn split_two_into_three(
    spine: &mut ShadowSpine<'_>,
    parent_index: usize,
    vt: &dyn ValueType,
    key: u64,
) -> Result<()> {
    let store = spine.store();
    let stats = spine.stats();

    let (mut left, mut right, middle_index) = if parent_index == 0 {
        let right = shadow_child(store, vt, stats, spine.parent_mut(), parent_index + 1)?;
        (spine.take_current(), right, 1)
    } else {
        let left = shadow_child(store, vt, stats, spine.parent_mut(), parent_index - 1)?;
        (left, spine.take_current(), parent_index)
    };
    let mut middle = store.new_block()?;

    {
        let view = NodeRef::new(left.data());
        NodeMut::of(&mut middle).init(view.flags(), view.max_entries(), view.value_size());
    }
    {
        let mut ln = NodeMut::of(&mut left);
        let mut mn = NodeMut::of(&mut middle);
        let mut rn = NodeMut::of(&mut right);
        redistribute3(&mut ln, &mut mn, &mut rn);
    }

    let middle_low = NodeRef::new(middle.data()).key_at(0);
    let right_low = NodeRef::new(right.data()).key_at(0);
    let middle_id = middle.id();
    {
        let mut pn = NodeMut::of(spine.parent_mut());
        pn.set_key(middle_index, right_low);
        pn.insert_at(middle_index, middle_low, &middle_id.0.to_le_bytes())?;
    }

    if key < middle_low {
        spine.set_current(left);
    } else if key < right_low {
        spine.set_current(middle);
    } else {
        spine.set_current(right);
    }
    stats.inc_splits_two_into_three();
    Ok(())
}

/// Splits a full root by pushing its entries down into two new children,
/// leaving the root as a 2-entry internal node. Keeps the root's block
/// address stable, so no parent exists to patch.
fn btree_split_beneath(spine: &mut ShadowSpine<'_>) -> Result<()> {
    let store = spine.store();
    let (flags, nr_entries, max_entries, value_size) = {
        let view = NodeRef::new(spine.current().data());
        (
            view.flags(),
            view.entry_count(),
            view.max_entries(),
            view.value_size(),
        )
    };
    let nr_left = nr_entries / 2;
    let nr_right = nr_entries - nr_left;

    let mut left = store.new_block()?;
    {
        let mut ln = NodeMut::of(&mut left);
        ln.init(flags, max_entries, value_size);
        ln.copy_from(0, NodeRef::new(spine.current().data()), 0, nr_left);
        ln.set_entry_count(nr_left);
    }

    let mut right = store.new_block()?;
    {
        let mut rn = NodeMut::of(&mut right);
        rn.init(flags, max_entries, value_size);
        rn.copy_from(0, NodeRef::new(spine.current().data()), nr_left, nr_right);
        rn.set_entry_count(nr_right);
    }

    let left_low = NodeRef::new(left.data()).key_at(0);
    let right_low = NodeRef::new(right.data()).key_at(0);
    let (left_id, right_id) = (left.id(), right.id());
    {
        let mut pn = NodeMut::of(spine.current_mut());
        pn.set_flags(INTERNAL_NODE_FLAG);
        pn.set_max_entries(calc_max_entries(8, store.block_size()));
        pn.set_value_size(8);
        pn.set_entry_count(2);
        pn.set_key(0, left_low);
        pn.set_child(0, left_id);
        pn.set_key(1, right_low);
        pn.set_child(1, right_id);
    }
    spine.stats().inc_splits_beneath();
    Ok(())
}

/// Moves entries into the left sibling (shadowing it first) to make room.
fn rebalance_left(
    spine: &mut ShadowSpine<'_>,
    vt: &dyn ValueType,
    parent_index: usize,
    key: u64,
) -> Result<()> {
    let store = spine.store();
    let stats = spine.stats();
    let mut sib = shadow_child(store, vt, stats, spine.parent_mut(), parent_index - 1)?;
    let mut cur = spine.take_current();

    {
        let mut left = NodeMut::of(&mut sib);
        let mut right = NodeMut::of(&mut cur);
        redistribute2(&mut left, &mut right);
    }
    let pivot = NodeRef::new(cur.data()).key_at(0);
    NodeMut::of(spine.parent_mut()).set_key(parent_index, pivot);

    if key < pivot {
        spine.set_current(sib);
    } else {
        spine.set_current(cur);
    }
    stats.inc_rebalances_left();
    Ok(())
}

/// Moves entries into the right sibling (shadowing it first) to make room.
fn rebalance_right(
    spine: &mut ShadowSpine<'_>,
    vt: &dyn ValueType,
    parent_index: usize,
    key: u64,
) -> Result<()> {
    let store = spine.store();
    let stats = spine.stats();
    let mut sib = shadow_child(store, vt, stats, spine.parent_mut(), parent_index + 1)?;
    let mut cur = spine.take_current();

    {
        let mut left = NodeMut::of(&mut cur);
        let mut right = NodeMut::of(&mut sib);
        redistribute2(&mut left, &mut right);
    }
    let pivot = NodeRef::new(sib.data()).key_at(0);
    NodeMut::of(spine.parent_mut()).set_key(parent_index + 1, pivot);

    if key < pivot {
        spine.set_current(cur);
    } else {
        spine.set_current(sib);
    }
    stats.inc_rebalances_right();
    Ok(())
}

fn node_free_space(store: &dyn BlockStore, b: BlockId) -> Result<usize> {
    let block = store.read_lock(b)?;
    let node = NodeRef::of(&block);
    node.check()?;
    Ok(node.max_entries() - node.entry_count())
}

/// Makes room in the spine's current (full, non-root) node.
///
/// Prefers moving entries to a sibling with at least [`SPACE_THRESHOLD`]
/// free slots — but never a shared one, since breaking sharing costs more
/// space than the move saves. Otherwise splits: 1→2 when the parent has at
/// most two children, the child sits at either edge, or a sibling is
/// shared; 2→3 in the interior.
fn rebalance_or_split(
    spine: &mut ShadowSpine<'_>,
    vt: &dyn ValueType,
    parent_index: usize,
    key: u64,
) -> Result<()> {
    let store = spine.store();
    let (nr_parent, left_b, right_b) = {
        let parent = NodeRef::new(spine.parent().data());
        let nr = parent.entry_count();
        (
            nr,
            (parent_index > 0).then(|| parent.child_at(parent_index - 1)),
            (parent_index + 1 < nr).then(|| parent.child_at(parent_index + 1)),
        )
    };

    let mut left_shared = false;
    if let Some(b) = left_b {
        left_shared = store.is_shared(b)?;
        if !left_shared && node_free_space(store, b)? >= SPACE_THRESHOLD {
            return rebalance_left(spine, vt, parent_index, key);
        }
    }

    let mut right_shared = false;
    if let Some(b) = right_b {
        right_shared = store.is_shared(b)?;
        if !right_shared && node_free_space(store, b)? >= SPACE_THRESHOLD {
            return rebalance_right(spine, vt, parent_index, key);
        }
    }

    if left_shared
        || right_shared
        || nr_parent <= 2
        || parent_index == 0
        || parent_index + 1 == nr_parent
    {
        split_one_into_two(spine, parent_index, key)
    } else {
        split_two_into_three(spine, parent_index, vt, key)
    }
}

fn contains_key(node: NodeRef<'_>, key: u64) -> bool {
    matches!(node.lower_bound(key), Some(i) if node.key_at(i) == key)
}

/// Whether an insert of `key` can proceed through this node without making
/// space first. A full leaf still has room when the key already exists —
/// an overwrite needs no new slot.
fn has_space_for_insert(node: NodeRef<'_>, key: u64) -> bool {
    if node.entry_count() == node.max_entries() {
        if !node.is_internal() {
            return contains_key(node, key);
        }
        return false;
    }
    true
}

fn need_insert(node: NodeRef<'_>, key: u64, index: usize) -> bool {
    index >= node.entry_count() || node.key_at(index) != key
}

/// The structural descent shared by every key level: shadow, make space,
/// locate, repeat. Leaves the spine's current node at the leaf and returns
/// with `index` set to the slot where `key` lives or belongs.
///
/// `index` also carries state *between* levels of a composite insert: on
/// entry it names the parent slot holding the subtree root being descended
/// into, so the first shadow of the new level can patch that slot.
fn btree_insert_raw(
    spine: &mut ShadowSpine<'_>,
    root: BlockId,
    vt: &dyn ValueType,
    key: u64,
    index: &mut Option<usize>,
) -> Result<()> {
    let mut block = root;
    let mut top = true;
    loop {
        spine.step(block, vt)?;

        if spine.has_parent() {
            if let Some(i) = *index {
                let loc = spine.current().id();
                NodeMut::of(spine.parent_mut()).set_child(i, loc);
            }
        }

        if !has_space_for_insert(NodeRef::new(spine.current().data()), key) {
            if top {
                btree_split_beneath(spine)?;
            } else {
                let i = index.expect("non-root nodes have a parent index");
                rebalance_or_split(spine, vt, i, key)?;
            }
            // Making space can swap which node the spine points at.
        }

        let (found, is_internal) = {
            let node = NodeRef::new(spine.current().data());
            (node.lower_bound(key), node.is_internal())
        };

        if !is_internal {
            let node = NodeRef::new(spine.current().data());
            *index = Some(match found {
                Some(i) if node.key_at(i) == key => i,
                Some(i) => i + 1,
                None => 0,
            });
            return Ok(());
        }

        let i = match found {
            Some(i) => i,
            None => {
                // Insertion below the minimum: lower the bound on keys[0]
                // so parent keys stay lower bounds for their subtrees.
                NodeMut::of(spine.current_mut()).set_key(0, key);
                0
            }
        };
        block = NodeRef::new(spine.current().data()).child_at(i);
        *index = Some(i);
        top = false;
    }
}

impl BTree {
    /// Inserts `value` under the composite key `keys`, returning the new
    /// root. An existing entry is overwritten; if the value type tracks
    /// references and the stored value differs, the old value is released
    /// first.
    pub fn insert(&self, root: BlockId, keys: &[u64], value: &[u8]) -> Result<BlockId> {
        self.insert_impl(root, keys, value).map(|(root, _)| root)
    }

    /// Like [`BTree::insert`], additionally reporting whether a fresh entry
    /// was created (`true`) or an existing one overwritten (`false`).
    pub fn insert_notify(
        &self,
        root: BlockId,
        keys: &[u64],
        value: &[u8],
    ) -> Result<(BlockId, bool)> {
        self.insert_impl(root, keys, value)
    }

    fn insert_impl(&self, root: BlockId, keys: &[u64], value: &[u8]) -> Result<(BlockId, bool)> {
        self.check_key_levels(keys)?;
        let vt = &*self.info.value_type;
        if value.len() != vt.size() {
            return Err(CopseError::Invalid(
                "value length does not match tree value size",
            ));
        }

        let last = self.info.levels - 1;
        let subtree_vt = SubtreeValueType::new(self.store());
        let mut spine = ShadowSpine::new(self.store(), &self.stats);
        let mut index: Option<usize> = None;
        let mut block = root;

        for (level, &level_key) in keys.iter().enumerate().take(last) {
            btree_insert_raw(&mut spine, block, &subtree_vt, level_key, &mut index)?;
            let slot = index.expect("raw insert always yields an index");
            if need_insert(NodeRef::new(spine.current().data()), level_key, slot) {
                // New prefix: hang a brand-new empty subtree off this level.
                let subtree = self.empty_subtree(self.leaf_value_size(level + 1))?;
                NodeMut::of(spine.current_mut()).insert_at(
                    slot,
                    level_key,
                    &subtree.0.to_le_bytes(),
                )?;
            }
            block = BlockId(NodeRef::new(spine.current().data()).value_u64(slot));
        }

        btree_insert_raw(&mut spine, block, vt, keys[last], &mut index)?;
        let slot = index.expect("raw insert always yields an index");
        let inserted = need_insert(NodeRef::new(spine.current().data()), keys[last], slot);
        if inserted {
            NodeMut::of(spine.current_mut()).insert_at(slot, keys[last], value)?;
        } else {
            {
                let node = NodeRef::new(spine.current().data());
                let old = node.value_at(slot);
                if !vt.equal(old, value) {
                    vt.dec(old)?;
                }
            }
            NodeMut::of(spine.current_mut()).set_value(slot, value);
        }
        Ok((spine.root(), inserted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::NODE_HEADER_LEN;

    fn node_buf(value_size: usize, max_entries: usize, keys: &[u64]) -> Vec<u8> {
        let block_size = NODE_HEADER_LEN + max_entries * (8 + value_size);
        let mut buf = vec![0u8; block_size];
        let mut node = NodeMut::new(&mut buf);
        node.init(0, max_entries, value_size);
        for (i, &k) in keys.iter().enumerate() {
            node.insert_at(i, k, &(k * 100).to_le_bytes())
                .expect("test entry fits");
        }
        buf
    }

    fn keys_of(buf: &[u8]) -> Vec<u64> {
        let node = NodeRef::new(buf);
        (0..node.entry_count()).map(|i| node.key_at(i)).collect()
    }

    fn values_match_keys(buf: &[u8]) -> bool {
        let node = NodeRef::new(buf);
        (0..node.entry_count()).all(|i| node.value_u64(i) == node.key_at(i) * 100)
    }

    #[test]
    fn redistribute2_balances_in_both_directions() {
        // Heavy left donates to the right.
        let mut left = node_buf(8, 12, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut right = node_buf(8, 12, &[9, 10]);
        redistribute2(
            &mut NodeMut::new(&mut left),
            &mut NodeMut::new(&mut right),
        );
        assert_eq!(keys_of(&left), vec![1, 2, 3, 4, 5]);
        assert_eq!(keys_of(&right), vec![6, 7, 8, 9, 10]);
        assert!(values_match_keys(&left) && values_match_keys(&right));

        // Heavy right donates to the left.
        let mut left = node_buf(8, 12, &[1]);
        let mut right = node_buf(8, 12, &[2, 3, 4, 5, 6, 7, 8]);
        redistribute2(
            &mut NodeMut::new(&mut left),
            &mut NodeMut::new(&mut right),
        );
        assert_eq!(keys_of(&left), vec![1, 2, 3, 4]);
        assert_eq!(keys_of(&right), vec![5, 6, 7, 8]);
        assert!(values_match_keys(&left) && values_match_keys(&right));
    }

    #[test]
    fn redistribute3_spreads_evenly_from_any_skew() {
        for (left_keys, right_keys) in [
            (vec![1u64, 2], vec![3u64, 4, 5, 6, 7, 8, 9, 10, 11, 12]),
            (vec![1, 2, 3, 4, 5], vec![6, 7, 8, 9, 10, 11, 12]),
            (vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10], vec![11, 12]),
        ] {
            let mut left = node_buf(8, 12, &left_keys);
            let mut center = node_buf(8, 12, &[]);
            let mut right = node_buf(8, 12, &right_keys);
            redistribute3(
                &mut NodeMut::new(&mut left),
                &mut NodeMut::new(&mut center),
                &mut NodeMut::new(&mut right),
            );
            assert_eq!(keys_of(&left), vec![1, 2, 3, 4]);
            assert_eq!(keys_of(&center), vec![5, 6, 7, 8]);
            assert_eq!(keys_of(&right), vec![9, 10, 11, 12]);
            assert!(
                values_match_keys(&left)
                    && values_match_keys(&center)
                    && values_match_keys(&right)
            );
        }
    }

    #[test]
    fn full_leaf_has_space_only_for_overwrites() {
        let buf = node_buf(8, 3, &[10, 20, 30]);
        let node = NodeRef::new(&buf);
        assert!(has_space_for_insert(node, 20));
        assert!(!has_space_for_insert(node, 15));

        let spare = node_buf(8, 6, &[10, 20, 30]);
        assert!(has_space_for_insert(NodeRef::new(&spare), 15));
    }
}
