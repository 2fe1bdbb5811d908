//! Whole-tree deletion.
//!
//! Deletion is logically recursive, but runs on an explicit heap-allocated
//! frame stack: the execution environments this engine targets cannot
//! assume deep call stacks, and the frame stack bounds auxiliary memory at
//! `MAX_SPINE_DEPTH` frames regardless of tree size.

use smallvec::SmallVec;
use tracing::trace;

use crate::btree::node::{read_node, NodeRef};
use crate::btree::BTree;
use crate::types::{BlockId, CopseError, Result, MAX_SPINE_DEPTH};

use crate::store::ReadBlock;

struct Frame {
    block: ReadBlock,
    level: usize,
    nr_children: usize,
    current_child: usize,
}

type FrameStack = SmallVec<[Frame; 8]>;

enum Step {
    Pop,
    Push(BlockId, usize),
}

impl BTree {
    /// Destroys the entire tree reachable from `root`, respecting sharing:
    /// subtrees that other roots still reference are decremented and left
    /// intact, everything exclusively owned is freed.
    ///
    /// On error, frames unlock but reference counts already dropped stay
    /// dropped — a failed delete leaves the tree in an indeterminate (but
    /// still lockable) state.
    pub fn delete_tree(&self, root: BlockId) -> Result<()> {
        let mut stack = FrameStack::new();
        self.push_frame(&mut stack, root, 0)?;

        while !stack.is_empty() {
            let step = {
                let frame = stack.last_mut().expect("stack is non-empty");
                if frame.current_child >= frame.nr_children {
                    Step::Pop
                } else {
                    let node = NodeRef::new(frame.block.data());
                    if node.is_internal() {
                        let child = node.child_at(frame.current_child);
                        let level = frame.level;
                        frame.current_child += 1;
                        Step::Push(child, level)
                    } else if frame.level + 1 < self.info.levels {
                        // A leaf above the final key level: its values are
                        // the roots of nested subtrees.
                        let child = BlockId(node.value_u64(frame.current_child));
                        let level = frame.level + 1;
                        frame.current_child += 1;
                        Step::Push(child, level)
                    } else {
                        let values = node.value_range(0, frame.nr_children);
                        self.info.value_type.dec(values)?;
                        Step::Pop
                    }
                }
            };

            match step {
                Step::Pop => {
                    let frame = stack.pop().expect("stack is non-empty");
                    if self.store.dec_ref(frame.block.id())? == 0 {
                        self.stats.inc_nodes_freed();
                    }
                }
                Step::Push(child, level) => self.push_frame(&mut stack, child, level)?,
            }
        }
        Ok(())
    }

    fn push_frame(&self, stack: &mut FrameStack, b: BlockId, level: usize) -> Result<()> {
        if stack.len() >= MAX_SPINE_DEPTH {
            return Err(CopseError::TooDeep);
        }

        if self.store.ref_count(b)? > 1 {
            // Another tree still needs this subtree: drop our reference
            // and leave the children alone.
            self.store.dec_ref(b)?;
            self.stats.inc_shared_subtrees_skipped();
            trace!(target: "copse::del", block = %b, "skipping shared subtree");
            return Ok(());
        }

        let block = self.store.read_lock(b)?;
        let nr_children;
        {
            let node = read_node(&block)?;
            nr_children = node.entry_count();
            if node.is_internal() || level + 1 < self.info.levels {
                // Overlap child I/O with the stack bookkeeping.
                for i in 0..nr_children {
                    self.store.prefetch(BlockId(node.value_u64(i)));
                }
            }
        }
        stack.push(Frame {
            block,
            level,
            nr_children,
            current_child: 0,
        });
        Ok(())
    }
}
