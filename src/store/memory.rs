//! In-memory, reference-counted block store.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::store::{BlockBuf, BlockStore, ReadBlock, WriteBlock};
use crate::types::{BlockId, CopseError, Result, DEFAULT_BLOCK_SIZE};

struct Slot {
    buf: BlockBuf,
    ref_count: u32,
}

struct Table {
    slots: FxHashMap<u64, Slot>,
    next_id: u64,
}

/// In-memory [`BlockStore`] with copy-on-write shadowing and per-block
/// reference counts.
///
/// Blocks live in a hash table of `RwLock`ed buffers; a block is dropped
/// from the table the moment its reference count reaches zero. An optional
/// block-count capacity makes allocation-failure paths testable.
pub struct MemoryBlockStore {
    block_size: usize,
    max_blocks: Option<u64>,
    table: Mutex<Table>,
    prefetches: AtomicU64,
}

impl MemoryBlockStore {
    /// Creates a store serving blocks of `block_size` bytes.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            max_blocks: None,
            table: Mutex::new(Table {
                slots: FxHashMap::default(),
                next_id: 1,
            }),
            prefetches: AtomicU64::new(0),
        }
    }

    /// Like [`MemoryBlockStore::new`], but allocation fails with
    /// [`CopseError::OutOfSpace`] once `max_blocks` blocks are live.
    pub fn with_capacity(block_size: usize, max_blocks: u64) -> Self {
        Self {
            max_blocks: Some(max_blocks),
            ..Self::new(block_size)
        }
    }

    /// Number of currently allocated blocks.
    pub fn live_blocks(&self) -> usize {
        self.table.lock().slots.len()
    }

    /// Number of prefetch hints received so far.
    pub fn prefetch_hints(&self) -> u64 {
        self.prefetches.load(AtomicOrdering::Relaxed)
    }

    fn allocate_locked(&self, table: &mut Table) -> Result<(BlockId, BlockBuf)> {
        if let Some(max) = self.max_blocks {
            if table.slots.len() as u64 >= max {
                return Err(CopseError::OutOfSpace);
            }
        }
        let id = table.next_id;
        table.next_id += 1;
        let buf: BlockBuf = Arc::new(RwLock::new(
            vec![0u8; self.block_size].into_boxed_slice(),
        ));
        table.slots.insert(
            id,
            Slot {
                buf: Arc::clone(&buf),
                ref_count: 1,
            },
        );
        Ok((BlockId(id), buf))
    }

    fn buf_of(&self, b: BlockId) -> Result<BlockBuf> {
        let table = self.table.lock();
        let slot = table
            .slots
            .get(&b.0)
            .ok_or(CopseError::Corruption("reference to unallocated block"))?;
        Ok(Arc::clone(&slot.buf))
    }
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl BlockStore for MemoryBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn new_block(&self) -> Result<WriteBlock> {
        let (id, buf) = {
            let mut table = self.table.lock();
            self.allocate_locked(&mut table)?
        };
        Ok(WriteBlock::new(id, buf.write_arc()))
    }

    fn read_lock(&self, b: BlockId) -> Result<ReadBlock> {
        let buf = self.buf_of(b)?;
        Ok(ReadBlock::new(b, buf.read_arc()))
    }

    fn shadow_block(&self, b: BlockId) -> Result<(WriteBlock, bool)> {
        let (id, buf, src) = {
            let mut table = self.table.lock();
            let slot = table
                .slots
                .get(&b.0)
                .ok_or(CopseError::Corruption("reference to unallocated block"))?;
            if slot.ref_count == 1 {
                // Exclusively owned: mutate in place.
                let buf = Arc::clone(&slot.buf);
                drop(table);
                return Ok((WriteBlock::new(b, buf.write_arc()), false));
            }
            // Allocate before touching the origin's count so a failed
            // allocation leaves the reference intact.
            let (id, buf) = self.allocate_locked(&mut table)?;
            let slot = table.slots.get_mut(&b.0).expect("slot checked above");
            slot.ref_count -= 1;
            let src = Arc::clone(&slot.buf);
            (id, buf, src)
        };
        // Buffer locks are taken outside the table mutex.
        let mut guard = buf.write_arc();
        guard.copy_from_slice(&src.read());
        Ok((WriteBlock::new(id, guard), true))
    }

    fn ref_count(&self, b: BlockId) -> Result<u32> {
        let table = self.table.lock();
        let slot = table
            .slots
            .get(&b.0)
            .ok_or(CopseError::Corruption("reference to unallocated block"))?;
        Ok(slot.ref_count)
    }

    fn inc_ref(&self, b: BlockId) -> Result<()> {
        let mut table = self.table.lock();
        let slot = table
            .slots
            .get_mut(&b.0)
            .ok_or(CopseError::Corruption("reference to unallocated block"))?;
        slot.ref_count += 1;
        Ok(())
    }

    fn dec_ref(&self, b: BlockId) -> Result<u32> {
        let mut table = self.table.lock();
        let slot = table
            .slots
            .get_mut(&b.0)
            .ok_or(CopseError::Corruption("reference to unallocated block"))?;
        if slot.ref_count == 0 {
            return Err(CopseError::Corruption("block reference count underflow"));
        }
        slot.ref_count -= 1;
        let count = slot.ref_count;
        if count == 0 {
            table.slots.remove(&b.0);
        }
        Ok(count)
    }

    fn prefetch(&self, _b: BlockId) {
        self.prefetches.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_block_is_zeroed_with_one_reference() -> Result<()> {
        let store = MemoryBlockStore::new(128);
        let id = {
            let block = store.new_block()?;
            assert!(block.data().iter().all(|&byte| byte == 0));
            block.id()
        };
        assert_eq!(store.ref_count(id)?, 1);
        assert_eq!(store.live_blocks(), 1);
        Ok(())
    }

    #[test]
    fn shadow_of_exclusive_block_reuses_address() -> Result<()> {
        let store = MemoryBlockStore::new(128);
        let id = store.new_block()?.id();
        let (block, copied) = store.shadow_block(id)?;
        assert!(!copied);
        assert_eq!(block.id(), id);
        Ok(())
    }

    #[test]
    fn shadow_of_shared_block_copies_and_splits_counts() -> Result<()> {
        let store = MemoryBlockStore::new(128);
        let id = {
            let mut block = store.new_block()?;
            block.data_mut()[0] = 7;
            block.id()
        };
        store.inc_ref(id)?;
        let (copy, copied) = store.shadow_block(id)?;
        assert!(copied);
        assert_ne!(copy.id(), id);
        assert_eq!(copy.data()[0], 7);
        let copy_id = copy.id();
        drop(copy);
        assert_eq!(store.ref_count(id)?, 1);
        assert_eq!(store.ref_count(copy_id)?, 1);
        Ok(())
    }

    #[test]
    fn dec_ref_frees_at_zero() -> Result<()> {
        let store = MemoryBlockStore::new(128);
        let id = store.new_block()?.id();
        assert_eq!(store.dec_ref(id)?, 0);
        assert_eq!(store.live_blocks(), 0);
        assert!(matches!(
            store.read_lock(id),
            Err(CopseError::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn capacity_cap_surfaces_out_of_space() -> Result<()> {
        let store = MemoryBlockStore::with_capacity(128, 2);
        let first = store.new_block()?.id();
        let _second = store.new_block()?.id();
        assert!(matches!(store.new_block(), Err(CopseError::OutOfSpace)));
        // Shadowing a shared block also needs a fresh allocation.
        store.inc_ref(first)?;
        assert!(matches!(
            store.shadow_block(first),
            Err(CopseError::OutOfSpace)
        ));
        // The failed shadow must not leak a reference.
        assert_eq!(store.ref_count(first)?, 2);
        Ok(())
    }
}
