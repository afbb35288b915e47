//! The block cache: per-slot block buckets, root blocks and eviction.
//!
//! Blocks are bucketed by slot under a slot-local map so eviction drops a
//! whole bucket at once. Eviction advances in one direction only; advancing
//! past a slot fires the per-block and per-slot eviction signals that the
//! downstream component lattices (tips, mempool attachments) listen to.
//!
//! Root blocks are the exception: one per recently committed slot remains
//! referenceable as a parent anchor after its bucket is gone, bounding how
//! far back solidification can reach.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::block::{Block, BlockId};
use crate::reactive::{Signal, Variable};
use crate::SlotIndex;

/// In-memory block cache with one-directional eviction.
pub struct BlockCache {
    slots: Mutex<BTreeMap<SlotIndex, HashMap<BlockId, Arc<Block>>>>,
    root_blocks: Mutex<BTreeMap<SlotIndex, HashMap<BlockId, Arc<Block>>>>,
    /// Root blocks older than this many slots below the eviction edge are
    /// dropped as well.
    root_retention: SlotIndex,

    /// Highest evicted slot; slots at or below it hold no buckets.
    pub last_evicted_slot: Variable<SlotIndex>,
    /// Fired for every non-root block dropped by eviction.
    pub block_evicted: Signal<Arc<Block>>,
    /// Fired once per evicted slot, after its blocks.
    pub slot_evicted: Signal<SlotIndex>,
}

impl BlockCache {
    pub fn new(root_retention: SlotIndex) -> Self {
        BlockCache {
            slots: Mutex::new(BTreeMap::new()),
            root_blocks: Mutex::new(BTreeMap::new()),
            root_retention,
            last_evicted_slot: Variable::new(0),
            block_evicted: Signal::new(),
            slot_evicted: Signal::new(),
        }
    }

    /// Fetch a block, looking through the live buckets and root blocks.
    pub fn get(&self, id: &BlockId) -> Option<Arc<Block>> {
        if let Some(block) = lock(&self.slots)
            .get(&id.slot)
            .and_then(|bucket| bucket.get(id))
        {
            return Some(Arc::clone(block));
        }
        lock(&self.root_blocks)
            .get(&id.slot)
            .and_then(|bucket| bucket.get(id))
            .map(Arc::clone)
    }

    /// Idempotently fetch or create the cache entry for `id`.
    ///
    /// Returns `None` when the slot already fell out of the active window
    /// (and `id` is not a root block): such blocks can no longer enter the
    /// pipeline. The boolean is true when the entry was created.
    pub fn store_or_create(
        &self,
        id: BlockId,
        create: impl FnOnce() -> Block,
    ) -> Option<(Arc<Block>, bool)> {
        if let Some(root) = lock(&self.root_blocks)
            .get(&id.slot)
            .and_then(|bucket| bucket.get(&id))
        {
            return Some((Arc::clone(root), false));
        }
        if id.slot <= self.last_evicted_slot.get() {
            return None;
        }
        let mut slots = lock(&self.slots);
        let bucket = slots.entry(id.slot).or_default();
        if let Some(existing) = bucket.get(&id) {
            return Some((Arc::clone(existing), false));
        }
        let block = Arc::new(create());
        bucket.insert(id, Arc::clone(&block));
        Some((block, true))
    }

    /// All live blocks of a slot.
    pub fn blocks_in_slot(&self, slot: SlotIndex) -> Vec<Arc<Block>> {
        lock(&self.slots)
            .get(&slot)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Register a block as a root block, surviving eviction.
    pub fn register_root_block(&self, block: Arc<Block>) {
        block.mark_root_block();
        lock(&self.root_blocks)
            .entry(block.slot())
            .or_default()
            .insert(block.id(), block);
    }

    pub fn is_root_block(&self, id: &BlockId) -> bool {
        lock(&self.root_blocks)
            .get(&id.slot)
            .map(|bucket| bucket.contains_key(id))
            .unwrap_or(false)
    }

    /// Current root block ids, ascending by slot.
    pub fn root_block_ids(&self) -> Vec<BlockId> {
        lock(&self.root_blocks)
            .values()
            .flat_map(|bucket| bucket.keys().copied())
            .collect()
    }

    /// Drop root blocks below `slot` (the commit pipeline keeps a short
    /// tail of recently committed slots as anchors).
    pub fn prune_root_blocks_below(&self, slot: SlotIndex) {
        lock(&self.root_blocks).retain(|root_slot, _| *root_slot >= slot);
    }

    /// Advance eviction up to and including `slot`.
    ///
    /// Buckets are dropped in slot order; every dropped non-root block
    /// fires `block_evicted`, then the slot fires `slot_evicted`. Root
    /// blocks older than the retention window are silently dropped.
    pub fn advance_eviction(&self, slot: SlotIndex) {
        let previous = self.last_evicted_slot.get();
        if slot <= previous {
            return;
        }
        self.last_evicted_slot.set(slot);
        for evicted_slot in (previous + 1)..=slot {
            let bucket = lock(&self.slots).remove(&evicted_slot);
            if let Some(bucket) = bucket {
                for block in bucket.into_values() {
                    if !block.is_root_block() {
                        self.block_evicted.trigger(&block);
                    }
                }
            }
            self.slot_evicted.trigger(&evicted_slot);
        }
        let cutoff = slot.saturating_sub(self.root_retention);
        lock(&self.root_blocks).retain(|root_slot, _| *root_slot >= cutoff);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn id(slot: SlotIndex, tag: u8) -> BlockId {
        BlockId {
            slot,
            hash: [tag; 32],
        }
    }

    #[test]
    fn store_or_create_is_idempotent() {
        let cache = BlockCache::new(8);
        let block_id = id(1, 1);
        let (first, created) = cache
            .store_or_create(block_id, || Block::new_missing(block_id))
            .unwrap();
        assert!(created);
        let (second, created) = cache
            .store_or_create(block_id, || Block::new_missing(block_id))
            .unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(cache.get(&block_id).is_some());
    }

    #[test]
    fn eviction_drops_buckets_and_fires_signals() {
        let cache = BlockCache::new(8);
        for slot in 1..=3 {
            let block_id = id(slot, slot as u8);
            cache
                .store_or_create(block_id, || Block::new_missing(block_id))
                .unwrap();
        }
        let evicted_blocks = Arc::new(AtomicUsize::new(0));
        let evicted_slots = Arc::new(Mutex::new(Vec::new()));
        {
            let count = Arc::clone(&evicted_blocks);
            cache
                .block_evicted
                .subscribe(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .detach();
            let slots = Arc::clone(&evicted_slots);
            cache
                .slot_evicted
                .subscribe(move |slot| slots.lock().unwrap().push(*slot))
                .detach();
        }

        cache.advance_eviction(2);
        assert_eq!(evicted_blocks.load(Ordering::SeqCst), 2);
        assert_eq!(*evicted_slots.lock().unwrap(), vec![1, 2]);
        assert!(cache.get(&id(1, 1)).is_none());
        assert!(cache.get(&id(3, 3)).is_some());
    }

    #[test]
    fn eviction_is_monotonic() {
        let cache = BlockCache::new(8);
        cache.advance_eviction(5);
        cache.advance_eviction(3);
        assert_eq!(cache.last_evicted_slot.get(), 5);
    }

    #[test]
    fn evicted_slot_rejects_new_blocks() {
        let cache = BlockCache::new(8);
        cache.advance_eviction(4);
        assert!(cache
            .store_or_create(id(3, 1), || Block::new_missing(id(3, 1)))
            .is_none());
        assert!(cache
            .store_or_create(id(5, 1), || Block::new_missing(id(5, 1)))
            .is_some());
    }

    #[test]
    fn root_blocks_survive_eviction() {
        let cache = BlockCache::new(8);
        let root_id = id(2, 7);
        let (root, _) = cache
            .store_or_create(root_id, || Block::new_missing(root_id))
            .unwrap();
        cache.register_root_block(Arc::clone(&root));

        cache.advance_eviction(3);
        assert!(cache.is_root_block(&root_id));
        assert!(cache.get(&root_id).is_some());
        // Still addressable through store_or_create despite eviction.
        let (again, created) = cache
            .store_or_create(root_id, || Block::new_missing(root_id))
            .unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&root, &again));
    }

    #[test]
    fn root_blocks_age_out_past_retention() {
        let cache = BlockCache::new(2);
        let root_id = id(1, 7);
        let (root, _) = cache
            .store_or_create(root_id, || Block::new_missing(root_id))
            .unwrap();
        cache.register_root_block(root);

        cache.advance_eviction(2);
        assert!(cache.is_root_block(&root_id));
        cache.advance_eviction(10);
        assert!(!cache.is_root_block(&root_id));
    }
}
