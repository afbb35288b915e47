//! The tip manager: a reactive lattice deriving the strong and weak tip
//! sets over the block cache.
//!
//! Every booked block gets a `TipMetadata` record whose derived predicates
//! mirror each other across the DAG: a block is strongly connected to the
//! tips if it is an eligible strong tip itself or strongly referenced by
//! one; it is a current strong tip if eligible and not yet strongly
//! referenced. Orphanhood propagates downward: a block with an orphaned
//! strong parent is orphaned too, which removes it (and transitively its
//! children) from the eligible set. Tip pools only ever promote
//! monotonically (Strong over Weak over Dropped takes no steps back).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::block::{Block, BlockId, ParentKind};
use crate::reactive::{derive2, Event, Variable};
use crate::SlotIndex;

/// Tip pools in promotion order: `set_tip_pool` never decreases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TipPool {
    Undefined = 0,
    Strong = 1,
    Weak = 2,
    Dropped = 3,
}

/// Per-block derived tip predicates.
pub struct TipMetadata {
    block: Arc<Block>,

    pub tip_pool: Variable<TipPool>,
    pub strongly_connected_children: Variable<i64>,
    pub weakly_connected_children: Variable<i64>,
    pub orphaned_strong_parents: Variable<i64>,
    pub marked_orphaned: Variable<bool>,

    // Derived layer.
    pub is_orphaned: Variable<bool>,
    pub is_eligible_strong_tip: Variable<bool>,
    pub is_eligible_weak_tip: Variable<bool>,
    pub strongly_referenced_by_tips: Variable<bool>,
    pub referenced_by_tips: Variable<bool>,
    pub strongly_connected_to_tips: Variable<bool>,
    pub weakly_connected_to_tips: Variable<bool>,
    pub is_strong_tip: Variable<bool>,
    pub is_weak_tip: Variable<bool>,

    pub evicted: Event,
}

impl TipMetadata {
    fn new(block: Arc<Block>) -> Arc<Self> {
        let tip_pool = Variable::with_transition(TipPool::Undefined, |current, new| {
            (*current).max(*new)
        });
        let strongly_connected_children = Variable::new(0i64);
        let weakly_connected_children = Variable::new(0i64);
        let orphaned_strong_parents = Variable::new(0i64);
        let marked_orphaned = Variable::new(false);

        let is_orphaned = derive2(&marked_orphaned, &orphaned_strong_parents, |marked, count| {
            *marked || *count > 0
        });
        let is_eligible_strong_tip = derive2(&tip_pool, &is_orphaned, |pool, orphaned| {
            *pool == TipPool::Strong && !orphaned
        });
        let is_eligible_weak_tip = derive2(&tip_pool, &is_orphaned, |pool, orphaned| {
            *pool == TipPool::Weak && !orphaned
        });
        let strongly_referenced_by_tips =
            crate::reactive::derive1(&strongly_connected_children, |count| *count > 0);
        let referenced_by_tips = derive2(
            &strongly_connected_children,
            &weakly_connected_children,
            |strong, weak| *strong > 0 || *weak > 0,
        );
        let strongly_connected_to_tips = derive2(
            &strongly_referenced_by_tips,
            &is_eligible_strong_tip,
            |referenced, eligible| *referenced || *eligible,
        );
        let weakly_connected_to_tips = derive2(
            &weakly_connected_children,
            &is_eligible_weak_tip,
            |count, eligible| *count > 0 || *eligible,
        );
        let is_strong_tip = derive2(
            &is_eligible_strong_tip,
            &strongly_referenced_by_tips,
            |eligible, referenced| *eligible && !referenced,
        );
        let is_weak_tip = derive2(
            &is_eligible_weak_tip,
            &referenced_by_tips,
            |eligible, referenced| *eligible && !referenced,
        );

        Arc::new(TipMetadata {
            block,
            tip_pool,
            strongly_connected_children,
            weakly_connected_children,
            orphaned_strong_parents,
            marked_orphaned,
            is_orphaned,
            is_eligible_strong_tip,
            is_eligible_weak_tip,
            strongly_referenced_by_tips,
            referenced_by_tips,
            strongly_connected_to_tips,
            weakly_connected_to_tips,
            is_strong_tip,
            is_weak_tip,
            evicted: Event::new(),
        })
    }

    pub fn id(&self) -> BlockId {
        self.block.id()
    }

    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    /// Promote the tip pool; demotions are ignored.
    pub fn set_tip_pool(&self, pool: TipPool) {
        self.tip_pool.set(pool);
    }
}

/// Selected parents for a new block.
#[derive(Default)]
pub struct TipSelection {
    pub strong: Vec<BlockId>,
    pub weak: Vec<BlockId>,
}

pub struct TipManager {
    metadata: Mutex<BTreeMap<SlotIndex, HashMap<BlockId, Arc<TipMetadata>>>>,
}

impl Default for TipManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TipManager {
    pub fn new() -> Self {
        TipManager {
            metadata: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a booked block in the given pool and wire it to its
    /// parents' records.
    pub fn add_block(&self, block: Arc<Block>, pool: TipPool) -> Arc<TipMetadata> {
        let metadata = TipMetadata::new(Arc::clone(&block));
        lock(&self.metadata)
            .entry(block.slot())
            .or_default()
            .insert(block.id(), Arc::clone(&metadata));

        // Block-level orphanhood feeds the lattice.
        {
            let marked = metadata.marked_orphaned.clone();
            block
                .orphaned
                .on_update(move |_, orphaned| {
                    marked.set(*orphaned);
                })
                .detach();
        }

        for (kind, parent_id) in block.parents() {
            let Some(parent) = self.get(&parent_id) else {
                continue;
            };
            match kind {
                ParentKind::Strong => {
                    // The child's connectivity feeds the parent's strong
                    // child counter.
                    let counter = parent.strongly_connected_children.clone();
                    metadata
                        .strongly_connected_to_tips
                        .on_update(move |_, connected| {
                            let delta = if *connected { 1 } else { -1 };
                            counter.compute(|count| count + delta);
                        })
                        .detach();

                    // The parent's orphanhood feeds the child's counter.
                    let counter = metadata.orphaned_strong_parents.clone();
                    parent
                        .is_orphaned
                        .on_update(move |_, orphaned| {
                            let delta = if *orphaned { 1 } else { -1 };
                            counter.compute(|count| count + delta);
                        })
                        .detach();
                    if parent.is_orphaned.get() {
                        metadata.orphaned_strong_parents.compute(|count| count + 1);
                    }
                }
                ParentKind::Weak | ParentKind::ShallowLike => {
                    let counter = parent.weakly_connected_children.clone();
                    metadata
                        .weakly_connected_to_tips
                        .on_update(move |_, connected| {
                            let delta = if *connected { 1 } else { -1 };
                            counter.compute(|count| count + delta);
                        })
                        .detach();
                }
            }
        }

        metadata.set_tip_pool(pool);
        metadata
    }

    pub fn get(&self, id: &BlockId) -> Option<Arc<TipMetadata>> {
        lock(&self.metadata)
            .get(&id.slot)
            .and_then(|bucket| bucket.get(id))
            .cloned()
    }

    /// Current strong tips (eligible and not strongly referenced).
    pub fn strong_tips(&self) -> Vec<Arc<TipMetadata>> {
        self.collect(|m| m.is_strong_tip.get())
    }

    pub fn weak_tips(&self) -> Vec<Arc<TipMetadata>> {
        self.collect(|m| m.is_weak_tip.get())
    }

    /// Select up to `strong_count` strong tips and up to `weak_count`
    /// weak tips for a new block's parent references.
    ///
    /// Tie-break: fewest orphaned strong parents, then newest.
    pub fn select_tips(&self, strong_count: usize, weak_count: usize) -> TipSelection {
        let mut strong = self.strong_tips();
        strong.sort_by_key(|m| {
            (
                m.orphaned_strong_parents.get(),
                std::cmp::Reverse(m.block().issuing_time_ms().unwrap_or(0)),
            )
        });
        let mut weak = self.weak_tips();
        weak.sort_by_key(|m| std::cmp::Reverse(m.block().issuing_time_ms().unwrap_or(0)));

        TipSelection {
            strong: strong.iter().take(strong_count).map(|m| m.id()).collect(),
            weak: weak.iter().take(weak_count).map(|m| m.id()).collect(),
        }
    }

    /// Drop the records of an evicted slot.
    pub fn evict_slot(&self, slot: SlotIndex) {
        if let Some(bucket) = lock(&self.metadata).remove(&slot) {
            for metadata in bucket.into_values() {
                metadata.evicted.trigger();
            }
        }
    }

    fn collect(&self, predicate: impl Fn(&TipMetadata) -> bool) -> Vec<Arc<TipMetadata>> {
        lock(&self.metadata)
            .values()
            .flat_map(|bucket| bucket.values())
            .filter(|m| predicate(m))
            .cloned()
            .collect()
    }
}

fn lock(
    mutex: &Mutex<BTreeMap<SlotIndex, HashMap<BlockId, Arc<TipMetadata>>>>,
) -> std::sync::MutexGuard<'_, BTreeMap<SlotIndex, HashMap<BlockId, Arc<TipMetadata>>>> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
