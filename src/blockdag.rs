//! BlockDAG solidification.
//!
//! `append` resolves a block's parents against the cache. Unknown parents
//! become missing-block placeholders (announced through `block_missing` so
//! the requester starts a retry ticker); parents that already fell below
//! the eviction window without being root blocks make the block invalid.
//! A block turns solid once every parent exists and is solid; solidity
//! propagates through placeholders the moment they are filled.

use std::sync::Arc;

use crate::block::{Block, BlockError, BlockId, ProtocolBlock};
use crate::cache::BlockCache;
use crate::config::ProtocolParameters;
use crate::reactive::Signal;

/// Errors from appending a block to the DAG.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BlockDagError {
    #[error("block {0} is below the eviction window")]
    BelowEvictionWindow(BlockId),
    #[error("block {0} was already appended")]
    Duplicate(BlockId),
    #[error("block references evicted non-root parent {0}")]
    InvalidParents(BlockId),
    #[error("malformed block: {0}")]
    Malformed(#[from] BlockError),
}

/// Result of a successful append.
pub struct AppendOutcome {
    pub block: Arc<Block>,
    /// True when the block replaced a missing-block placeholder.
    pub was_missing: bool,
}

/// The solidification stage of the pipeline.
pub struct BlockDag {
    params: Arc<ProtocolParameters>,
    cache: Arc<BlockCache>,

    /// A block entered the cache with its parents linked.
    pub block_appended: Signal<Arc<Block>>,
    /// A block's parents are all present and solid.
    pub block_solid: Signal<Arc<Block>>,
    /// A referenced block is unknown; a placeholder was created.
    pub block_missing: Signal<BlockId>,
    /// A missing placeholder was replaced by the real block.
    pub missing_block_appended: Signal<Arc<Block>>,
    /// A block could not be appended (duplicate or below window).
    pub block_not_appended: Signal<BlockId>,
    /// A block references an evicted non-root parent.
    pub block_invalid: Signal<(Arc<Block>, String)>,
}

impl BlockDag {
    pub fn new(params: Arc<ProtocolParameters>, cache: Arc<BlockCache>) -> Self {
        BlockDag {
            params,
            cache,
            block_appended: Signal::new(),
            block_solid: Signal::new(),
            block_missing: Signal::new(),
            missing_block_appended: Signal::new(),
            block_not_appended: Signal::new(),
            block_invalid: Signal::new(),
        }
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    /// Append a block, resolving its parents.
    pub fn append(&self, protocol_block: ProtocolBlock) -> Result<AppendOutcome, BlockDagError> {
        protocol_block.validate_structure()?;
        let id = protocol_block.id(&self.params)?;

        let body = protocol_block.clone();
        let Some((block, created)) = self
            .cache
            .store_or_create(id, move || Block::new(id, body))
        else {
            self.block_not_appended.trigger(&id);
            return Err(BlockDagError::BelowEvictionWindow(id));
        };

        let was_missing = if created {
            false
        } else if block.fill(protocol_block) {
            true
        } else {
            self.block_not_appended.trigger(&id);
            return Err(BlockDagError::Duplicate(id));
        };

        self.setup(&block)?;

        if was_missing {
            self.missing_block_appended.trigger(&block);
        }
        self.block_appended.trigger(&block);

        Ok(AppendOutcome { block, was_missing })
    }

    /// Fetch a block, creating a missing placeholder (and announcing it)
    /// when unknown. Returns `None` below the eviction window.
    pub fn get_or_request(&self, id: BlockId) -> Option<Arc<Block>> {
        let (block, created) = self
            .cache
            .store_or_create(id, move || Block::new_missing(id))?;
        if created {
            tracing::debug!(block = %id, "requesting missing block");
            self.block_missing.trigger(&id);
        }
        Some(block)
    }

    /// Link parents and wire solidification for a freshly filled block.
    fn setup(&self, block: &Arc<Block>) -> Result<(), BlockDagError> {
        let parents = block.parents();

        // Resolve every parent first; an evicted non-root parent poisons
        // the block before any linking happens.
        let mut resolved = Vec::with_capacity(parents.len());
        for (kind, parent_id) in parents {
            let Some(parent) = self.resolve_parent(parent_id) else {
                tracing::warn!(
                    block = %block.id(),
                    parent = %parent_id,
                    "block references evicted non-root parent"
                );
                block.invalid.trigger();
                self.block_invalid
                    .trigger(&(Arc::clone(block), format!("evicted parent {parent_id}")));
                return Err(BlockDagError::InvalidParents(block.id()));
            };
            resolved.push((kind, parent));
        }

        for (kind, parent) in &resolved {
            parent.register_child(*kind, block);
        }

        // Sentinel counting: one slot per parent plus one the setup itself
        // releases, so subscriptions that fire immediately (replayed solid
        // events) cannot reach zero before all parents are wired.
        block.init_unsolid_parents(resolved.len() + 1);
        for (_, parent) in &resolved {
            let child = Arc::clone(block);
            let solid_signal = self.block_solid.clone();
            parent
                .solid
                .on_trigger(move || {
                    if child.mark_parent_solid() && child.solid.trigger() {
                        solid_signal.trigger(&child);
                    }
                })
                .detach();
        }
        if block.mark_parent_solid() && block.solid.trigger() {
            self.block_solid.trigger(block);
        }

        Ok(())
    }

    /// Resolve a parent id to a cache entry, creating a placeholder for
    /// unknown blocks. `None` means the parent is evicted and not a root.
    fn resolve_parent(&self, parent_id: BlockId) -> Option<Arc<Block>> {
        let (parent, created) = self
            .cache
            .store_or_create(parent_id, move || Block::new_missing(parent_id))?;
        if created {
            tracing::debug!(block = %parent_id, "parent unknown, requesting");
            self.block_missing.trigger(&parent_id);
        }
        Some(parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockHeader, Payload};
    use crate::commitment::CommitmentId;
    use crate::committee::Signature;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn params() -> Arc<ProtocolParameters> {
        Arc::new(ProtocolParameters {
            genesis_unix_ms: 0,
            slot_duration_ms: 10,
            ..Default::default()
        })
    }

    fn dag() -> BlockDag {
        BlockDag::new(params(), Arc::new(BlockCache::new(8)))
    }

    fn block_at(time_ms: u64, issuer: u8, strong_parents: Vec<BlockId>) -> ProtocolBlock {
        ProtocolBlock {
            header: BlockHeader {
                protocol_version: 1,
                issuer: [issuer; 32],
                issuing_time_ms: time_ms,
                slot_commitment_id: CommitmentId::default(),
                latest_finalized_slot: 0,
                strong_parents,
                weak_parents: vec![],
                shallow_like_parents: vec![],
            },
            payload: Payload::Validation {
                highest_supported_version: 1,
            },
            signature: Signature::empty(),
        }
    }

    fn root_anchor(dag: &BlockDag) -> BlockId {
        let id = BlockId::root(&CommitmentId::default());
        let (root, _) = dag
            .cache
            .store_or_create(id, || Block::new_root(id))
            .unwrap();
        dag.cache.register_root_block(root);
        id
    }

    #[test]
    fn append_with_known_parents_is_solid() {
        let dag = dag();
        let anchor = root_anchor(&dag);

        let first = block_at(15, 1, vec![anchor]);
        let outcome = dag.append(first.clone()).unwrap();
        assert!(outcome.block.solid.was_triggered());

        let second = block_at(25, 2, vec![first.id(&params()).unwrap()]);
        let outcome = dag.append(second).unwrap();
        assert!(outcome.block.solid.was_triggered());
    }

    #[test]
    fn missing_parent_requests_and_resolves() {
        let dag = dag();
        let anchor = root_anchor(&dag);
        let missing_ids = Arc::new(Mutex::new(Vec::new()));
        {
            let sink = Arc::clone(&missing_ids);
            dag.block_missing
                .subscribe(move |id| sink.lock().unwrap().push(*id))
                .detach();
        }

        let parent = block_at(15, 1, vec![anchor]);
        let parent_id = parent.id(&params()).unwrap();
        let child = block_at(25, 2, vec![parent_id]);

        // Child arrives first: parent becomes a placeholder, child unsolid.
        let child_outcome = dag.append(child).unwrap();
        assert!(!child_outcome.block.solid.was_triggered());
        assert_eq!(*missing_ids.lock().unwrap(), vec![parent_id]);

        // Parent arrives: placeholder fills, both turn solid.
        let missing_appended = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&missing_appended);
            dag.missing_block_appended
                .subscribe(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .detach();
        }
        let parent_outcome = dag.append(parent).unwrap();
        assert!(parent_outcome.was_missing);
        assert_eq!(missing_appended.load(Ordering::SeqCst), 1);
        assert!(parent_outcome.block.solid.was_triggered());
        assert!(child_outcome.block.solid.was_triggered());
    }

    #[test]
    fn duplicate_append_is_rejected() {
        let dag = dag();
        let anchor = root_anchor(&dag);
        let block = block_at(15, 1, vec![anchor]);
        dag.append(block.clone()).unwrap();
        assert!(matches!(
            dag.append(block),
            Err(BlockDagError::Duplicate(_))
        ));
    }

    #[test]
    fn evicted_non_root_parent_is_invalid() {
        let dag = dag();
        root_anchor(&dag);
        dag.cache.advance_eviction(2);

        let invalid_count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&invalid_count);
            dag.block_invalid
                .subscribe(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .detach();
        }

        // Parent id in slot 1 (evicted, not a root block).
        let evicted_parent = BlockId {
            slot: 1,
            hash: [9u8; 32],
        };
        let child = block_at(35, 1, vec![evicted_parent]);
        let result = dag.append(child);
        assert!(matches!(result, Err(BlockDagError::InvalidParents(_))));
        assert_eq!(invalid_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn root_parent_stays_valid_after_eviction() {
        let dag = dag();
        let anchor = root_anchor(&dag);
        dag.cache.advance_eviction(0);

        let child = block_at(15, 1, vec![anchor]);
        let outcome = dag.append(child).unwrap();
        assert!(outcome.block.solid.was_triggered());
    }

    #[test]
    fn solidity_propagates_through_chain_of_placeholders() {
        let dag = dag();
        let anchor = root_anchor(&dag);

        let a = block_at(15, 1, vec![anchor]);
        let a_id = a.id(&params()).unwrap();
        let b = block_at(25, 2, vec![a_id]);
        let b_id = b.id(&params()).unwrap();
        let c = block_at(35, 3, vec![b_id]);

        // Arrive in reverse order.
        let c_out = dag.append(c).unwrap();
        let b_out = dag.append(b).unwrap();
        assert!(!c_out.block.solid.was_triggered());
        let a_out = dag.append(a).unwrap();

        assert!(a_out.block.solid.was_triggered());
        assert!(b_out.block.solid.was_triggered());
        assert!(c_out.block.solid.was_triggered());
    }

    #[test]
    fn get_or_request_creates_placeholder_once() {
        let dag = dag();
        let id = BlockId {
            slot: 2,
            hash: [4u8; 32],
        };
        let missing_count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&missing_count);
            dag.block_missing
                .subscribe(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .detach();
        }
        let first = dag.get_or_request(id).unwrap();
        let second = dag.get_or_request(id).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(missing_count.load(Ordering::SeqCst), 1);
    }
}
