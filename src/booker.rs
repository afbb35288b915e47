//! The booker: attaches payloads to the mempool and assigns conflict sets
//! to blocks.
//!
//! A solid block is booked once all of its parents are booked and its
//! transaction (if any) finished booking in the mempool. At that point the
//! block inherits its spender-id set: the union of its strong parents'
//! sets plus the conflict ids of its own payload. Blocks whose payload
//! turns out conflicting later pick the new ids up reactively.

use std::sync::{Arc, Weak};

use crate::block::{Block, ParentKind};
use crate::cache::BlockCache;
use crate::ledger::TransactionId;
use crate::mempool::Mempool;
use crate::reactive::Signal;

pub struct Booker {
    mempool: Arc<Mempool>,
    cache: Arc<BlockCache>,
    weak_self: Weak<Booker>,

    pub block_booked: Signal<Arc<Block>>,
}

impl Booker {
    pub fn new(mempool: Arc<Mempool>, cache: Arc<BlockCache>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Booker {
            mempool,
            cache,
            weak_self: weak_self.clone(),
            block_booked: Signal::new(),
        })
    }

    /// Queue a solid block for booking (wired to the DAG's `block_solid`).
    pub fn queue(&self, block: &Arc<Block>) {
        if block.invalid.was_triggered() {
            return;
        }

        let parents: Vec<_> = block
            .parents()
            .iter()
            .filter_map(|(kind, id)| self.cache.get(id).map(|parent| (*kind, parent)))
            .collect();

        // One slot per parent, one for the payload, one sentinel released
        // at the end of setup.
        let transaction = block.payload_transaction();
        let slots = parents.len() + usize::from(transaction.is_some()) + 1;
        block.init_unbooked_parents(slots);

        for (_, parent) in &parents {
            let child = Arc::clone(block);
            let weak = self.weak_self.clone();
            parent
                .booked
                .on_trigger(move || {
                    if child.mark_parent_booked() {
                        if let Some(booker) = weak.upgrade() {
                            booker.finish_booking(&child);
                        }
                    }
                })
                .detach();
        }

        if let Some(transaction) = transaction {
            let transaction_id = transaction.id();
            let metadata = self.mempool.attach_transaction(transaction, block.id());

            {
                let child = Arc::clone(block);
                let weak = self.weak_self.clone();
                metadata
                    .booked
                    .on_trigger(move || {
                        if child.mark_parent_booked() {
                            if let Some(booker) = weak.upgrade() {
                                booker.finish_booking(&child);
                            }
                        }
                    })
                    .detach();
            }

            // Inclusion follows the attachment's acceptance.
            {
                let mempool = Arc::clone(&self.mempool);
                let block_id = block.id();
                block
                    .accepted
                    .on_trigger(move || {
                        mempool.mark_attachment_included(&transaction_id, block_id);
                    })
                    .detach();
            }
        }

        if block.mark_parent_booked() {
            self.finish_booking(block);
        }
    }

    fn finish_booking(&self, block: &Arc<Block>) {
        // Inherit the spender-id set through strong parents.
        for (kind, parent_id) in block.parents() {
            if kind != ParentKind::Strong {
                continue;
            }
            if let Some(parent) = self.cache.get(&parent_id) {
                block.add_spender_ids(parent.spender_ids());
            }
        }
        if let Some(transaction) = block.payload_transaction() {
            if let Some(metadata) = self.mempool.transaction(&transaction.id()) {
                block.add_spender_ids(metadata.conflict_ids());
                // Late conflicts (a rival arriving after booking) still
                // flow into the block's spender set.
                let target = Arc::clone(block);
                let mempool = Arc::clone(&self.mempool);
                let transaction_id: TransactionId = metadata.id();
                metadata
                    .conflicting
                    .on_trigger(move || {
                        if let Some(metadata) = mempool.transaction(&transaction_id) {
                            target.add_spender_ids(metadata.conflict_ids());
                        }
                    })
                    .detach();
            }
        }

        if block.booked.trigger() {
            tracing::debug!(block = %block.id(), "block booked");
            self.block_booked.trigger(block);
            block.scheduled.trigger();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockHeader, BlockId, Payload, ProtocolBlock};
    use crate::blockdag::BlockDag;
    use crate::commitment::CommitmentId;
    use crate::committee::Signature;
    use crate::config::ProtocolParameters;
    use crate::ledger::{Ledger, LedgerState, Output, StateRef, Transaction};
    use crate::storage::Store;

    struct Fixture {
        dag: BlockDag,
        booker: Arc<Booker>,
        mempool: Arc<Mempool>,
        params: Arc<ProtocolParameters>,
        genesis_state: LedgerState,
        anchor: BlockId,
    }

    fn fixture() -> Fixture {
        let params = Arc::new(ProtocolParameters {
            genesis_unix_ms: 0,
            slot_duration_ms: 10,
            ..Default::default()
        });
        let cache = Arc::new(BlockCache::new(8));
        let dag = BlockDag::new(Arc::clone(&params), Arc::clone(&cache));

        let store = Store::open_temporary().unwrap();
        let ledger = Arc::new(Ledger::load(store).unwrap());
        let genesis_state = LedgerState::new([0u8; 32], 0, Output {
            amount: 100,
            owner: [0u8; 32],
        });
        ledger.seed_state(genesis_state.clone()).unwrap();

        let mempool = Mempool::new(ledger);
        let booker = Booker::new(Arc::clone(&mempool), Arc::clone(&cache));

        let anchor = BlockId::root(&CommitmentId::default());
        let (root, _) = cache
            .store_or_create(anchor, || Block::new_root(anchor))
            .unwrap();
        cache.register_root_block(root);

        {
            let booker = Arc::clone(&booker);
            dag.block_solid
                .subscribe(move |block| booker.queue(block))
                .detach();
        }

        Fixture {
            dag,
            booker,
            mempool,
            params,
            genesis_state,
            anchor,
        }
    }

    fn validation_block(time_ms: u64, issuer: u8, strong_parents: Vec<BlockId>) -> ProtocolBlock {
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

    fn tx_block(
        time_ms: u64,
        issuer: u8,
        strong_parents: Vec<BlockId>,
        transaction: Transaction,
    ) -> ProtocolBlock {
        let mut block = validation_block(time_ms, issuer, strong_parents);
        block.payload = Payload::Transaction(transaction);
        block
    }

    fn spend_of(state: &LedgerState, uniquifier: u64) -> Transaction {
        Transaction {
            inputs: vec![StateRef {
                source_transaction: state.created_by,
                index: state.index,
            }],
            outputs: vec![Output {
                amount: state.output.amount,
                owner: [9u8; 32],
            }],
            creation_time_ms: uniquifier,
        }
    }

    #[test]
    fn validation_block_books_after_parents() {
        let f = fixture();
        let a = validation_block(15, 1, vec![f.anchor]);
        let a_id = a.id(&f.params).unwrap();
        let out_a = f.dag.append(a).unwrap();
        assert!(out_a.block.booked.was_triggered());

        let b = validation_block(25, 2, vec![a_id]);
        let out_b = f.dag.append(b).unwrap();
        assert!(out_b.block.booked.was_triggered());
        assert!(out_b.block.scheduled.was_triggered());
    }

    #[test]
    fn transaction_block_attaches_payload() {
        let f = fixture();
        let tx = spend_of(&f.genesis_state, 1);
        let tx_id = tx.id();
        let block = tx_block(15, 1, vec![f.anchor], tx);
        let outcome = f.dag.append(block).unwrap();

        assert!(outcome.block.booked.was_triggered());
        let metadata = f.mempool.transaction(&tx_id).unwrap();
        assert!(metadata.booked.was_triggered());
        assert_eq!(metadata.attachments(), vec![outcome.block.id()]);
    }

    #[test]
    fn conflicting_payloads_mark_blocks() {
        let f = fixture();
        let tx_a = spend_of(&f.genesis_state, 1);
        let tx_b = spend_of(&f.genesis_state, 2);
        let id_a = tx_a.id();
        let id_b = tx_b.id();

        let block_a = tx_block(15, 1, vec![f.anchor], tx_a);
        let block_b = tx_block(16, 2, vec![f.anchor], tx_b);
        let out_a = f.dag.append(block_a).unwrap();
        let out_b = f.dag.append(block_b).unwrap();

        assert!(out_a.block.spender_ids().contains(&id_a));
        assert!(out_a.block.spender_ids().contains(&id_b));
        assert!(out_b.block.spender_ids().contains(&id_a));
    }

    #[test]
    fn children_inherit_spender_ids_through_strong_parents() {
        let f = fixture();
        let tx_a = spend_of(&f.genesis_state, 1);
        let tx_b = spend_of(&f.genesis_state, 2);
        let id_a = tx_a.id();

        let block_a = tx_block(15, 1, vec![f.anchor], tx_a);
        let a_id = block_a.id(&f.params).unwrap();
        f.dag.append(block_a).unwrap();
        f.dag.append(tx_block(16, 2, vec![f.anchor], tx_b)).unwrap();

        let child = validation_block(25, 3, vec![a_id]);
        let out = f.dag.append(child).unwrap();
        assert!(out.block.spender_ids().contains(&id_a));
    }

    #[test]
    fn block_acceptance_marks_attachment_included() {
        let f = fixture();
        let tx = spend_of(&f.genesis_state, 1);
        let tx_id = tx.id();
        let block = tx_block(15, 1, vec![f.anchor], tx);
        let outcome = f.dag.append(block).unwrap();

        let metadata = f.mempool.transaction(&tx_id).unwrap();
        assert_eq!(metadata.earliest_included_slot.get(), 0);

        outcome.block.accepted.trigger();
        assert_eq!(metadata.earliest_included_slot.get(), 2);
        assert!(metadata.accepted.get());
    }

    #[test]
    fn booking_waits_for_missing_parent() {
        let f = fixture();
        let parent = validation_block(15, 1, vec![f.anchor]);
        let parent_id = parent.id(&f.params).unwrap();
        let child = validation_block(25, 2, vec![parent_id]);

        let out_child = f.dag.append(child).unwrap();
        assert!(!out_child.block.booked.was_triggered());

        f.dag.append(parent).unwrap();
        assert!(out_child.block.booked.was_triggered());
        let _ = &f.booker;
    }
}
