//! Slot notarization: aggregating accepted state per slot and producing
//! the chained slot commitments.
//!
//! Per slot the manager aggregates the accepted block set (tangle), the
//! accepted transaction mutations and the issuers' attestations. Once the
//! acceptance frontier is more than `min_committable_age` slots past a
//! slot, that slot is committed: mutations apply to the ledger, the six
//! roots are assembled, and the commitment chains onto its predecessor
//! with the attested weight accumulated. The store flush is the atomic
//! barrier; commitment publication is strictly monotonic by slot.

pub mod attestations;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::block::{Block, BlockId};
use crate::cache::BlockCache;
use crate::commitment::{Attestation, Commitment, Roots};
use crate::config::ProtocolParameters;
use crate::ledger::{Ledger, Transaction, TransactionId};
use crate::mempool::Mempool;
use crate::reactive::{Signal, Variable};
use crate::storage::{StorageError, Store};
use crate::{hash_domain, merkle, Hash, SlotIndex};

pub use attestations::{Attestations, AttestationsError};

/// Errors from slot commitment production.
#[derive(Clone, Debug, thiserror::Error)]
pub enum NotarizationError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("attestation error: {0}")]
    Attestations(#[from] AttestationsError),
    #[error("ledger error: {0}")]
    Ledger(#[from] crate::ledger::LedgerError),
    #[error("block error: {0}")]
    Block(#[from] crate::block::BlockError),
}

#[derive(Default)]
struct SlotData {
    accepted_blocks: BTreeSet<BlockId>,
    /// Accepted transactions in acceptance order (application order).
    accepted_transactions: Vec<Transaction>,
    transaction_ids: BTreeSet<TransactionId>,
}

pub struct Notarization {
    params: Arc<ProtocolParameters>,
    store: Store,
    cache: Arc<BlockCache>,
    ledger: Arc<Ledger>,
    mempool: Arc<Mempool>,
    attestations: Arc<Attestations>,

    slot_data: Mutex<BTreeMap<SlotIndex, SlotData>>,
    max_accepted_slot: AtomicU64,

    pub latest_commitment: Variable<Commitment>,
    pub slot_committed: Signal<(SlotIndex, Commitment)>,
    pub latest_commitment_updated: Signal<Commitment>,
}

impl Notarization {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: Arc<ProtocolParameters>,
        store: Store,
        cache: Arc<BlockCache>,
        ledger: Arc<Ledger>,
        mempool: Arc<Mempool>,
        attestations: Arc<Attestations>,
        initial_commitment: Commitment,
    ) -> Self {
        Notarization {
            params,
            store,
            cache,
            ledger,
            mempool,
            attestations,
            slot_data: Mutex::new(BTreeMap::new()),
            max_accepted_slot: AtomicU64::new(0),
            latest_commitment: Variable::new(initial_commitment),
            slot_committed: Signal::new(),
            latest_commitment_updated: Signal::new(),
        }
    }

    pub fn attestations(&self) -> &Arc<Attestations> {
        &self.attestations
    }

    /// Track an accepted block: tangle membership, the issuer's
    /// attestation, and a possible commitment advance.
    pub fn notarize_accepted_block(&self, block: &Arc<Block>) -> Result<(), NotarizationError> {
        let slot = block.slot();
        if slot <= self.latest_commitment.get().slot {
            // Acceptance below the committed frontier (warp-synced blocks
            // replaying history) adds nothing to open slots.
            return Ok(());
        }
        lock(&self.slot_data)
            .entry(slot)
            .or_default()
            .accepted_blocks
            .insert(block.id());

        if let Some(protocol_block) = block.protocol_block() {
            let attestation = Attestation {
                issuer: protocol_block.header.issuer,
                issuing_time_ms: protocol_block.header.issuing_time_ms,
                slot_commitment_id: protocol_block.header.slot_commitment_id,
                signature: protocol_block.signature.clone(),
            };
            if let Err(error) = self.attestations.add(attestation) {
                tracing::debug!(block = %block.id(), %error, "attestation not tracked");
            }
        }

        self.max_accepted_slot.fetch_max(slot, Ordering::SeqCst);
        self.try_commit()
    }

    /// Track an accepted transaction in its earliest included slot.
    pub fn notarize_accepted_transaction(
        &self,
        transaction: &Transaction,
        included_slot: SlotIndex,
    ) {
        let id = transaction.id();
        let mut slot_data = lock(&self.slot_data);
        let data = slot_data.entry(included_slot).or_default();
        if data.transaction_ids.insert(id) {
            data.accepted_transactions.push(transaction.clone());
        }
    }

    /// Commit every slot whose age passed `min_committable_age`.
    pub fn try_commit(&self) -> Result<(), NotarizationError> {
        loop {
            let next = self.latest_commitment.get().slot + 1;
            let frontier = self.max_accepted_slot.load(Ordering::SeqCst);
            if frontier <= next + self.params.min_committable_age {
                return Ok(());
            }
            self.commit_slot(next)?;
        }
    }

    fn commit_slot(&self, slot: SlotIndex) -> Result<(), NotarizationError> {
        let data = lock(&self.slot_data).remove(&slot).unwrap_or_default();

        // Persist the slot's accepted blocks (the tangle set).
        for block_id in &data.accepted_blocks {
            if let Some(block) = self.cache.get(block_id) {
                if let Some(protocol_block) = block.protocol_block() {
                    self.store.put_block(block_id, &protocol_block.to_bytes()?)?;
                }
            }
        }

        // Apply the slot's mutations to the committed ledger.
        self.ledger.apply_mutations(slot, &data.accepted_transactions)?;
        let mutation_ids: Vec<TransactionId> =
            data.transaction_ids.iter().copied().collect();
        self.store.put_mutations(slot, &mutation_ids)?;

        let (attestations_root, attested_weight) = self.attestations.commit(slot)?;

        let previous = self.latest_commitment.get();
        let roots = Roots {
            tangle_root: tangle_root(&data.accepted_blocks),
            state_root: self.ledger.state_root(),
            mutation_root: mutation_root(&data.transaction_ids),
            attestations_root,
            committee_root: self.store.committee()?.map(|c| c.root()).unwrap_or_default(),
            rewards_root: self.rewards_root(slot)?,
        };
        let commitment = Commitment {
            protocol_version: self.params.version,
            slot,
            previous_commitment_id: previous.id(),
            roots_id: roots.id(),
            cumulative_weight: previous.cumulative_weight + attested_weight,
            reference_mana_cost: self.params.reference_mana_cost,
        };

        self.store.put_roots(slot, &roots)?;
        self.store.put_commitment(&commitment)?;
        self.store.set_latest_commitment(&commitment)?;
        if !data.accepted_blocks.is_empty() {
            self.store.set_latest_non_empty_slot(slot)?;
        }
        self.store.flush()?;

        // Mark the slot's transactions committed (rivals orphan).
        for id in &mutation_ids {
            self.mempool.commit_transaction(id, slot);
        }
        for block_id in &data.accepted_blocks {
            if let Some(block) = self.cache.get(block_id) {
                block.committed_slot.set(slot);
            }
        }

        // The last accepted block of the slot anchors solidification once
        // the slot is evicted; only a short tail of anchors is kept.
        if let Some(root_id) = data.accepted_blocks.iter().next_back() {
            if let Some(block) = self.cache.get(root_id) {
                self.cache.register_root_block(block);
            }
        }
        self.cache.prune_root_blocks_below(slot.saturating_sub(2));

        tracing::info!(
            slot,
            commitment = %commitment.id(),
            cumulative_weight = commitment.cumulative_weight,
            "slot committed"
        );
        self.latest_commitment.set(commitment.clone());
        self.slot_committed.trigger(&(slot, commitment.clone()));
        self.latest_commitment_updated.trigger(&commitment);
        Ok(())
    }

    fn rewards_root(&self, slot: SlotIndex) -> Result<Hash, NotarizationError> {
        let epoch = self.params.epoch_of(slot);
        Ok(self
            .store
            .rewards_blob(epoch)?
            .map(|bytes| hash_domain(b"meridian.rewards", &bytes))
            .unwrap_or_default())
    }
}

/// Merkle root over a slot's accepted block ids, sorted lexicographically.
pub fn tangle_root(block_ids: &BTreeSet<BlockId>) -> Hash {
    let leaves: Vec<Hash> = block_ids.iter().map(tangle_leaf).collect();
    merkle::merkle_root(&leaves)
}

/// Leaf hash of a block id within the tangle root.
pub fn tangle_leaf(block_id: &BlockId) -> Hash {
    hash_domain(b"meridian.tangle.leaf", &block_id.to_bytes())
}

/// Merkle root over a slot's accepted transaction ids, sorted.
pub fn mutation_root(transaction_ids: &BTreeSet<TransactionId>) -> Hash {
    let leaves: Vec<Hash> = transaction_ids.iter().copied().collect();
    merkle::merkle_root(&leaves)
}

fn lock(
    mutex: &Mutex<BTreeMap<SlotIndex, SlotData>>,
) -> std::sync::MutexGuard<'_, BTreeMap<SlotIndex, SlotData>> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
