//! A chain: an ordered run of commitments from a forking point.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::chains::commitment_metadata::ChainId;
use crate::commitment::CommitmentId;
use crate::reactive::{Event, Variable};
use crate::SlotIndex;

/// Handle to an engine instance owned by the engine manager.
pub type EngineHandle = usize;

/// A linear history of commitments diverging from a parent chain at its
/// forking point.
///
/// Weights accumulate along the chain: `claimed_weight` follows the
/// cumulative weight the latest commitment claims, `attested_weight` the
/// latest commitment whose attestations verified, `verified_weight` the
/// latest commitment the engine has ledger-verified.
pub struct Chain {
    id: ChainId,
    /// Forking point; `None` only for the main chain's root bootstrap.
    pub forking_point: Variable<Option<CommitmentId>>,
    pub parent_chain: Variable<Option<ChainId>>,
    commitments: Mutex<BTreeMap<SlotIndex, CommitmentId>>,

    pub latest_commitment: Variable<Option<CommitmentId>>,
    pub latest_attested: Variable<Option<CommitmentId>>,
    pub latest_verified: Variable<Option<CommitmentId>>,

    pub claimed_weight: Variable<u64>,
    pub attested_weight: Variable<u64>,
    pub verified_weight: Variable<u64>,

    /// Slots below this are within the sync window.
    pub sync_threshold: Variable<SlotIndex>,
    /// Slots below this are warp-synced rather than replayed.
    pub warp_sync_threshold: Variable<SlotIndex>,

    /// Chain-switching flags driven by the heaviest-chain tracking.
    pub request_attestations: Variable<bool>,
    pub instantiate_engine: Variable<bool>,
    pub engine: Variable<Option<EngineHandle>>,
    pub is_evicted: Event,
}

impl Chain {
    pub fn new(id: ChainId, forking_point: Option<CommitmentId>, parent: Option<ChainId>) -> Self {
        Chain {
            id,
            forking_point: Variable::new(forking_point),
            parent_chain: Variable::new(parent),
            commitments: Mutex::new(BTreeMap::new()),
            latest_commitment: Variable::new(None),
            latest_attested: Variable::new(None),
            latest_verified: Variable::new(None),
            claimed_weight: Variable::new(0),
            attested_weight: Variable::new(0),
            verified_weight: Variable::new(0),
            sync_threshold: Variable::new(0),
            warp_sync_threshold: Variable::new(0),
            request_attestations: Variable::new(false),
            instantiate_engine: Variable::new(false),
            engine: Variable::new(None),
            is_evicted: Event::new(),
        }
    }

    pub fn id(&self) -> ChainId {
        self.id
    }

    /// Record a commitment as part of this chain.
    pub fn add_commitment(&self, slot: SlotIndex, id: CommitmentId) {
        lock(&self.commitments).insert(slot, id);
        self.latest_commitment.compute(|current| match current {
            Some(existing) if existing.slot >= slot => *current,
            _ => Some(id),
        });
    }

    /// The chain's commitment at the given slot, if known.
    pub fn commitment_at(&self, slot: SlotIndex) -> Option<CommitmentId> {
        lock(&self.commitments).get(&slot).copied()
    }

    pub fn commitment_slots(&self) -> Vec<SlotIndex> {
        lock(&self.commitments).keys().copied().collect()
    }

    pub fn latest_commitment_slot(&self) -> SlotIndex {
        self.latest_commitment.get().map(|id| id.slot).unwrap_or(0)
    }
}

fn lock(
    mutex: &Mutex<BTreeMap<SlotIndex, CommitmentId>>,
) -> std::sync::MutexGuard<'_, BTreeMap<SlotIndex, CommitmentId>> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(slot: SlotIndex, tag: u8) -> CommitmentId {
        CommitmentId {
            slot,
            hash: [tag; 32],
        }
    }

    #[test]
    fn latest_commitment_tracks_highest_slot() {
        let chain = Chain::new(0, None, None);
        chain.add_commitment(2, id(2, 1));
        chain.add_commitment(1, id(1, 2));
        assert_eq!(chain.latest_commitment.get(), Some(id(2, 1)));
        chain.add_commitment(5, id(5, 3));
        assert_eq!(chain.latest_commitment_slot(), 5);
        assert_eq!(chain.commitment_at(1), Some(id(1, 2)));
        assert_eq!(chain.commitment_at(9), None);
    }
}
