//! Reactive metadata wrapped around a slot commitment.

use crate::commitment::{Commitment, CommitmentId};
use crate::reactive::{derive2, Event, Variable};
use crate::SlotIndex;

/// Identifier of a chain in the chain manager's arena.
pub type ChainId = usize;

/// A commitment as tracked by the chain manager: the immutable commitment
/// plus the reactive lattice driving solidification, chain membership,
/// verification and the warp-sync window.
///
/// Invariants: `verified ⇒ parent_verified ⇒ solid`, and
/// `requires_warp_sync ⇒ in_sync_window`. Cross-references (chain, parent,
/// successor) are ids resolved through the chain manager, which owns every
/// instance.
pub struct CommitmentMetadata {
    commitment: Commitment,
    id: CommitmentId,

    pub chain: Variable<Option<ChainId>>,
    pub parent: Variable<Option<CommitmentId>>,
    pub successor: Variable<Option<CommitmentId>>,

    pub solid: Event,
    pub attested: Event,
    pub verified: Event,
    pub parent_verified: Event,
    pub below_sync_threshold: Event,
    pub below_warp_sync_threshold: Event,
    pub below_latest_verified: Event,
    pub evicted: Event,

    pub parent_above_latest_verified: Variable<bool>,
    pub directly_above_latest_verified: Variable<bool>,
    pub above_latest_verified: Variable<bool>,
    pub in_sync_window: Variable<bool>,
    pub requires_warp_sync: Variable<bool>,
}

impl CommitmentMetadata {
    pub fn new(commitment: Commitment) -> Self {
        let id = commitment.id();
        let solid = Event::new();
        let attested = Event::new();
        let verified = Event::new();
        let parent_verified = Event::new();
        let below_sync_threshold = Event::new();
        let below_warp_sync_threshold = Event::new();
        let below_latest_verified = Event::new();
        let parent_above_latest_verified = Variable::new(false);

        // verified ⇒ parent_verified ⇒ solid.
        solid.inherit_from(&parent_verified).detach();
        parent_verified.inherit_from(&verified).detach();

        let directly_above_latest_verified = derive2(
            parent_verified.as_variable(),
            verified.as_variable(),
            |parent_verified, verified| *parent_verified && !verified,
        );
        let above_latest_verified = derive2(
            &directly_above_latest_verified,
            &parent_above_latest_verified,
            |directly, parent| *directly || *parent,
        );
        let in_sync_window = derive2(
            below_sync_threshold.as_variable(),
            &above_latest_verified,
            |below, above| *below && *above,
        );
        let requires_warp_sync = derive2(
            &in_sync_window,
            below_warp_sync_threshold.as_variable(),
            |in_window, below_warp| *in_window && *below_warp,
        );

        CommitmentMetadata {
            commitment,
            id,
            chain: Variable::new(None),
            parent: Variable::new(None),
            successor: Variable::new(None),
            solid,
            attested,
            verified,
            parent_verified,
            below_sync_threshold,
            below_warp_sync_threshold,
            below_latest_verified,
            evicted: Event::new(),
            parent_above_latest_verified,
            directly_above_latest_verified,
            above_latest_verified,
            in_sync_window,
            requires_warp_sync,
        }
    }

    /// Metadata for a root commitment: settled on every axis.
    pub fn new_root(commitment: Commitment) -> Self {
        let metadata = Self::new(commitment);
        metadata.solid.trigger();
        metadata.attested.trigger();
        metadata.verified.trigger();
        metadata.parent_verified.trigger();
        metadata.below_sync_threshold.trigger();
        metadata.below_warp_sync_threshold.trigger();
        metadata.below_latest_verified.trigger();
        metadata
    }

    pub fn id(&self) -> CommitmentId {
        self.id
    }

    pub fn slot(&self) -> SlotIndex {
        self.commitment.slot
    }

    pub fn commitment(&self) -> &Commitment {
        &self.commitment
    }

    pub fn cumulative_weight(&self) -> u64 {
        self.commitment.cumulative_weight
    }

    pub fn previous_commitment_id(&self) -> CommitmentId {
        self.commitment.previous_commitment_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolParameters;

    fn commitment(slot: SlotIndex) -> Commitment {
        Commitment {
            protocol_version: 1,
            slot,
            previous_commitment_id: CommitmentId::default(),
            roots_id: [slot as u8; 32],
            cumulative_weight: slot,
            reference_mana_cost: 1,
        }
    }

    #[test]
    fn verified_implies_parent_verified_implies_solid() {
        let metadata = CommitmentMetadata::new(commitment(3));
        assert!(!metadata.solid.was_triggered());
        metadata.verified.trigger();
        assert!(metadata.parent_verified.was_triggered());
        assert!(metadata.solid.was_triggered());
    }

    #[test]
    fn warp_sync_requires_sync_window() {
        let metadata = CommitmentMetadata::new(commitment(3));
        // Below warp threshold alone is not enough.
        metadata.below_warp_sync_threshold.trigger();
        assert!(!metadata.requires_warp_sync.get());

        // Above latest verified + below sync threshold = in sync window.
        metadata.parent_verified.trigger();
        metadata.below_sync_threshold.trigger();
        assert!(metadata.directly_above_latest_verified.get());
        assert!(metadata.in_sync_window.get());
        assert!(metadata.requires_warp_sync.get());

        // Once verified itself, it is no longer above latest verified.
        metadata.verified.trigger();
        assert!(!metadata.directly_above_latest_verified.get());
        assert!(!metadata.requires_warp_sync.get());
    }

    #[test]
    fn root_metadata_is_settled() {
        let genesis = Commitment::genesis(&ProtocolParameters::default());
        let metadata = CommitmentMetadata::new_root(genesis);
        assert!(metadata.solid.was_triggered());
        assert!(metadata.verified.was_triggered());
        assert!(!metadata.requires_warp_sync.get());
    }
}
