//! The chain manager: a commitment DAG rooted at a known root commitment,
//! chain objects over it, fork detection and heaviest-chain tracking.
//!
//! Commitments link to their parent by `previous_commitment_id`. The first
//! child registered becomes the parent's successor and inherits its chain;
//! later children spawn new chains forking at themselves. Chains compete
//! on three weights (claimed, attested, verified); the switching protocol
//! reacts to the corresponding heaviest-chain variables: request
//! attestations from the heaviest claimed, instantiate a candidate engine
//! for the heaviest attested, switch the main engine to the heaviest
//! verified.
//!
//! Ownership is arena-style: the manager owns all chains and commitment
//! metadata; cross-references are ids, so eviction drops cycles-free.

pub mod chain;
pub mod commitment_metadata;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::commitment::{self, Attestation, Commitment, CommitmentId};
use crate::committee::Committee;
use crate::config::ProtocolParameters;
use crate::merkle::MerkleProof;
use crate::notarization::attestations::attestations_root;
use crate::reactive::{Signal, Variable};
use crate::SlotIndex;

pub use chain::{Chain, EngineHandle};
pub use commitment_metadata::{ChainId, CommitmentMetadata};

/// Errors from chain-manager operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ChainError {
    #[error("unknown commitment {0}")]
    UnknownCommitment(CommitmentId),
    #[error("attestation proof does not match the commitment's roots")]
    AttestationProofMismatch(CommitmentId),
    #[error("attestation rejected: {0}")]
    InvalidAttestation(String),
}

pub struct ChainManager {
    params: Arc<ProtocolParameters>,
    weak_self: Weak<ChainManager>,

    commitments: Mutex<HashMap<CommitmentId, Arc<CommitmentMetadata>>>,
    chains: Mutex<Vec<Arc<Chain>>>,
    /// Children waiting for their parent commitment to be published.
    pending_children: Mutex<HashMap<CommitmentId, Vec<CommitmentId>>>,

    pub main_chain: Variable<ChainId>,
    pub heaviest_chain: Variable<Option<ChainId>>,
    pub heaviest_attested_chain: Variable<Option<ChainId>>,
    pub heaviest_verified_chain: Variable<Option<ChainId>>,

    pub commitment_published: Signal<Arc<CommitmentMetadata>>,
    pub chain_created: Signal<ChainId>,
    /// A referenced commitment is unknown: the requester should tick.
    pub commitment_missing: Signal<CommitmentId>,
    /// A previously missing commitment arrived.
    pub commitment_request_satisfied: Signal<CommitmentId>,
    /// The heaviest verified chain changed: the engine manager swaps.
    pub main_chain_switch: Signal<ChainId>,
}

impl ChainManager {
    pub fn new(params: Arc<ProtocolParameters>, root_commitment: Commitment) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak_self| ChainManager {
            params,
            weak_self: weak_self.clone(),
            commitments: Mutex::new(HashMap::new()),
            chains: Mutex::new(Vec::new()),
            pending_children: Mutex::new(HashMap::new()),
            main_chain: Variable::new(0),
            heaviest_chain: Variable::new(None),
            heaviest_attested_chain: Variable::new(None),
            heaviest_verified_chain: Variable::new(None),
            commitment_published: Signal::new(),
            chain_created: Signal::new(),
            commitment_missing: Signal::new(),
            commitment_request_satisfied: Signal::new(),
            main_chain_switch: Signal::new(),
        });

        let root = Arc::new(CommitmentMetadata::new_root(root_commitment));
        let root_id = root.id();
        let main = Arc::new(Chain::new(0, Some(root_id), None));
        lock(&manager.chains).push(Arc::clone(&main));
        lock(&manager.commitments).insert(root_id, Arc::clone(&root));
        manager.wire_commitment(&root);
        manager.assign_to_chain(&root, 0);
        manager.init_chain_switching();
        manager.on_commitment_verified(root_id);
        manager.chain_created.trigger(&0);
        manager
    }

    // ── Lookups ──

    pub fn commitment(&self, id: &CommitmentId) -> Option<Arc<CommitmentMetadata>> {
        lock(&self.commitments).get(id).cloned()
    }

    pub fn chain(&self, id: ChainId) -> Option<Arc<Chain>> {
        lock(&self.chains).get(id).cloned()
    }

    pub fn main_chain_instance(&self) -> Arc<Chain> {
        let id = self.main_chain.get();
        lock(&self.chains)[id].clone()
    }

    pub fn chain_count(&self) -> usize {
        lock(&self.chains).len()
    }

    /// Resolve a commitment, announcing it as missing when unknown.
    pub fn commitment_or_request(&self, id: CommitmentId) -> Option<Arc<CommitmentMetadata>> {
        let existing = self.commitment(&id);
        if existing.is_none() {
            self.commitment_missing.trigger(&id);
        }
        existing
    }

    // ── Publication ──

    /// Publish a commitment into the DAG (idempotent).
    pub fn process_commitment(&self, commitment: Commitment) -> Arc<CommitmentMetadata> {
        let id = commitment.id();
        let (metadata, created) = {
            let mut commitments = lock(&self.commitments);
            match commitments.get(&id) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let metadata = Arc::new(CommitmentMetadata::new(commitment));
                    commitments.insert(id, Arc::clone(&metadata));
                    (metadata, true)
                }
            }
        };
        if !created {
            return metadata;
        }
        self.commitment_request_satisfied.trigger(&id);
        self.wire_commitment(&metadata);

        // Link to the parent, or wait for it.
        let previous_id = metadata.previous_commitment_id();
        match self.commitment(&previous_id) {
            Some(parent) => self.register_child(&parent, &metadata),
            None => {
                lock(&self.pending_children)
                    .entry(previous_id)
                    .or_default()
                    .push(id);
                tracing::debug!(commitment = %previous_id, "requesting missing parent commitment");
                self.commitment_missing.trigger(&previous_id);
            }
        }

        // Adopt children that were waiting for this commitment.
        let waiting = lock(&self.pending_children).remove(&id).unwrap_or_default();
        for child_id in waiting {
            if let Some(child) = self.commitment(&child_id) {
                self.register_child(&metadata, &child);
            }
        }

        self.commitment_published.trigger(&metadata);
        metadata
    }

    /// Apply verified attestations received for a commitment: check the
    /// signatures and the Merkle proof against the commitment's roots id,
    /// then mark the commitment attested.
    pub fn process_attestations(
        &self,
        commitment_id: CommitmentId,
        attestations: &[Attestation],
        proof: &MerkleProof,
        committee: &Committee,
    ) -> Result<u64, ChainError> {
        let metadata = self
            .commitment(&commitment_id)
            .ok_or(ChainError::UnknownCommitment(commitment_id))?;

        let mut weight = 0u64;
        for attestation in attestations {
            if !committee.verify_signature(
                &attestation.issuer,
                &attestation.sign_data(),
                &attestation.signature.0,
            ) {
                return Err(ChainError::InvalidAttestation(
                    "signature verification failed".into(),
                ));
            }
            weight += committee.weight_of_accounts(std::iter::once(&attestation.issuer));
        }

        let root = attestations_root(attestations.iter());
        if !commitment::verify_attestations_root(&root, proof, &metadata.commitment().roots_id) {
            tracing::error!(commitment = %commitment_id, "attestations root mismatch, rejecting");
            return Err(ChainError::AttestationProofMismatch(commitment_id));
        }

        metadata.attested.trigger();
        Ok(weight)
    }

    // ── Eviction ──

    /// Drop commitment metadata at or below `slot`, keeping forking
    /// points addressable.
    pub fn evict(&self, slot: SlotIndex) {
        let forking_points: Vec<CommitmentId> = lock(&self.chains)
            .iter()
            .filter_map(|chain| chain.forking_point.get())
            .collect();
        let evicted: Vec<Arc<CommitmentMetadata>> = {
            let mut commitments = lock(&self.commitments);
            let doomed: Vec<CommitmentId> = commitments
                .iter()
                .filter(|(id, metadata)| {
                    metadata.slot() <= slot && !forking_points.contains(id)
                })
                .map(|(id, _)| *id)
                .collect();
            doomed
                .into_iter()
                .filter_map(|id| commitments.remove(&id))
                .collect()
        };
        for metadata in evicted {
            metadata.evicted.trigger();
        }
        lock(&self.pending_children).retain(|id, _| id.slot > slot);
    }

    // ── Internals ──

    /// Subscribe the manager to a commitment's weight-relevant events.
    fn wire_commitment(&self, metadata: &Arc<CommitmentMetadata>) {
        let id = metadata.id();
        let weak = self.weak_self.clone();
        metadata
            .attested
            .on_trigger(move || {
                if let Some(manager) = weak.upgrade() {
                    manager.on_commitment_attested(id);
                }
            })
            .detach();
        let weak = self.weak_self.clone();
        metadata
            .verified
            .on_trigger(move || {
                if let Some(manager) = weak.upgrade() {
                    manager.on_commitment_verified(id);
                }
            })
            .detach();
    }

    fn register_child(&self, parent: &Arc<CommitmentMetadata>, child: &Arc<CommitmentMetadata>) {
        child.parent.set(Some(parent.id()));
        child.solid.inherit_from(&parent.solid).detach();
        child.parent_verified.inherit_from(&parent.verified).detach();

        {
            let target = child.parent_above_latest_verified.clone();
            parent
                .above_latest_verified
                .on_update(move |_, above| {
                    target.set(*above);
                })
                .detach();
            child
                .parent_above_latest_verified
                .set(parent.above_latest_verified.get());
        }

        // First child becomes the successor and adopts the parent's chain;
        // later children spawn a fork.
        let child_id = child.id();
        parent.successor.compute(|current| current.or(Some(child_id)));
        if parent.successor.get() == Some(child_id) {
            // Follow the parent's chain, now and on later reassignments.
            let weak = self.weak_self.clone();
            parent
                .chain
                .on_update(move |_, chain| {
                    if let (Some(manager), Some(chain)) = (weak.upgrade(), chain) {
                        if let Some(child) = manager.commitment(&child_id) {
                            manager.assign_to_chain(&child, *chain);
                        }
                    }
                })
                .detach();
            if let Some(chain) = parent.chain.get() {
                self.assign_to_chain(child, chain);
            }
        } else {
            let fork_id = {
                let mut chains = lock(&self.chains);
                let fork_id = chains.len();
                chains.push(Arc::new(Chain::new(
                    fork_id,
                    Some(child_id),
                    parent.chain.get(),
                )));
                fork_id
            };
            tracing::info!(
                forking_point = %child_id,
                chain = fork_id,
                "commitment diverges from known successor, fork detected"
            );
            self.assign_to_chain(child, fork_id);
            self.chain_created.trigger(&fork_id);
        }
    }

    fn assign_to_chain(&self, metadata: &Arc<CommitmentMetadata>, chain_id: ChainId) {
        let Some(chain) = self.chain(chain_id) else {
            return;
        };
        metadata.chain.set(Some(chain_id));
        chain.add_commitment(metadata.slot(), metadata.id());
        if chain.latest_commitment.get() == Some(metadata.id()) {
            chain.claimed_weight.set(metadata.cumulative_weight());
        }
        self.refresh_thresholds_for(metadata, &chain);
        self.track_heaviest(chain_id);
    }

    fn on_commitment_attested(&self, id: CommitmentId) {
        let Some(metadata) = self.commitment(&id) else {
            return;
        };
        let Some(chain) = metadata.chain.get().and_then(|c| self.chain(c)) else {
            return;
        };
        chain.latest_attested.compute(|current| match current {
            Some(existing) if existing.slot >= id.slot => *current,
            _ => Some(id),
        });
        if chain.latest_attested.get() == Some(id) {
            chain.attested_weight.set(metadata.cumulative_weight());
            self.track_heaviest(chain.id());
        }
    }

    fn on_commitment_verified(&self, id: CommitmentId) {
        let Some(metadata) = self.commitment(&id) else {
            return;
        };
        // Verification implies attestation coverage for weight purposes.
        metadata.attested.trigger();
        let Some(chain) = metadata.chain.get().and_then(|c| self.chain(c)) else {
            return;
        };
        chain.latest_verified.compute(|current| match current {
            Some(existing) if existing.slot >= id.slot => *current,
            _ => Some(id),
        });
        if chain.latest_verified.get() == Some(id) {
            chain.verified_weight.set(metadata.cumulative_weight());
            chain
                .sync_threshold
                .set(id.slot + self.params.sync_window);
            chain
                .warp_sync_threshold
                .set(id.slot + self.params.warp_sync_window);
            self.refresh_chain_thresholds(&chain);
            self.track_heaviest(chain.id());
        }
    }

    /// Re-evaluate the threshold events of every commitment on the chain.
    fn refresh_chain_thresholds(&self, chain: &Arc<Chain>) {
        for slot in chain.commitment_slots() {
            if let Some(metadata) = chain
                .commitment_at(slot)
                .and_then(|id| self.commitment(&id))
            {
                self.refresh_thresholds_for(&metadata, chain);
            }
        }
    }

    fn refresh_thresholds_for(&self, metadata: &Arc<CommitmentMetadata>, chain: &Arc<Chain>) {
        let latest_verified = chain.latest_verified.get().map(|id| id.slot).unwrap_or(0);
        if metadata.slot() < latest_verified {
            metadata.below_latest_verified.trigger();
        }
        if metadata.slot() < chain.sync_threshold.get() {
            metadata.below_sync_threshold.trigger();
        }
        if metadata.slot() < chain.warp_sync_threshold.get() {
            metadata.below_warp_sync_threshold.trigger();
        }
    }

    /// Candidate replaces the current heaviest under strict inequality;
    /// evicted incumbents always lose; ties keep the incumbent.
    fn track_heaviest(&self, candidate: ChainId) {
        self.update_heaviest(&self.heaviest_chain, candidate, |c| c.claimed_weight.get());
        self.update_heaviest(&self.heaviest_attested_chain, candidate, |c| {
            c.attested_weight.get()
        });
        self.update_heaviest(&self.heaviest_verified_chain, candidate, |c| {
            c.verified_weight.get()
        });
    }

    fn update_heaviest(
        &self,
        variable: &Variable<Option<ChainId>>,
        candidate: ChainId,
        weight_of: impl Fn(&Chain) -> u64,
    ) {
        let candidate_weight = match self.chain(candidate) {
            Some(chain) => weight_of(&chain),
            None => return,
        };
        if candidate_weight == 0 {
            return;
        }
        variable.compute(|current| match current {
            None => Some(candidate),
            Some(current_id) => {
                let current_chain = self.chain(*current_id);
                let current_evicted = current_chain
                    .as_ref()
                    .map(|c| c.is_evicted.was_triggered())
                    .unwrap_or(true);
                let current_weight = current_chain.map(|c| weight_of(&c)).unwrap_or(0);
                if current_evicted || candidate_weight > current_weight {
                    Some(candidate)
                } else {
                    *current
                }
            }
        });
    }

    /// Wire the chain-switching protocol to the heaviest variables.
    fn init_chain_switching(&self) {
        let weak = self.weak_self.clone();
        self.heaviest_chain
            .on_update(move |previous, new| {
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                if let Some(previous) = previous.and_then(|id| manager.chain(id)) {
                    previous.request_attestations.set(false);
                }
                if let Some(new) = new.and_then(|id| manager.chain(id)) {
                    tracing::info!(chain = new.id(), "heavier chain claimed, requesting attestations");
                    new.request_attestations.set(true);
                }
            })
            .detach();

        let weak = self.weak_self.clone();
        self.heaviest_attested_chain
            .on_update(move |previous, new| {
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                if let Some(previous) = previous.and_then(|id| manager.chain(id)) {
                    previous.instantiate_engine.set(false);
                }
                if let Some(new) = new.and_then(|id| manager.chain(id)) {
                    tracing::info!(chain = new.id(), "heavier attested chain, instantiating engine");
                    new.instantiate_engine.set(true);
                }
            })
            .detach();

        let weak = self.weak_self.clone();
        self.heaviest_verified_chain
            .on_update(move |_, new| {
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                if let Some(new) = *new {
                    if manager.main_chain.get() != new {
                        tracing::info!(chain = new, "switching main chain to heaviest verified");
                        manager.main_chain.set(new);
                        manager.main_chain_switch.trigger(&new);
                    }
                }
            })
            .detach();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::Roots;

    fn params() -> Arc<ProtocolParameters> {
        Arc::new(ProtocolParameters {
            sync_window: 20,
            warp_sync_window: 8,
            ..Default::default()
        })
    }

    fn root_commitment() -> Commitment {
        Commitment::genesis(&ProtocolParameters::default())
    }

    fn child_of(parent: &Commitment, weight_step: u64, tag: u8) -> Commitment {
        Commitment {
            protocol_version: 1,
            slot: parent.slot + 1,
            previous_commitment_id: parent.id(),
            roots_id: Roots {
                tangle_root: [tag; 32],
                ..Default::default()
            }
            .id(),
            cumulative_weight: parent.cumulative_weight + weight_step,
            reference_mana_cost: 1,
        }
    }

    #[test]
    fn successor_adopts_main_chain() {
        let manager = ChainManager::new(params(), root_commitment());
        let c1 = child_of(&root_commitment(), 10, 1);
        let c2 = child_of(&c1, 10, 1);
        let m1 = manager.process_commitment(c1);
        let m2 = manager.process_commitment(c2);

        assert_eq!(m1.chain.get(), Some(0));
        assert_eq!(m2.chain.get(), Some(0));
        assert!(m1.solid.was_triggered());
        assert!(m2.solid.was_triggered());
        assert_eq!(manager.chain_count(), 1);
        assert_eq!(
            manager.main_chain_instance().latest_commitment.get(),
            Some(m2.id())
        );
        assert_eq!(manager.main_chain_instance().claimed_weight.get(), 20);
    }

    #[test]
    fn second_child_spawns_fork_chain() {
        let manager = ChainManager::new(params(), root_commitment());
        let c1 = child_of(&root_commitment(), 10, 1);
        let fork = child_of(&root_commitment(), 12, 2);
        manager.process_commitment(c1);
        let fork_meta = manager.process_commitment(fork);

        assert_eq!(manager.chain_count(), 2);
        assert_eq!(fork_meta.chain.get(), Some(1));
        let fork_chain = manager.chain(1).unwrap();
        assert_eq!(fork_chain.forking_point.get(), Some(fork_meta.id()));
        assert_eq!(fork_chain.parent_chain.get(), Some(0));
        assert_eq!(fork_chain.claimed_weight.get(), 12);
    }

    #[test]
    fn unsolid_parent_chain_resolves_when_parent_arrives() {
        let manager = ChainManager::new(params(), root_commitment());
        let c1 = child_of(&root_commitment(), 10, 1);
        let c2 = child_of(&c1, 10, 1);

        let missing = Arc::new(Mutex::new(Vec::new()));
        {
            let sink = Arc::clone(&missing);
            manager
                .commitment_missing
                .subscribe(move |id| sink.lock().unwrap().push(*id))
                .detach();
        }

        // Child first: parent requested, child not solid.
        let m2 = manager.process_commitment(c2);
        assert!(!m2.solid.was_triggered());
        assert_eq!(missing.lock().unwrap().len(), 1);
        assert_eq!(missing.lock().unwrap()[0], c1.id());

        // Parent arrives: child links, solidifies and joins the chain.
        let m1 = manager.process_commitment(c1);
        assert!(m1.solid.was_triggered());
        assert!(m2.solid.was_triggered());
        assert_eq!(m2.chain.get(), Some(0));
    }

    #[test]
    fn heavier_fork_requests_attestations() {
        let manager = ChainManager::new(params(), root_commitment());
        let c1 = child_of(&root_commitment(), 10, 1);
        manager.process_commitment(c1.clone());
        assert_eq!(manager.heaviest_chain.get(), Some(0));
        assert!(manager.chain(0).unwrap().request_attestations.get());

        // A fork with 5% more claimed weight takes over.
        let fork = child_of(&root_commitment(), 11, 2);
        manager.process_commitment(fork);
        assert_eq!(manager.heaviest_chain.get(), Some(1));
        assert!(manager.chain(1).unwrap().request_attestations.get());
        assert!(!manager.chain(0).unwrap().request_attestations.get());
    }

    #[test]
    fn ties_keep_the_incumbent() {
        let manager = ChainManager::new(params(), root_commitment());
        let c1 = child_of(&root_commitment(), 10, 1);
        let fork = child_of(&root_commitment(), 10, 2);
        manager.process_commitment(c1);
        manager.process_commitment(fork);
        assert_eq!(manager.heaviest_chain.get(), Some(0));
    }

    #[test]
    fn verification_switches_main_chain() {
        let manager = ChainManager::new(params(), root_commitment());
        let switches = Arc::new(Mutex::new(Vec::new()));
        {
            let sink = Arc::clone(&switches);
            manager
                .main_chain_switch
                .subscribe(move |chain| sink.lock().unwrap().push(*chain))
                .detach();
        }

        let c1 = child_of(&root_commitment(), 10, 1);
        let fork = child_of(&root_commitment(), 12, 2);
        manager.process_commitment(c1);
        let fork_meta = manager.process_commitment(fork);

        // Simulate the candidate engine verifying the fork.
        fork_meta.verified.trigger();
        assert_eq!(manager.heaviest_verified_chain.get(), Some(1));
        assert_eq!(manager.main_chain.get(), 1);
        assert_eq!(*switches.lock().unwrap(), vec![1]);
        assert!(manager.chain(1).unwrap().instantiate_engine.get());
    }

    #[test]
    fn thresholds_follow_latest_verified() {
        let manager = ChainManager::new(params(), root_commitment());
        let c1 = child_of(&root_commitment(), 10, 1);
        let m1 = manager.process_commitment(c1.clone());
        // Root is verified at slot 0: sync threshold 20, warp 8.
        assert!(m1.below_sync_threshold.was_triggered());
        assert!(m1.below_warp_sync_threshold.was_triggered());
        // Slot 1 is above latest verified (parent verified, not itself).
        assert!(m1.above_latest_verified.get());
        assert!(m1.in_sync_window.get());
        assert!(m1.requires_warp_sync.get());

        m1.verified.trigger();
        assert!(!m1.requires_warp_sync.get());
        let chain = manager.chain(0).unwrap();
        assert_eq!(chain.sync_threshold.get(), 1 + 20);
        assert_eq!(chain.verified_weight.get(), 10);
    }

    #[test]
    fn eviction_drops_metadata_but_keeps_forking_points() {
        let manager = ChainManager::new(params(), root_commitment());
        let c1 = child_of(&root_commitment(), 10, 1);
        let fork = child_of(&root_commitment(), 12, 2);
        let m1 = manager.process_commitment(c1);
        let fork_meta = manager.process_commitment(fork);

        manager.evict(1);
        assert!(m1.evicted.was_triggered());
        assert!(manager.commitment(&m1.id()).is_none());
        // The fork's forking point survives.
        assert!(manager.commitment(&fork_meta.id()).is_some());
    }
}
