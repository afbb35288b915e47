//! Per-slot attestation aggregation with a Merkle-rooted authenticated
//! map.
//!
//! Attestations are cached per slot and keyed by issuer; within a slot the
//! latest attestation per issuer wins (commitment slot, then commitment id,
//! then issuing time). Committing a slot freezes its map into the store,
//! computes the attestation root and the attested weight, and rejects any
//! further additions for that slot. A per-slot lock lets concurrent
//! additions to different slots proceed while a commit excludes additions
//! to the slot being committed.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::commitment::Attestation;
use crate::committee::{AccountId, SeatManager};
use crate::config::ProtocolParameters;
use crate::reactive::Variable;
use crate::storage::{StorageError, Store};
use crate::{hash_parts, merkle, Hash, SlotIndex};

/// Errors from attestation bookkeeping.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AttestationsError {
    #[error("attestation targets already committed slot {slot} (last committed {last_committed})")]
    PastSlot {
        slot: SlotIndex,
        last_committed: SlotIndex,
    },
    #[error("slot {0} is not committed yet")]
    NotCommitted(SlotIndex),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub struct Attestations {
    params: Arc<ProtocolParameters>,
    seats: Arc<SeatManager>,
    store: Store,
    cached: Mutex<BTreeMap<SlotIndex, HashMap<AccountId, Attestation>>>,
    slot_locks: Mutex<HashMap<SlotIndex, Arc<Mutex<()>>>>,
    pub last_committed_slot: Variable<SlotIndex>,
}

impl Attestations {
    pub fn new(
        params: Arc<ProtocolParameters>,
        seats: Arc<SeatManager>,
        store: Store,
    ) -> Result<Self, AttestationsError> {
        let last_committed = store.attestations_committed_slot()?;
        Ok(Attestations {
            params,
            seats,
            store,
            cached: Mutex::new(BTreeMap::new()),
            slot_locks: Mutex::new(HashMap::new()),
            last_committed_slot: Variable::new(last_committed),
        })
    }

    /// Add an attestation to its issuing-time slot. Within the slot, the
    /// latest attestation per issuer wins.
    pub fn add(&self, attestation: Attestation) -> Result<bool, AttestationsError> {
        let slot = self.params.slot_for_time(attestation.issuing_time_ms);
        self.with_slot_lock(slot, || {
            let last_committed = self.last_committed_slot.get();
            if slot <= last_committed {
                return Err(AttestationsError::PastSlot {
                    slot,
                    last_committed,
                });
            }

            let mut cached = lock(&self.cached);
            let slot_map = cached.entry(slot).or_default();
            match slot_map.get(&attestation.issuer) {
                Some(existing) if existing.compare(&attestation) != CmpOrdering::Less => Ok(false),
                _ => {
                    slot_map.insert(attestation.issuer, attestation);
                    Ok(true)
                }
            }
        })
    }

    /// Freeze the slot: persist the latest attestation per issuer, compute
    /// the Merkle root over the map and the attested committee weight.
    pub fn commit(&self, slot: SlotIndex) -> Result<(Hash, u64), AttestationsError> {
        self.with_slot_lock(slot, || {
            let last_committed = self.last_committed_slot.get();
            if slot <= last_committed {
                return Err(AttestationsError::PastSlot {
                    slot,
                    last_committed,
                });
            }

            let slot_map = lock(&self.cached).remove(&slot).unwrap_or_default();
            let committee = self.seats.committee();

            // Sorted by issuer for a deterministic root.
            let entries: BTreeMap<AccountId, Attestation> = slot_map
                .into_iter()
                .filter(|(issuer, _)| committee.seat(issuer).is_some())
                .collect();

            let mut weight = 0u64;
            for (issuer, attestation) in &entries {
                self.store.put_slot_attestation(slot, attestation)?;
                weight += committee
                    .seat(issuer)
                    .and_then(|seat| committee.member(seat))
                    .map(|member| member.weight)
                    .unwrap_or(0);
            }

            let root = attestations_root(entries.values());
            self.store.set_attestation_weight(slot, weight)?;
            self.store.set_attestations_committed_slot(slot)?;
            self.last_committed_slot.set(slot);

            Ok((root, weight))
        })
    }

    /// Committed attestations of a slot, ordered by issuer.
    pub fn get(&self, slot: SlotIndex) -> Result<Vec<Attestation>, AttestationsError> {
        if slot > self.last_committed_slot.get() {
            return Err(AttestationsError::NotCommitted(slot));
        }
        Ok(self.store.slot_attestations(slot)?)
    }

    /// Attested weight of a committed slot.
    pub fn weight(&self, slot: SlotIndex) -> Result<u64, AttestationsError> {
        if slot > self.last_committed_slot.get() {
            return Err(AttestationsError::NotCommitted(slot));
        }
        Ok(self.store.attestation_weight(slot)?)
    }

    /// Import a committed slot's attestations (snapshot intake).
    pub fn import(
        &self,
        slot: SlotIndex,
        attestations: Vec<Attestation>,
        weight: u64,
    ) -> Result<(), AttestationsError> {
        for attestation in &attestations {
            self.store.put_slot_attestation(slot, attestation)?;
        }
        self.store.set_attestation_weight(slot, weight)?;
        self.store.set_attestations_committed_slot(slot)?;
        self.last_committed_slot.set(slot);
        Ok(())
    }

    /// Export a committed slot's attestations (snapshot emission).
    pub fn export(&self, slot: SlotIndex) -> Result<(Vec<Attestation>, u64), AttestationsError> {
        Ok((self.get(slot)?, self.weight(slot)?))
    }

    /// Run `f` holding the lock of `slot`, so additions to other slots
    /// proceed in parallel while a commit excludes additions to its slot.
    fn with_slot_lock<R>(&self, slot: SlotIndex, f: impl FnOnce() -> R) -> R {
        let handle = {
            let mut locks = self
                .slot_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.retain(|s, _| *s + 1 >= self.last_committed_slot.get());
            Arc::clone(locks.entry(slot).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        let _guard = handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f()
    }
}

/// Merkle root over (issuer, attestation) entries, sorted by issuer.
pub fn attestations_root<'a>(attestations: impl Iterator<Item = &'a Attestation>) -> Hash {
    let leaves: Vec<Hash> = attestations
        .map(|a| hash_parts(b"meridian.attestations.entry", &[&a.issuer, &a.hash()]))
        .collect();
    merkle::merkle_root(&leaves)
}

fn lock(
    mutex: &Mutex<BTreeMap<SlotIndex, HashMap<AccountId, Attestation>>>,
) -> std::sync::MutexGuard<'_, BTreeMap<SlotIndex, HashMap<AccountId, Attestation>>> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::CommitmentId;
    use crate::committee::{account_id, Committee, CommitteeMember, Signature};
    use ed25519_dalek::SigningKey;

    fn setup(weights: &[u64]) -> (Attestations, Vec<AccountId>) {
        let members: Vec<CommitteeMember> = weights
            .iter()
            .enumerate()
            .map(|(i, weight)| {
                let key = SigningKey::from_bytes(&[i as u8 + 1; 32]);
                let key_bytes = key.verifying_key().to_bytes();
                CommitteeMember {
                    account: account_id(&key_bytes),
                    key_bytes,
                    weight: *weight,
                }
            })
            .collect();
        let accounts: Vec<AccountId> = members.iter().map(|m| m.account).collect();
        let seats = Arc::new(SeatManager::new(Committee::new(members)));
        let params = Arc::new(ProtocolParameters {
            genesis_unix_ms: 0,
            slot_duration_ms: 10,
            ..Default::default()
        });
        let store = Store::open_temporary().unwrap();
        (Attestations::new(params, seats, store).unwrap(), accounts)
    }

    fn attestation(issuer: AccountId, time_ms: u64, commitment_slot: SlotIndex) -> Attestation {
        Attestation {
            issuer,
            issuing_time_ms: time_ms,
            slot_commitment_id: CommitmentId {
                slot: commitment_slot,
                hash: [commitment_slot as u8; 32],
            },
            signature: Signature::empty(),
        }
    }

    #[test]
    fn add_and_commit_accumulates_weight() {
        let (attestations, accounts) = setup(&[30, 70]);
        attestations.add(attestation(accounts[0], 15, 1)).unwrap();
        attestations.add(attestation(accounts[1], 16, 1)).unwrap();

        let (root, weight) = attestations.commit(2).unwrap();
        assert_eq!(weight, 100);
        assert_ne!(root, [0u8; 32]);
        assert_eq!(attestations.weight(2).unwrap(), 100);
        assert_eq!(attestations.get(2).unwrap().len(), 2);
    }

    #[test]
    fn latest_attestation_per_issuer_wins() {
        let (attestations, accounts) = setup(&[1]);
        attestations.add(attestation(accounts[0], 15, 3)).unwrap();
        // An older commitment from the same issuer does not replace it.
        assert!(!attestations.add(attestation(accounts[0], 16, 2)).unwrap());
        // A newer commitment does.
        assert!(attestations.add(attestation(accounts[0], 17, 4)).unwrap());

        attestations.commit(2).unwrap();
        let committed = attestations.get(2).unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].slot_commitment_id.slot, 4);
    }

    #[test]
    fn additions_for_committed_slots_are_rejected() {
        let (attestations, accounts) = setup(&[1]);
        attestations.add(attestation(accounts[0], 15, 1)).unwrap();
        attestations.commit(2).unwrap();

        // Slot 2 (time 15) is now committed.
        assert!(matches!(
            attestations.add(attestation(accounts[0], 16, 5)),
            Err(AttestationsError::PastSlot { .. })
        ));
    }

    #[test]
    fn non_committee_attestations_carry_no_weight() {
        let (attestations, accounts) = setup(&[10]);
        attestations.add(attestation(accounts[0], 15, 1)).unwrap();
        attestations.add(attestation([99u8; 32], 16, 1)).unwrap();

        let (_, weight) = attestations.commit(2).unwrap();
        assert_eq!(weight, 10);
        assert_eq!(attestations.get(2).unwrap().len(), 1);
    }

    #[test]
    fn uncommitted_slot_queries_fail() {
        let (attestations, _) = setup(&[1]);
        assert!(matches!(
            attestations.get(5),
            Err(AttestationsError::NotCommitted(5))
        ));
    }

    #[test]
    fn import_export_roundtrip() {
        let (a, accounts) = setup(&[10, 20]);
        a.add(attestation(accounts[0], 15, 1)).unwrap();
        a.add(attestation(accounts[1], 16, 1)).unwrap();
        a.commit(2).unwrap();
        let (exported, weight) = a.export(2).unwrap();

        let (b, _) = setup(&[10, 20]);
        b.import(2, exported.clone(), weight).unwrap();
        assert_eq!(b.get(2).unwrap(), exported);
        assert_eq!(b.weight(2).unwrap(), weight);
        assert_eq!(b.last_committed_slot.get(), 2);
    }

    #[test]
    fn root_is_deterministic_and_order_independent() {
        let (a, accounts) = setup(&[1, 1]);
        a.add(attestation(accounts[0], 15, 1)).unwrap();
        a.add(attestation(accounts[1], 16, 1)).unwrap();
        let (root_a, _) = a.commit(2).unwrap();

        let (b, accounts_b) = setup(&[1, 1]);
        // Reverse insertion order.
        b.add(attestation(accounts_b[1], 16, 1)).unwrap();
        b.add(attestation(accounts_b[0], 15, 1)).unwrap();
        let (root_b, _) = b.commit(2).unwrap();
        assert_eq!(root_a, root_b);
    }
}
