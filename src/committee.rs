//! Validator committee and seat-weight bookkeeping (sybil protection).
//!
//! Consensus weight is carried by committee seats: every validator account
//! occupies one seat with a fixed weight for the epoch. The block gadget
//! counts witness/ratifier seats against the online subset, the slot gadget
//! and confirmation against the full committee.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use ed25519_dalek::{Signature as EdSignature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::{hash_parts, merkle, Hash};

/// Identifier of a validator account (hash of its public key).
pub type AccountId = Hash;

/// An ed25519 signature in wire form.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    pub fn empty() -> Self {
        Signature(Vec::new())
    }
}

/// Index of a committee seat.
pub type SeatIndex = usize;

/// Derive an account id from a verifying key.
pub fn account_id(key_bytes: &[u8; 32]) -> AccountId {
    crate::hash_domain(b"meridian.account.id", key_bytes)
}

/// A committee member: account, signing key and seat weight.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeMember {
    pub account: AccountId,
    pub key_bytes: [u8; 32],
    pub weight: u64,
}

impl CommitteeMember {
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_bytes(&self.key_bytes).ok()
    }
}

/// The validator committee of the current epoch, seat-indexed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Committee {
    members: Vec<CommitteeMember>,
    #[serde(skip)]
    by_account: HashMap<AccountId, SeatIndex>,
    total_weight: u64,
}

impl Committee {
    pub fn new(members: Vec<CommitteeMember>) -> Self {
        let by_account = members
            .iter()
            .enumerate()
            .map(|(seat, m)| (m.account, seat))
            .collect();
        let total_weight = members.iter().map(|m| m.weight).sum();
        Committee {
            members,
            by_account,
            total_weight,
        }
    }

    /// Rebuild the derived account index after deserialization.
    pub fn reindex(self) -> Self {
        Self::new(self.members)
    }

    pub fn seat(&self, account: &AccountId) -> Option<SeatIndex> {
        self.by_account.get(account).copied()
    }

    pub fn member(&self, seat: SeatIndex) -> Option<&CommitteeMember> {
        self.members.get(seat)
    }

    pub fn members(&self) -> &[CommitteeMember] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Summed weight of the given seats.
    pub fn weight_of_seats(&self, seats: &BTreeSet<SeatIndex>) -> u64 {
        seats
            .iter()
            .filter_map(|seat| self.members.get(*seat))
            .map(|m| m.weight)
            .sum()
    }

    /// Summed weight of the given accounts (unknown accounts contribute 0).
    pub fn weight_of_accounts<'a>(&self, accounts: impl Iterator<Item = &'a AccountId>) -> u64 {
        accounts
            .filter_map(|account| self.seat(account))
            .filter_map(|seat| self.members.get(seat))
            .map(|m| m.weight)
            .sum()
    }

    /// Merkle root committing to the committee composition.
    pub fn root(&self) -> Hash {
        let leaves: Vec<Hash> = self
            .members
            .iter()
            .map(|m| {
                hash_parts(
                    b"meridian.committee.member",
                    &[&m.account, &m.key_bytes, &m.weight.to_le_bytes()],
                )
            })
            .collect();
        merkle::merkle_root(&leaves)
    }

    /// Verify an ed25519 signature by the given account over `message`.
    pub fn verify_signature(&self, account: &AccountId, message: &[u8], signature: &[u8]) -> bool {
        let Some(seat) = self.seat(account) else {
            return false;
        };
        let Some(member) = self.members.get(seat) else {
            return false;
        };
        let Some(key) = member.verifying_key() else {
            return false;
        };
        let Ok(sig) = EdSignature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &sig).is_ok()
    }
}

/// Tracks which committee seats are currently online.
///
/// A seat counts as online once a block from its account passed booking;
/// the (pre-)acceptance quorum is computed against this subset so a stalled
/// validator does not stall acceptance of everyone else's blocks.
pub struct SeatManager {
    committee: Committee,
    online: Mutex<BTreeSet<SeatIndex>>,
}

impl SeatManager {
    pub fn new(committee: Committee) -> Self {
        SeatManager {
            committee,
            online: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn committee(&self) -> &Committee {
        &self.committee
    }

    pub fn mark_online(&self, seat: SeatIndex) {
        self.lock_online().insert(seat);
    }

    pub fn mark_offline(&self, seat: SeatIndex) {
        self.lock_online().remove(&seat);
    }

    pub fn online_seats(&self) -> BTreeSet<SeatIndex> {
        self.lock_online().clone()
    }

    /// Summed weight of the online subset.
    pub fn online_weight(&self) -> u64 {
        self.committee.weight_of_seats(&self.lock_online())
    }

    fn lock_online(&self) -> std::sync::MutexGuard<'_, BTreeSet<SeatIndex>> {
        self.online
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Whether `weight` out of `total_weight` reaches the given fraction.
pub fn is_threshold_reached(weight: u64, total_weight: u64, threshold: f64) -> bool {
    total_weight > 0 && weight as f64 >= total_weight as f64 * threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn member_from_seed(seed: u8, weight: u64) -> (SigningKey, CommitteeMember) {
        let signing = SigningKey::from_bytes(&[seed; 32]);
        let key_bytes = signing.verifying_key().to_bytes();
        let member = CommitteeMember {
            account: account_id(&key_bytes),
            key_bytes,
            weight,
        };
        (signing, member)
    }

    fn committee_of(weights: &[u64]) -> Committee {
        Committee::new(
            weights
                .iter()
                .enumerate()
                .map(|(i, w)| member_from_seed(i as u8 + 1, *w).1)
                .collect(),
        )
    }

    #[test]
    fn seats_and_weights() {
        let committee = committee_of(&[10, 20, 30]);
        assert_eq!(committee.len(), 3);
        assert_eq!(committee.total_weight(), 60);
        let account = committee.members()[1].account;
        assert_eq!(committee.seat(&account), Some(1));
        let seats: BTreeSet<SeatIndex> = [0, 2].into_iter().collect();
        assert_eq!(committee.weight_of_seats(&seats), 40);
    }

    #[test]
    fn unknown_account_has_no_seat() {
        let committee = committee_of(&[1]);
        assert_eq!(committee.seat(&[9u8; 32]), None);
    }

    #[test]
    fn threshold_boundaries() {
        assert!(is_threshold_reached(50, 100, 0.5));
        assert!(!is_threshold_reached(49, 100, 0.5));
        assert!(is_threshold_reached(67, 100, 0.67));
        assert!(!is_threshold_reached(66, 100, 0.67));
        assert!(!is_threshold_reached(1, 0, 0.5));
    }

    #[test]
    fn online_tracking() {
        let manager = SeatManager::new(committee_of(&[10, 20]));
        assert_eq!(manager.online_weight(), 0);
        manager.mark_online(0);
        assert_eq!(manager.online_weight(), 10);
        manager.mark_online(1);
        assert_eq!(manager.online_weight(), 30);
        manager.mark_offline(0);
        assert_eq!(manager.online_weight(), 20);
    }

    #[test]
    fn committee_root_changes_with_members() {
        let a = committee_of(&[1, 2]);
        let b = committee_of(&[1, 3]);
        assert_ne!(a.root(), b.root());
        assert_eq!(a.root(), committee_of(&[1, 2]).root());
    }

    #[test]
    fn signature_verification() {
        let (signing, member) = member_from_seed(7, 1);
        let committee = Committee::new(vec![member.clone()]);
        let message = b"attest";
        let signature = signing.sign(message).to_bytes();
        assert!(committee.verify_signature(&member.account, message, &signature));
        assert!(!committee.verify_signature(&member.account, b"other", &signature));
        assert!(!committee.verify_signature(&[0u8; 32], message, &signature));
    }
}
