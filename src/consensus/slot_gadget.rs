//! The slot gadget: slot finalization by weighted commitment votes.
//!
//! Every ratified-confirmed block is a vote: its issuer attests to the
//! block's slot commitment, which covers all slots up to its index. The
//! gadget keeps one highest-voted commitment slot per issuer; slot `S` is
//! finalized once the summed weight of issuers whose vote is at or past
//! `S` crosses `finalization_threshold × committee total weight`.
//! Finalization is strictly monotonic and prunes the vote trackers it
//! consumed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::block::Block;
use crate::committee::{is_threshold_reached, AccountId, SeatManager};
use crate::config::ProtocolParameters;
use crate::reactive::{Signal, Variable};
use crate::SlotIndex;

struct Trackers {
    /// Highest commitment slot each issuer has attested to.
    votes: HashMap<AccountId, SlotIndex>,
    /// Issuers per attested commitment slot (their current highest vote).
    voters_by_slot: BTreeMap<SlotIndex, Vec<AccountId>>,
}

pub struct SlotGadget {
    params: Arc<ProtocolParameters>,
    seats: Arc<SeatManager>,
    trackers: Mutex<Trackers>,

    pub latest_finalized_slot: Variable<SlotIndex>,
    pub slot_finalized: Signal<SlotIndex>,
}

impl SlotGadget {
    pub fn new(
        params: Arc<ProtocolParameters>,
        seats: Arc<SeatManager>,
        latest_finalized_slot: SlotIndex,
    ) -> Self {
        SlotGadget {
            params,
            seats,
            trackers: Mutex::new(Trackers {
                votes: HashMap::new(),
                voters_by_slot: BTreeMap::new(),
            }),
            latest_finalized_slot: Variable::new(latest_finalized_slot),
            slot_finalized: Signal::new(),
        }
    }

    /// Track the commitment vote of a ratified-confirmed block (wired to
    /// the block gadget's `block_confirmed`).
    pub fn track_votes(&self, block: &Arc<Block>) {
        let (Some(issuer), Some(commitment_id)) = (block.issuer(), block.slot_commitment_id())
        else {
            return;
        };
        let voted_slot = commitment_id.slot;
        let last_finalized = self.latest_finalized_slot.get();
        if voted_slot <= last_finalized {
            return;
        }

        let updated = {
            let mut trackers = lock(&self.trackers);
            let previous = trackers.votes.get(&issuer).copied();
            if previous.is_some_and(|p| p >= voted_slot) {
                false
            } else {
                if let Some(previous) = previous {
                    if let Some(voters) = trackers.voters_by_slot.get_mut(&previous) {
                        voters.retain(|a| a != &issuer);
                    }
                }
                trackers.votes.insert(issuer, voted_slot);
                trackers
                    .voters_by_slot
                    .entry(voted_slot)
                    .or_default()
                    .push(issuer);
                true
            }
        };
        if !updated {
            return;
        }

        for finalized in self.refresh_finalization(voted_slot) {
            tracing::info!(slot = finalized, "slot finalized");
            self.slot_finalized.trigger(&finalized);
        }
    }

    /// Walk finalization forward as far as the attestor weight carries it.
    fn refresh_finalization(&self, latest_voted: SlotIndex) -> Vec<SlotIndex> {
        let committee = self.seats.committee();
        let total_weight = committee.total_weight();
        let mut finalized = Vec::new();

        let mut slot = self.latest_finalized_slot.get() + 1;
        while slot <= latest_voted {
            let attestor_weight = {
                let trackers = lock(&self.trackers);
                // Voters of `slot`: issuers whose highest vote is >= slot.
                let voters: Vec<&AccountId> = trackers
                    .voters_by_slot
                    .range(slot..)
                    .flat_map(|(_, voters)| voters.iter())
                    .collect();
                committee.weight_of_accounts(voters.into_iter())
            };
            if !is_threshold_reached(
                attestor_weight,
                total_weight,
                self.params.finalization_threshold,
            ) {
                break;
            }
            self.latest_finalized_slot.set(slot);
            finalized.push(slot);
            self.prune(slot);
            slot += 1;
        }
        finalized
    }

    /// Drop vote bookkeeping at or below the finalized slot.
    fn prune(&self, slot: SlotIndex) {
        let mut trackers = lock(&self.trackers);
        let obsolete: Vec<SlotIndex> = trackers
            .voters_by_slot
            .range(..=slot)
            .map(|(s, _)| *s)
            .collect();
        for s in obsolete {
            if let Some(voters) = trackers.voters_by_slot.remove(&s) {
                for voter in voters {
                    trackers.votes.remove(&voter);
                }
            }
        }
    }
}

fn lock(mutex: &Mutex<Trackers>) -> std::sync::MutexGuard<'_, Trackers> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, BlockHeader, BlockId, Payload, ProtocolBlock};
    use crate::commitment::CommitmentId;
    use crate::committee::{account_id, Committee, CommitteeMember, Signature};
    use ed25519_dalek::SigningKey;

    fn seats(weights: &[u64]) -> (Arc<SeatManager>, Vec<AccountId>) {
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
        let accounts = members.iter().map(|m| m.account).collect();
        (Arc::new(SeatManager::new(Committee::new(members))), accounts)
    }

    fn voting_block(issuer: AccountId, block_slot: SlotIndex, commitment_slot: SlotIndex) -> Arc<Block> {
        let protocol_block = ProtocolBlock {
            header: BlockHeader {
                protocol_version: 1,
                issuer,
                issuing_time_ms: block_slot * 10,
                slot_commitment_id: CommitmentId {
                    slot: commitment_slot,
                    hash: [7u8; 32],
                },
                latest_finalized_slot: 0,
                strong_parents: vec![BlockId::default()],
                weak_parents: vec![],
                shallow_like_parents: vec![],
            },
            payload: Payload::Validation {
                highest_supported_version: 1,
            },
            signature: Signature::empty(),
        };
        let id = BlockId {
            slot: block_slot,
            hash: [block_slot as u8; 32],
        };
        Arc::new(Block::new(id, protocol_block))
    }

    fn gadget(weights: &[u64]) -> (SlotGadget, Vec<AccountId>) {
        let (seats, accounts) = seats(weights);
        let params = Arc::new(ProtocolParameters {
            slot_duration_ms: 10,
            ..Default::default()
        });
        (SlotGadget::new(params, seats, 0), accounts)
    }

    #[test]
    fn finalization_requires_supermajority() {
        let (gadget, accounts) = gadget(&[1, 1, 1]);
        let finalized = Arc::new(Mutex::new(Vec::new()));
        {
            let sink = Arc::clone(&finalized);
            gadget
                .slot_finalized
                .subscribe(move |slot| sink.lock().unwrap().push(*slot))
                .detach();
        }

        gadget.track_votes(&voting_block(accounts[0], 4, 2));
        gadget.track_votes(&voting_block(accounts[1], 4, 2));
        // 2 of 3 equal weights = 0.666 < 0.67.
        assert_eq!(gadget.latest_finalized_slot.get(), 0);

        gadget.track_votes(&voting_block(accounts[2], 4, 2));
        assert_eq!(gadget.latest_finalized_slot.get(), 2);
        assert_eq!(*finalized.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn higher_votes_cover_lower_slots() {
        let (gadget, accounts) = gadget(&[50, 50]);
        gadget.track_votes(&voting_block(accounts[0], 6, 3));
        gadget.track_votes(&voting_block(accounts[1], 7, 4));
        // Both voted >= 3: slots 1..=3 finalize; slot 4 has only one voter
        // (weight 50 of 100 < 0.67).
        assert_eq!(gadget.latest_finalized_slot.get(), 3);
    }

    #[test]
    fn votes_for_finalized_slots_are_ignored() {
        let (gadget, accounts) = gadget(&[50, 50]);
        gadget.track_votes(&voting_block(accounts[0], 6, 3));
        gadget.track_votes(&voting_block(accounts[1], 6, 3));
        assert_eq!(gadget.latest_finalized_slot.get(), 3);

        // A stale vote for an already finalized slot changes nothing.
        gadget.track_votes(&voting_block(accounts[0], 7, 2));
        assert_eq!(gadget.latest_finalized_slot.get(), 3);
    }

    #[test]
    fn vote_upgrades_replace_lower_votes() {
        let (gadget, accounts) = gadget(&[50, 50]);
        gadget.track_votes(&voting_block(accounts[0], 5, 2));
        gadget.track_votes(&voting_block(accounts[0], 6, 5));
        gadget.track_votes(&voting_block(accounts[1], 6, 5));
        assert_eq!(gadget.latest_finalized_slot.get(), 5);
    }

    #[test]
    fn weight_ratio_at_finalization_meets_threshold() {
        let (gadget, accounts) = gadget(&[30, 30, 40]);
        gadget.track_votes(&voting_block(accounts[0], 4, 1));
        assert_eq!(gadget.latest_finalized_slot.get(), 0); // 30/100
        gadget.track_votes(&voting_block(accounts[2], 4, 1));
        // 70/100 >= 0.67
        assert_eq!(gadget.latest_finalized_slot.get(), 1);
    }
}
