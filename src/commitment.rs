//! Slot commitments, their roots tree and validator attestations.
//!
//! A commitment is the cryptographic summary of a committed slot: it chains
//! to its predecessor, commits to the slot's roots (tangle, state,
//! mutations, attestations, committee, rewards) and accumulates attested
//! weight. Its identifier is the Blake2b-256 hash of the canonical
//! fixed-width encoding, so ids are stable bytewise across implementations.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::committee::{AccountId, Signature};
use crate::config::ProtocolParameters;
use crate::merkle::{self, MerkleProof};
use crate::{hash_domain, short_hex, Hash, SlotIndex};

/// Identifier of a slot commitment: the slot index alongside the content
/// hash, so eviction and routing can bucket by slot without a lookup.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CommitmentId {
    pub slot: SlotIndex,
    pub hash: Hash,
}

impl CommitmentId {
    pub const LENGTH: usize = 40;

    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        let mut bytes = [0u8; Self::LENGTH];
        bytes[..8].copy_from_slice(&self.slot.to_le_bytes());
        bytes[8..].copy_from_slice(&self.hash);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::LENGTH {
            return None;
        }
        let mut slot_bytes = [0u8; 8];
        slot_bytes.copy_from_slice(&bytes[..8]);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[8..]);
        Some(CommitmentId {
            slot: u64::from_le_bytes(slot_bytes),
            hash,
        })
    }
}

impl fmt::Display for CommitmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}:{}", self.slot, short_hex(&self.hash))
    }
}

/// The six per-slot roots a commitment commits to, in tree order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roots {
    /// Merkle root over the slot's accepted block ids, sorted.
    pub tangle_root: Hash,
    /// Root of the committed ledger state.
    pub state_root: Hash,
    /// Merkle root over the slot's accepted transaction ids, sorted.
    pub mutation_root: Hash,
    /// Root of the slot's attestation map.
    pub attestations_root: Hash,
    /// Root of the committee composition.
    pub committee_root: Hash,
    /// Root of the opaque per-epoch rewards state.
    pub rewards_root: Hash,
}

impl Roots {
    fn leaves(&self) -> [Hash; 6] {
        [
            self.tangle_root,
            self.state_root,
            self.mutation_root,
            self.attestations_root,
            self.committee_root,
            self.rewards_root,
        ]
    }

    /// Identifier of the roots tree (what the commitment carries).
    pub fn id(&self) -> Hash {
        merkle::merkle_root(&self.leaves())
    }

    /// Inclusion proof of the tangle root within the roots tree.
    ///
    /// Shipped in warp-sync responses so a peer can verify a block-id set
    /// against a commitment without learning the other roots.
    pub fn tangle_proof(&self) -> MerkleProof {
        let (_, proofs) = merkle::build_merkle_tree(&self.leaves());
        proofs[0].clone()
    }

    /// Inclusion proof of the attestations root within the roots tree
    /// (shipped alongside attestation responses).
    pub fn attestations_proof(&self) -> MerkleProof {
        let (_, proofs) = merkle::build_merkle_tree(&self.leaves());
        proofs[3].clone()
    }
}

/// Verify that `tangle_root` is the tangle leaf of the roots tree
/// identified by `roots_id`.
pub fn verify_tangle_root(tangle_root: &Hash, proof: &MerkleProof, roots_id: &Hash) -> bool {
    merkle::verify_proof(tangle_root, proof, roots_id)
}

/// Verify that `attestations_root` is the attestations leaf of the roots
/// tree identified by `roots_id`.
pub fn verify_attestations_root(
    attestations_root: &Hash,
    proof: &MerkleProof,
    roots_id: &Hash,
) -> bool {
    merkle::verify_proof(attestations_root, proof, roots_id)
}

/// A slot commitment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    pub protocol_version: u8,
    pub slot: SlotIndex,
    pub previous_commitment_id: CommitmentId,
    pub roots_id: Hash,
    pub cumulative_weight: u64,
    pub reference_mana_cost: u64,
}

impl Commitment {
    /// Canonical fixed-width little-endian encoding:
    /// `version ‖ slot ‖ previous_id ‖ roots_id ‖ weight ‖ rmc`.
    pub fn canonical_bytes(&self) -> [u8; 97] {
        let mut bytes = [0u8; 97];
        bytes[0] = self.protocol_version;
        bytes[1..9].copy_from_slice(&self.slot.to_le_bytes());
        bytes[9..49].copy_from_slice(&self.previous_commitment_id.to_bytes());
        bytes[49..81].copy_from_slice(&self.roots_id);
        bytes[81..89].copy_from_slice(&self.cumulative_weight.to_le_bytes());
        bytes[89..97].copy_from_slice(&self.reference_mana_cost.to_le_bytes());
        bytes
    }

    /// `commitment_id = blake2b(canonical bytes)`, carried with the slot.
    pub fn id(&self) -> CommitmentId {
        CommitmentId {
            slot: self.slot,
            hash: hash_domain(b"meridian.commitment.id", &self.canonical_bytes()),
        }
    }

    /// The genesis commitment: slot 0, zero predecessor and roots.
    pub fn genesis(params: &ProtocolParameters) -> Self {
        Commitment {
            protocol_version: params.version,
            slot: 0,
            previous_commitment_id: CommitmentId::default(),
            roots_id: [0u8; 32],
            cumulative_weight: 0,
            reference_mana_cost: params.reference_mana_cost,
        }
    }
}

/// A signed statement that an issuer has seen (and built on) a commitment.
///
/// Attestations aggregate into per-slot Merkle maps whose summed issuer
/// weight drives chain-weight comparison during chain switching.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub issuer: AccountId,
    pub issuing_time_ms: u64,
    pub slot_commitment_id: CommitmentId,
    pub signature: Signature,
}

impl Attestation {
    /// Bytes covered by the attestation signature.
    pub fn sign_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(32 + 8 + CommitmentId::LENGTH);
        data.extend_from_slice(&self.issuer);
        data.extend_from_slice(&self.issuing_time_ms.to_le_bytes());
        data.extend_from_slice(&self.slot_commitment_id.to_bytes());
        data
    }

    /// Content hash, used as the attestation-map leaf.
    pub fn hash(&self) -> Hash {
        let mut data = self.sign_data();
        data.extend_from_slice(&self.signature.0);
        hash_domain(b"meridian.attestation", &data)
    }

    /// Total order deciding which attestation per issuer wins: higher
    /// attested commitment slot first, then lexicographically greater
    /// commitment id, then later issuing time.
    pub fn compare(&self, other: &Attestation) -> Ordering {
        self.slot_commitment_id
            .slot
            .cmp(&other.slot_commitment_id.slot)
            .then_with(|| {
                self.slot_commitment_id
                    .hash
                    .cmp(&other.slot_commitment_id.hash)
            })
            .then_with(|| self.issuing_time_ms.cmp(&other.issuing_time_ms))
    }
}
