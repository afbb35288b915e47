//! Network protocol message definitions and the transport boundary.
//!
//! The peer-to-peer transport itself is an external collaborator: it
//! delivers typed `Message`s (unreliably, out of order) and accepts sends.
//! The dispatcher owns idempotency; nothing here retries or deduplicates.

use serde::{Deserialize, Serialize};

use crate::block::BlockId;
use crate::commitment::{Attestation, Commitment, CommitmentId};
use crate::merkle::MerkleProof;
use crate::Hash;

/// A peer identifier assigned by the transport.
pub type PeerId = Hash;

/// Network protocol messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    // ── Blocks ──
    /// A serialized block.
    Block(Vec<u8>),

    /// Request a block by id.
    BlockRequest(BlockId),

    // ── Slot commitments ──
    /// A slot commitment.
    SlotCommitment(Commitment),

    /// Request a commitment by id.
    SlotCommitmentRequest(CommitmentId),

    // ── Attestations ──
    /// Attestations for a commitment, with the Merkle proof tying their
    /// root into the commitment's roots id.
    Attestations {
        commitment: Commitment,
        attestations: Vec<Attestation>,
        proof: MerkleProof,
    },

    /// Request the attestations of a commitment.
    AttestationsRequest(CommitmentId),

    // ── Warp sync ──
    /// Request the accepted block set of a committed slot.
    WarpSyncRequest(CommitmentId),

    /// The accepted block ids of a committed slot, with the Merkle proof
    /// tying the tangle root into the commitment's roots id.
    WarpSyncResponse {
        commitment_id: CommitmentId,
        block_ids: Vec<BlockId>,
        proof: MerkleProof,
    },
}

/// The outbound half of the transport (black box).
///
/// `target: None` broadcasts; `Some(peer)` sends to one peer.
pub trait Network: Send + Sync {
    fn send(&self, target: Option<PeerId>, message: Message);
}

/// A recording network for tests and simulations.
#[derive(Default)]
pub struct MockNetwork {
    sent: std::sync::Mutex<Vec<(Option<PeerId>, Message)>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Option<PeerId>, Message)> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl Network for MockNetwork {
    fn send(&self, target: Option<PeerId>, message: Message) {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((target, message));
    }
}
