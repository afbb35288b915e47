//! Blocks: immutable wire payload plus mutable pipeline metadata.
//!
//! A `ProtocolBlock` is what travels the network: header (issuer, issuing
//! time, slot commitment, parent references), payload (a value transaction
//! or a validation payload) and an ed25519 signature. A `Block` is the
//! cache entry the engine pipeline works on: it wraps the payload (or a
//! missing-block placeholder) with reactive lifecycle events and the
//! voting/conflict bookkeeping of the downstream stages.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::commitment::CommitmentId;
use crate::committee::{AccountId, SeatIndex, Signature};
use crate::config::ProtocolParameters;
use crate::constants;
use crate::ledger::{Transaction, TransactionId};
use crate::reactive::{Event, Variable};
use crate::{hash_domain, short_hex, Hash, SlotIndex};

/// Errors from block construction and validation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BlockError {
    #[error("block has no strong parents")]
    NoStrongParents,
    #[error("block has {0} parents in one relation (max {max})", max = constants::MAX_PARENTS)]
    TooManyParents(usize),
    #[error("duplicate parent reference")]
    DuplicateParent,
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Identifier of a block: slot index alongside the content hash.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockId {
    pub slot: SlotIndex,
    pub hash: Hash,
}

impl BlockId {
    pub const LENGTH: usize = 40;

    /// The virtual block id anchoring the DAG at a commitment: the block
    /// all bootstrap-era blocks reference as their strong parent.
    pub fn root(commitment_id: &CommitmentId) -> Self {
        BlockId {
            slot: commitment_id.slot,
            hash: commitment_id.hash,
        }
    }

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
        Some(BlockId {
            slot: u64::from_le_bytes(slot_bytes),
            hash,
        })
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}:{}", self.slot, short_hex(&self.hash))
    }
}

/// The three parent relations of the DAG.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParentKind {
    /// Endorses the parent's past cone; carries votes and tip propagation.
    Strong,
    /// References the payload without endorsing the past cone.
    Weak,
    /// Endorses the payload of an otherwise-disliked block.
    ShallowLike,
}

/// Block payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// A basic value transaction.
    Transaction(Transaction),
    /// A validation block: no payload data, pure voting weight.
    Validation { highest_supported_version: u8 },
}

/// The signed, immutable block header.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub protocol_version: u8,
    pub issuer: AccountId,
    pub issuing_time_ms: u64,
    pub slot_commitment_id: CommitmentId,
    pub latest_finalized_slot: SlotIndex,
    pub strong_parents: Vec<BlockId>,
    pub weak_parents: Vec<BlockId>,
    pub shallow_like_parents: Vec<BlockId>,
}

/// A block as it travels the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtocolBlock {
    pub header: BlockHeader,
    pub payload: Payload,
    pub signature: Signature,
}

impl ProtocolBlock {
    /// Serialize to wire bytes. Parsing the result yields an identical
    /// block, and re-serializing yields identical bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BlockError> {
        bincode::serialize(self).map_err(|e| BlockError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlockError> {
        bincode::deserialize(bytes).map_err(|e| BlockError::Serialization(e.to_string()))
    }

    /// Bytes covered by the block signature (header and payload).
    pub fn sign_data(&self) -> Result<Vec<u8>, BlockError> {
        bincode::serialize(&(&self.header, &self.payload))
            .map_err(|e| BlockError::Serialization(e.to_string()))
    }

    /// The block id: issuing-time slot alongside the hash of the bytes.
    pub fn id(&self, params: &ProtocolParameters) -> Result<BlockId, BlockError> {
        Ok(BlockId {
            slot: params.slot_for_time(self.header.issuing_time_ms),
            hash: hash_domain(b"meridian.block.id", &self.to_bytes()?),
        })
    }

    pub fn slot(&self, params: &ProtocolParameters) -> SlotIndex {
        params.slot_for_time(self.header.issuing_time_ms)
    }

    /// Structural validation: parent counts and duplicate references.
    pub fn validate_structure(&self) -> Result<(), BlockError> {
        if self.header.strong_parents.is_empty() {
            return Err(BlockError::NoStrongParents);
        }
        for parents in [
            &self.header.strong_parents,
            &self.header.weak_parents,
            &self.header.shallow_like_parents,
        ] {
            if parents.len() > constants::MAX_PARENTS {
                return Err(BlockError::TooManyParents(parents.len()));
            }
            let unique: BTreeSet<_> = parents.iter().collect();
            if unique.len() != parents.len() {
                return Err(BlockError::DuplicateParent);
            }
        }
        Ok(())
    }

    /// All parent references with their relation.
    pub fn parents(&self) -> Vec<(ParentKind, BlockId)> {
        let mut parents = Vec::with_capacity(
            self.header.strong_parents.len()
                + self.header.weak_parents.len()
                + self.header.shallow_like_parents.len(),
        );
        parents.extend(
            self.header
                .strong_parents
                .iter()
                .map(|id| (ParentKind::Strong, *id)),
        );
        parents.extend(
            self.header
                .weak_parents
                .iter()
                .map(|id| (ParentKind::Weak, *id)),
        );
        parents.extend(
            self.header
                .shallow_like_parents
                .iter()
                .map(|id| (ParentKind::ShallowLike, *id)),
        );
        parents
    }
}

/// A block in the cache: payload plus mutable pipeline metadata.
///
/// Shared as `Arc<Block>`; all metadata uses interior mutability so the
/// pipeline stages can react to each other without exclusive ownership.
pub struct Block {
    id: BlockId,
    body: Mutex<Option<ProtocolBlock>>,

    // Lifecycle events, triggered by the pipeline stages in order.
    pub solid: Event,
    pub invalid: Event,
    pub booked: Event,
    /// Passed to the tip manager (post-booking).
    pub scheduled: Event,
    pub pre_accepted: Event,
    pub accepted: Event,
    pub pre_confirmed: Event,
    pub confirmed: Event,
    /// Set when the block's slot was committed.
    pub committed_slot: Variable<SlotIndex>,
    pub orphaned: Variable<bool>,

    // Solidification / booking bookkeeping (BlockDAG and Booker).
    unsolid_parents: AtomicUsize,
    unbooked_parents: AtomicUsize,

    // Voting bookkeeping (block gadget).
    witnesses: Mutex<BTreeSet<SeatIndex>>,
    ratifiers: Mutex<BTreeSet<SeatIndex>>,

    // Conflict bookkeeping (booker / mempool).
    spender_ids: Mutex<BTreeSet<TransactionId>>,

    // DAG child back-references, filled during solidification setup.
    strong_children: Mutex<Vec<Arc<Block>>>,
    weak_children: Mutex<Vec<Arc<Block>>>,
    shallow_like_children: Mutex<Vec<Arc<Block>>>,

    missing: AtomicBool,
    root_block: AtomicBool,
}

impl Block {
    pub fn new(id: BlockId, body: ProtocolBlock) -> Self {
        Self::build(id, Some(body), false)
    }

    /// A placeholder for a referenced but not yet received block.
    pub fn new_missing(id: BlockId) -> Self {
        Self::build(id, None, true)
    }

    /// A root block: already solid, booked and accepted; anchors the DAG
    /// below the eviction window.
    pub fn new_root(id: BlockId) -> Self {
        let block = Self::build(id, None, false);
        block.root_block.store(true, Ordering::SeqCst);
        block.solid.trigger();
        block.booked.trigger();
        block.pre_accepted.trigger();
        block.accepted.trigger();
        block.pre_confirmed.trigger();
        block.confirmed.trigger();
        block
    }

    fn build(id: BlockId, body: Option<ProtocolBlock>, missing: bool) -> Self {
        Block {
            id,
            body: Mutex::new(body),
            solid: Event::new(),
            invalid: Event::new(),
            booked: Event::new(),
            scheduled: Event::new(),
            pre_accepted: Event::new(),
            accepted: Event::new(),
            pre_confirmed: Event::new(),
            confirmed: Event::new(),
            committed_slot: Variable::new(0),
            orphaned: Variable::new(false),
            unsolid_parents: AtomicUsize::new(0),
            unbooked_parents: AtomicUsize::new(0),
            witnesses: Mutex::new(BTreeSet::new()),
            ratifiers: Mutex::new(BTreeSet::new()),
            spender_ids: Mutex::new(BTreeSet::new()),
            strong_children: Mutex::new(Vec::new()),
            weak_children: Mutex::new(Vec::new()),
            shallow_like_children: Mutex::new(Vec::new()),
            missing: AtomicBool::new(missing),
            root_block: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn slot(&self) -> SlotIndex {
        self.id.slot
    }

    pub fn is_missing(&self) -> bool {
        self.missing.load(Ordering::SeqCst)
    }

    pub fn is_root_block(&self) -> bool {
        self.root_block.load(Ordering::SeqCst)
    }

    pub fn mark_root_block(&self) {
        self.root_block.store(true, Ordering::SeqCst);
    }

    /// Replace a missing placeholder with the received payload.
    /// Returns false if the block already had a payload.
    pub fn fill(&self, body: ProtocolBlock) -> bool {
        let mut slot = lock(&self.body);
        if slot.is_some() {
            return false;
        }
        *slot = Some(body);
        drop(slot);
        self.missing.store(false, Ordering::SeqCst);
        true
    }

    pub fn protocol_block(&self) -> Option<ProtocolBlock> {
        lock(&self.body).clone()
    }

    pub fn header(&self) -> Option<BlockHeader> {
        lock(&self.body).as_ref().map(|b| b.header.clone())
    }

    pub fn issuer(&self) -> Option<AccountId> {
        lock(&self.body).as_ref().map(|b| b.header.issuer)
    }

    pub fn issuing_time_ms(&self) -> Option<u64> {
        lock(&self.body).as_ref().map(|b| b.header.issuing_time_ms)
    }

    pub fn slot_commitment_id(&self) -> Option<CommitmentId> {
        lock(&self.body).as_ref().map(|b| b.header.slot_commitment_id)
    }

    pub fn payload_transaction(&self) -> Option<Transaction> {
        lock(&self.body).as_ref().and_then(|b| match &b.payload {
            Payload::Transaction(tx) => Some(tx.clone()),
            Payload::Validation { .. } => None,
        })
    }

    pub fn strong_parent_ids(&self) -> Vec<BlockId> {
        lock(&self.body)
            .as_ref()
            .map(|b| b.header.strong_parents.clone())
            .unwrap_or_default()
    }

    pub fn parents(&self) -> Vec<(ParentKind, BlockId)> {
        lock(&self.body)
            .as_ref()
            .map(|b| b.parents())
            .unwrap_or_default()
    }

    // ── Solidification / booking counters ──

    pub fn init_unsolid_parents(&self, count: usize) {
        self.unsolid_parents.store(count, Ordering::SeqCst);
    }

    /// Decrement the unsolid-parent counter; true when it reaches zero.
    pub fn mark_parent_solid(&self) -> bool {
        self.unsolid_parents.fetch_sub(1, Ordering::SeqCst) == 1
    }

    pub fn init_unbooked_parents(&self, count: usize) {
        self.unbooked_parents.store(count, Ordering::SeqCst);
    }

    pub fn mark_parent_booked(&self) -> bool {
        self.unbooked_parents.fetch_sub(1, Ordering::SeqCst) == 1
    }

    // ── Voting ──

    /// Add a witness seat; true if newly added.
    pub fn add_witness(&self, seat: SeatIndex) -> bool {
        lock(&self.witnesses).insert(seat)
    }

    pub fn witness_seats(&self) -> BTreeSet<SeatIndex> {
        lock(&self.witnesses).clone()
    }

    /// Add a ratifier seat; true if newly added.
    pub fn add_ratifier(&self, seat: SeatIndex) -> bool {
        lock(&self.ratifiers).insert(seat)
    }

    pub fn ratifier_seats(&self) -> BTreeSet<SeatIndex> {
        lock(&self.ratifiers).clone()
    }

    // ── Conflicts ──

    pub fn add_spender_ids(&self, ids: impl IntoIterator<Item = TransactionId>) {
        lock(&self.spender_ids).extend(ids);
    }

    pub fn spender_ids(&self) -> BTreeSet<TransactionId> {
        lock(&self.spender_ids).clone()
    }

    // ── DAG relations ──

    pub fn register_child(&self, kind: ParentKind, child: &Arc<Block>) {
        let children = match kind {
            ParentKind::Strong => &self.strong_children,
            ParentKind::Weak => &self.weak_children,
            ParentKind::ShallowLike => &self.shallow_like_children,
        };
        lock(children).push(Arc::clone(child));
    }

    pub fn strong_children(&self) -> Vec<Arc<Block>> {
        lock(&self.strong_children).clone()
    }

    pub fn weak_children(&self) -> Vec<Arc<Block>> {
        lock(&self.weak_children).clone()
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id.to_string())
            .field("missing", &self.is_missing())
            .field("solid", &self.solid.was_triggered())
            .field("booked", &self.booked.was_triggered())
            .field("accepted", &self.accepted.was_triggered())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
