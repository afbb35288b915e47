//! Persistent storage for engine state.
//!
//! A sled database with one tree per namespace: permanent namespaces
//! (settings, commitments, ledger, committee, rewards, upgrade signals)
//! and per-slot "prunable" buckets (blocks, roots, attestations,
//! state mutations) whose keys are prefixed with the big-endian slot index
//! so a slot can be scanned or pruned as a range.
//!
//! A health tag in the settings namespace detects unclean shutdown: the
//! store is marked dirty on open and clean on `set_clean`; opening a dirty
//! store fails with `StorageError::Corrupted`, which the embedder treats as
//! fatal (resync required).

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::commitment::{Attestation, Commitment, Roots};
use crate::committee::{AccountId, Committee};
use crate::ledger::{LedgerState, StateId, TransactionId};
use crate::{block::BlockId, EpochIndex, SlotIndex};

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("store is corrupted: {0}; a resync from the network is required")]
    Corrupted(String),
}

fn io_err(e: sled::Error) -> StorageError {
    StorageError::Io(e.to_string())
}

const KEY_HEALTH: &[u8] = b"health";
const KEY_GENESIS_COMMITMENT: &[u8] = b"genesis_commitment";
const KEY_LATEST_COMMITMENT: &[u8] = b"latest_commitment";
const KEY_LATEST_FINALIZED_SLOT: &[u8] = b"latest_finalized_slot";
const KEY_LATEST_NON_EMPTY_SLOT: &[u8] = b"latest_non_empty_slot";
const KEY_ATTESTATIONS_COMMITTED_SLOT: &[u8] = b"attestations_last_committed_slot";
const KEY_ROOT_BLOCKS: &[u8] = b"root_blocks";

const HEALTH_DIRTY: &[u8] = b"dirty";
const HEALTH_CLEAN: &[u8] = b"clean";

/// Namespaced persistent store.
///
/// Cloning is cheap and refers to the same database.
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    settings: sled::Tree,
    commitments: sled::Tree,
    ledger: sled::Tree,
    committee: sled::Tree,
    rewards: sled::Tree,
    upgrade_signals: sled::Tree,
    // Prunable, slot-prefixed buckets.
    blocks: sled::Tree,
    roots: sled::Tree,
    attestations: sled::Tree,
    attestation_weights: sled::Tree,
    mutations: sled::Tree,
}

impl Store {
    /// Open or create a store at the given path.
    ///
    /// Fails with `Corrupted` if the previous run did not shut down
    /// cleanly (dirty health tag).
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(io_err)?;
        let store = Self::from_db(db)?;
        store.check_and_mark_dirty()?;
        Ok(store)
    }

    /// Open a temporary store (tests, forked candidate engines).
    pub fn open_temporary() -> Result<Self, StorageError> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(io_err)?;
        let store = Self::from_db(db)?;
        store.check_and_mark_dirty()?;
        Ok(store)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let open = |name: &str| db.open_tree(name).map_err(io_err);
        Ok(Store {
            settings: open("settings")?,
            commitments: open("commitments")?,
            ledger: open("ledger")?,
            committee: open("committee")?,
            rewards: open("rewards")?,
            upgrade_signals: open("upgrade_signals")?,
            blocks: open("blocks")?,
            roots: open("roots")?,
            attestations: open("attestations")?,
            attestation_weights: open("attestation_weights")?,
            mutations: open("mutations")?,
            db,
        })
    }

    fn check_and_mark_dirty(&self) -> Result<(), StorageError> {
        if let Some(tag) = self.settings.get(KEY_HEALTH).map_err(io_err)? {
            if tag.as_ref() == HEALTH_DIRTY {
                return Err(StorageError::Corrupted(
                    "previous run did not shut down cleanly".into(),
                ));
            }
        }
        self.settings
            .insert(KEY_HEALTH, HEALTH_DIRTY)
            .map_err(io_err)?;
        Ok(())
    }

    /// Mark the store cleanly shut down and flush.
    pub fn set_clean(&self) -> Result<(), StorageError> {
        self.settings
            .insert(KEY_HEALTH, HEALTH_CLEAN)
            .map_err(io_err)?;
        self.flush()
    }

    /// Flush all pending writes to disk (the atomic commit barrier).
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(io_err)?;
        Ok(())
    }

    // ── Settings ──

    pub fn set_genesis_commitment(&self, commitment: &Commitment) -> Result<(), StorageError> {
        put(&self.settings, KEY_GENESIS_COMMITMENT, commitment)
    }

    pub fn genesis_commitment(&self) -> Result<Option<Commitment>, StorageError> {
        get(&self.settings, KEY_GENESIS_COMMITMENT)
    }

    pub fn set_latest_commitment(&self, commitment: &Commitment) -> Result<(), StorageError> {
        put(&self.settings, KEY_LATEST_COMMITMENT, commitment)
    }

    pub fn latest_commitment(&self) -> Result<Option<Commitment>, StorageError> {
        get(&self.settings, KEY_LATEST_COMMITMENT)
    }

    pub fn set_latest_finalized_slot(&self, slot: SlotIndex) -> Result<(), StorageError> {
        put(&self.settings, KEY_LATEST_FINALIZED_SLOT, &slot)
    }

    pub fn latest_finalized_slot(&self) -> Result<SlotIndex, StorageError> {
        Ok(get(&self.settings, KEY_LATEST_FINALIZED_SLOT)?.unwrap_or(0))
    }

    pub fn set_latest_non_empty_slot(&self, slot: SlotIndex) -> Result<(), StorageError> {
        put(&self.settings, KEY_LATEST_NON_EMPTY_SLOT, &slot)
    }

    pub fn latest_non_empty_slot(&self) -> Result<SlotIndex, StorageError> {
        Ok(get(&self.settings, KEY_LATEST_NON_EMPTY_SLOT)?.unwrap_or(0))
    }

    pub fn set_attestations_committed_slot(&self, slot: SlotIndex) -> Result<(), StorageError> {
        put(&self.settings, KEY_ATTESTATIONS_COMMITTED_SLOT, &slot)
    }

    pub fn attestations_committed_slot(&self) -> Result<SlotIndex, StorageError> {
        Ok(get(&self.settings, KEY_ATTESTATIONS_COMMITTED_SLOT)?.unwrap_or(0))
    }

    /// Persist the eviction state's root block set.
    pub fn set_root_blocks(&self, root_blocks: &Vec<BlockId>) -> Result<(), StorageError> {
        put(&self.settings, KEY_ROOT_BLOCKS, root_blocks)
    }

    pub fn root_blocks(&self) -> Result<Vec<BlockId>, StorageError> {
        Ok(get(&self.settings, KEY_ROOT_BLOCKS)?.unwrap_or_default())
    }

    // ── Commitments ──

    pub fn put_commitment(&self, commitment: &Commitment) -> Result<(), StorageError> {
        put(&self.commitments, &slot_key(commitment.slot), commitment)
    }

    pub fn commitment_by_slot(&self, slot: SlotIndex) -> Result<Option<Commitment>, StorageError> {
        get(&self.commitments, &slot_key(slot))
    }

    /// Commitments in `[from, to]`, ascending by slot.
    pub fn commitments_in_range(
        &self,
        from: SlotIndex,
        to: SlotIndex,
    ) -> Result<Vec<Commitment>, StorageError> {
        let mut result = Vec::new();
        for entry in self.commitments.range(slot_key(from)..=slot_key(to)) {
            let (_, value) = entry.map_err(io_err)?;
            result.push(decode(&value)?);
        }
        Ok(result)
    }

    // ── Per-slot roots ──

    pub fn put_roots(&self, slot: SlotIndex, roots: &Roots) -> Result<(), StorageError> {
        put(&self.roots, &slot_key(slot), roots)
    }

    pub fn roots(&self, slot: SlotIndex) -> Result<Option<Roots>, StorageError> {
        get(&self.roots, &slot_key(slot))
    }

    // ── Per-slot blocks ──

    pub fn put_block(
        &self,
        block_id: &BlockId,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        let mut key = Vec::with_capacity(8 + BlockId::LENGTH);
        key.extend_from_slice(&slot_key(block_id.slot));
        key.extend_from_slice(&block_id.to_bytes());
        self.blocks.insert(key, bytes).map_err(io_err)?;
        Ok(())
    }

    /// Ids of the stored blocks of a slot, in key order.
    pub fn block_ids_in_slot(&self, slot: SlotIndex) -> Result<Vec<BlockId>, StorageError> {
        let mut ids = Vec::new();
        for entry in self.blocks.scan_prefix(slot_key(slot)) {
            let (key, _) = entry.map_err(io_err)?;
            if let Some(id) = BlockId::from_bytes(&key[8..]) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    pub fn block_bytes(&self, block_id: &BlockId) -> Result<Option<Vec<u8>>, StorageError> {
        let mut key = Vec::with_capacity(8 + BlockId::LENGTH);
        key.extend_from_slice(&slot_key(block_id.slot));
        key.extend_from_slice(&block_id.to_bytes());
        Ok(self
            .blocks
            .get(key)
            .map_err(io_err)?
            .map(|v| v.to_vec()))
    }

    // ── Per-slot attestations ──

    pub fn put_slot_attestation(
        &self,
        slot: SlotIndex,
        attestation: &Attestation,
    ) -> Result<(), StorageError> {
        let mut key = Vec::with_capacity(8 + 32);
        key.extend_from_slice(&slot_key(slot));
        key.extend_from_slice(&attestation.issuer);
        put(&self.attestations, &key, attestation)
    }

    /// Committed attestations of a slot, ordered by issuer id.
    pub fn slot_attestations(&self, slot: SlotIndex) -> Result<Vec<Attestation>, StorageError> {
        let mut result = Vec::new();
        for entry in self.attestations.scan_prefix(slot_key(slot)) {
            let (_, value) = entry.map_err(io_err)?;
            result.push(decode(&value)?);
        }
        Ok(result)
    }

    pub fn set_attestation_weight(
        &self,
        slot: SlotIndex,
        weight: u64,
    ) -> Result<(), StorageError> {
        put(&self.attestation_weights, &slot_key(slot), &weight)
    }

    pub fn attestation_weight(&self, slot: SlotIndex) -> Result<u64, StorageError> {
        Ok(get(&self.attestation_weights, &slot_key(slot))?.unwrap_or(0))
    }

    // ── Per-slot state mutations ──

    pub fn put_mutations(
        &self,
        slot: SlotIndex,
        mutations: &Vec<TransactionId>,
    ) -> Result<(), StorageError> {
        put(&self.mutations, &slot_key(slot), mutations)
    }

    pub fn mutations(&self, slot: SlotIndex) -> Result<Vec<TransactionId>, StorageError> {
        Ok(get(&self.mutations, &slot_key(slot))?.unwrap_or_default())
    }

    // ── Ledger ──

    pub fn put_ledger_state(&self, state: &LedgerState) -> Result<(), StorageError> {
        put(&self.ledger, &state.id, state)
    }

    pub fn delete_ledger_state(&self, id: &StateId) -> Result<(), StorageError> {
        self.ledger.remove(id).map_err(io_err)?;
        Ok(())
    }

    pub fn ledger_states(&self) -> Result<Vec<LedgerState>, StorageError> {
        let mut result = Vec::new();
        for entry in self.ledger.iter() {
            let (_, value) = entry.map_err(io_err)?;
            result.push(decode(&value)?);
        }
        Ok(result)
    }

    // ── Committee ──

    pub fn set_committee(&self, committee: &Committee) -> Result<(), StorageError> {
        put(&self.committee, b"current", committee)
    }

    pub fn committee(&self) -> Result<Option<Committee>, StorageError> {
        Ok(get::<Committee>(&self.committee, b"current")?.map(Committee::reindex))
    }

    // ── Opaque epoch-scoped blobs ──

    pub fn set_rewards_blob(&self, epoch: EpochIndex, bytes: &[u8]) -> Result<(), StorageError> {
        self.rewards
            .insert(slot_key(epoch), bytes)
            .map_err(io_err)?;
        Ok(())
    }

    pub fn rewards_blob(&self, epoch: EpochIndex) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .rewards
            .get(slot_key(epoch))
            .map_err(io_err)?
            .map(|v| v.to_vec()))
    }

    pub fn set_upgrade_signals(
        &self,
        epoch: EpochIndex,
        signals: &Vec<(AccountId, u32)>,
    ) -> Result<(), StorageError> {
        put(&self.upgrade_signals, &slot_key(epoch), signals)
    }

    pub fn upgrade_signals(
        &self,
        epoch: EpochIndex,
    ) -> Result<Vec<(AccountId, u32)>, StorageError> {
        Ok(get(&self.upgrade_signals, &slot_key(epoch))?.unwrap_or_default())
    }

    // ── Pruning ──

    /// Drop all prunable buckets of the given slot.
    pub fn prune_slot(&self, slot: SlotIndex) -> Result<(), StorageError> {
        for tree in [
            &self.blocks,
            &self.attestations,
            &self.attestation_weights,
            &self.roots,
            &self.mutations,
        ] {
            let keys: Vec<_> = tree
                .scan_prefix(slot_key(slot))
                .filter_map(|entry| entry.ok().map(|(k, _)| k))
                .collect();
            for key in keys {
                tree.remove(key).map_err(io_err)?;
            }
        }
        Ok(())
    }
}

/// Big-endian slot key so range scans iterate in slot order.
fn slot_key(slot: SlotIndex) -> [u8; 8] {
    slot.to_be_bytes()
}

fn put<T: Serialize>(tree: &sled::Tree, key: &[u8], value: &T) -> Result<(), StorageError> {
    let bytes =
        bincode::serialize(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
    tree.insert(key, bytes).map_err(io_err)?;
    Ok(())
}

fn get<T: DeserializeOwned>(tree: &sled::Tree, key: &[u8]) -> Result<Option<T>, StorageError> {
    match tree.get(key).map_err(io_err)? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}
