//! Snapshot export and import.
//!
//! A snapshot captures a node's committed state at a target slot:
//! settings (genesis commitment, protocol version, latest finalized slot,
//! latest commitment), the commitment range up to the target, the ledger
//! state set, the committee, the eviction state (root blocks), the target
//! slot's attestations and its roots. Importing a snapshot into a fresh
//! store yields a node whose commitment bytes match the exporter's.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::block::BlockId;
use crate::commitment::{Attestation, Commitment, Roots};
use crate::committee::Committee;
use crate::ledger::LedgerState;
use crate::storage::{StorageError, Store};
use crate::SlotIndex;

/// Errors from snapshot handling.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot is missing {0}")]
    Incomplete(&'static str),
}

/// Snapshot settings header.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSettings {
    pub genesis_commitment: Commitment,
    pub protocol_version: u8,
    pub latest_finalized_slot: SlotIndex,
    pub latest_commitment: Commitment,
}

/// A complete snapshot, in section order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub settings: SnapshotSettings,
    pub commitments: Vec<Commitment>,
    pub ledger_states: Vec<LedgerState>,
    pub committee: Committee,
    pub root_blocks: Vec<BlockId>,
    pub attestations: Vec<Attestation>,
    pub attested_weight: u64,
    pub roots: Roots,
}

impl Snapshot {
    /// Capture a snapshot of `store` at `target_slot`.
    ///
    /// The store must have committed `target_slot` (its commitment, roots
    /// and attestations are all part of the snapshot).
    pub fn export(
        store: &Store,
        target_slot: SlotIndex,
        root_blocks: Vec<BlockId>,
    ) -> Result<Self, SnapshotError> {
        let genesis_commitment = store
            .genesis_commitment()?
            .ok_or(SnapshotError::Incomplete("genesis commitment"))?;
        let latest_commitment = if target_slot == 0 {
            genesis_commitment.clone()
        } else {
            store
                .commitment_by_slot(target_slot)?
                .ok_or(SnapshotError::Incomplete("target commitment"))?
        };
        let committee = store
            .committee()?
            .ok_or(SnapshotError::Incomplete("committee"))?;
        let roots = store.roots(target_slot)?.unwrap_or_default();
        // Anchors past the target belong to history the snapshot cuts off.
        let root_blocks: Vec<BlockId> = root_blocks
            .into_iter()
            .filter(|id| id.slot <= target_slot)
            .collect();

        Ok(Snapshot {
            settings: SnapshotSettings {
                protocol_version: latest_commitment.protocol_version,
                latest_finalized_slot: store.latest_finalized_slot()?.min(target_slot),
                genesis_commitment,
                latest_commitment,
            },
            commitments: store.commitments_in_range(0, target_slot)?,
            ledger_states: store.ledger_states()?,
            committee,
            root_blocks,
            attestations: store.slot_attestations(target_slot)?,
            attested_weight: store.attestation_weight(target_slot)?,
            roots,
        })
    }

    /// Populate a fresh store from this snapshot.
    pub fn import_into(&self, store: &Store) -> Result<(), SnapshotError> {
        store.set_genesis_commitment(&self.settings.genesis_commitment)?;
        store.set_latest_commitment(&self.settings.latest_commitment)?;
        store.set_latest_finalized_slot(self.settings.latest_finalized_slot)?;
        for commitment in &self.commitments {
            store.put_commitment(commitment)?;
        }
        for state in &self.ledger_states {
            store.put_ledger_state(state)?;
        }
        store.set_committee(&self.committee)?;
        store.set_root_blocks(&self.root_blocks)?;
        let target_slot = self.settings.latest_commitment.slot;
        for attestation in &self.attestations {
            store.put_slot_attestation(target_slot, attestation)?;
        }
        store.set_attestation_weight(target_slot, self.attested_weight)?;
        store.set_attestations_committed_slot(target_slot)?;
        store.put_roots(target_slot, &self.roots)?;
        store.flush()?;
        Ok(())
    }

    /// Serialize the snapshot to a writer.
    pub fn write_to(&self, writer: &mut impl Write) -> Result<(), SnapshotError> {
        let bytes =
            bincode::serialize(self).map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        writer.write_all(&(bytes.len() as u64).to_le_bytes())?;
        writer.write_all(&bytes)?;
        Ok(())
    }

    /// Read a snapshot from a reader.
    pub fn read_from(reader: &mut impl Read) -> Result<Self, SnapshotError> {
        let mut length_bytes = [0u8; 8];
        reader.read_exact(&mut length_bytes)?;
        let length = u64::from_le_bytes(length_bytes) as usize;
        let mut bytes = vec![0u8; length];
        reader.read_exact(&mut bytes)?;
        bincode::deserialize(&bytes).map_err(|e| SnapshotError::Serialization(e.to_string()))
    }
}
