//! Transactions, ledger states and the committed UTXO ledger.
//!
//! The mempool works on in-flight `StateMetadata`/`TransactionMetadata`
//! wrappers; this module owns the underlying value types and the committed
//! state set that slot commitment snapshots and state roots are computed
//! from. Validation here is deliberately thin: input existence and value
//! conservation, enough to drive mempool acceptance.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::committee::AccountId;
use crate::storage::{Store, StorageError};
use crate::{hash_parts, merkle, Hash, SlotIndex};

/// Identifier of a transaction (hash of its bytes).
pub type TransactionId = Hash;

/// Identifier of a ledger state (hash of creating transaction and index).
pub type StateId = Hash;

/// Errors from transaction execution against the ledger.
#[derive(Clone, Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("input state not found")]
    InputNotFound(StateId),
    #[error("transaction consumes {consumed} but produces {produced}")]
    ValueMismatch { consumed: u64, produced: u64 },
    #[error("transaction has no inputs")]
    NoInputs,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Reference to the output of another transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateRef {
    pub source_transaction: TransactionId,
    pub index: u16,
}

impl StateRef {
    pub fn state_id(&self) -> StateId {
        state_id(&self.source_transaction, self.index)
    }
}

/// Derive the id of the `index`-th output of `transaction`.
pub fn state_id(transaction: &TransactionId, index: u16) -> StateId {
    hash_parts(
        b"meridian.state.id",
        &[transaction, &index.to_le_bytes()],
    )
}

/// A transaction output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub amount: u64,
    pub owner: AccountId,
}

/// A basic value transaction: consume referenced states, produce outputs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<StateRef>,
    pub outputs: Vec<Output>,
    /// Creation timestamp, also a uniquifier for otherwise equal payloads.
    pub creation_time_ms: u64,
}

impl Transaction {
    pub fn id(&self) -> TransactionId {
        let bytes = bincode::serialize(self).unwrap_or_default();
        crate::hash_domain(b"meridian.transaction.id", &bytes)
    }
}

/// A concrete ledger state (an unspent output and its provenance).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    pub id: StateId,
    pub output: Output,
    pub created_by: TransactionId,
    pub index: u16,
}

impl LedgerState {
    pub fn new(created_by: TransactionId, index: u16, output: Output) -> Self {
        LedgerState {
            id: state_id(&created_by, index),
            output,
            created_by,
            index,
        }
    }
}

/// Execute the transaction's VM rules against already-resolved inputs.
///
/// Returns the produced output states. The only rules enforced are input
/// presence (the caller resolved them) and value conservation.
pub fn execute(tx: &Transaction, inputs: &[LedgerState]) -> Result<Vec<LedgerState>, LedgerError> {
    if inputs.is_empty() {
        return Err(LedgerError::NoInputs);
    }
    let consumed: u64 = inputs.iter().map(|s| s.output.amount).sum();
    let produced: u64 = tx.outputs.iter().map(|o| o.amount).sum();
    if consumed != produced {
        return Err(LedgerError::ValueMismatch { consumed, produced });
    }
    let tx_id = tx.id();
    Ok(tx
        .outputs
        .iter()
        .enumerate()
        .map(|(index, output)| LedgerState::new(tx_id, index as u16, output.clone()))
        .collect())
}

/// The committed UTXO set, persisted in the store's ledger namespace.
///
/// Mutations are applied per committed slot; the state root is a Merkle
/// root over the sorted live state ids and feeds the slot commitment.
pub struct Ledger {
    store: Store,
    /// In-memory mirror of the committed set, sorted by state id.
    states: Mutex<BTreeMap<StateId, LedgerState>>,
}

impl Ledger {
    /// Load the committed set from the store's ledger namespace.
    pub fn load(store: Store) -> Result<Self, LedgerError> {
        let mut states = BTreeMap::new();
        for state in store.ledger_states()? {
            states.insert(state.id, state);
        }
        Ok(Ledger {
            store,
            states: Mutex::new(states),
        })
    }

    /// Seed a genesis state directly (bypasses transaction validation).
    pub fn seed_state(&self, state: LedgerState) -> Result<(), LedgerError> {
        self.store.put_ledger_state(&state)?;
        self.lock_states().insert(state.id, state);
        Ok(())
    }

    pub fn state(&self, id: &StateId) -> Option<LedgerState> {
        self.lock_states().get(id).cloned()
    }

    pub fn state_count(&self) -> usize {
        self.lock_states().len()
    }

    /// Apply the accepted transactions of a committed slot: consume their
    /// inputs, materialize their outputs.
    pub fn apply_mutations(
        &self,
        slot: SlotIndex,
        transactions: &[Transaction],
    ) -> Result<(), LedgerError> {
        let mut states = self.lock_states();
        for tx in transactions {
            for input in &tx.inputs {
                let id = input.state_id();
                states.remove(&id);
                self.store.delete_ledger_state(&id)?;
            }
            let tx_id = tx.id();
            for (index, output) in tx.outputs.iter().enumerate() {
                let state = LedgerState::new(tx_id, index as u16, output.clone());
                self.store.put_ledger_state(&state)?;
                states.insert(state.id, state);
            }
        }
        let _ = slot;
        Ok(())
    }

    /// Merkle root over the sorted live state ids.
    pub fn state_root(&self) -> Hash {
        let leaves: Vec<Hash> = self.lock_states().keys().copied().collect();
        merkle::merkle_root(&leaves)
    }

    /// All live states, sorted by id (snapshot export order).
    pub fn states(&self) -> Vec<LedgerState> {
        self.lock_states().values().cloned().collect()
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, BTreeMap<StateId, LedgerState>> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
