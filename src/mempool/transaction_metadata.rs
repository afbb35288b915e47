//! Per-transaction metadata tracked by the mempool.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::block::BlockId;
use crate::ledger::{Transaction, TransactionId};
use crate::mempool::state_metadata::StateMetadata;
use crate::reactive::{Event, Variable};
use crate::SlotIndex;

/// A transaction as seen by the mempool: lifecycle events, input/output
/// links, conflict set and the attachments (blocks) that carry it.
///
/// Acceptance is a variable, not a latching event: a transaction returns
/// to pending when one of its acceptance conditions regresses (an input
/// un-accepts, or its last included attachment is orphaned).
pub struct TransactionMetadata {
    id: TransactionId,
    transaction: Transaction,

    /// Resolved inputs, indexed by input position (`None` until resolved).
    inputs: Mutex<Vec<Option<Arc<StateMetadata>>>>,
    outputs: Mutex<Vec<Arc<StateMetadata>>>,
    conflict_ids: Mutex<BTreeSet<TransactionId>>,

    unsolid_inputs: AtomicUsize,
    unaccepted_inputs: AtomicUsize,

    // Lifecycle events (in pipeline order).
    pub solid: Event,
    pub executed: Event,
    pub booked: Event,
    pub invalid: Event,

    /// The transaction spends a contested state.
    pub conflicting: Event,
    pub all_inputs_accepted: Variable<bool>,
    pub accepted: Variable<bool>,
    pub rejected: Event,
    pub orphaned: Event,
    pub committed_slot: Variable<SlotIndex>,

    // Attachments: blocks carrying this transaction, with an
    // "included" flag set once the attachment is accepted.
    attachments: Mutex<BTreeMap<BlockId, bool>>,
    pub earliest_included_slot: Variable<SlotIndex>,
    pub all_attachments_evicted: Event,
}

impl TransactionMetadata {
    pub fn new(transaction: Transaction) -> Self {
        let input_count = transaction.inputs.len();
        TransactionMetadata {
            id: transaction.id(),
            inputs: Mutex::new(vec![None; input_count]),
            outputs: Mutex::new(Vec::new()),
            conflict_ids: Mutex::new(BTreeSet::new()),
            unsolid_inputs: AtomicUsize::new(input_count),
            unaccepted_inputs: AtomicUsize::new(input_count),
            solid: Event::new(),
            executed: Event::new(),
            booked: Event::new(),
            invalid: Event::new(),
            conflicting: Event::new(),
            all_inputs_accepted: Variable::new(false),
            accepted: Variable::new(false),
            rejected: Event::new(),
            orphaned: Event::new(),
            committed_slot: Variable::new(0),
            attachments: Mutex::new(BTreeMap::new()),
            earliest_included_slot: Variable::new(0),
            all_attachments_evicted: Event::new(),
            transaction,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// Store a resolved input. Returns true when this was the last
    /// unresolved one (the transaction turned solid).
    pub fn publish_input(&self, index: usize, state: Arc<StateMetadata>) -> bool {
        {
            let mut inputs = lock(&self.inputs);
            if index >= inputs.len() || inputs[index].is_some() {
                return false;
            }
            inputs[index] = Some(state);
        }
        self.unsolid_inputs.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Resolved inputs, in input order. Complete once solid.
    pub fn inputs(&self) -> Vec<Arc<StateMetadata>> {
        lock(&self.inputs).iter().flatten().cloned().collect()
    }

    pub fn set_outputs(&self, outputs: Vec<Arc<StateMetadata>>) {
        *lock(&self.outputs) = outputs;
    }

    pub fn outputs(&self) -> Vec<Arc<StateMetadata>> {
        lock(&self.outputs).clone()
    }

    // ── Conflicts ──

    pub fn add_conflict_ids(&self, ids: impl IntoIterator<Item = TransactionId>) {
        lock(&self.conflict_ids).extend(ids);
    }

    pub fn conflict_ids(&self) -> BTreeSet<TransactionId> {
        lock(&self.conflict_ids).clone()
    }

    /// No conflicting spender has been accepted over this transaction.
    pub fn is_conflict_accepted(&self) -> bool {
        self.inputs().iter().all(|input| match input.accepted_spender() {
            None => true,
            Some(winner) => winner == self.id,
        })
    }

    // ── Input acceptance counting ──

    /// Note an input's acceptance flip; updates `all_inputs_accepted`.
    pub fn note_input_acceptance(&self, accepted: bool) {
        if accepted {
            if self.unaccepted_inputs.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.all_inputs_accepted.set(true);
            }
        } else if self.unaccepted_inputs.fetch_add(1, Ordering::SeqCst) == 0 {
            self.all_inputs_accepted.set(false);
        }
    }

    // ── Attachments ──

    /// Register a block carrying this transaction; true if new.
    pub fn add_attachment(&self, block_id: BlockId) -> bool {
        lock(&self.attachments).insert(block_id, false).is_none()
    }

    /// Mark an attachment as included (its block was accepted); keeps the
    /// earliest included slot minimal.
    pub fn mark_attachment_included(&self, block_id: BlockId) {
        {
            let mut attachments = lock(&self.attachments);
            match attachments.get_mut(&block_id) {
                Some(included) => *included = true,
                None => return,
            }
        }
        self.earliest_included_slot.compute(|current| {
            if *current == 0 || block_id.slot < *current {
                block_id.slot
            } else {
                *current
            }
        });
    }

    /// Drop an orphaned or evicted attachment, rescanning the remaining
    /// included ones for the new earliest slot. Fires
    /// `all_attachments_evicted` when none remain.
    pub fn mark_attachment_orphaned(&self, block_id: BlockId) {
        let (was_included, emptied, new_earliest) = {
            let mut attachments = lock(&self.attachments);
            let Some(was_included) = attachments.remove(&block_id) else {
                return;
            };
            let new_earliest = attachments
                .iter()
                .filter(|(_, included)| **included)
                .map(|(id, _)| id.slot)
                .min()
                .unwrap_or(0);
            (was_included, attachments.is_empty(), new_earliest)
        };
        if was_included && block_id.slot == self.earliest_included_slot.get() {
            self.earliest_included_slot.set(new_earliest);
        }
        if emptied {
            self.all_attachments_evicted.trigger();
        }
    }

    pub fn attachments(&self) -> Vec<BlockId> {
        lock(&self.attachments).keys().copied().collect()
    }

    pub fn is_committed(&self) -> bool {
        self.committed_slot.get() != 0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
