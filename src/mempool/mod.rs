//! The mempool: in-flight transactions, spender tracking and acceptance
//! propagation.
//!
//! Attach-and-execute pipeline per transaction:
//! 1. resolve each input to a `StateMetadata` (committed ledger state,
//!    pending output of another in-flight transaction, or a waiter until
//!    that output appears); all resolved fires `solid`;
//! 2. execute the VM rules, firing `executed` (or `invalid`);
//! 3. book: register as spender of every input and inherit the
//!    conflict-id set from the input spenders, firing `booked`.
//!
//! Acceptance: a transaction is accepted while all inputs are accepted,
//! no conflicting spender was accepted over it, and at least one of its
//! attachments is included (`earliest_included_slot != 0`). Any condition
//! regressing returns it to pending. Acceptance of a spender rejects its
//! rivals; commitment of a spender orphans them.
//!
//! The mempool owns the authoritative id → metadata maps; metadata objects
//! reference each other only downward (transaction → input state), so the
//! graph stays cycle-free and eviction actually frees memory.

pub mod state_metadata;
pub mod transaction_metadata;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::block::BlockId;
use crate::ledger::{self, Ledger, LedgerError, StateId, Transaction, TransactionId};
use crate::reactive::Signal;
use crate::SlotIndex;

pub use state_metadata::StateMetadata;
pub use transaction_metadata::TransactionMetadata;

/// Errors from mempool operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum MempoolError {
    #[error("transaction failed execution: {0}")]
    Execution(#[from] LedgerError),
}

struct Inner {
    transactions: HashMap<TransactionId, Arc<TransactionMetadata>>,
    states: HashMap<StateId, Arc<StateMetadata>>,
    /// Transactions waiting for a not-yet-produced input state:
    /// state id → (waiting transaction, input index).
    pending_resolutions: HashMap<StateId, Vec<(TransactionId, usize)>>,
}

/// The mempool engine.
pub struct Mempool {
    ledger: Arc<Ledger>,
    inner: Mutex<Inner>,
    weak_self: Weak<Mempool>,

    pub transaction_attached: Signal<Arc<TransactionMetadata>>,
    pub transaction_solid: Signal<Arc<TransactionMetadata>>,
    pub transaction_executed: Signal<Arc<TransactionMetadata>>,
    pub transaction_booked: Signal<Arc<TransactionMetadata>>,
    pub transaction_accepted: Signal<Arc<TransactionMetadata>>,
    pub transaction_rejected: Signal<Arc<TransactionMetadata>>,
    pub transaction_orphaned: Signal<Arc<TransactionMetadata>>,
    pub transaction_invalid: Signal<(Arc<TransactionMetadata>, String)>,
}

impl Mempool {
    pub fn new(ledger: Arc<Ledger>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Mempool {
            ledger,
            inner: Mutex::new(Inner {
                transactions: HashMap::new(),
                states: HashMap::new(),
                pending_resolutions: HashMap::new(),
            }),
            weak_self: weak_self.clone(),
            transaction_attached: Signal::new(),
            transaction_solid: Signal::new(),
            transaction_executed: Signal::new(),
            transaction_booked: Signal::new(),
            transaction_accepted: Signal::new(),
            transaction_rejected: Signal::new(),
            transaction_orphaned: Signal::new(),
            transaction_invalid: Signal::new(),
        })
    }

    pub fn transaction(&self, id: &TransactionId) -> Option<Arc<TransactionMetadata>> {
        lock(&self.inner).transactions.get(id).cloned()
    }

    pub fn state(&self, id: &StateId) -> Option<Arc<StateMetadata>> {
        lock(&self.inner).states.get(id).cloned()
    }

    pub fn transaction_count(&self) -> usize {
        lock(&self.inner).transactions.len()
    }

    /// Attach a transaction carried by `block_id`, starting the pipeline
    /// the first time the transaction is seen.
    pub fn attach_transaction(
        &self,
        transaction: Transaction,
        block_id: BlockId,
    ) -> Arc<TransactionMetadata> {
        let id = transaction.id();
        let (metadata, created) = {
            let mut inner = lock(&self.inner);
            match inner.transactions.get(&id) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let metadata = Arc::new(TransactionMetadata::new(transaction));
                    inner.transactions.insert(id, Arc::clone(&metadata));
                    (metadata, true)
                }
            }
        };
        metadata.add_attachment(block_id);

        if created {
            self.wire_transaction(&metadata);
            self.transaction_attached.trigger(&metadata);
            self.solidify(&metadata);
        }
        metadata
    }

    /// Mark an attachment as included (its block was accepted).
    pub fn mark_attachment_included(&self, transaction_id: &TransactionId, block_id: BlockId) {
        if let Some(metadata) = self.transaction(transaction_id) {
            metadata.mark_attachment_included(block_id);
        }
    }

    /// Drop an orphaned or evicted attachment.
    pub fn orphan_attachment(&self, transaction_id: &TransactionId, block_id: BlockId) {
        if let Some(metadata) = self.transaction(transaction_id) {
            metadata.mark_attachment_orphaned(block_id);
        }
    }

    /// Mark a transaction committed in `slot` (called at slot commit).
    pub fn commit_transaction(&self, transaction_id: &TransactionId, slot: SlotIndex) {
        if let Some(metadata) = self.transaction(transaction_id) {
            metadata.committed_slot.set(slot);
        }
    }

    /// Drop all bookkeeping for a committed transaction (post-commit
    /// cleanup, once its slot is evicted).
    pub fn evict_transaction(&self, transaction_id: &TransactionId) {
        let mut inner = lock(&self.inner);
        if let Some(metadata) = inner.transactions.remove(transaction_id) {
            // Output states stay resolvable through the committed ledger.
            for output in metadata.outputs() {
                inner.states.remove(&output.id());
            }
        }
    }

    // ── Pipeline ──

    /// Wire the lifecycle propagation for a freshly created transaction.
    fn wire_transaction(&self, metadata: &Arc<TransactionMetadata>) {
        let id = metadata.id();

        let weak = self.weak_self.clone();
        metadata
            .solid
            .on_trigger(move || {
                if let Some(mempool) = weak.upgrade() {
                    mempool.on_transaction_solid(&id);
                }
            })
            .detach();

        let weak = self.weak_self.clone();
        metadata
            .accepted
            .on_update(move |_, accepted| {
                if let Some(mempool) = weak.upgrade() {
                    mempool.on_acceptance_changed(&id, *accepted);
                }
            })
            .detach();

        let weak = self.weak_self.clone();
        metadata
            .rejected
            .on_trigger(move || {
                if let Some(mempool) = weak.upgrade() {
                    mempool.on_transaction_rejected(&id);
                }
            })
            .detach();

        let weak = self.weak_self.clone();
        metadata
            .orphaned
            .on_trigger(move || {
                if let Some(mempool) = weak.upgrade() {
                    mempool.on_transaction_orphaned(&id);
                }
            })
            .detach();

        let weak = self.weak_self.clone();
        metadata
            .committed_slot
            .on_update(move |_, slot| {
                if let Some(mempool) = weak.upgrade() {
                    mempool.on_transaction_committed(&id, *slot);
                }
            })
            .detach();

        let weak = self.weak_self.clone();
        metadata
            .all_attachments_evicted
            .on_trigger(move || {
                if let Some(mempool) = weak.upgrade() {
                    if let Some(metadata) = mempool.transaction(&id) {
                        if !metadata.is_committed() {
                            metadata.orphaned.trigger();
                        }
                    }
                }
            })
            .detach();

        let weak = self.weak_self.clone();
        metadata
            .earliest_included_slot
            .on_update(move |_, _| {
                if let Some(mempool) = weak.upgrade() {
                    mempool.refresh_acceptance(&id);
                }
            })
            .detach();

        let weak = self.weak_self.clone();
        metadata
            .all_inputs_accepted
            .on_update(move |_, _| {
                if let Some(mempool) = weak.upgrade() {
                    mempool.refresh_acceptance(&id);
                }
            })
            .detach();
    }

    /// Resolve the transaction's inputs, registering waiters for outputs
    /// that do not exist yet.
    fn solidify(&self, metadata: &Arc<TransactionMetadata>) {
        let id = metadata.id();
        let input_refs = metadata.transaction().inputs.clone();
        for (index, input_ref) in input_refs.iter().enumerate() {
            let state_id = input_ref.state_id();
            let resolved = {
                let mut inner = lock(&self.inner);
                if let Some(state) = inner.states.get(&state_id) {
                    Some(Arc::clone(state))
                } else if let Some(committed) = self.ledger.state(&state_id) {
                    let state = Arc::new(StateMetadata::committed(committed));
                    inner.states.insert(state_id, Arc::clone(&state));
                    Some(state)
                } else {
                    inner
                        .pending_resolutions
                        .entry(state_id)
                        .or_default()
                        .push((id, index));
                    None
                }
            };
            if let Some(state) = resolved {
                self.publish_input(metadata, index, &state);
            }
        }
    }

    /// Hand a resolved input to the transaction and register it as a
    /// spender of that state.
    fn publish_input(
        &self,
        metadata: &Arc<TransactionMetadata>,
        index: usize,
        state: &Arc<StateMetadata>,
    ) {
        self.register_spender(state, metadata);
        if state.accepted.get() {
            metadata.note_input_acceptance(true);
        }
        if metadata.publish_input(index, Arc::clone(state)) {
            metadata.solid.trigger();
        }
    }

    /// Register a spender on a state and maintain conflict sets: once a
    /// state is contested, every spender's conflict-id set is the full
    /// spender set of that state.
    fn register_spender(&self, state: &Arc<StateMetadata>, spender: &Arc<TransactionMetadata>) {
        if state.add_spender(spender.id()).is_none() {
            return;
        }
        let spender_ids = state.spender_ids();
        if spender_ids.len() >= 2 {
            for other_id in &spender_ids {
                if let Some(other) = self.transaction(other_id) {
                    other.add_conflict_ids(spender_ids.iter().copied());
                    other.conflicting.trigger();
                }
            }
        }
    }

    fn on_transaction_solid(&self, id: &TransactionId) {
        let Some(metadata) = self.transaction(id) else {
            return;
        };
        self.transaction_solid.trigger(&metadata);

        // Execute the VM rules against the resolved inputs.
        let input_states: Vec<_> = metadata
            .inputs()
            .iter()
            .map(|s| s.state().clone())
            .collect();
        let outputs = match ledger::execute(metadata.transaction(), &input_states) {
            Ok(outputs) => outputs,
            Err(error) => {
                tracing::warn!(tx = %crate::short_hex(id), %error, "transaction failed execution");
                metadata.invalid.trigger();
                self.transaction_invalid
                    .trigger(&(Arc::clone(&metadata), error.to_string()));
                return;
            }
        };

        // Materialize outputs and resolve transactions waiting on them.
        let mut output_metadata = Vec::with_capacity(outputs.len());
        let mut resolved_waiters = Vec::new();
        {
            let mut inner = lock(&self.inner);
            for output in outputs {
                let state_id = output.id;
                let state = Arc::new(StateMetadata::pending(output, *id));
                inner.states.insert(state_id, Arc::clone(&state));
                if let Some(waiters) = inner.pending_resolutions.remove(&state_id) {
                    for (waiter_id, index) in waiters {
                        if let Some(waiter) = inner.transactions.get(&waiter_id) {
                            resolved_waiters.push((Arc::clone(waiter), index, Arc::clone(&state)));
                        }
                    }
                }
                output_metadata.push(state);
            }
        }
        metadata.set_outputs(output_metadata);
        metadata.executed.trigger();
        self.transaction_executed.trigger(&metadata);

        // Book: the conflict-id set is inherited from the input spenders
        // (maintained incrementally by `register_spender`).
        metadata.booked.trigger();
        self.transaction_booked.trigger(&metadata);

        // Attachments may have been included before booking finished.
        self.refresh_acceptance(id);

        for (waiter, index, state) in resolved_waiters {
            self.publish_input(&waiter, index, &state);
        }
    }

    /// Re-evaluate the acceptance conditions of a transaction.
    fn refresh_acceptance(&self, id: &TransactionId) {
        let Some(metadata) = self.transaction(id) else {
            return;
        };
        if metadata.rejected.was_triggered()
            || metadata.invalid.was_triggered()
            || !metadata.booked.was_triggered()
        {
            return;
        }
        let eligible = metadata.all_inputs_accepted.get()
            && metadata.earliest_included_slot.get() != 0
            && metadata.is_conflict_accepted();
        metadata.accepted.set(eligible);
    }

    /// A transaction's acceptance flipped: propagate to its inputs
    /// (winning the spend) and outputs (inclusion flags).
    fn on_acceptance_changed(&self, id: &TransactionId, accepted: bool) {
        let Some(metadata) = self.transaction(id) else {
            return;
        };
        if accepted {
            for input in metadata.inputs() {
                input.set_spend_accepted(*id);
                // Losing rivals are rejected.
                for rival_id in input.spender_ids() {
                    if rival_id != *id {
                        if let Some(rival) = self.transaction(&rival_id) {
                            rival.rejected.trigger();
                        }
                    }
                }
            }
            self.transaction_accepted.trigger(&metadata);
        }
        for output in metadata.outputs() {
            output.accepted.set(accepted);
            output
                .inclusion_slot
                .set(metadata.earliest_included_slot.get());
            for spender_id in output.spender_ids() {
                if let Some(spender) = self.transaction(&spender_id) {
                    spender.note_input_acceptance(accepted);
                }
            }
        }
    }

    fn on_transaction_rejected(&self, id: &TransactionId) {
        let Some(metadata) = self.transaction(id) else {
            return;
        };
        metadata.accepted.set(false);
        self.transaction_rejected.trigger(&metadata);
        // Rejection propagates through outputs to their spenders.
        for output in metadata.outputs() {
            output.rejected.trigger();
            for spender_id in output.spender_ids() {
                if let Some(spender) = self.transaction(&spender_id) {
                    spender.rejected.trigger();
                }
            }
        }
    }

    fn on_transaction_committed(&self, id: &TransactionId, slot: SlotIndex) {
        let Some(metadata) = self.transaction(id) else {
            return;
        };
        for input in metadata.inputs() {
            input.spend_committed.set(Some(*id));
            input.decrease_spender_count();
            // Rivals of a committed spend can never be included.
            for rival_id in input.spender_ids() {
                if rival_id != *id {
                    if let Some(rival) = self.transaction(&rival_id) {
                        rival.orphaned.trigger();
                    }
                }
            }
        }
        for output in metadata.outputs() {
            output.committed_slot.set(slot);
        }
    }

    fn on_transaction_orphaned(&self, id: &TransactionId) {
        let Some(metadata) = self.transaction(id) else {
            return;
        };
        metadata.accepted.set(false);
        self.transaction_orphaned.trigger(&metadata);
        for input in metadata.inputs() {
            input.decrease_spender_count();
        }
        for output in metadata.outputs() {
            output.orphaned.trigger();
            for spender_id in output.spender_ids() {
                if let Some(spender) = self.transaction(&spender_id) {
                    spender.orphaned.trigger();
                }
            }
        }
    }
}

fn lock(mutex: &Mutex<Inner>) -> std::sync::MutexGuard<'_, Inner> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
