//! Per-state (UTXO) metadata tracked by the mempool.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::ledger::{LedgerState, StateId, TransactionId};
use crate::reactive::{Event, Signal, Variable};
use crate::SlotIndex;

/// A ledger state as seen by the mempool: the concrete output plus spender
/// tracking and inclusion flags.
///
/// States referencing a committed output start out accepted; states
/// produced by an in-flight transaction inherit their flags from it. Only
/// ids are stored for spenders; the mempool resolves them, which keeps the
/// object graph cycle-free.
pub struct StateMetadata {
    state: LedgerState,
    /// Creating transaction, `None` for committed/genesis states.
    source: Option<TransactionId>,

    spender_ids: Mutex<BTreeSet<TransactionId>>,
    /// Number of pending (not committed/orphaned) spenders.
    spender_count: AtomicUsize,

    /// First spender attached.
    pub spent: Event,
    /// A second spender attached; the state is contested.
    pub double_spent: Event,
    /// The spender that won acceptance, at most one ever.
    pub spend_accepted: Variable<Option<TransactionId>>,
    /// The spender whose slot was committed.
    pub spend_committed: Variable<Option<TransactionId>>,
    /// Fired whenever the pending-spender count returns to zero.
    pub all_spenders_removed: Signal<StateId>,

    // Inclusion flags, inherited from the creating transaction.
    pub accepted: Variable<bool>,
    pub rejected: Event,
    pub orphaned: Event,
    pub committed_slot: Variable<SlotIndex>,
    /// Slot of the earliest accepted attachment of the creating
    /// transaction (0 = not included yet).
    pub inclusion_slot: Variable<SlotIndex>,
}

impl StateMetadata {
    /// Metadata for a committed ledger state: accepted from the start.
    pub fn committed(state: LedgerState) -> Self {
        let metadata = Self::build(state, None);
        metadata.accepted.set(true);
        metadata
    }

    /// Metadata for an output of an in-flight transaction.
    pub fn pending(state: LedgerState, source: TransactionId) -> Self {
        Self::build(state, Some(source))
    }

    fn build(state: LedgerState, source: Option<TransactionId>) -> Self {
        StateMetadata {
            state,
            source,
            spender_ids: Mutex::new(BTreeSet::new()),
            spender_count: AtomicUsize::new(0),
            spent: Event::new(),
            double_spent: Event::new(),
            spend_accepted: Variable::new(None),
            spend_committed: Variable::new(None),
            all_spenders_removed: Signal::new(),
            accepted: Variable::new(false),
            rejected: Event::new(),
            orphaned: Event::new(),
            committed_slot: Variable::new(0),
            inclusion_slot: Variable::new(0),
        }
    }

    pub fn id(&self) -> StateId {
        self.state.id
    }

    pub fn state(&self) -> &LedgerState {
        &self.state
    }

    pub fn source(&self) -> Option<TransactionId> {
        self.source
    }

    /// Register a spender. Returns the pending-spender count after the
    /// addition, or `None` if the spender was already registered.
    pub fn add_spender(&self, spender: TransactionId) -> Option<usize> {
        if !lock(&self.spender_ids).insert(spender) {
            return None;
        }
        let count = self.spender_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 1 {
            self.spent.trigger();
        } else if count == 2 {
            self.double_spent.trigger();
        }
        Some(count)
    }

    /// Drop one pending spender (committed or orphaned elsewhere).
    pub fn decrease_spender_count(&self) {
        if self.spender_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.all_spenders_removed.trigger(&self.id());
        }
    }

    pub fn pending_spender_count(&self) -> usize {
        self.spender_count.load(Ordering::SeqCst)
    }

    pub fn spender_ids(&self) -> BTreeSet<TransactionId> {
        lock(&self.spender_ids).clone()
    }

    pub fn is_double_spent(&self) -> bool {
        self.double_spent.was_triggered()
    }

    /// Record the winning spender. The first winner sticks: acceptance of
    /// a second spender is a protocol violation upstream and is ignored
    /// here to preserve the at-most-one invariant.
    pub fn set_spend_accepted(&self, spender: TransactionId) {
        self.spend_accepted.compute(|current| current.or(Some(spender)));
    }

    pub fn accepted_spender(&self) -> Option<TransactionId> {
        self.spend_accepted.get()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
