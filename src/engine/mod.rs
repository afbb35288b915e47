//! The engine: composition root of the consensus pipeline.
//!
//! One engine owns one store and one pipeline instance:
//! filter → BlockDAG (solidify) → Booker (conflict inheritance) →
//! BlockGadget (accept/confirm) → SlotGadget (finalize) → Notarization
//! (commit slots) → Clock & tip updates. The engine's event hub forwards
//! the component signals so outer layers (dispatcher, chain manager,
//! engine manager) subscribe in one place.
//!
//! Multiple engines coexist during chain switching: the main engine plus
//! a candidate forked from a snapshot at the fork slot. Each engine is
//! identified by its chain id, the commitment it was rooted at.

pub mod manager;

use std::sync::Arc;
use std::time::Duration;

use crate::block::{Block, BlockId, ProtocolBlock};
use crate::blockdag::{BlockDag, BlockDagError};
use crate::booker::Booker;
use crate::cache::BlockCache;
use crate::clock::Clock;
use crate::commitment::{Commitment, CommitmentId, Roots};
use crate::committee::SeatManager;
use crate::config::ProtocolParameters;
use crate::consensus::{BlockGadget, SlotGadget};
use crate::filter::{FilterError, PreSolidFilter};
use crate::ledger::Ledger;
use crate::mempool::Mempool;
use crate::notarization::{Attestations, Notarization};
use crate::reactive::{Event, Signal};
use crate::requester::Requester;
use crate::snapshot::{Snapshot, SnapshotError};
use crate::storage::{StorageError, Store};
use crate::tips::{TipManager, TipPool};
use crate::SlotIndex;

pub use manager::EngineManager;

/// Errors from engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store has no committee")]
    MissingCommittee,
    #[error("store has no genesis commitment")]
    MissingGenesis,
    #[error("unknown engine handle {0}")]
    UnknownEngine(usize),
    #[error("block dropped by filter: {0}")]
    Filtered(#[from] FilterError),
    #[error("block not appended: {0}")]
    BlockDag(#[from] BlockDagError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("attestations error: {0}")]
    Attestations(#[from] crate::notarization::AttestationsError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// The engine's event hub: forwarded component signals.
pub struct EngineEvents {
    pub block_solid: Signal<Arc<Block>>,
    pub block_booked: Signal<Arc<Block>>,
    pub block_accepted: Signal<Arc<Block>>,
    pub block_confirmed: Signal<Arc<Block>>,
    pub block_missing: Signal<BlockId>,
    pub slot_finalized: Signal<SlotIndex>,
    pub slot_committed: Signal<(SlotIndex, Commitment)>,
    pub latest_commitment_updated: Signal<Commitment>,
}

impl EngineEvents {
    fn new() -> Self {
        EngineEvents {
            block_solid: Signal::new(),
            block_booked: Signal::new(),
            block_accepted: Signal::new(),
            block_confirmed: Signal::new(),
            block_missing: Signal::new(),
            slot_finalized: Signal::new(),
            slot_committed: Signal::new(),
            latest_commitment_updated: Signal::new(),
        }
    }
}

/// The accepted contents of a committed slot, served to warp-syncing
/// peers.
pub struct CommittedSlot {
    pub commitment: Commitment,
    pub block_ids: Vec<BlockId>,
    pub roots: Roots,
}

pub struct Engine {
    pub params: Arc<ProtocolParameters>,
    pub store: Store,
    pub cache: Arc<BlockCache>,
    pub blockdag: Arc<BlockDag>,
    pub booker: Arc<Booker>,
    pub mempool: Arc<Mempool>,
    pub ledger: Arc<Ledger>,
    pub seats: Arc<SeatManager>,
    pub block_gadget: Arc<BlockGadget>,
    pub slot_gadget: Arc<SlotGadget>,
    pub notarization: Arc<Notarization>,
    pub clock: Arc<Clock>,
    pub tips: Arc<TipManager>,
    pub filter: Arc<PreSolidFilter>,
    pub block_requester: Arc<Requester<BlockId>>,
    pub events: EngineEvents,
    pub stopped: Event,

    chain_id: CommitmentId,
}

impl Engine {
    /// Build an engine over an initialized store (committee and genesis
    /// commitment present; possibly a snapshot import).
    pub fn new(store: Store, params: Arc<ProtocolParameters>) -> Result<Arc<Self>, EngineError> {
        let committee = store.committee()?.ok_or(EngineError::MissingCommittee)?;
        let genesis = store
            .genesis_commitment()?
            .ok_or(EngineError::MissingGenesis)?;
        let root_commitment = store.latest_commitment()?.unwrap_or(genesis);
        let chain_id = root_commitment.id();

        let cache = Arc::new(BlockCache::new(params.max_committable_age * 2));
        let blockdag = Arc::new(BlockDag::new(Arc::clone(&params), Arc::clone(&cache)));
        let ledger = Arc::new(Ledger::load(store.clone()).map_err(|e| match e {
            crate::ledger::LedgerError::Storage(e) => EngineError::Storage(e),
            other => EngineError::Storage(StorageError::Io(other.to_string())),
        })?);
        let mempool = Mempool::new(Arc::clone(&ledger));
        let booker = Booker::new(Arc::clone(&mempool), Arc::clone(&cache));
        let seats = Arc::new(SeatManager::new(committee));
        let block_gadget = Arc::new(BlockGadget::new(
            Arc::clone(&params),
            Arc::clone(&cache),
            Arc::clone(&seats),
        ));
        let slot_gadget = Arc::new(SlotGadget::new(
            Arc::clone(&params),
            Arc::clone(&seats),
            store.latest_finalized_slot()?,
        ));
        let attestations = Arc::new(Attestations::new(
            Arc::clone(&params),
            Arc::clone(&seats),
            store.clone(),
        )?);
        let notarization = Arc::new(Notarization::new(
            Arc::clone(&params),
            store.clone(),
            Arc::clone(&cache),
            Arc::clone(&ledger),
            Arc::clone(&mempool),
            attestations,
            root_commitment.clone(),
        ));
        let clock = Arc::new(Clock::new(Arc::clone(&params)));
        let tips = Arc::new(TipManager::new());
        let filter = Arc::new(PreSolidFilter::new(Arc::clone(&params), Arc::clone(&seats)));
        let block_requester = Requester::new(
            Duration::from_millis(crate::constants::BLOCK_REQUEST_RETRY_MS),
            Duration::from_millis(crate::constants::WARP_SYNC_RETRY_MS),
        );

        let engine = Arc::new(Engine {
            params,
            store,
            cache,
            blockdag,
            booker,
            mempool,
            ledger,
            seats,
            block_gadget,
            slot_gadget,
            notarization,
            clock,
            tips,
            filter,
            block_requester,
            events: EngineEvents::new(),
            stopped: Event::new(),
            chain_id,
        });

        engine.seed_root_blocks(&root_commitment)?;
        engine.wire_pipeline();
        Ok(engine)
    }

    /// Initialize a fresh store with genesis state and build an engine.
    pub fn bootstrap(
        store: Store,
        params: Arc<ProtocolParameters>,
        committee: crate::committee::Committee,
        genesis_states: Vec<crate::ledger::LedgerState>,
    ) -> Result<Arc<Self>, EngineError> {
        store.set_committee(&committee)?;
        let genesis = Commitment::genesis(&params);
        store.set_genesis_commitment(&genesis)?;
        for state in genesis_states {
            store.put_ledger_state(&state)?;
        }
        Self::new(store, params)
    }

    /// The chain this engine is rooted at (its forking point id).
    pub fn chain_id(&self) -> CommitmentId {
        self.chain_id
    }

    pub fn latest_commitment(&self) -> Commitment {
        self.notarization.latest_commitment.get()
    }

    pub fn latest_finalized_slot(&self) -> SlotIndex {
        self.slot_gadget.latest_finalized_slot.get()
    }

    /// Feed a block from the network through the filter into the DAG.
    pub fn process_block(&self, block: ProtocolBlock) -> Result<Arc<Block>, EngineError> {
        self.filter.check(&block, self.clock.accepted().get())?;
        let outcome = self.blockdag.append(block)?;
        Ok(outcome.block)
    }

    /// The accepted contents of a committed slot (warp-sync server side).
    pub fn committed_slot(&self, slot: SlotIndex) -> Result<Option<CommittedSlot>, EngineError> {
        let Some(commitment) = self.store.commitment_by_slot(slot)? else {
            return Ok(None);
        };
        let Some(roots) = self.store.roots(slot)? else {
            return Ok(None);
        };
        Ok(Some(CommittedSlot {
            commitment,
            block_ids: self.store.block_ids_in_slot(slot)?,
            roots,
        }))
    }

    /// Export a snapshot of the committed state at `target_slot`.
    pub fn export_snapshot(&self, target_slot: SlotIndex) -> Result<Snapshot, EngineError> {
        Ok(Snapshot::export(
            &self.store,
            target_slot,
            self.cache.root_block_ids(),
        )?)
    }

    /// Shut the engine down: stop tickers, flush the store, mark it clean
    /// and latch `stopped`. Sub-modules are passive past this point; the
    /// dispatcher drains its pools before calling in here.
    pub fn shutdown(&self) -> Result<(), EngineError> {
        self.block_requester.shutdown();
        self.store.set_root_blocks(&self.cache.root_block_ids())?;
        self.store.set_clean()?;
        self.stopped.trigger();
        Ok(())
    }

    /// Seed the solidification anchors: the root blocks carried by the
    /// store (snapshot import), or the root commitment's virtual block on
    /// a fresh bootstrap.
    fn seed_root_blocks(&self, root_commitment: &Commitment) -> Result<(), EngineError> {
        let stored = self.store.root_blocks()?;
        if stored.is_empty() {
            let anchor = BlockId::root(&root_commitment.id());
            if let Some((block, _)) =
                self.cache.store_or_create(anchor, || Block::new_root(anchor))
            {
                self.cache.register_root_block(block);
            }
            return Ok(());
        }
        for id in stored {
            if let Some((block, _)) = self.cache.store_or_create(id, || Block::new_root(id)) {
                self.cache.register_root_block(block);
            }
        }
        Ok(())
    }

    /// Wire the component signals into the pipeline and the event hub.
    fn wire_pipeline(self: &Arc<Self>) {
        // BlockDAG → Booker.
        {
            let engine = Arc::clone(self);
            self.blockdag
                .block_solid
                .subscribe(move |block| {
                    engine.booker.queue(block);
                    engine.events.block_solid.trigger(block);
                })
                .detach();
        }

        // Missing blocks → requester ticker (when a runtime is present;
        // pure replay setups observe the signal only).
        {
            let engine = Arc::clone(self);
            self.blockdag
                .block_missing
                .subscribe(move |id| {
                    if tokio::runtime::Handle::try_current().is_ok() {
                        engine.block_requester.start_ticker(*id);
                    }
                    engine.events.block_missing.trigger(id);
                })
                .detach();
        }
        {
            let engine = Arc::clone(self);
            self.blockdag
                .missing_block_appended
                .subscribe(move |block| {
                    engine.block_requester.stop_ticker(&block.id());
                })
                .detach();
        }
        {
            let engine = Arc::clone(self);
            self.blockdag
                .block_not_appended
                .subscribe(move |id| {
                    engine.block_requester.stop_ticker(id);
                })
                .detach();
        }

        // Booker → gadget votes and tip pool.
        {
            let engine = Arc::clone(self);
            self.booker
                .block_booked
                .subscribe(move |block| {
                    engine.block_gadget.track_votes(block);
                    // Conflicting payloads enter the weak pool; everything
                    // else is a strong tip candidate.
                    let pool = match block.payload_transaction() {
                        Some(tx) => match engine.mempool.transaction(&tx.id()) {
                            Some(metadata) if metadata.conflicting.was_triggered() => TipPool::Weak,
                            _ => TipPool::Strong,
                        },
                        None => TipPool::Strong,
                    };
                    engine.tips.add_block(Arc::clone(block), pool);
                    engine.events.block_booked.trigger(block);
                })
                .detach();
        }

        // Gadget acceptance → clock and notarization; ratified
        // confirmation → clock and slot finalization votes.
        {
            let engine = Arc::clone(self);
            self.block_gadget
                .block_accepted
                .subscribe(move |block| {
                    engine.clock.advance_accepted(block);
                    if let Err(error) = engine.notarization.notarize_accepted_block(block) {
                        tracing::error!(block = %block.id(), %error, "notarization failed");
                    }
                    engine.events.block_accepted.trigger(block);
                })
                .detach();
        }
        {
            let engine = Arc::clone(self);
            self.block_gadget
                .block_confirmed
                .subscribe(move |block| {
                    engine.clock.advance_confirmed(block);
                    engine.slot_gadget.track_votes(block);
                    engine.events.block_confirmed.trigger(block);
                })
                .detach();
        }

        // Accepted transactions feed the slot's mutation set.
        {
            let engine = Arc::clone(self);
            self.mempool
                .transaction_accepted
                .subscribe(move |metadata| {
                    engine.notarization.notarize_accepted_transaction(
                        metadata.transaction(),
                        metadata.earliest_included_slot.get(),
                    );
                })
                .detach();
        }

        // Finalization → persistence, clock, eviction.
        {
            let engine = Arc::clone(self);
            self.slot_gadget
                .slot_finalized
                .subscribe(move |slot| {
                    if let Err(error) = engine.store.set_latest_finalized_slot(*slot) {
                        tracing::warn!(%error, "failed to persist latest finalized slot");
                    }
                    engine.clock.advance_finalized(*slot);
                    engine
                        .cache
                        .advance_eviction(slot.saturating_sub(engine.params.max_committable_age));
                    engine.events.slot_finalized.trigger(slot);
                })
                .detach();
        }

        // Eviction → tips and orphaned attachments.
        {
            let engine = Arc::clone(self);
            self.cache
                .slot_evicted
                .subscribe(move |slot| {
                    engine.tips.evict_slot(*slot);
                    engine.block_requester.evict_until(*slot);
                })
                .detach();
        }
        {
            let engine = Arc::clone(self);
            self.cache
                .block_evicted
                .subscribe(move |block| {
                    // A block evicted without acceptance is orphaned; its
                    // payload attachment is gone either way.
                    if !block.accepted.was_triggered() {
                        block.orphaned.set(true);
                    }
                    if let Some(tx) = block.payload_transaction() {
                        engine.mempool.orphan_attachment(&tx.id(), block.id());
                    }
                })
                .detach();
        }

        // Notarization → event hub.
        {
            let engine = Arc::clone(self);
            self.notarization
                .slot_committed
                .subscribe(move |entry| {
                    engine.events.slot_committed.trigger(entry);
                })
                .detach();
        }
        {
            let engine = Arc::clone(self);
            self.notarization
                .latest_commitment_updated
                .subscribe(move |commitment| {
                    engine.events.latest_commitment_updated.trigger(commitment);
                })
                .detach();
        }
    }
}
