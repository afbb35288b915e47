//! The block dispatcher: routes network traffic to the right engine and
//! drives warp-sync.
//!
//! Incoming blocks resolve their slot commitment through the chain
//! manager first; blocks with unsolid commitments wait in a bounded
//! buffer keyed by commitment id. Solid commitments route the block to
//! the engine whose chain id matches the commitment's chain forking
//! point (or the engine that explicitly requested the block). Blocks too
//! far past an engine's committed frontier are left to the warp-sync
//! cycle, which bulk-requests whole slots and verifies the returned
//! block-id sets against the commitment's roots.
//!
//! Two pools drive the work: a multi-worker dispatch pool and a
//! single-worker warp-sync pool. Task submission checks the shutdown flag
//! atomically (compare-and-set on a reactive bool); without an async
//! runtime the dispatcher degrades to synchronous calls, which is what
//! the deterministic tests use.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::block::{BlockId, ProtocolBlock};
use crate::chains::ChainManager;
use crate::commitment::{self, Commitment, CommitmentId};
use crate::config::ProtocolParameters;
use crate::engine::{Engine, EngineManager};
use crate::merkle::MerkleProof;
use crate::network::{Message, Network, PeerId};
use crate::notarization;
use crate::reactive::Variable;
use crate::requester::Requester;
use crate::workers::WorkerPool;
use crate::{constants, SlotIndex};

/// Errors from dispatching.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("block {0} buffered: slot commitment not solid")]
    Buffered(BlockId),
    #[error("unsolid-commitment buffer rejected block {0}")]
    BufferFull(BlockId),
    #[error("no matching engine for block {0}")]
    NoMatchingEngine(BlockId),
    #[error("unknown commitment {0}")]
    UnknownCommitment(CommitmentId),
    #[error("warp-sync proof rejected for {0}")]
    WarpSyncProofMismatch(CommitmentId),
    #[error("malformed block: {0}")]
    Malformed(String),
}

/// Bounded buffer for blocks whose slot commitment is not solid yet:
/// per-commitment LRU with a global count cap.
struct UnsolidCommitmentBuffer {
    per_key_capacity: usize,
    total_capacity: usize,
    inner: Mutex<BufferInner>,
}

#[derive(Default)]
struct BufferInner {
    queues: HashMap<CommitmentId, VecDeque<ProtocolBlock>>,
    lru: VecDeque<CommitmentId>,
    total: usize,
}

impl UnsolidCommitmentBuffer {
    fn new(per_key_capacity: usize, total_capacity: usize) -> Self {
        UnsolidCommitmentBuffer {
            per_key_capacity,
            total_capacity,
            inner: Mutex::new(BufferInner::default()),
        }
    }

    fn add(&self, commitment_id: CommitmentId, block: ProtocolBlock) -> bool {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        inner.lru.retain(|id| *id != commitment_id);
        inner.lru.push_back(commitment_id);

        let queue = inner.queues.entry(commitment_id).or_default();
        if queue.len() >= self.per_key_capacity {
            queue.pop_front();
        } else {
            inner.total += 1;
        }
        queue.push_back(block);

        // Over the global cap: shed from the least recently used key.
        while inner.total > self.total_capacity {
            let drop_key = match inner.lru.front().copied() {
                Some(oldest) if oldest != commitment_id => Some(oldest),
                Some(_) => inner.lru.get(1).copied(),
                None => None,
            };
            let Some(drop_key) = drop_key else { break };
            if let Some(queue) = inner.queues.remove(&drop_key) {
                inner.total -= queue.len();
            }
            inner.lru.retain(|id| *id != drop_key);
        }
        true
    }

    fn take(&self, commitment_id: &CommitmentId) -> Vec<ProtocolBlock> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        inner.lru.retain(|id| id != commitment_id);
        match inner.queues.remove(commitment_id) {
            Some(queue) => {
                inner.total -= queue.len();
                queue.into_iter().collect()
            }
            None => Vec::new(),
        }
    }

    fn evict_until(&self, slot: SlotIndex) {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        let doomed: Vec<CommitmentId> = inner
            .queues
            .keys()
            .filter(|id| id.slot <= slot)
            .copied()
            .collect();
        for id in doomed {
            if let Some(queue) = inner.queues.remove(&id) {
                inner.total -= queue.len();
            }
            inner.lru.retain(|key| *key != id);
        }
    }

    fn len(&self) -> usize {
        lock(&self.inner).total
    }
}

pub struct Dispatcher {
    params: Arc<ProtocolParameters>,
    chains: Arc<ChainManager>,
    engines: Arc<EngineManager>,
    network: Arc<dyn Network>,
    weak_self: Weak<Dispatcher>,

    dispatch_pool: Option<Arc<WorkerPool>>,
    warp_sync_pool: Option<Arc<WorkerPool>>,

    unsolid_buffer: UnsolidCommitmentBuffer,
    warp_sync_requester: Arc<Requester<CommitmentId>>,
    commitment_requester: Arc<Requester<CommitmentId>>,
    processed_warp_sync: Mutex<HashSet<CommitmentId>>,

    shutdown: Variable<bool>,
}

impl Dispatcher {
    pub fn new(
        params: Arc<ProtocolParameters>,
        chains: Arc<ChainManager>,
        engines: Arc<EngineManager>,
        network: Arc<dyn Network>,
        dispatch_workers: usize,
    ) -> Arc<Self> {
        let in_runtime = tokio::runtime::Handle::try_current().is_ok();
        let dispatcher = Arc::new_cyclic(|weak_self| Dispatcher {
            params,
            chains,
            engines,
            network,
            weak_self: weak_self.clone(),
            dispatch_pool: in_runtime
                .then(|| WorkerPool::new("block-dispatcher.dispatch", dispatch_workers)),
            warp_sync_pool: in_runtime.then(|| WorkerPool::new("block-dispatcher.warp-sync", 1)),
            unsolid_buffer: UnsolidCommitmentBuffer::new(
                constants::UNSOLID_BUFFER_PER_COMMITMENT,
                constants::UNSOLID_BUFFER_TOTAL,
            ),
            warp_sync_requester: Requester::new(
                Duration::from_millis(constants::WARP_SYNC_RETRY_MS),
                Duration::from_millis(constants::WARP_SYNC_RETRY_MS),
            ),
            commitment_requester: Requester::new(
                Duration::from_millis(constants::BLOCK_REQUEST_RETRY_MS),
                Duration::from_millis(constants::WARP_SYNC_RETRY_MS),
            ),
            processed_warp_sync: Mutex::new(HashSet::new()),
            shutdown: Variable::new(false),
        });
        dispatcher.init_monitoring();
        dispatcher.init_network_requests();
        dispatcher
    }

    /// Handle an incoming network message on the appropriate pool.
    pub fn submit_message(&self, peer: PeerId, message: Message) {
        let pool = match &message {
            Message::WarpSyncRequest(_) | Message::WarpSyncResponse { .. } => &self.warp_sync_pool,
            _ => &self.dispatch_pool,
        };
        let Some(pool) = pool else {
            self.handle_message(peer, message);
            return;
        };
        let weak = self.weak_self.clone();
        let pool = Arc::clone(pool);
        self.run_task(&pool, move || {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.handle_message(peer, message);
            }
        });
    }

    /// Handle a message synchronously. Errors are logged and the message
    /// is dropped; recovery is owned by the retry tickers.
    pub fn handle_message(&self, peer: PeerId, message: Message) {
        let result = match message {
            Message::Block(bytes) => ProtocolBlock::from_bytes(&bytes)
                .map_err(|e| DispatchError::Malformed(e.to_string()))
                .and_then(|block| self.dispatch_block(block)),
            Message::BlockRequest(id) => self.process_block_request(id, peer),
            Message::SlotCommitment(commitment) => {
                self.process_commitment(commitment);
                Ok(())
            }
            Message::SlotCommitmentRequest(id) => self.process_commitment_request(id, peer),
            Message::Attestations {
                commitment,
                attestations,
                proof,
            } => self.process_attestations(commitment, &attestations, &proof),
            Message::AttestationsRequest(id) => self.process_attestations_request(id, peer),
            Message::WarpSyncRequest(id) => self.process_warp_sync_request(id, peer),
            Message::WarpSyncResponse {
                commitment_id,
                block_ids,
                proof,
            } => self.process_warp_sync_response(commitment_id, &block_ids, &proof),
        };
        if let Err(error) = result {
            match error {
                DispatchError::Buffered(_) => {
                    tracing::debug!(%error, "block deferred");
                }
                _ => tracing::warn!(%error, "message dropped"),
            }
        }
    }

    /// Route a block to the correct engine instance.
    pub fn dispatch_block(&self, block: ProtocolBlock) -> Result<(), DispatchError> {
        let block_id = block
            .id(&self.params)
            .map_err(|e| DispatchError::Malformed(e.to_string()))?;
        let commitment_id = block.header.slot_commitment_id;

        let solid = self
            .chains
            .commitment_or_request(commitment_id)
            .map(|metadata| metadata.solid.was_triggered())
            .unwrap_or(false);
        if !solid {
            // `commitment_or_request` already announced the missing
            // commitment; the requester is ticking.
            if !self.unsolid_buffer.add(commitment_id, block) {
                return Err(DispatchError::BufferFull(block_id));
            }
            return Err(DispatchError::Buffered(block_id));
        }

        let chain_id = self
            .chains
            .commitment(&commitment_id)
            .and_then(|metadata| metadata.chain.get())
            .and_then(|chain| self.chains.chain(chain))
            .and_then(|chain| chain.forking_point.get());

        let mut matched = false;
        for engine in self.target_engines() {
            let requested = engine.block_requester.has_ticker(&block_id);
            if Some(engine.chain_id()) != chain_id && !requested {
                continue;
            }
            matched = true;
            if self.in_warp_sync_range(&engine, block_id) {
                // The whole slot will arrive in bulk; skip one-by-one
                // processing.
                continue;
            }
            if let Err(error) = engine.process_block(block.clone()) {
                tracing::debug!(block = %block_id, %error, "engine rejected block");
            }
        }
        if matched {
            Ok(())
        } else {
            Err(DispatchError::NoMatchingEngine(block_id))
        }
    }

    /// Number of blocks currently parked in the unsolid buffer.
    pub fn buffered_blocks(&self) -> usize {
        self.unsolid_buffer.len()
    }

    pub fn has_pending_warp_sync(&self, id: &CommitmentId) -> bool {
        self.warp_sync_requester.has_ticker(id)
    }

    /// Whether a warp-sync response for this commitment already verified.
    pub fn is_warp_sync_processed(&self, id: &CommitmentId) -> bool {
        lock_set(&self.processed_warp_sync).contains(id)
    }

    /// Stop tickers, drain both pools, then shut the engines down
    /// (reverse dataflow order ends at the store flush).
    pub async fn shutdown(&self) {
        self.shutdown.set(true);
        self.warp_sync_requester.shutdown();
        self.commitment_requester.shutdown();
        if let Some(pool) = &self.dispatch_pool {
            pool.shutdown().await;
        }
        if let Some(pool) = &self.warp_sync_pool {
            pool.shutdown().await;
        }
        let active = self.engines.active_engine();
        if let Err(error) = active.shutdown() {
            tracing::warn!(%error, "engine shutdown failed");
        }
        if let Some(candidate) = self.engines.candidate_engine() {
            if let Err(error) = candidate.shutdown() {
                tracing::warn!(%error, "candidate engine shutdown failed");
            }
        }
    }

    // ── Message handlers ──

    fn process_block_request(&self, id: BlockId, peer: PeerId) -> Result<(), DispatchError> {
        let engine = self.engines.active_engine();
        let bytes = engine
            .cache
            .get(&id)
            .and_then(|block| block.protocol_block())
            .and_then(|block| block.to_bytes().ok())
            .or_else(|| engine.store.block_bytes(&id).ok().flatten());
        if let Some(bytes) = bytes {
            self.network.send(Some(peer), Message::Block(bytes));
        }
        Ok(())
    }

    fn process_commitment(&self, commitment: Commitment) {
        self.commitment_requester.stop_ticker(&commitment.id());
        self.chains.process_commitment(commitment);
    }

    fn process_commitment_request(
        &self,
        id: CommitmentId,
        peer: PeerId,
    ) -> Result<(), DispatchError> {
        let engine = self.engines.active_engine();
        if let Ok(Some(commitment)) = engine.store.commitment_by_slot(id.slot) {
            if commitment.id() == id {
                self.network
                    .send(Some(peer), Message::SlotCommitment(commitment));
            }
        }
        Ok(())
    }

    fn process_attestations(
        &self,
        commitment: Commitment,
        attestations: &[crate::commitment::Attestation],
        proof: &MerkleProof,
    ) -> Result<(), DispatchError> {
        let commitment_id = commitment.id();
        self.process_commitment(commitment);
        let committee = self.engines.active_engine().seats.committee().clone();
        match self
            .chains
            .process_attestations(commitment_id, attestations, proof, &committee)
        {
            Ok(weight) => {
                tracing::debug!(commitment = %commitment_id, weight, "attestations verified");
                Ok(())
            }
            Err(error) => {
                tracing::error!(commitment = %commitment_id, %error, "attestations rejected");
                Ok(())
            }
        }
    }

    fn process_attestations_request(
        &self,
        id: CommitmentId,
        peer: PeerId,
    ) -> Result<(), DispatchError> {
        let engine = self.engines.active_engine();
        let Ok(Some(slot_data)) = engine.committed_slot(id.slot) else {
            return Ok(());
        };
        if slot_data.commitment.id() != id {
            return Ok(());
        }
        let Ok(attestations) = engine.notarization.attestations().get(id.slot) else {
            return Ok(());
        };
        self.network.send(Some(peer), Message::Attestations {
            commitment: slot_data.commitment,
            attestations,
            proof: slot_data.roots.attestations_proof(),
        });
        Ok(())
    }

    fn process_warp_sync_request(&self, id: CommitmentId, peer: PeerId) -> Result<(), DispatchError> {
        let engine = self.engines.active_engine();
        let Ok(Some(slot_data)) = engine.committed_slot(id.slot) else {
            return Err(DispatchError::UnknownCommitment(id));
        };
        if slot_data.commitment.id() != id {
            return Err(DispatchError::UnknownCommitment(id));
        }
        self.network.send(Some(peer), Message::WarpSyncResponse {
            commitment_id: id,
            block_ids: slot_data.block_ids,
            proof: slot_data.roots.tangle_proof(),
        });
        Ok(())
    }

    fn process_warp_sync_response(
        &self,
        commitment_id: CommitmentId,
        block_ids: &[BlockId],
        proof: &MerkleProof,
    ) -> Result<(), DispatchError> {
        if lock_set(&self.processed_warp_sync).contains(&commitment_id) {
            return Ok(());
        }
        let metadata = self
            .chains
            .commitment(&commitment_id)
            .ok_or(DispatchError::UnknownCommitment(commitment_id))?;
        let target = self
            .target_engine_for(&commitment_id)
            .ok_or(DispatchError::NoMatchingEngine(BlockId::root(&commitment_id)))?;

        // Rebuild the tangle root from the advertised ids and verify it
        // against the commitment's roots.
        let id_set = block_ids.iter().copied().collect();
        let tangle_root = notarization::tangle_root(&id_set);
        if !commitment::verify_tangle_root(
            &tangle_root,
            proof,
            &metadata.commitment().roots_id,
        ) {
            tracing::error!(commitment = %commitment_id, "warp-sync proof mismatch, rejecting");
            return Err(DispatchError::WarpSyncProofMismatch(commitment_id));
        }

        self.warp_sync_requester.stop_ticker(&commitment_id);
        lock_set(&self.processed_warp_sync).insert(commitment_id);
        tracing::info!(
            commitment = %commitment_id,
            blocks = block_ids.len(),
            "warp-sync slot verified"
        );

        for block_id in block_ids {
            if target.blockdag.get_or_request(*block_id).is_none() {
                tracing::debug!(block = %block_id, "warp-synced block below eviction window");
            }
        }
        Ok(())
    }

    // ── Warp-sync cycle ──

    /// Whether a block should be left to warp-sync: it commits further
    /// than `max_committable_age` past the engine's frontier and was not
    /// explicitly requested.
    fn in_warp_sync_range(&self, engine: &Arc<Engine>, block_id: BlockId) -> bool {
        if engine.block_requester.has_ticker(&block_id) {
            return false;
        }
        let latest = engine.latest_commitment().slot;
        block_id.slot > latest + self.params.max_committable_age
    }

    /// Kick off warp-sync tickers for the window past the engine's
    /// frontier when a chain commitment shows the engine is behind.
    fn warp_sync_if_necessary(
        &self,
        engine: &Arc<Engine>,
        metadata: &Arc<crate::chains::CommitmentMetadata>,
    ) {
        let latest = engine.latest_commitment().slot;
        if metadata.slot() <= latest + 1 {
            return;
        }
        let Some(chain) = metadata.chain.get().and_then(|id| self.chains.chain(id)) else {
            return;
        };
        let window_end = latest + 2 * self.params.max_committable_age;
        for slot in (latest + 1)..=window_end {
            let Some(commitment_id) = chain.commitment_at(slot) else {
                continue;
            };
            if lock_set(&self.processed_warp_sync).contains(&commitment_id) {
                continue;
            }
            self.start_warp_sync_request(commitment_id);
        }
    }

    fn start_warp_sync_request(&self, id: CommitmentId) {
        if tokio::runtime::Handle::try_current().is_ok() {
            self.warp_sync_requester.start_ticker(id);
        } else {
            self.network.send(None, Message::WarpSyncRequest(id));
        }
    }

    fn request_commitment(&self, id: CommitmentId) {
        if tokio::runtime::Handle::try_current().is_ok() {
            self.commitment_requester.start_ticker(id);
        } else {
            self.network.send(None, Message::SlotCommitmentRequest(id));
        }
    }

    // ── Wiring ──

    fn init_monitoring(self: &Arc<Self>) {
        // Solid commitments release buffered blocks and may trigger
        // warp-sync.
        {
            let weak = self.weak_self.clone();
            self.chains
                .commitment_published
                .subscribe(move |metadata| {
                    let weak = weak.clone();
                    let commitment_id = metadata.id();
                    metadata
                        .solid
                        .on_trigger(move || {
                            if let Some(dispatcher) = weak.upgrade() {
                                dispatcher.on_commitment_solid(commitment_id);
                            }
                        })
                        .detach();
                })
                .detach();
        }

        // The chain manager's missing commitments feed the requester.
        {
            let weak = self.weak_self.clone();
            self.chains
                .commitment_missing
                .subscribe(move |id| {
                    if let Some(dispatcher) = weak.upgrade() {
                        dispatcher.request_commitment(*id);
                    }
                })
                .detach();
        }
        {
            let weak = self.weak_self.clone();
            self.chains
                .commitment_request_satisfied
                .subscribe(move |id| {
                    if let Some(dispatcher) = weak.upgrade() {
                        dispatcher.commitment_requester.stop_ticker(id);
                    }
                })
                .detach();
        }

        // Chain switching: new chains get the switching flags wired.
        {
            let weak = self.weak_self.clone();
            self.chains
                .chain_created
                .subscribe(move |chain_id| {
                    if let Some(dispatcher) = weak.upgrade() {
                        dispatcher.monitor_chain(*chain_id);
                    }
                })
                .detach();
        }
        self.monitor_chain(self.chains.main_chain.get());
        {
            let weak = self.weak_self.clone();
            self.chains
                .main_chain_switch
                .subscribe(move |chain_id| {
                    let Some(dispatcher) = weak.upgrade() else {
                        return;
                    };
                    let Some(chain) = dispatcher.chains.chain(*chain_id) else {
                        return;
                    };
                    if let Some(handle) = chain.engine.get() {
                        if let Err(error) = dispatcher.engines.switch_to(handle) {
                            tracing::error!(%error, "main engine switch failed");
                        }
                    }
                })
                .detach();
        }

        // Engine frontier movement re-evaluates the warp-sync window and
        // publishes the engine's commitments to the chain manager.
        self.monitor_engine(&self.engines.active_engine());
        {
            let weak = self.weak_self.clone();
            let engines = Arc::clone(&self.engines);
            self.engines
                .engine_created
                .subscribe(move |handle| {
                    if let (Some(dispatcher), Some(engine)) =
                        (weak.upgrade(), engines.engine(*handle))
                    {
                        dispatcher.monitor_engine(&engine);
                    }
                })
                .detach();
        }
    }

    /// Wire a chain's switching flags: attestation requests for the
    /// heaviest claimed chain, an engine fork for the heaviest attested.
    fn monitor_chain(self: &Arc<Self>, chain_id: crate::chains::ChainId) {
        let Some(chain) = self.chains.chain(chain_id) else {
            return;
        };

        {
            let weak = self.weak_self.clone();
            let chain = Arc::clone(&chain);
            let flag = chain.request_attestations.clone();
            flag.on_update(move |_, requested| {
                let Some(dispatcher) = weak.upgrade() else {
                    return;
                };
                if *requested {
                    if let Some(latest) = chain.latest_commitment.get() {
                        dispatcher
                            .network
                            .send(None, Message::AttestationsRequest(latest));
                    }
                }
            })
            .detach();
        }

        {
            let weak = self.weak_self.clone();
            let flag = chain.instantiate_engine.clone();
            flag.on_update(move |_, instantiate| {
                let Some(dispatcher) = weak.upgrade() else {
                    return;
                };
                if !*instantiate || chain.engine.get().is_some() {
                    return;
                }
                let Some(forking_point) = chain.forking_point.get() else {
                    return;
                };
                let fork_slot = forking_point.slot.saturating_sub(1);
                match dispatcher.engines.fork_at_slot(fork_slot) {
                    Ok(handle) => {
                        chain.engine.set(Some(handle));
                    }
                    Err(error) => {
                        tracing::error!(%error, fork_slot, "candidate engine fork failed");
                    }
                }
            })
            .detach();
        }
    }

    fn monitor_engine(self: &Arc<Self>, engine: &Arc<Engine>) {
        let weak = self.weak_self.clone();
        let engine_handle = Arc::clone(engine);
        engine
            .events
            .latest_commitment_updated
            .subscribe(move |commitment| {
                let Some(dispatcher) = weak.upgrade() else {
                    return;
                };
                let metadata = dispatcher.chains.process_commitment(commitment.clone());
                // The engine itself verified this commitment.
                metadata.verified.trigger();
                lock_set(&dispatcher.processed_warp_sync).remove(&commitment.id());
                dispatcher.warp_sync_if_necessary(&engine_handle, &metadata);
            })
            .detach();

        let weak = self.weak_self.clone();
        engine
            .events
            .slot_finalized
            .subscribe(move |slot| {
                if let Some(dispatcher) = weak.upgrade() {
                    dispatcher.evict(*slot);
                }
            })
            .detach();

        // Outbound block requests from the engine's requester.
        let network = Arc::clone(&self.network);
        engine
            .block_requester
            .tick
            .subscribe(move |id| {
                network.send(None, Message::BlockRequest(*id));
            })
            .detach();
    }

    fn init_network_requests(self: &Arc<Self>) {
        let network = Arc::clone(&self.network);
        self.warp_sync_requester
            .tick
            .subscribe(move |id| {
                network.send(None, Message::WarpSyncRequest(*id));
            })
            .detach();

        let network = Arc::clone(&self.network);
        self.commitment_requester
            .tick
            .subscribe(move |id| {
                network.send(None, Message::SlotCommitmentRequest(*id));
            })
            .detach();
    }

    fn on_commitment_solid(&self, commitment_id: CommitmentId) {
        for block in self.unsolid_buffer.take(&commitment_id) {
            if let Err(error) = self.dispatch_block(block) {
                tracing::debug!(%error, "buffered block not dispatched");
            }
        }
        if let Some(metadata) = self.chains.commitment(&commitment_id) {
            if let Some(engine) = self.target_engine_for(&commitment_id) {
                self.warp_sync_if_necessary(&engine, &metadata);
            }
        }
    }

    fn evict(&self, slot: SlotIndex) {
        self.warp_sync_requester.evict_until(slot);
        self.commitment_requester.evict_until(slot);
        self.unsolid_buffer.evict_until(slot);
        self.chains.evict(slot);
        lock_set(&self.processed_warp_sync).retain(|id| id.slot > slot);
    }

    fn target_engines(&self) -> Vec<Arc<Engine>> {
        let mut engines = vec![self.engines.active_engine()];
        if let Some(candidate) = self.engines.candidate_engine() {
            engines.push(candidate);
        }
        engines
    }

    fn target_engine_for(&self, commitment_id: &CommitmentId) -> Option<Arc<Engine>> {
        let chain_id = self
            .chains
            .commitment(commitment_id)?
            .chain
            .get()
            .and_then(|id| self.chains.chain(id))
            .and_then(|chain| chain.forking_point.get())?;
        self.target_engines()
            .into_iter()
            .find(|engine| engine.chain_id() == chain_id)
    }

    /// Submit a task unless shut down (atomic check-and-submit).
    fn run_task(&self, pool: &Arc<WorkerPool>, task: impl FnOnce() + Send + 'static) {
        let mut task = Some(task);
        self.shutdown.compute(|is_shutdown| {
            if !is_shutdown {
                if let Some(task) = task.take() {
                    pool.submit(task);
                }
            }
            *is_shutdown
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_set(
    mutex: &Mutex<HashSet<CommitmentId>>,
) -> std::sync::MutexGuard<'_, HashSet<CommitmentId>> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commitment_id(slot: SlotIndex, tag: u8) -> CommitmentId {
        CommitmentId {
            slot,
            hash: [tag; 32],
        }
    }

    fn test_block(tag: u8) -> ProtocolBlock {
        use crate::block::{BlockHeader, Payload};
        use crate::committee::Signature;
        ProtocolBlock {
            header: BlockHeader {
                protocol_version: 1,
                issuer: [tag; 32],
                issuing_time_ms: tag as u64,
                slot_commitment_id: CommitmentId::default(),
                latest_finalized_slot: 0,
                strong_parents: vec![BlockId::default()],
                weak_parents: vec![],
                shallow_like_parents: vec![],
            },
            payload: Payload::Validation {
                highest_supported_version: 1,
            },
            signature: Signature::empty(),
        }
    }

    #[test]
    fn buffer_caps_per_key() {
        let buffer = UnsolidCommitmentBuffer::new(2, 100);
        let key = commitment_id(1, 1);
        for tag in 0..5u8 {
            buffer.add(key, test_block(tag));
        }
        let drained = buffer.take(&key);
        assert_eq!(drained.len(), 2);
        // The newest blocks survive.
        assert_eq!(drained[1].header.issuer, [4u8; 32]);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn buffer_sheds_least_recently_used_key() {
        let buffer = UnsolidCommitmentBuffer::new(10, 4);
        let old_key = commitment_id(1, 1);
        let new_key = commitment_id(2, 2);
        for tag in 0..3u8 {
            buffer.add(old_key, test_block(tag));
        }
        for tag in 0..2u8 {
            buffer.add(new_key, test_block(tag));
        }
        // Global cap 4 exceeded: the old key was shed entirely.
        assert!(buffer.take(&old_key).is_empty());
        assert_eq!(buffer.take(&new_key).len(), 2);
    }

    #[test]
    fn buffer_evicts_by_slot() {
        let buffer = UnsolidCommitmentBuffer::new(10, 100);
        buffer.add(commitment_id(1, 1), test_block(1));
        buffer.add(commitment_id(5, 2), test_block(2));
        buffer.evict_until(3);
        assert!(buffer.take(&commitment_id(1, 1)).is_empty());
        assert_eq!(buffer.take(&commitment_id(5, 2)).len(), 1);
    }
}
