//! The engine manager: owns every engine instance and performs forking
//! and switching.
//!
//! Engines live in an arena and are addressed by handle; chains refer to
//! engines by handle only, so no ownership cycles form. Forking exports a
//! snapshot of the active engine at the fork slot, imports it into a
//! fresh store and builds a candidate engine on top. Switching makes the
//! candidate the active engine; the previous one is retained until its
//! shutdown completes.

use std::sync::{Arc, Mutex};

use crate::chains::EngineHandle;
use crate::config::ProtocolParameters;
use crate::engine::{Engine, EngineError};
use crate::reactive::{Signal, Variable};
use crate::storage::Store;
use crate::SlotIndex;

pub struct EngineManager {
    params: Arc<ProtocolParameters>,
    engines: Mutex<Vec<Arc<Engine>>>,

    pub active: Variable<EngineHandle>,
    pub candidate: Variable<Option<EngineHandle>>,
    pub engine_created: Signal<EngineHandle>,
}

impl EngineManager {
    /// Create the manager with its initial active engine.
    pub fn new(params: Arc<ProtocolParameters>, main_engine: Arc<Engine>) -> Arc<Self> {
        Arc::new(EngineManager {
            params,
            engines: Mutex::new(vec![main_engine]),
            active: Variable::new(0),
            candidate: Variable::new(None),
            engine_created: Signal::new(),
        })
    }

    pub fn engine(&self, handle: EngineHandle) -> Option<Arc<Engine>> {
        lock(&self.engines).get(handle).cloned()
    }

    pub fn active_engine(&self) -> Arc<Engine> {
        let handle = self.active.get();
        lock(&self.engines)[handle].clone()
    }

    pub fn candidate_engine(&self) -> Option<Arc<Engine>> {
        self.candidate.get().and_then(|handle| self.engine(handle))
    }

    /// Fork a candidate engine from the active engine's state at
    /// `fork_slot` (the slot before a fork's forking point).
    pub fn fork_at_slot(&self, fork_slot: SlotIndex) -> Result<EngineHandle, EngineError> {
        let active = self.active_engine();
        let snapshot = active.export_snapshot(fork_slot)?;

        let store = Store::open_temporary()?;
        snapshot.import_into(&store)?;
        let engine = Engine::new(store, Arc::clone(&self.params))?;

        let handle = {
            let mut engines = lock(&self.engines);
            engines.push(engine);
            engines.len() - 1
        };
        tracing::info!(fork_slot, handle, "candidate engine forked");
        self.candidate.set(Some(handle));
        self.engine_created.trigger(&handle);
        Ok(handle)
    }

    /// Atomically promote a candidate to be the active engine. The
    /// previous engine stays in the arena until its shutdown completes.
    pub fn switch_to(&self, handle: EngineHandle) -> Result<(), EngineError> {
        let previous = self.active.get();
        if previous == handle {
            return Ok(());
        }
        if self.engine(handle).is_none() {
            return Err(EngineError::UnknownEngine(handle));
        }
        self.active.set(handle);
        if self.candidate.get() == Some(handle) {
            self.candidate.set(None);
        }
        tracing::info!(from = previous, to = handle, "main engine switched");
        if let Some(old) = self.engine(previous) {
            if let Err(error) = old.shutdown() {
                tracing::warn!(%error, "previous engine shutdown failed");
            }
        }
        Ok(())
    }
}

fn lock(mutex: &Mutex<Vec<Arc<Engine>>>) -> std::sync::MutexGuard<'_, Vec<Arc<Engine>>> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
