//! Retry tickers for missing blocks, commitments and warp-sync requests.
//!
//! A `Requester` keeps one ticker per outstanding id. Each ticker fires the
//! `tick` signal immediately and then retries on an exponential backoff
//! with jitter, capped at a fixed upper bound. Tickers never fail; they
//! run until stopped, evicted or shut down.

use std::collections::HashMap;
use std::hash::Hash as StdHash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::block::BlockId;
use crate::commitment::CommitmentId;
use crate::reactive::Signal;
use crate::SlotIndex;

/// Ids that carry a slot, so tickers can be evicted by slot.
pub trait HasSlot {
    fn slot(&self) -> SlotIndex;
}

impl HasSlot for BlockId {
    fn slot(&self) -> SlotIndex {
        self.slot
    }
}

impl HasSlot for CommitmentId {
    fn slot(&self) -> SlotIndex {
        self.slot
    }
}

/// A set of per-id retry tickers.
pub struct Requester<Id> {
    /// Fires for every retry attempt of an outstanding id.
    pub tick: Signal<Id>,
    tickers: Mutex<HashMap<Id, CancellationToken>>,
    base_interval: Duration,
    max_interval: Duration,
    shutdown: CancellationToken,
}

impl<Id> Requester<Id>
where
    Id: Clone + Eq + StdHash + Send + Sync + 'static,
{
    pub fn new(base_interval: Duration, max_interval: Duration) -> Arc<Self> {
        Arc::new(Requester {
            tick: Signal::new(),
            tickers: Mutex::new(HashMap::new()),
            base_interval,
            max_interval,
            shutdown: CancellationToken::new(),
        })
    }

    /// Start a ticker for `id`. A no-op if one is already running or the
    /// requester is shut down.
    pub fn start_ticker(self: &Arc<Self>, id: Id) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let token = {
            let mut tickers = lock(&self.tickers);
            if tickers.contains_key(&id) {
                return;
            }
            let token = self.shutdown.child_token();
            tickers.insert(id.clone(), token.clone());
            token
        };

        let requester = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = requester.base_interval;
            loop {
                requester.tick.trigger(&id);
                let jittered = jitter(interval);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(jittered) => {}
                }
                interval = (interval * 2).min(requester.max_interval);
            }
        });
    }

    /// Stop the ticker for `id`, if any.
    pub fn stop_ticker(&self, id: &Id) {
        if let Some(token) = lock(&self.tickers).remove(id) {
            token.cancel();
        }
    }

    pub fn has_ticker(&self, id: &Id) -> bool {
        lock(&self.tickers).contains_key(id)
    }

    pub fn outstanding(&self) -> usize {
        lock(&self.tickers).len()
    }

    /// Stop all tickers and reject future starts.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        lock(&self.tickers).clear();
    }
}

impl<Id> Requester<Id>
where
    Id: Clone + Eq + StdHash + Send + Sync + HasSlot + 'static,
{
    /// Cancel all tickers for ids at or below `slot`.
    pub fn evict_until(&self, slot: SlotIndex) {
        let mut tickers = lock(&self.tickers);
        tickers.retain(|id, token| {
            if id.slot() <= slot {
                token.cancel();
                false
            } else {
                true
            }
        });
    }
}

/// Randomize an interval by ±10% so a fleet of nodes does not retry in
/// lock-step.
fn jitter(interval: Duration) -> Duration {
    let millis = interval.as_millis() as u64;
    if millis == 0 {
        return interval;
    }
    let spread = millis / 10;
    let offset = rand::thread_rng().gen_range(0..=spread * 2);
    Duration::from_millis(millis - spread + offset)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
