//! Named worker pools over the tokio runtime.
//!
//! Each pipeline concern runs its callbacks on its own pool; single-worker
//! pools preserve submission order, which is what the engine relies on for
//! its per-subject ordering guarantees. Shutdown drains: the queue closes,
//! workers finish what was already submitted, then exit.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A pool of `workers` tasks draining a shared queue.
pub struct WorkerPool {
    name: &'static str,
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawn a pool with the given number of workers (at least one).
    pub fn new(name: &'static str, workers: usize) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel::<Task>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let mut handles = Vec::with_capacity(workers.max(1));
        for _ in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            handles.push(tokio::spawn(async move {
                loop {
                    let task = {
                        let mut receiver = receiver.lock().await;
                        receiver.recv().await
                    };
                    match task {
                        Some(task) => task(),
                        None => break,
                    }
                }
            }));
        }

        Arc::new(WorkerPool {
            name,
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Submit a task. Returns false once the pool is shut down.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        let sender = lock(&self.sender);
        match sender.as_ref() {
            Some(sender) => sender.send(Box::new(task)).is_ok(),
            None => false,
        }
    }

    /// Close the queue and wait for the workers to drain it.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        // Dropping the sender closes the queue; workers drain and exit.
        lock(&self.sender).take();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self
                .handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

fn lock(
    mutex: &Mutex<Option<mpsc::UnboundedSender<Task>>>,
) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<Task>>> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
