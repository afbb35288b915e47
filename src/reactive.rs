//! Reactive primitives: variables, latching events and broadcast signals.
//!
//! The engine pipeline is wired through small reactive cells instead of
//! direct method calls: a `Variable<T>` holds a value and notifies
//! subscribers of transitions, an `Event` is a latching boolean variable,
//! and a `Signal<T>` broadcasts payload-carrying notifications without
//! retaining state.
//!
//! Ordering contract: for a given cell, callbacks run in registration
//! order and never observe update `k + 1` before update `k`. Re-entrant
//! updates (a callback setting the cell it is reacting to) are queued and
//! applied after the current drain, never recursively.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type TransitionFn<T> = dyn Fn(&T, &T) -> T + Send + Sync;
type UpdateFn<T> = dyn Fn(&T, &T) + Send + Sync;

/// Handle that cancels a callback registration when `cancel` is called.
///
/// Dropping the handle without cancelling leaves the callback subscribed
/// for the lifetime of the cell.
pub struct Subscription {
    unsubscribed: Arc<AtomicBool>,
    invocation_lock: Arc<Mutex<()>>,
}

impl Subscription {
    fn new(unsubscribed: Arc<AtomicBool>, invocation_lock: Arc<Mutex<()>>) -> Self {
        Subscription {
            unsubscribed,
            invocation_lock,
        }
    }

    /// A subscription that controls nothing (used when a callback was
    /// replayed immediately instead of being registered).
    fn dummy() -> Self {
        Subscription {
            unsubscribed: Arc::new(AtomicBool::new(true)),
            invocation_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Cancel the registration.
    ///
    /// Taking the invocation lock resolves the race with an in-flight
    /// delivery: after `cancel` returns, the callback is either done
    /// running or will never run again.
    pub fn cancel(self) {
        let _guard = self
            .invocation_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.unsubscribed.store(true, Ordering::SeqCst);
    }

    /// Keep the callback subscribed forever.
    pub fn detach(self) {}
}

struct Callback<T> {
    #[allow(dead_code)]
    id: u64,
    f: Arc<UpdateFn<T>>,
    unsubscribed: Arc<AtomicBool>,
    invocation_lock: Arc<Mutex<()>>,
    /// Highest update id this callback has observed; deliveries with an id
    /// at or below it are skipped (exactly-once per transition).
    last_seen_update: Arc<AtomicU64>,
}

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        Callback {
            id: self.id,
            f: Arc::clone(&self.f),
            unsubscribed: Arc::clone(&self.unsubscribed),
            invocation_lock: Arc::clone(&self.invocation_lock),
            last_seen_update: Arc::clone(&self.last_seen_update),
        }
    }
}

struct VariableState<T> {
    value: T,
    update_id: u64,
    /// Transitions not yet delivered: (update id, previous, new).
    pending: VecDeque<(u64, T, T)>,
    draining: bool,
}

struct VariableInner<T> {
    state: Mutex<VariableState<T>>,
    callbacks: Mutex<Vec<Callback<T>>>,
    next_callback_id: AtomicU64,
    transition: Option<Box<TransitionFn<T>>>,
}

/// A shared reactive value with subscriber callbacks.
///
/// Cloning the handle is cheap and refers to the same cell.
pub struct Variable<T> {
    inner: Arc<VariableInner<T>>,
}

impl<T> Clone for Variable<T> {
    fn clone(&self) -> Self {
        Variable {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Variable<T> {
    /// Create a variable holding `initial`.
    pub fn new(initial: T) -> Self {
        Self::build(initial, None)
    }

    /// Create a variable whose updates pass through `transition(current,
    /// candidate)` before being applied.
    pub fn with_transition(
        initial: T,
        transition: impl Fn(&T, &T) -> T + Send + Sync + 'static,
    ) -> Self {
        Self::build(initial, Some(Box::new(transition)))
    }

    fn build(initial: T, transition: Option<Box<TransitionFn<T>>>) -> Self {
        Variable {
            inner: Arc::new(VariableInner {
                state: Mutex::new(VariableState {
                    value: initial,
                    update_id: 0,
                    pending: VecDeque::new(),
                    draining: false,
                }),
                callbacks: Mutex::new(Vec::new()),
                next_callback_id: AtomicU64::new(0),
                transition,
            }),
        }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.lock_state().value.clone()
    }

    /// Set the value, returning the previous one.
    pub fn set(&self, value: T) -> T {
        self.apply(|_| value)
    }

    /// Atomically derive the new value from the current one.
    pub fn compute(&self, f: impl FnOnce(&T) -> T) -> T {
        self.apply(f)
    }

    /// Register `f(prev, new)` to run on every transition.
    pub fn on_update(&self, f: impl Fn(&T, &T) + Send + Sync + 'static) -> Subscription {
        self.register(Arc::new(f)).1
    }

    fn register(&self, f: Arc<UpdateFn<T>>) -> (bool, Subscription) {
        // The state lock is held while inserting so the callback's starting
        // update id is consistent with the value it would read.
        let state = self.lock_state();
        let unsubscribed = Arc::new(AtomicBool::new(false));
        let invocation_lock = Arc::new(Mutex::new(()));
        let callback = Callback {
            id: self.inner.next_callback_id.fetch_add(1, Ordering::SeqCst),
            f,
            unsubscribed: Arc::clone(&unsubscribed),
            invocation_lock: Arc::clone(&invocation_lock),
            last_seen_update: Arc::new(AtomicU64::new(state.update_id)),
        };
        self.lock_callbacks().push(callback);
        let truthy = state.update_id > 0;
        drop(state);

        (truthy, Subscription::new(unsubscribed, invocation_lock))
    }

    fn apply(&self, f: impl FnOnce(&T) -> T) -> T {
        let previous;
        {
            let mut state = self.lock_state();
            let candidate = f(&state.value);
            let new_value = match &self.inner.transition {
                Some(transition) => transition(&state.value, &candidate),
                None => candidate,
            };
            if new_value == state.value {
                return state.value.clone();
            }
            previous = std::mem::replace(&mut state.value, new_value.clone());
            state.update_id += 1;
            let id = state.update_id;
            state.pending.push_back((id, previous.clone(), new_value));
            if state.draining {
                // A callback on this cell is mid-drain; it will pick the
                // queued transition up after the current one.
                return previous;
            }
            state.draining = true;
        }
        self.drain();
        previous
    }

    fn drain(&self) {
        loop {
            let (id, prev, new) = {
                let mut state = self.lock_state();
                match state.pending.pop_front() {
                    Some(transition) => transition,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            let callbacks = {
                let mut callbacks = self.lock_callbacks();
                callbacks.retain(|cb| !cb.unsubscribed.load(Ordering::SeqCst));
                callbacks.clone()
            };
            for cb in callbacks {
                let _guard = cb
                    .invocation_lock
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if cb.unsubscribed.load(Ordering::SeqCst) {
                    continue;
                }
                if cb.last_seen_update.load(Ordering::SeqCst) >= id {
                    continue;
                }
                cb.last_seen_update.store(id, Ordering::SeqCst);
                (cb.f)(&prev, &new);
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, VariableState<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_callbacks(&self) -> std::sync::MutexGuard<'_, Vec<Callback<T>>> {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Derive a variable from one source through a pure function.
pub fn derive1<A, T>(a: &Variable<A>, f: impl Fn(&A) -> T + Send + Sync + 'static) -> Variable<T>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + PartialEq + Send + Sync + 'static,
{
    let out = Variable::new(f(&a.get()));
    let out_handle = out.clone();
    a.on_update(move |_, new| {
        out_handle.set(f(new));
    })
    .detach();
    out
}

/// Derive a variable from two sources through a pure function.
///
/// The derived cell recomputes on any source update; both sources are
/// re-read at recompute time so the result converges even when the two
/// update concurrently.
pub fn derive2<A, B, T>(
    a: &Variable<A>,
    b: &Variable<B>,
    f: impl Fn(&A, &B) -> T + Send + Sync + 'static,
) -> Variable<T>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    B: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + PartialEq + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let out = Variable::new(f(&a.get(), &b.get()));
    {
        let out = out.clone();
        let b = b.clone();
        let f = Arc::clone(&f);
        a.on_update(move |_, new_a| {
            out.set(f(new_a, &b.get()));
        })
        .detach();
    }
    {
        let out = out.clone();
        let a = a.clone();
        b.on_update(move |_, new_b| {
            out.set(f(&a.get(), new_b));
        })
        .detach();
    }
    out
}

/// A latching boolean: once triggered it stays triggered.
///
/// Implemented as a `Variable<bool>` whose transition is logical-or.
#[derive(Clone)]
pub struct Event {
    var: Variable<bool>,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    pub fn new() -> Self {
        Event {
            var: Variable::with_transition(false, |current, new| *current || *new),
        }
    }

    /// Trigger the event. Returns true on the first trigger only.
    pub fn trigger(&self) -> bool {
        !self.var.set(true)
    }

    pub fn was_triggered(&self) -> bool {
        self.var.get()
    }

    /// Run `f` when the event triggers.
    ///
    /// If the event already triggered, `f` runs immediately (exactly once
    /// in total: the registration bookkeeping guarantees a handler never
    /// sees the same transition twice even when registration races the
    /// trigger).
    pub fn on_trigger(&self, f: impl Fn() + Send + Sync + 'static) -> Subscription {
        let f = Arc::new(f);
        let g = Arc::clone(&f);
        let (already_triggered, subscription) = self.var.register(Arc::new(move |_, _| g()));
        if already_triggered {
            f();
            return Subscription::dummy();
        }
        subscription
    }

    /// Forward triggers of `source` into this event.
    pub fn inherit_from(&self, source: &Event) -> Subscription {
        let this = self.clone();
        source.on_trigger(move || {
            this.trigger();
        })
    }

    /// The underlying boolean variable, for composing derived cells.
    pub fn as_variable(&self) -> &Variable<bool> {
        &self.var
    }
}

type SignalFn<T> = dyn Fn(&T) + Send + Sync;

struct SignalCallback<T> {
    f: Arc<SignalFn<T>>,
    unsubscribed: Arc<AtomicBool>,
    invocation_lock: Arc<Mutex<()>>,
}

impl<T> Clone for SignalCallback<T> {
    fn clone(&self) -> Self {
        SignalCallback {
            f: Arc::clone(&self.f),
            unsubscribed: Arc::clone(&self.unsubscribed),
            invocation_lock: Arc::clone(&self.invocation_lock),
        }
    }
}

/// A broadcast hook carrying a payload but no retained state.
///
/// Used for pipeline notifications (block solid, block accepted, slot
/// finalized, ...) where subscribers need the subject, not a latched flag.
pub struct Signal<T> {
    callbacks: Arc<Mutex<Vec<SignalCallback<T>>>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Signal {
            callbacks: Arc::clone(&self.callbacks),
        }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Signal {
            callbacks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self, f: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let unsubscribed = Arc::new(AtomicBool::new(false));
        let invocation_lock = Arc::new(Mutex::new(()));
        self.lock().push(SignalCallback {
            f: Arc::new(f),
            unsubscribed: Arc::clone(&unsubscribed),
            invocation_lock: Arc::clone(&invocation_lock),
        });
        Subscription::new(unsubscribed, invocation_lock)
    }

    pub fn trigger(&self, value: &T) {
        let callbacks = {
            let mut callbacks = self.lock();
            callbacks.retain(|cb| !cb.unsubscribed.load(Ordering::SeqCst));
            callbacks.clone()
        };
        for cb in callbacks {
            let _guard = cb
                .invocation_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if cb.unsubscribed.load(Ordering::SeqCst) {
                continue;
            }
            (cb.f)(value);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SignalCallback<T>>> {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
