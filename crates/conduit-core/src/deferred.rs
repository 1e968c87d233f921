//! Externally settled promises and an id-keyed registry of them.
//!
//! A [`Deferred`] is the settling side of an async operation; any number of
//! [`Promise`] handles can wait on it. Settlement is recorded once: the first
//! `resolve` or `reject` wins and every later call is a reported no-op.

use rustc_hash::FxHashMap;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// State of a [`Deferred`].
#[derive(Debug, Clone)]
pub enum Settlement<T> {
    /// Not settled yet.
    Pending,
    /// Settled with a value.
    Resolved(T),
    /// Settled with an error.
    Rejected(Error),
}

impl<T> Settlement<T> {
    /// Whether the deferred is still waiting for a settlement.
    pub fn is_pending(&self) -> bool {
        matches!(self, Settlement::Pending)
    }
}

/// Settling side of a one-shot asynchronous result.
#[derive(Debug)]
pub struct Deferred<T> {
    tx: watch::Sender<Settlement<T>>,
}

impl<T: Clone> Deferred<T> {
    /// Create a pending deferred.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Settlement::Pending);
        Self { tx }
    }

    /// Get a waiter for this deferred.
    pub fn promise(&self) -> Promise<T> {
        Promise {
            rx: self.tx.subscribe(),
        }
    }

    /// Settle with a value. Returns `false` if it was already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Settlement::Resolved(value))
    }

    /// Settle with an error. Returns `false` if it was already settled.
    pub fn reject(&self, error: Error) -> bool {
        self.settle(Settlement::Rejected(error))
    }

    /// Current state.
    pub fn settlement(&self) -> Settlement<T> {
        self.tx.borrow().clone()
    }

    /// Whether `resolve` or `reject` has taken effect.
    pub fn is_settled(&self) -> bool {
        !self.tx.borrow().is_pending()
    }

    fn settle(&self, outcome: Settlement<T>) -> bool {
        self.tx.send_if_modified(move |state| {
            if !state.is_pending() {
                return false;
            }
            *state = outcome;
            true
        })
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Waiting side of a [`Deferred`]. Cheap to clone; every clone observes the
/// same settlement.
#[derive(Debug, Clone)]
pub struct Promise<T> {
    rx: watch::Receiver<Settlement<T>>,
}

impl<T: Clone> Promise<T> {
    /// Wait for the settlement.
    ///
    /// Fails with [`Error::Abandoned`] if the deferred is dropped while
    /// still pending.
    pub async fn wait(&self) -> Result<T> {
        let mut rx = self.rx.clone();
        let settled = rx
            .wait_for(|state| !state.is_pending())
            .await
            .map_err(|_| Error::Abandoned)?;
        match &*settled {
            Settlement::Resolved(value) => Ok(value.clone()),
            Settlement::Rejected(error) => Err(error.clone()),
            Settlement::Pending => Err(Error::Abandoned),
        }
    }

    /// Current state without waiting.
    pub fn peek(&self) -> Settlement<T> {
        self.rx.borrow().clone()
    }
}

/// Registry correlating string ids with pending deferreds.
///
/// Ids come from a monotonic counter and are never reused for the lifetime
/// of the tracker. An id leaves the registry exactly once: on resolve,
/// reject, explicit removal or `reject_all`.
#[derive(Debug)]
pub struct PromiseTracker<T> {
    next_id: u64,
    pending: FxHashMap<String, Deferred<T>>,
}

impl<T: Clone> PromiseTracker<T> {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            next_id: 0,
            pending: FxHashMap::default(),
        }
    }

    /// Register a new pending entry and return its id and waiter.
    pub fn create(&mut self) -> (String, Promise<T>) {
        let id = self.next_id.to_string();
        self.next_id += 1;

        let deferred = Deferred::new();
        let promise = deferred.promise();
        self.pending.insert(id.clone(), deferred);
        (id, promise)
    }

    /// Resolve and forget `id`. Returns `false` for unknown ids.
    pub fn resolve(&mut self, id: &str, value: T) -> bool {
        match self.pending.remove(id) {
            Some(deferred) => deferred.resolve(value),
            None => false,
        }
    }

    /// Reject and forget `id`. Returns `false` for unknown ids.
    pub fn reject(&mut self, id: &str, error: Error) -> bool {
        match self.pending.remove(id) {
            Some(deferred) => deferred.reject(error),
            None => false,
        }
    }

    /// Forget `id` without settling it.
    pub fn remove(&mut self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Reject every pending entry with a clone of `error`.
    pub fn reject_all(&mut self, error: Error) {
        for (_, deferred) in self.pending.drain() {
            deferred.reject(error.clone());
        }
    }

    /// Whether `id` is still pending.
    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<T: Clone> Default for PromiseTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}
