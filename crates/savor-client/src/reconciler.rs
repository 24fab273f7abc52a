//! Optimistic mutations with rollback.
//!
//! A mutation applies its predicted value locally, calls the backend, and then
//! either adopts the server's authoritative value or restores the snapshot
//! taken before the prediction. While a mutation for a key is in flight,
//! further mutations of that key are ignored. A mutation dropped before the
//! backend answers is rolled back as if it had failed, minus the error.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use savor_types::api::{Envelope, ToggleResult};

/// Displayed state of a boolean interaction: whether the current user has
/// it active, and how many users do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToggleState {
    pub active: bool,
    pub count: u32,
}

impl ToggleState {
    pub fn new(active: bool, count: u32) -> Self {
        Self { active, count }
    }

    /// The predicted state after flipping. The count never goes below zero.
    pub fn toggled(self) -> Self {
        self.set(!self.active)
    }

    /// The predicted state after setting `active`, or `self` when it already
    /// has that value.
    pub fn set(self, active: bool) -> Self {
        if self.active == active {
            return self;
        }
        let count = if active {
            self.count.saturating_add(1)
        } else {
            self.count.saturating_sub(1)
        };
        Self { active, count }
    }
}

impl From<ToggleResult> for ToggleState {
    fn from(r: ToggleResult) -> Self {
        Self {
            active: r.active,
            count: r.count,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome<V> {
    /// The backend accepted the mutation. Holds the value now displayed: the
    /// server's when it sent one, the prediction otherwise.
    Confirmed(V),
    /// The backend refused. The pre-mutation value was restored.
    RolledBack { restored: V, error: String },
    /// Another mutation of the same key was in flight, or the prediction
    /// changed nothing. No request was made.
    Ignored,
}

impl<V> MutationOutcome<V> {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::RolledBack { error, .. } => Some(error),
            _ => None,
        }
    }
}

struct StoreInner<K, V> {
    values: HashMap<K, V>,
    in_flight: HashSet<K>,
    last_error: Option<String>,
}

/// Keyed values with optimistic mutation.
///
/// The in-flight guard is per store and per key, so a store should hold one
/// kind of action: a post's like and its share can be in flight together
/// only if they live in different stores.
pub struct OptimisticStore<K, V> {
    inner: Mutex<StoreInner<K, V>>,
}

impl<K, V> Default for OptimisticStore<K, V> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                values: HashMap::new(),
                in_flight: HashSet::new(),
                last_error: None,
            }),
        }
    }
}

/// One mutation's claim on a key: the value it replaced and who to tell.
///
/// Dropped before the mutation settles (the future was cancelled), it puts
/// the old value back and clears the in-flight mark, so an unanswered
/// prediction never outlives its request.
struct InFlight<'a, K: Eq + Hash + Clone, V: Clone, O: FnMut(&V)> {
    store: &'a OptimisticStore<K, V>,
    key: K,
    snapshot: V,
    observe: O,
    settled: bool,
}

impl<K: Eq + Hash + Clone, V: Clone, O: FnMut(&V)> Drop for InFlight<'_, K, V, O> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        {
            let mut inner = self.store.lock();
            inner.in_flight.remove(&self.key);
            inner.values.insert(self.key.clone(), self.snapshot.clone());
        }
        (self.observe)(&self.snapshot);
    }
}

impl<K, V> OptimisticStore<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner<K, V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Error of the most recent rolled back mutation. Cleared when the next
    /// mutation starts.
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn take_error(&self) -> Option<String> {
        self.lock().last_error.take()
    }
}

impl<K, V> OptimisticStore<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone + Default,
{
    /// Current value, or the default for keys never seen.
    pub fn get(&self, key: &K) -> V {
        self.lock().values.get(key).cloned().unwrap_or_default()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().values.contains_key(key)
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.lock().in_flight.contains(key)
    }

    /// Records a value loaded from the backend. Keys with a mutation in
    /// flight keep their prediction; the mutation's own answer settles them.
    pub fn seed(&self, key: K, value: V) -> bool {
        let mut inner = self.lock();
        if inner.in_flight.contains(&key) {
            return false;
        }
        inner.values.insert(key, value);
        true
    }

    /// Applies `predict` to the current value, then runs `remote`.
    ///
    /// `predict` returning `None` means there is nothing to change and no
    /// request is made.
    pub async fn mutate<P, F, Fut>(&self, key: K, predict: P, remote: F) -> MutationOutcome<V>
    where
        P: FnOnce(&V) -> Option<V>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Envelope<V>>,
    {
        self.mutate_observed(key, predict, remote, |_| {}).await
    }

    /// [`mutate`](Self::mutate), also reporting every value the key takes:
    /// the prediction first, then the confirmed or restored value.
    pub async fn mutate_observed<P, F, Fut, O>(
        &self,
        key: K,
        predict: P,
        remote: F,
        observe: O,
    ) -> MutationOutcome<V>
    where
        P: FnOnce(&V) -> Option<V>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Envelope<V>>,
        O: FnMut(&V),
    {
        let (predicted, snapshot) = {
            let mut inner = self.lock();
            if inner.in_flight.contains(&key) {
                debug!("Mutation of {:?} already in flight, ignoring", key);
                return MutationOutcome::Ignored;
            }

            let snapshot = inner.values.get(&key).cloned().unwrap_or_default();
            let Some(predicted) = predict(&snapshot) else {
                return MutationOutcome::Ignored;
            };

            inner.in_flight.insert(key.clone());
            inner.values.insert(key.clone(), predicted.clone());
            inner.last_error = None;
            (predicted, snapshot)
        };
        let mut guard = InFlight {
            store: self,
            key: key.clone(),
            snapshot,
            observe,
            settled: false,
        };
        (guard.observe)(&predicted);

        let result = remote().await.into_result();

        let outcome = {
            let mut inner = self.lock();
            inner.in_flight.remove(&key);
            guard.settled = true;
            match result {
                Ok(Some(authoritative)) => {
                    inner.values.insert(key, authoritative.clone());
                    MutationOutcome::Confirmed(authoritative)
                }
                Ok(None) => MutationOutcome::Confirmed(predicted),
                Err(error) => {
                    warn!("Mutation of {:?} failed, rolling back: {}", key, error);
                    let restored = guard.snapshot.clone();
                    inner.values.insert(key, restored.clone());
                    inner.last_error = Some(error.clone());
                    MutationOutcome::RolledBack { restored, error }
                }
            }
        };
        match &outcome {
            MutationOutcome::Confirmed(v) | MutationOutcome::RolledBack { restored: v, .. } => (guard.observe)(v),
            MutationOutcome::Ignored => {}
        }
        outcome
    }
}
