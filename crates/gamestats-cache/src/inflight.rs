use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use rustc_hash::FxHashMap;
use sentry::{Hub, SentryFutureExt};

/// A handle to a running fetch that can be cloned and awaited by any number of callers.
pub type SharedFetch<T> = Shared<BoxFuture<'static, T>>;

/// The outcome of [`InFlight::run_deduped`].
pub enum Deduped<T: Clone> {
    /// No fetch was running for the key, the given fetch was registered and spawned.
    Started(SharedFetch<T>),
    /// A fetch was already running for the key. The given fetch was dropped without being
    /// polled and the running fetch was joined instead.
    Joined(SharedFetch<T>),
}

impl<T: Clone> Deduped<T> {
    pub fn is_joined(&self) -> bool {
        matches!(self, Deduped::Joined(_))
    }

    /// Returns the shared fetch, which resolves identically for every caller attached to it.
    pub fn into_shared(self) -> SharedFetch<T> {
        match self {
            Deduped::Started(fetch) | Deduped::Joined(fetch) => fetch,
        }
    }
}

struct Registration<T: Clone> {
    id: u64,
    fetch: SharedFetch<T>,
}

type PendingMap<K, T> = FxHashMap<K, Registration<T>>;

/// Deduplicates concurrent fetches per key.
///
/// The first caller for a key has its fetch started, every caller arriving while that
/// fetch is still running is handed the same [`SharedFetch`] and observes the same outcome,
/// success or failure. The key stops being pending as soon as the fetch completes, right before
/// the result is handed out, so a failure is never remembered and the next call simply starts a
/// new fetch.
///
/// Fetches are driven by a spawned task: once dispatched they run to completion even if no caller
/// awaits them. There is no cancellation.
///
/// The tracker is generic over its key so that it can dedupe single entries as well as whole
/// batches (see [`BatchKey`](crate::BatchKey)). Lock order: the tracker is locked before the store,
/// never the other way around.
pub struct InFlight<K, T: Clone> {
    /// Tags metrics and logs emitted by this tracker.
    name: &'static str,
    pending: Arc<Mutex<PendingMap<K, T>>>,
    next_id: Arc<AtomicU64>,
}

impl<K, T: Clone> Clone for InFlight<K, T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            pending: Arc::clone(&self.pending),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<K, T: Clone> fmt::Debug for InFlight<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.pending.try_lock().map(|p| p.len()).unwrap_or_default();
        f.debug_struct("InFlight")
            .field("name", &self.name)
            .field("pending", &pending)
            .finish()
    }
}

fn lock<K, T: Clone>(pending: &Mutex<PendingMap<K, T>>) -> MutexGuard<'_, PendingMap<K, T>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, T> InFlight<K, T>
where
    K: Eq + Hash + Clone + fmt::Display + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            pending: Default::default(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Runs `fetch` for `key`, unless a fetch for `key` is already running.
    ///
    /// `fetch` must be lazy: nothing of it may run before it is first polled. It is either
    /// registered and spawned onto the current tokio runtime, so this must be called from within
    /// one, or dropped without ever being polled when a running fetch is joined instead. The
    /// tracker is never locked while `fetch` runs, so it is free to call back into the tracker.
    pub fn run_deduped<Fut>(&self, key: K, fetch: Fut) -> Deduped<T>
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        let pending = lock(&self.pending);
        self.join_or_start(pending, key, fetch)
    }

    /// Like [`run_deduped`](Self::run_deduped), but does nothing and returns `None` if
    /// `satisfied` holds.
    ///
    /// `satisfied` is evaluated while the tracker is locked, so a fetch that finishes in the
    /// meantime is either still registered or has already published its result. It must be cheap
    /// and must not call back into the tracker.
    pub fn run_deduped_unless<S, Fut>(&self, key: K, satisfied: S, fetch: Fut) -> Option<Deduped<T>>
    where
        S: FnOnce(&K) -> bool,
        Fut: Future<Output = T> + Send + 'static,
    {
        let pending = lock(&self.pending);
        if satisfied(&key) {
            drop(pending);
            tracing::trace!("Skipping {} fetch for {}", self.name, key);
            return None;
        }
        Some(self.join_or_start(pending, key, fetch))
    }

    fn join_or_start<Fut>(
        &self,
        mut pending: MutexGuard<'_, PendingMap<K, T>>,
        key: K,
        fetch: Fut,
    ) -> Deduped<T>
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        if let Some(registration) = pending.get(&key) {
            let running = registration.fetch.clone();
            // the unused fetch owns caller state, release it outside the lock
            drop(pending);
            drop(fetch);
            metric!(counter("gamestats.dedup.join") += 1, "mode" => self.name);
            tracing::trace!("Joining running {} fetch for {}", self.name, key);
            return Deduped::Joined(running);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let done_token = PendingToken {
            name: self.name,
            pending: Arc::clone(&self.pending),
            key: key.clone(),
            id,
        };

        tracing::trace!("Starting deduplicated {} fetch for {}", self.name, key);
        let fetch = async move {
            let output = fetch.await;
            drop(done_token);
            output
        }
        .boxed()
        .shared();

        pending.insert(
            key,
            Registration {
                id,
                fetch: fetch.clone(),
            },
        );
        metric!(gauge("gamestats.pending") = pending.len() as u64, "mode" => self.name);
        drop(pending);

        let driver = fetch.clone().map(|_| ());
        tokio::spawn(driver.bind_hub(Hub::new_from_top(Hub::current())));

        Deduped::Started(fetch)
    }

    /// Whether a fetch is currently running for `key`.
    pub fn is_pending(&self, key: &K) -> bool {
        lock(&self.pending).contains_key(key)
    }

    /// The number of fetches currently running.
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unregisters a fetch once it is done, or when it is dropped because its task panicked.
struct PendingToken<K: Eq + Hash, T: Clone> {
    name: &'static str,
    pending: Arc<Mutex<PendingMap<K, T>>>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash, T: Clone> Drop for PendingToken<K, T> {
    fn drop(&mut self) {
        let mut pending = lock(&self.pending);
        // a newer fetch may have registered under the same key in the meantime
        if pending.get(&self.key).is_some_and(|r| r.id == self.id) {
            pending.remove(&self.key);
            metric!(gauge("gamestats.pending") = pending.len() as u64, "mode" => self.name);
        }
    }
}
