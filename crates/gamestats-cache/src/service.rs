use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{self, BoxFuture, FutureExt};
use rustc_hash::FxHashSet;

use crate::config::CacheConfig;
use crate::time::Duration;
use crate::{
    CacheKey, Deduped, EntityKind, FetchError, FetchResult, InFlight, StatsEntry, StatsStore,
};

/// What happened to a single [`load_one`](GamesStatsCache::load_one) call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A fresh entry was already cached, nothing was fetched.
    Fresh,
    /// The given fetch function ran and its result was cached.
    Fetched,
    /// A fetch for the same key was already running and was joined successfully.
    Joined,
    /// The fetch, either started or joined, failed. The cache was left untouched.
    Failed(FetchError),
}

/// Summary of a [`load_many`](GamesStatsCache::load_many) call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Number of requests in the batch.
    pub requested: usize,
    /// Requests already fresh in the cache, or turned fresh before their fetch could start.
    pub fresh: usize,
    /// Entities fetched and cached, by this batch or by a running fetch it joined.
    pub fetched: usize,
    /// Entities whose fetch, started or joined, failed.
    pub failed: usize,
    /// Whether an identical running batch was joined instead of starting a new one.
    pub joined: bool,
}

/// The per-entity results of a combined batch fetch, shared by every caller of that batch.
#[derive(Clone, Copy, Debug, Default)]
struct BatchFetched {
    fetched: usize,
    failed: usize,
}

/// Identifies a combined batch fetch: the sorted set of the keys it fetches.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BatchKey(Arc<[CacheKey]>);

impl BatchKey {
    pub fn new<I: IntoIterator<Item = CacheKey>>(keys: I) -> Self {
        let mut keys: Vec<_> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();
        Self(keys.into())
    }

    pub fn keys(&self) -> &[CacheKey] {
        &self.0
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, key) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}")?;
        }
        f.write_str("]")
    }
}

type FetchFn = Box<dyn FnOnce() -> BoxFuture<'static, FetchResult> + Send>;

/// One entity to load as part of a [`load_many`](GamesStatsCache::load_many) batch.
pub struct LoadRequest {
    key: CacheKey,
    fetch_fn: FetchFn,
}

impl LoadRequest {
    pub fn new<F, Fut>(kind: EntityKind, entity_id: &str, owner: Option<&str>, fetch_fn: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        Self {
            key: CacheKey::build(kind, entity_id, owner),
            fetch_fn: Box::new(move || fetch_fn().boxed()),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl fmt::Debug for LoadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadRequest").field("key", &self.key).finish()
    }
}

/// A running load.
///
/// The cache is populated as a side effect of the load, awaiting the handle is only needed to
/// find out when and how it settled. Dropping the handle does not cancel the fetch.
pub struct Loading<T> {
    inner: BoxFuture<'static, T>,
}

impl<T> Loading<T> {
    fn new<F: Future<Output = T> + Send + 'static>(future: F) -> Self {
        Self {
            inner: future.boxed(),
        }
    }
}

impl<T> Future for Loading<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        self.inner.as_mut().poll(cx)
    }
}

impl<T> fmt::Debug for Loading<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loading").finish_non_exhaustive()
    }
}

/// A domain-level reason to drop cached stats.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Invalidation {
    /// A single entry is no longer valid.
    Entry(CacheKey),
    /// Something about an owner changed (for example a child's progress), drop everything scoped
    /// to them.
    OwnerChanged(String),
    /// The games assigned to an entity changed, drop its stats in every scope.
    EntityChanged {
        kind: EntityKind,
        entity_id: String,
    },
    /// Drop everything.
    Everything,
}

impl Invalidation {
    fn metrics_tag(&self) -> &'static str {
        match self {
            Invalidation::Entry(_) => "key",
            Invalidation::OwnerChanged(_) => "owner",
            Invalidation::EntityChanged { .. } => "entity",
            Invalidation::Everything => "all",
        }
    }
}

/// The game statistics cache shared by all consumers of a process.
///
/// Construct one instance per process and hand out clones: all clones share the same store and
/// the same in-flight bookkeeping.
///
/// Reads are synchronous and never fetch. Loads check the store, join or start a deduplicated
/// fetch, and write successful results back. Loads must be started from within a tokio runtime.
#[derive(Clone)]
pub struct GamesStatsCache {
    store: Arc<StatsStore>,
    single: InFlight<CacheKey, FetchResult>,
    batches: InFlight<BatchKey, BatchFetched>,
}

impl fmt::Debug for GamesStatsCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GamesStatsCache")
            .field("ttl", &self.store.ttl())
            .field("entries", &self.store.len())
            .field("running fetches", &self.single.len())
            .field("running batches", &self.batches.len())
            .finish()
    }
}

impl Default for GamesStatsCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

impl GamesStatsCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_ttl(config.ttl)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            store: Arc::new(StatsStore::new(ttl)),
            single: InFlight::new("single"),
            batches: InFlight::new("batch"),
        }
    }

    /// The underlying store, for direct synchronous access.
    pub fn store(&self) -> &StatsStore {
        &self.store
    }

    /// Returns the cached stats for an entity, or `None` if there are none or they are stale.
    pub fn get_stats_for_entity(
        &self,
        kind: EntityKind,
        entity_id: &str,
        owner: Option<&str>,
    ) -> Option<StatsEntry> {
        self.get(&CacheKey::build(kind, entity_id, owner))
    }

    /// Returns the cached stats for `key`, or `None` if there are none or they are stale.
    pub fn get(&self, key: &CacheKey) -> Option<StatsEntry> {
        metric!(counter("gamestats.access") += 1);
        let entry = self.store.get(key);
        if entry.is_some() {
            metric!(counter("gamestats.memory.hit") += 1);
        }
        entry
    }

    /// Loads stats for one entity, unless fresh stats are already cached.
    ///
    /// If a fetch for the same entity is already running, started by another load or by a
    /// batch, it is joined and `fetch_fn` is dropped without being invoked. Otherwise `fetch_fn`
    /// is invoked from a spawned task, never while the cache's bookkeeping is locked, so it may
    /// freely use the cache itself.
    ///
    /// A successful result is written to the cache. A failure leaves the cache untouched, it is
    /// reported through the returned handle and otherwise only logged.
    pub fn load_one<F, Fut>(
        &self,
        kind: EntityKind,
        entity_id: &str,
        owner: Option<&str>,
        fetch_fn: F,
    ) -> Loading<LoadOutcome>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        self.load_key(CacheKey::build(kind, entity_id, owner), fetch_fn)
    }

    /// Same as [`load_one`](Self::load_one), for an already built key.
    pub fn load_key<F, Fut>(&self, key: CacheKey, fetch_fn: F) -> Loading<LoadOutcome>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        if self.store.is_fresh(&key) {
            tracing::trace!("Fresh stats cached for {}", key);
            return Loading::new(future::ready(LoadOutcome::Fresh));
        }

        let Some(deduped) = self.start_fetch(key, fetch_fn, "single") else {
            return Loading::new(future::ready(LoadOutcome::Fresh));
        };

        let joined = deduped.is_joined();
        let fetch = deduped.into_shared();
        Loading::new(async move {
            match fetch.await {
                Ok(_) if joined => LoadOutcome::Joined,
                Ok(_) => LoadOutcome::Fetched,
                Err(err) => LoadOutcome::Failed(err),
            }
        })
    }

    /// Joins the running fetch for `key`, or registers a new one that invokes `fetch_fn` and
    /// writes its result.
    ///
    /// Returns `None` if `key` turned fresh since the caller looked. The check is repeated under
    /// the tracker lock, so a fetch that completed in between is not started again.
    fn start_fetch<F, Fut>(
        &self,
        key: CacheKey,
        fetch_fn: F,
        mode: &'static str,
    ) -> Option<Deduped<FetchResult>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        // taken before registering, so a later `set` always wins over this fetch
        let sequence = self.store.next_sequence();
        let store = Arc::clone(&self.store);
        let fetch_key = key.clone();
        let fetch = async move {
            metric!(counter("gamestats.fetch") += 1, "mode" => mode);
            tracing::debug!("Fetching stats for {}", fetch_key);
            let result = fetch_fn().await;
            match &result {
                Ok(stats) => write_result(&store, fetch_key, sequence, stats.clone()),
                Err(err) => {
                    metric!(
                        counter("gamestats.fetch.error") += 1,
                        "mode" => mode,
                        "error" => err.kind(),
                    );
                    tracing::warn!(
                        error = err as &dyn std::error::Error,
                        key = %fetch_key,
                        mode,
                        "Failed to fetch stats",
                    );
                }
            }
            result
        };

        self.single
            .run_deduped_unless(key, |key| self.store.is_fresh(key), fetch)
    }

    /// Loads stats for many entities in one coordinated batch.
    ///
    /// Requests are partitioned against a single snapshot of the cache: fresh entities are
    /// skipped, all the others are fetched concurrently. Each result is written as soon as it
    /// arrives, and one failing entity does not keep the others from being cached. Duplicate
    /// keys within the batch are fetched once, using the first request's fetch function.
    ///
    /// Every entity goes through the same per-key deduplication as [`load_one`](Self::load_one):
    /// an entity that is already being fetched is joined instead of fetched again, and a
    /// `load_one` for an entity of a running batch joins the batch's fetch. Fetch functions are
    /// invoked from spawned tasks, never while the cache's bookkeeping is locked.
    ///
    /// On top of that, the batch is deduplicated as a whole: a batch for exactly the same keys as
    /// a running batch joins it and reports [`BatchOutcome::joined`].
    pub fn load_many(&self, requests: Vec<LoadRequest>) -> Loading<BatchOutcome> {
        let requested = requests.len();
        if requested == 0 {
            return Loading::new(future::ready(BatchOutcome::default()));
        }

        let fresh_flags = self.store.partition(requests.iter().map(LoadRequest::key));

        let mut fresh = 0;
        let mut seen = FxHashSet::default();
        let mut to_fetch = Vec::new();
        for (request, is_fresh) in requests.into_iter().zip(fresh_flags) {
            if is_fresh {
                fresh += 1;
            } else if seen.insert(request.key.clone()) {
                to_fetch.push(request);
            }
        }

        if to_fetch.is_empty() {
            tracing::trace!("All {} requested stats are fresh", requested);
            return Loading::new(future::ready(BatchOutcome {
                requested,
                fresh,
                ..Default::default()
            }));
        }

        let batch_key = BatchKey::new(to_fetch.iter().map(|request| request.key.clone()));
        tracing::debug!("Loading stats for a batch of {} entities", to_fetch.len());

        // register every entity right away, so that concurrent loads find them pending
        let mut members = Vec::with_capacity(to_fetch.len());
        for LoadRequest { key, fetch_fn } in to_fetch {
            match self.start_fetch(key, fetch_fn, "batch") {
                Some(deduped) => members.push(deduped.into_shared()),
                None => fresh += 1,
            }
        }

        let combined = async move {
            let results = future::join_all(members).await;
            let fetched = results.iter().filter(|result| result.is_ok()).count();
            BatchFetched {
                fetched,
                failed: results.len() - fetched,
            }
        };
        let deduped = self.batches.run_deduped(batch_key, combined);

        let joined = deduped.is_joined();
        let fetch = deduped.into_shared();
        Loading::new(async move {
            let BatchFetched { fetched, failed } = fetch.await;
            BatchOutcome {
                requested,
                fresh,
                fetched,
                failed,
                joined,
            }
        })
    }

    /// Drops cached stats. Returns the number of removed entries.
    ///
    /// Fetches that are already running are not affected and will still write their results.
    pub fn invalidate(&self, invalidation: Invalidation) -> usize {
        metric!(counter("gamestats.invalidate") += 1, "scope" => invalidation.metrics_tag());
        let removed = match &invalidation {
            Invalidation::Entry(key) => usize::from(self.store.delete(key)),
            Invalidation::OwnerChanged(owner) => self.store.delete_by_owner(owner),
            Invalidation::EntityChanged { kind, entity_id } => {
                self.store.delete_by_entity(*kind, entity_id)
            }
            Invalidation::Everything => self.store.clear(),
        };
        tracing::debug!(?invalidation, removed, "Invalidated stats");
        metric!(gauge("gamestats.entries") = self.store.len() as u64);
        removed
    }

    /// Drops the cached stats for one entity within one scope.
    pub fn invalidate_entry(&self, kind: EntityKind, entity_id: &str, owner: Option<&str>) -> bool {
        let key = CacheKey::build(kind, entity_id, owner);
        self.invalidate(Invalidation::Entry(key)) > 0
    }

    /// Drops all cached stats scoped to `owner`.
    pub fn invalidate_owner(&self, owner: &str) -> usize {
        self.invalidate(Invalidation::OwnerChanged(owner.to_owned()))
    }

    /// Drops the cached stats for an entity in every scope.
    pub fn invalidate_entity(&self, kind: EntityKind, entity_id: &str) -> usize {
        self.invalidate(Invalidation::EntityChanged {
            kind,
            entity_id: entity_id.to_owned(),
        })
    }

    /// Drops all cached stats.
    pub fn clear_cache(&self) -> usize {
        self.invalidate(Invalidation::Everything)
    }

    /// The number of entries held, including stale ones.
    pub fn entry_count(&self) -> usize {
        self.store.len()
    }

    /// The number of entities currently being fetched, by single loads and batches alike.
    pub fn pending_count(&self) -> usize {
        self.single.len()
    }

    /// Whether a fetch is running for `key`, started either by a single load or by a batch.
    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.single.is_pending(key)
    }
}

fn write_result(store: &StatsStore, key: CacheKey, sequence: u64, stats: crate::FetchedStats) {
    if !store.write(key, sequence, stats) {
        metric!(counter("gamestats.write.discarded") += 1);
    }
    metric!(gauge("gamestats.entries") = store.len() as u64);
}
