//! Helpers for testing the stats cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Loads spawn their fetches onto the tokio runtime. Run tests with `#[tokio::test]`, and use
//!    `start_paused = true` together with [`MockBackend::with_delay`] to get deterministic
//!    interleavings without real sleeps.
//!
//!  - A [`MockBackend`] counts fetch *invocations*, not awaited futures. A fetch function that was
//!    handed to a load but dropped because a running fetch was joined does not count.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use gamestats_cache::{FetchError, FetchResult, FetchedStats};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `gamestats_cache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("gamestats_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

#[derive(Debug, Default)]
struct BackendState {
    responses: HashMap<String, FetchResult>,
    calls: HashMap<String, usize>,
}

/// A scriptable stand-in for the remote stats backend.
///
/// Responses are configured per entity id. Entities without a configured response resolve to
/// [`FetchError::NotFound`].
#[derive(Clone, Debug, Default)]
pub struct MockBackend {
    state: Arc<Mutex<BackendState>>,
    total_calls: Arc<AtomicUsize>,
    delay: Duration,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every fetch take `delay` before resolving.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the stats returned for `entity_id`.
    pub fn respond(&self, entity_id: &str, stats: FetchedStats) -> &Self {
        self.set(entity_id, Ok(stats))
    }

    /// Makes fetches for `entity_id` fail with `error`.
    pub fn fail(&self, entity_id: &str, error: FetchError) -> &Self {
        self.set(entity_id, Err(error))
    }

    fn set(&self, entity_id: &str, result: FetchResult) -> &Self {
        let mut state = self.state.lock().unwrap();
        state.responses.insert(entity_id.to_owned(), result);
        self
    }

    /// Returns a fetch function for `entity_id`, as handed to the cache's loaders.
    ///
    /// The invocation is counted when the function is called, the response is looked up when
    /// the returned future resolves.
    pub fn fetcher(
        &self,
        entity_id: &str,
    ) -> impl FnOnce() -> BoxFuture<'static, FetchResult> + Send + 'static + use<> {
        let backend = self.clone();
        let entity_id = entity_id.to_owned();
        move || {
            backend.total_calls.fetch_add(1, Ordering::SeqCst);
            *backend
                .state
                .lock()
                .unwrap()
                .calls
                .entry(entity_id.clone())
                .or_default() += 1;

            async move {
                if !backend.delay.is_zero() {
                    tokio::time::sleep(backend.delay).await;
                }
                let state = backend.state.lock().unwrap();
                state
                    .responses
                    .get(&entity_id)
                    .cloned()
                    .unwrap_or(Err(FetchError::NotFound))
            }
            .boxed()
        }
    }

    /// Total number of fetch invocations.
    pub fn calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    /// Number of fetch invocations for `entity_id`.
    pub fn calls_for(&self, entity_id: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.calls.get(entity_id).copied().unwrap_or_default()
    }
}
