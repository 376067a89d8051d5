//! # Game statistics cache
//!
//! Listing views in both the parent app and the admin app show, per subject or category, how many
//! games of each type exist. Those counts are aggregated by remote queries, which are slow and
//! frequently requested by many views at once. This crate holds the results in memory for a while,
//! and makes sure that concurrent consumers asking for the same counts share a single query.
//!
//! ## Layers
//!
//! - [`CacheKey`]: a stable, collision-free key built from an [`EntityKind`], an entity id and an
//!   optional owner (for example a specific child the stats are scoped to).
//! - [`StatsStore`]: the synchronous key → [`StatsEntry`] map. Freshness is a read-time judgment
//!   against the configured TTL, stale entries are never swept but simply superseded.
//! - [`InFlight`]: request coalescing. A fetch that is already running for a key (or for an
//!   identical batch of keys) is joined instead of being issued a second time. Single loads and
//!   batch members share one per-key tracker.
//! - [`GamesStatsCache`]: the facade consumers talk to. It exposes synchronous reads,
//!   [`load_one`](GamesStatsCache::load_one) / [`load_many`](GamesStatsCache::load_many) to
//!   populate the cache, and the invalidation API.
//!
//! Reading never triggers a fetch. Consumers load at well-defined points (when a view is mounted,
//! when its parameters change) and read separately.
//!
//! ## Fetch results
//!
//! The cache does not know how stats are produced. Every load is given a fetch function returning
//! a future of `Result<`[`FetchedStats`]`, `[`FetchError`]`>`. A failed fetch never writes to the
//! store and is not cached negatively, the next load simply tries again.
//!
//! ## Metrics
//!
//! All metrics are emitted through the [`metric!`] macro and are a no-op unless
//! [`metrics::configure_statsd`] was called:
//!
//! - `gamestats.access`: All reads.
//! - `gamestats.memory.hit`: Reads served by a fresh entry.
//! - `gamestats.fetch`: Fetch functions actually invoked, tagged with `mode`.
//! - `gamestats.fetch.error`: Failed fetches, tagged with `mode`.
//! - `gamestats.dedup.join`: Loads that attached to an already running fetch, tagged with `mode`.
//! - `gamestats.write.discarded`: Fetch results dropped because a newer fetch already wrote.
//! - `gamestats.invalidate`: Invalidations, tagged with `scope`.
//! - `gamestats.entries`: Gauge of the entries held, stale ones included.
//! - `gamestats.pending`: Gauge of the running fetches, tagged with `mode`.

#[macro_use]
pub mod metrics;

pub mod config;

mod entry;
mod error;
mod format;
mod inflight;
mod key;
mod service;
mod store;

pub use entry::*;
pub use error::*;
pub use format::*;
pub use inflight::*;
pub use key::*;
pub use service::*;
pub use store::*;

// Unit tests drive TTL expiry with tokio's pausable clock.
#[cfg(test)]
pub(crate) use tokio::time;

#[cfg(not(test))]
pub(crate) use std::time;
