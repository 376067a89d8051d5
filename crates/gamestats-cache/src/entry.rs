use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::FetchError;
use crate::time::{Duration, Instant};

/// Stats as returned by a fetch function.
///
/// This is the strict shape backend answers are validated into before they reach the cache.
/// `total` is trusted as given and is not checked against the sum of the per-category counts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedStats {
    /// Number of games per category label (for example `"qcm"` or `"memory"`).
    #[serde(default)]
    pub counts_by_category: BTreeMap<String, u64>,
    /// Total number of games.
    pub total: u64,
}

impl FetchedStats {
    pub fn new(counts_by_category: BTreeMap<String, u64>, total: u64) -> Self {
        Self {
            counts_by_category,
            total,
        }
    }

    /// Creates stats from per-category counts, with `total` being their sum.
    pub fn from_counts<L, I>(counts: I) -> Self
    where
        L: Into<String>,
        I: IntoIterator<Item = (L, u64)>,
    {
        let mut counts_by_category = BTreeMap::new();
        for (label, count) in counts {
            *counts_by_category.entry(label.into()).or_default() += count;
        }
        let total = counts_by_category.values().sum();
        Self {
            counts_by_category,
            total,
        }
    }

    /// Parses a JSON backend answer of the form `{"countsByCategory": {..}, "total": n}`.
    ///
    /// Negative or non-integer counts and a missing `total` are rejected as
    /// [`FetchError::Malformed`].
    pub fn from_json(bytes: &[u8]) -> Result<Self, FetchError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A cached aggregate, as stored per [`CacheKey`](crate::CacheKey).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsEntry {
    /// Number of games per category label.
    pub counts_by_category: BTreeMap<String, u64>,
    /// Total number of games.
    pub total: u64,
    /// When this entry was written.
    pub timestamp: Instant,
}

impl StatsEntry {
    pub(crate) fn from_fetched(stats: FetchedStats, timestamp: Instant) -> Self {
        let FetchedStats {
            counts_by_category,
            total,
        } = stats;
        Self {
            counts_by_category,
            total,
            timestamp,
        }
    }

    /// How long ago this entry was written.
    pub fn age(&self) -> Duration {
        self.timestamp.elapsed()
    }

    /// An entry is fresh while it is younger than `ttl`.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}
