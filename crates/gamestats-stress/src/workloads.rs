use std::time::Duration;

use anyhow::{Result, ensure};
use gamestats_cache::{CacheKey, EntityKind, GamesStatsCache, LoadOutcome, LoadRequest};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::backend::{BackendConfig, SyntheticBackend};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

/// Which consumer a workload simulates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum App {
    /// Views scoped to one child at a time.
    Parent,
    /// Dashboards reading the global scope.
    Admin,
}

impl App {
    pub fn as_str(&self) -> &'static str {
        match self {
            App::Parent => "parent",
            App::Admin => "admin",
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub app: App,
    pub concurrency: usize,
    pub kind: EntityKind,
    /// Size of the pool entity ids are drawn from.
    pub entities: usize,
    /// Size of the pool owner ids are drawn from. Only used by the parent app.
    #[serde(default = "default_owners")]
    pub owners: usize,
    /// Loads this many entities per operation through `load_many` instead of `load_one`.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Periodically drops part of the cache while the workload runs.
    #[serde(default, with = "humantime_serde")]
    pub invalidate_every: Option<Duration>,
    #[serde(flatten)]
    pub backend: BackendConfig,
}

fn default_owners() -> usize {
    1
}

/// A workload ready to run, sharing one backend between all its operations.
#[derive(Debug)]
pub struct PreparedWorkload {
    pub app: App,
    pub concurrency: usize,
    pub invalidate_every: Option<Duration>,
    kind: EntityKind,
    entities: usize,
    owners: usize,
    batch_size: Option<usize>,
    pub backend: SyntheticBackend,
}

/// What one operation observed.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpStats {
    pub fresh: usize,
    pub fetched: usize,
    pub joined: usize,
    pub failed: usize,
}

impl std::ops::AddAssign for OpStats {
    fn add_assign(&mut self, rhs: Self) {
        self.fresh += rhs.fresh;
        self.fetched += rhs.fetched;
        self.joined += rhs.joined;
        self.failed += rhs.failed;
    }
}

pub fn prepare_workload(workload: Workload) -> Result<PreparedWorkload> {
    ensure!(workload.concurrency > 0, "concurrency must be positive");
    ensure!(workload.entities > 0, "entity pool must not be empty");
    ensure!(workload.owners > 0, "owner pool must not be empty");
    ensure!(
        workload.batch_size != Some(0),
        "batch size must be positive"
    );
    let backend = SyntheticBackend::new(workload.backend)?;

    Ok(PreparedWorkload {
        app: workload.app,
        concurrency: workload.concurrency,
        invalidate_every: workload.invalidate_every,
        kind: workload.kind,
        entities: workload.entities,
        owners: workload.owners,
        batch_size: workload.batch_size,
        backend,
    })
}

impl PreparedWorkload {
    fn pick_entity(&self, rng: &mut impl Rng) -> String {
        format!("{}-{}", self.kind, rng.random_range(0..self.entities))
    }

    fn pick_owner(&self, rng: &mut impl Rng) -> Option<String> {
        match self.app {
            App::Parent => Some(format!("child-{}", rng.random_range(0..self.owners))),
            App::Admin => None,
        }
    }

    fn pick_keys(&self) -> (Option<String>, Vec<String>) {
        let mut rng = rand::rng();
        let owner = self.pick_owner(&mut rng);
        let count = self.batch_size.unwrap_or(1);
        let ids = (0..count).map(|_| self.pick_entity(&mut rng)).collect();
        (owner, ids)
    }

    /// Runs a single load or batch load against `cache`, then reads back what it loaded.
    pub async fn run_once(&self, cache: &GamesStatsCache) -> OpStats {
        let (owner, ids) = self.pick_keys();
        let owner = owner.as_deref();

        let stats = match self.batch_size {
            None => {
                let id = &ids[0];
                let outcome = cache
                    .load_one(self.kind, id, owner, self.backend.fetcher(self.kind, id))
                    .await;
                let mut stats = OpStats::default();
                match outcome {
                    LoadOutcome::Fresh => stats.fresh += 1,
                    LoadOutcome::Fetched => stats.fetched += 1,
                    LoadOutcome::Joined => stats.joined += 1,
                    LoadOutcome::Failed(_) => stats.failed += 1,
                }
                stats
            }
            Some(_) => {
                let requests = ids
                    .iter()
                    .map(|id| {
                        LoadRequest::new(self.kind, id, owner, self.backend.fetcher(self.kind, id))
                    })
                    .collect();
                let outcome = cache.load_many(requests).await;
                OpStats {
                    fresh: outcome.fresh,
                    fetched: outcome.fetched,
                    joined: usize::from(outcome.joined),
                    failed: outcome.failed,
                }
            }
        };

        // this is what the views do after loading
        for id in &ids {
            if let Some(entry) = cache.get(&CacheKey::build(self.kind, id, owner)) {
                std::hint::black_box(entry.summary().to_string());
            }
        }

        stats
    }

    /// Drops a random part of the cache, the way data changes would.
    pub fn invalidate_some(&self, cache: &GamesStatsCache) -> usize {
        let mut rng = rand::rng();
        match self.pick_owner(&mut rng) {
            Some(owner) => cache.invalidate_owner(&owner),
            None => {
                let id = self.pick_entity(&mut rng);
                cache.invalidate_entity(self.kind, &id)
            }
        }
    }
}
