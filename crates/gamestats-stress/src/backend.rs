use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, ensure};
use futures::future::{BoxFuture, FutureExt};
use gamestats_cache::{EntityKind, FetchError, FetchResult, FetchedStats};
use rand::Rng;
use serde::{Deserialize, Serialize};

const CATEGORIES: &[&str] = &["qcm", "memory", "puzzle", "quiz", "matching"];

/// How the synthetic backend behaves.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct BackendConfig {
    /// How long every fetch takes.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Probability of a fetch failing, between `0` and `1`.
    #[serde(default)]
    pub failure_rate: f64,
}

/// Stands in for the remote aggregation queries.
///
/// Answers are produced as JSON and go through the same validation as real backend answers.
#[derive(Clone, Debug)]
pub struct SyntheticBackend {
    config: BackendConfig,
    fetches: Arc<AtomicUsize>,
}

impl SyntheticBackend {
    pub fn new(config: BackendConfig) -> Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&config.failure_rate),
            "failure_rate must be between 0 and 1, got {}",
            config.failure_rate
        );
        Ok(Self {
            config,
            fetches: Default::default(),
        })
    }

    /// Number of fetches actually issued.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn fetcher(
        &self,
        kind: EntityKind,
        entity_id: &str,
    ) -> impl FnOnce() -> BoxFuture<'static, FetchResult> + Send + 'static + use<> {
        let backend = self.clone();
        let entity_id = entity_id.to_owned();
        move || {
            backend.fetches.fetch_add(1, Ordering::Relaxed);

            let mut rng = rand::rng();
            let failure = rng
                .random_bool(backend.config.failure_rate)
                .then(|| FetchError::Backend(format!("synthetic failure for {kind} {entity_id}")));
            let payload = render_payload(&mut rng);
            let latency = backend.config.latency;

            async move {
                tokio::time::sleep(latency).await;
                match failure {
                    Some(err) => Err(err),
                    None => FetchedStats::from_json(&payload),
                }
            }
            .boxed()
        }
    }
}

fn render_payload(rng: &mut impl Rng) -> Vec<u8> {
    let counts: serde_json::Map<String, serde_json::Value> = CATEGORIES
        .iter()
        .filter_map(|category| {
            let count: u64 = rng.random_range(1..20);
            rng.random_bool(0.7)
                .then(|| (category.to_string(), count.into()))
        })
        .collect();
    let total: u64 = counts.values().filter_map(|count| count.as_u64()).sum();

    serde_json::json!({
        "countsByCategory": counts,
        "total": total,
    })
    .to_string()
    .into_bytes()
}
