use std::time::Duration;

use gamestats_cache::{
    BatchOutcome, CacheKey, EntityKind, FetchError, FetchedStats, GamesStatsCache, LoadOutcome,
    LoadRequest,
};
use gamestats_test::MockBackend;

fn requests(backend: &MockBackend, ids: &[&str], owner: Option<&str>) -> Vec<LoadRequest> {
    ids.iter()
        .map(|id| LoadRequest::new(EntityKind::Subject, id, owner, backend.fetcher(id)))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_only_stale_entities_are_fetched() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    let backend = MockBackend::new();
    for id in ["A", "B", "C", "D", "E"] {
        backend.respond(id, FetchedStats::from_counts([("qcm", 1)]));
    }
    for id in ["A", "C"] {
        let key = CacheKey::build(EntityKind::Subject, id, Some("child-1"));
        cache.store().set(key, Default::default(), 0);
    }

    let outcome = cache
        .load_many(requests(&backend, &["A", "B", "C", "D", "E"], Some("child-1")))
        .await;

    assert_eq!(
        outcome,
        BatchOutcome {
            requested: 5,
            fresh: 2,
            fetched: 3,
            failed: 0,
            joined: false,
        }
    );
    assert_eq!(backend.calls(), 3);
    assert_eq!(backend.calls_for("A"), 0);
    assert_eq!(backend.calls_for("C"), 0);
    for id in ["B", "D", "E"] {
        let entry = cache
            .get_stats_for_entity(EntityKind::Subject, id, Some("child-1"))
            .unwrap();
        assert_eq!(entry.total, 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_partial_failure_is_isolated() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    let backend = MockBackend::new().with_delay(Duration::from_millis(10));
    backend
        .respond("A", FetchedStats::from_counts([("qcm", 1)]))
        .fail("B", FetchError::PermissionDenied("row level security".into()))
        .respond("C", FetchedStats::from_counts([("memory", 2)]));

    let outcome = cache.load_many(requests(&backend, &["A", "B", "C"], None)).await;
    assert_eq!(outcome.fetched, 2);
    assert_eq!(outcome.failed, 1);

    let a = cache.get_stats_for_entity(EntityKind::Subject, "A", None).unwrap();
    assert_eq!(a.total, 1);
    assert_eq!(cache.get_stats_for_entity(EntityKind::Subject, "B", None), None);
    let c = cache.get_stats_for_entity(EntityKind::Subject, "C", None).unwrap();
    assert_eq!(c.total, 2);
}

#[tokio::test(start_paused = true)]
async fn test_identical_batches_share_one_fetch() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    let first = MockBackend::new().with_delay(Duration::from_millis(50));
    let second = MockBackend::new();
    for id in ["A", "B"] {
        first.respond(id, FetchedStats::from_counts([("qcm", 1)]));
        second.respond(id, FetchedStats::from_counts([("qcm", 2)]));
    }

    let a = cache.load_many(requests(&first, &["A", "B"], None));
    // same keys, different order
    let b = cache.load_many(requests(&second, &["B", "A"], None));
    let (a, b) = futures::join!(a, b);

    assert!(!a.joined);
    assert!(b.joined);
    assert_eq!(a.fetched, 2);
    assert_eq!(b.fetched, 2);
    assert_eq!(first.calls(), 2);
    assert_eq!(second.calls(), 0);
    assert_eq!(cache.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_batches_share_common_entities() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    let backend = MockBackend::new().with_delay(Duration::from_millis(50));
    for id in ["A", "B", "C"] {
        backend.respond(id, FetchedStats::from_counts([("qcm", 1)]));
    }

    let a = cache.load_many(requests(&backend, &["A", "B"], None));
    let b = cache.load_many(requests(&backend, &["B", "C"], None));
    let (a, b) = futures::join!(a, b);

    // different batches, but B is fetched only once
    assert!(!a.joined && !b.joined);
    assert_eq!((a.fetched, b.fetched), (2, 2));
    assert_eq!(backend.calls_for("A"), 1);
    assert_eq!(backend.calls_for("B"), 1);
    assert_eq!(backend.calls_for("C"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_single_load_joins_batch_member() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    let batch_backend = MockBackend::new().with_delay(Duration::from_millis(50));
    batch_backend.respond("S1", FetchedStats::from_counts([("qcm", 1)]));
    let single_backend = MockBackend::new().with_delay(Duration::from_millis(50));
    single_backend.respond("S1", FetchedStats::from_counts([("qcm", 2)]));

    let batch = cache.load_many(requests(&batch_backend, &["S1"], None));
    assert!(cache.is_pending(&CacheKey::build(EntityKind::Subject, "S1", None)));
    let single = cache.load_one(EntityKind::Subject, "S1", None, single_backend.fetcher("S1"));
    let (batch, single) = futures::join!(batch, single);

    assert_eq!(batch.fetched, 1);
    assert_eq!(single, LoadOutcome::Joined);
    assert_eq!(batch_backend.calls() + single_backend.calls(), 1);
    let entry = cache.get_stats_for_entity(EntityKind::Subject, "S1", None).unwrap();
    assert_eq!(entry.total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_batch_joins_running_single_load() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    let single_backend = MockBackend::new().with_delay(Duration::from_millis(50));
    single_backend
        .respond("S1", FetchedStats::from_counts([("qcm", 1)]))
        .respond("S2", FetchedStats::from_counts([("qcm", 1)]));
    let batch_backend = MockBackend::new().with_delay(Duration::from_millis(10));
    batch_backend
        .respond("S1", FetchedStats::from_counts([("qcm", 2)]))
        .respond("S2", FetchedStats::from_counts([("qcm", 2)]));

    let single = cache.load_one(EntityKind::Subject, "S1", None, single_backend.fetcher("S1"));
    let batch = cache.load_many(requests(&batch_backend, &["S1", "S2"], None));
    let (single, batch) = futures::join!(single, batch);

    assert_eq!(single, LoadOutcome::Fetched);
    assert_eq!(batch.fetched, 2);
    assert_eq!(batch_backend.calls_for("S1"), 0);
    assert_eq!(batch_backend.calls_for("S2"), 1);
    let s1 = cache.get_stats_for_entity(EntityKind::Subject, "S1", None).unwrap();
    assert_eq!(s1.total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_batch_is_a_noop() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    let outcome = cache.load_many(Vec::new()).await;
    assert_eq!(outcome, BatchOutcome::default());
    assert_eq!(cache.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_batch_results_are_written_as_they_arrive() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    let fast = MockBackend::new().with_delay(Duration::from_millis(10));
    fast.respond("A", FetchedStats::from_counts([("qcm", 1)]));
    let slow = MockBackend::new().with_delay(Duration::from_millis(100));
    slow.respond("B", FetchedStats::from_counts([("qcm", 1)]));

    let batch = cache.load_many(vec![
        LoadRequest::new(EntityKind::Subject, "A", None, fast.fetcher("A")),
        LoadRequest::new(EntityKind::Subject, "B", None, slow.fetcher("B")),
    ]);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(cache.get_stats_for_entity(EntityKind::Subject, "A", None).is_some());
    assert!(cache.get_stats_for_entity(EntityKind::Subject, "B", None).is_none());

    let outcome = batch.await;
    assert_eq!(outcome.fetched, 2);
    assert!(cache.get_stats_for_entity(EntityKind::Subject, "B", None).is_some());
}
