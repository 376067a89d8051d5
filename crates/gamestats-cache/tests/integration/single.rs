use std::time::Duration;

use gamestats_cache::{
    CacheKey, EntityKind, FetchError, FetchedStats, GamesStatsCache, LoadOutcome,
};
use gamestats_test::MockBackend;

#[tokio::test(start_paused = true)]
async fn test_concurrent_loads_share_one_fetch() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    let first = MockBackend::new().with_delay(Duration::from_millis(50));
    first.respond("S1", FetchedStats::from_counts([("qcm", 2), ("memory", 1)]));
    let second = MockBackend::new();
    second.respond("S1", FetchedStats::from_counts([("qcm", 99)]));

    let a = cache.load_one(EntityKind::Subject, "S1", Some("child-1"), first.fetcher("S1"));
    let b = cache.load_one(EntityKind::Subject, "S1", Some("child-1"), second.fetcher("S1"));
    assert!(cache.is_pending(&CacheKey::build(EntityKind::Subject, "S1", Some("child-1"))));

    let (a, b) = futures::join!(a, b);
    assert_eq!(a, LoadOutcome::Fetched);
    assert_eq!(b, LoadOutcome::Joined);
    assert_eq!(first.calls(), 1);
    assert_eq!(second.calls(), 0);
    assert_eq!(cache.pending_count(), 0);

    let entry = cache
        .get_stats_for_entity(EntityKind::Subject, "S1", Some("child-1"))
        .unwrap();
    assert_eq!(entry.total, 3);
    assert_eq!(entry.counts_by_category["qcm"], 2);
}

#[tokio::test(start_paused = true)]
async fn test_joined_callers_observe_the_same_failure() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    let backend = MockBackend::new().with_delay(Duration::from_millis(20));
    backend.fail("S1", FetchError::Backend("connection reset".into()));

    let a = cache.load_one(EntityKind::Subject, "S1", None, backend.fetcher("S1"));
    let b = cache.load_one(EntityKind::Subject, "S1", None, backend.fetcher("S1"));
    let (a, b) = futures::join!(a, b);

    let expected = LoadOutcome::Failed(FetchError::Backend("connection reset".into()));
    assert_eq!(a, expected);
    assert_eq!(b, expected);
    assert_eq!(backend.calls(), 1);
    assert_eq!(cache.get_stats_for_entity(EntityKind::Subject, "S1", None), None);
    assert_eq!(cache.entry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_not_cached() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    let backend = MockBackend::new();
    backend.fail("S1", FetchError::Timeout(Duration::from_secs(5)));

    let outcome = cache
        .load_one(EntityKind::Subject, "S1", None, backend.fetcher("S1"))
        .await;
    assert!(matches!(outcome, LoadOutcome::Failed(FetchError::Timeout(_))));

    // the next load retries right away
    backend.respond("S1", FetchedStats::from_counts([("memory", 4)]));
    let outcome = cache
        .load_one(EntityKind::Subject, "S1", None, backend.fetcher("S1"))
        .await;
    assert_eq!(outcome, LoadOutcome::Fetched);
    assert_eq!(backend.calls(), 2);
    assert_eq!(
        cache
            .get_stats_for_entity(EntityKind::Subject, "S1", None)
            .unwrap()
            .total,
        4
    );
}

#[tokio::test(start_paused = true)]
async fn test_fresh_entry_skips_fetch() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    let key = CacheKey::build(EntityKind::Category, "C1", None);
    cache
        .store()
        .set(key.clone(), [("qcm".to_owned(), 3)].into_iter().collect(), 3);

    // a fresh entry means no fetch at all
    let backend = MockBackend::new();
    backend.fail("C1", FetchError::NotFound);
    let outcome = cache.load_key(key.clone(), backend.fetcher("C1")).await;
    assert_eq!(outcome, LoadOutcome::Fresh);
    assert_eq!(backend.calls(), 0);
    assert_eq!(cache.get(&key).unwrap().total, 3);
}

#[tokio::test(start_paused = true)]
async fn test_fire_and_forget() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    let backend = MockBackend::new().with_delay(Duration::from_millis(30));
    backend.respond("S1", FetchedStats::from_counts([("qcm", 1)]));

    // the handle is dropped right away, the fetch still runs to completion
    drop(cache.load_one(EntityKind::Subject, "S1", None, backend.fetcher("S1")));
    assert_eq!(cache.get_stats_for_entity(EntityKind::Subject, "S1", None), None);

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(backend.calls(), 1);
    assert!(cache
        .get_stats_for_entity(EntityKind::Subject, "S1", None)
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn test_owners_do_not_share_fetches() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    let backend = MockBackend::new().with_delay(Duration::from_millis(10));
    backend.respond("S1", FetchedStats::from_counts([("qcm", 1)]));

    let a = cache.load_one(EntityKind::Subject, "S1", Some("child-1"), backend.fetcher("S1"));
    let b = cache.load_one(EntityKind::Subject, "S1", Some("child-2"), backend.fetcher("S1"));
    let c = cache.load_one(EntityKind::Subject, "S1", None, backend.fetcher("S1"));
    let outcomes = futures::join!(a, b, c);

    assert_eq!(
        outcomes,
        (LoadOutcome::Fetched, LoadOutcome::Fetched, LoadOutcome::Fetched)
    );
    assert_eq!(backend.calls(), 3);
    assert_eq!(cache.entry_count(), 3);
}
