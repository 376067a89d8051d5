use std::time::Duration;

use gamestats_cache::{CacheKey, EntityKind, FetchedStats, GamesStatsCache, LoadOutcome};
use gamestats_test::MockBackend;

fn seed(cache: &GamesStatsCache, kind: EntityKind, id: &str, owner: Option<&str>) {
    let key = CacheKey::build(kind, id, owner);
    cache
        .store()
        .set(key, [("qcm".to_owned(), 1)].into_iter().collect(), 1);
}

#[test]
fn test_invalidate_owner_is_scoped() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    seed(&cache, EntityKind::Subject, "S1", Some("child-1"));
    seed(&cache, EntityKind::Category, "C1", Some("child-1"));
    seed(&cache, EntityKind::Subject, "S1", Some("child-2"));
    seed(&cache, EntityKind::Subject, "S1", None);

    assert_eq!(cache.invalidate_owner("child-1"), 2);

    assert!(cache
        .get_stats_for_entity(EntityKind::Subject, "S1", Some("child-1"))
        .is_none());
    assert!(cache
        .get_stats_for_entity(EntityKind::Category, "C1", Some("child-1"))
        .is_none());
    assert!(cache
        .get_stats_for_entity(EntityKind::Subject, "S1", Some("child-2"))
        .is_some());
    assert!(cache
        .get_stats_for_entity(EntityKind::Subject, "S1", None)
        .is_some());
}

#[test]
fn test_owner_prefixes_do_not_match() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    seed(&cache, EntityKind::Subject, "S1", Some("child-1"));
    seed(&cache, EntityKind::Subject, "S1", Some("child-10"));
    seed(&cache, EntityKind::Subject, "S1", Some("child-1/x"));

    assert_eq!(cache.invalidate_owner("child-1"), 1);
    assert_eq!(cache.entry_count(), 2);
}

#[test]
fn test_invalidate_entity_across_owners() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    seed(&cache, EntityKind::Subject, "S1", Some("child-1"));
    seed(&cache, EntityKind::Subject, "S1", Some("child-2"));
    seed(&cache, EntityKind::Subject, "S1", None);
    seed(&cache, EntityKind::Category, "S1", None);
    seed(&cache, EntityKind::Subject, "S2", None);

    assert_eq!(cache.invalidate_entity(EntityKind::Subject, "S1"), 3);
    assert_eq!(cache.entry_count(), 2);
    assert!(cache
        .get_stats_for_entity(EntityKind::Category, "S1", None)
        .is_some());
}

#[test]
fn test_invalidate_single_entry() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    seed(&cache, EntityKind::Subject, "S1", Some("child-1"));
    seed(&cache, EntityKind::Subject, "S1", None);

    assert!(cache.invalidate_entry(EntityKind::Subject, "S1", Some("child-1")));
    assert!(!cache.invalidate_entry(EntityKind::Subject, "S1", Some("child-1")));
    assert_eq!(cache.entry_count(), 1);
}

#[test]
fn test_clear_is_idempotent() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    seed(&cache, EntityKind::Subject, "S1", Some("child-1"));
    seed(&cache, EntityKind::Category, "C1", None);

    assert_eq!(cache.clear_cache(), 2);
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(cache.clear_cache(), 0);
    assert_eq!(cache.entry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_forces_refetch() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    let backend = MockBackend::new();
    backend.respond("S1", FetchedStats::from_counts([("qcm", 1)]));

    let load = || cache.load_one(EntityKind::Subject, "S1", Some("child-1"), backend.fetcher("S1"));
    assert_eq!(load().await, LoadOutcome::Fetched);
    assert_eq!(load().await, LoadOutcome::Fresh);

    cache.invalidate_owner("child-1");
    backend.respond("S1", FetchedStats::from_counts([("qcm", 1), ("memory", 1)]));
    assert_eq!(load().await, LoadOutcome::Fetched);
    assert_eq!(backend.calls(), 2);

    let entry = cache
        .get_stats_for_entity(EntityKind::Subject, "S1", Some("child-1"))
        .unwrap();
    assert_eq!(entry.total, 2);
}

#[tokio::test(start_paused = true)]
async fn test_running_fetch_survives_invalidation() {
    gamestats_test::setup();

    let cache = GamesStatsCache::default();
    let backend = MockBackend::new().with_delay(Duration::from_millis(50));
    backend.respond("S1", FetchedStats::from_counts([("qcm", 1)]));

    let load = cache.load_one(EntityKind::Subject, "S1", None, backend.fetcher("S1"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(cache.clear_cache(), 0);

    assert_eq!(load.await, LoadOutcome::Fetched);
    assert_eq!(cache.entry_count(), 1);
}
