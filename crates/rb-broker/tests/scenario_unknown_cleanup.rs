//! Unknown-resource cleanup: whatever the provider lists beyond the
//! store's knowledge gets deleted, at most once per period.

mod common;

use std::collections::BTreeSet;

use rb_store::queries;

#[tokio::test]
async fn stray_provider_resources_are_deleted_once_per_period() {
    let broker = common::broker().await;
    let deleted_log = broker.dir.path().join("deleted.txt");

    let mut pool = common::test_pool("alpha");
    pool.max_prealloc = 1;
    pool.cmd_list = Some("echo alpha_00000001 stray-a stray-b".to_string());
    pool.cmd_delete = format!("echo \"$RESALLOC_NAME\" >> {}", deleted_log.display());
    let pools = common::pool_map([pool]);

    // First tick: one allocation plus the first-ever cleanup pass.
    assert_eq!(common::run_tick(&broker, &pools).await, 2);

    let deleted: BTreeSet<String> = std::fs::read_to_string(&deleted_log)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    let expected: BTreeSet<String> = ["stray-a", "stray-b"]
        .into_iter()
        .map(str::to_string)
        .collect();
    // The store-owned resource was spared, the strays were not.
    assert_eq!(deleted, expected);

    // Stray deletions have no resource id; they log under id zero.
    assert!(broker.dir.path().join("hooks/000000_list").exists());
    assert!(broker.dir.path().join("hooks/000000_terminate").exists());

    let mut conn = broker.store.pool().acquire().await.unwrap();
    let row = queries::ensure_pool_row(&mut conn, "alpha").await.unwrap();
    assert!(row.cleaning_unknown_resources.is_some());
    drop(conn);

    // Well inside the half-hour period: no second cleanup, no new
    // deletions, no new allocations.
    assert_eq!(common::run_tick(&broker, &pools).await, 0);
    let rerun = std::fs::read_to_string(&deleted_log).unwrap();
    assert_eq!(rerun.lines().count(), 2);
}

#[tokio::test]
async fn pools_without_cmd_list_never_clean() {
    let broker = common::broker().await;
    let mut pool = common::test_pool("alpha");
    pool.max_prealloc = 1;
    assert!(pool.cmd_list.is_none());
    let pools = common::pool_map([pool]);

    // Only the allocation worker, ever.
    assert_eq!(common::run_tick(&broker, &pools).await, 1);
    assert_eq!(common::run_tick(&broker, &pools).await, 0);
    assert!(!broker.dir.path().join("hooks/000000_list").exists());

    let mut conn = broker.store.pool().acquire().await.unwrap();
    let row = queries::ensure_pool_row(&mut conn, "alpha").await.unwrap();
    assert_eq!(row.cleaning_unknown_resources, None);
}
