//! Time-based reuse policy: the pickup window after a release and the
//! maximum sandbox age.

mod common;

use rb_broker::submit_ticket;

/// Take the single pool resource once and release it, leaving it UP with
/// `releases_counter = 1`.
async fn take_and_release(
    broker: &common::TestBroker,
    pools: &std::collections::BTreeMap<String, rb_common::PoolConfig>,
    sandbox: Option<&str>,
) {
    common::run_tick(broker, pools).await;
    let ticket = submit_ticket(&broker.store, &broker.sync, &[], sandbox, None)
        .await
        .unwrap();
    common::run_tick(broker, pools).await;
    assert_eq!(common::resource(broker, 1).await.ticket_id, Some(ticket));
    broker.store.close_ticket(ticket).await.unwrap();
    common::run_tick(broker, pools).await;
    let res = common::resource(broker, 1).await;
    assert_eq!(res.state, "UP");
    assert_eq!(res.releases_counter, 1);
}

async fn backdate(broker: &common::TestBroker, column: &str, value: i64) {
    let sql = format!("UPDATE resources SET {} = ? WHERE id = 1", column);
    sqlx::query(&sql)
        .bind(value)
        .execute(broker.store.pool())
        .await
        .unwrap();
}

#[tokio::test]
async fn unclaimed_release_window_expires() {
    let broker = common::broker().await;
    let mut pool = common::test_pool("alpha");
    pool.max = 1;
    pool.max_prealloc = 1;
    pool.reuse_opportunity_time = 300;
    let pools = common::pool_map([pool]);

    take_and_release(&broker, &pools, None).await;

    // Within the window the resource survives the policy pass.
    common::run_tick(&broker, &pools).await;
    assert_eq!(common::resource(&broker, 1).await.state, "UP");

    // Nobody picked it up in time.
    backdate(&broker, "released_at", rb_common::unix_now() - 400).await;
    common::run_tick(&broker, &pools).await;
    assert_eq!(common::resource(&broker, 1).await.state, "ENDED");
}

#[tokio::test]
async fn sandbox_age_limit_retires_the_resource() {
    let broker = common::broker().await;
    let mut pool = common::test_pool("alpha");
    pool.max = 1;
    pool.max_prealloc = 1;
    pool.reuse_opportunity_time = 100_000;
    pool.reuse_max_time = 60;
    let pools = common::pool_map([pool]);

    take_and_release(&broker, &pools, Some("S")).await;
    common::run_tick(&broker, &pools).await;
    assert_eq!(common::resource(&broker, 1).await.state, "UP");

    backdate(&broker, "sandboxed_since", rb_common::unix_now() - 120).await;
    common::run_tick(&broker, &pools).await;
    assert_eq!(common::resource(&broker, 1).await.state, "ENDED");
}

#[tokio::test]
async fn sandbox_age_limit_ignores_unsandboxed_resources() {
    let broker = common::broker().await;
    let mut pool = common::test_pool("alpha");
    pool.max = 1;
    pool.max_prealloc = 1;
    pool.reuse_opportunity_time = 100_000;
    pool.reuse_max_time = 60;
    let pools = common::pool_map([pool]);

    // Released by a sandbox-less ticket: no sandbox age to exceed, so
    // the resource stays as long as the pickup window allows.
    take_and_release(&broker, &pools, None).await;
    assert_eq!(common::resource(&broker, 1).await.sandboxed_since, None);

    common::run_tick(&broker, &pools).await;
    common::run_tick(&broker, &pools).await;
    assert_eq!(common::resource(&broker, 1).await.state, "UP");
}
