//! Shared plumbing for the end-to-end scenarios: an in-memory store, a
//! temp log directory, and a manager ticked by hand with explicit pool
//! configs.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use rb_broker::{Manager, Synchronizer};
use rb_common::{PoolConfig, ServerConfig};
use rb_store::{queries, ResourceRow, Store};

pub struct TestBroker {
    pub store: Store,
    pub sync: Arc<Synchronizer>,
    pub manager: Manager,
    pub dir: tempfile::TempDir,
}

pub async fn broker() -> TestBroker {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_in_memory().await.unwrap();
    let sync = Arc::new(Synchronizer::new());
    let config = ServerConfig {
        logdir: dir.path().to_path_buf(),
        config_dir: dir.path().to_path_buf(),
        sleeptime: 1,
        database_url: String::new(),
    };
    let manager = Manager::new(store.clone(), sync.clone(), config);
    TestBroker {
        store,
        sync,
        manager,
        dir,
    }
}

/// A pool with a predictable name pattern and hooks that just succeed.
pub fn test_pool(id: &str) -> PoolConfig {
    let mut pool = PoolConfig::new(id, "echo ok", "true");
    pool.name_pattern = "{pool_name}_{id}".to_string();
    pool
}

pub fn pool_map(pools: impl IntoIterator<Item = PoolConfig>) -> BTreeMap<String, PoolConfig> {
    pools.into_iter().map(|p| (p.id.clone(), p)).collect()
}

/// Run one manager tick and wait for every spawned worker to finish.
/// Returns how many workers the tick spawned.
pub async fn run_tick(broker: &TestBroker, pools: &BTreeMap<String, PoolConfig>) -> usize {
    let handles = broker.manager.tick_with_pools(pools).await.unwrap();
    let spawned = handles.len();
    for handle in handles {
        handle.await.unwrap();
    }
    spawned
}

pub async fn all_resources(broker: &TestBroker) -> Vec<ResourceRow> {
    let mut conn = broker.store.pool().acquire().await.unwrap();
    let mut rows = Vec::new();
    // No lifecycle filter here: ENDED rows matter to the assertions too.
    for id in 1.. {
        match queries::resource_by_id(&mut conn, id).await.unwrap() {
            Some(row) => rows.push(row),
            None => break,
        }
    }
    rows
}

pub async fn resource(broker: &TestBroker, id: i64) -> ResourceRow {
    let mut conn = broker.store.pool().acquire().await.unwrap();
    queries::resource_by_id(&mut conn, id).await.unwrap().unwrap()
}

pub async fn ticket(broker: &TestBroker, id: i64) -> rb_store::TicketRow {
    let mut conn = broker.store.pool().acquire().await.unwrap();
    queries::ticket_by_id(&mut conn, id).await.unwrap().unwrap()
}
