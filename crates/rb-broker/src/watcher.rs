//! Liveness watcher.
//!
//! Runs independently of the manager at half its period. Every UP
//! resource whose pool has a livecheck hook gets checked once per
//! `livecheck_period`; the watcher only moves the failure counters, the
//! next pool-controller tick acts on them. Taken resources are checked
//! too, so the counter is already conclusive when the ticket closes and
//! a broken resource is removed as soon as it is released.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use rb_common::{unix_now, PoolConfig, Result};
use rb_store::{queries, Store};

use crate::hooks::{HookEnv, HookRunner, LogKind};

pub struct Watcher {
    pub store: Store,
    pub runner: HookRunner,
    pub config_dir: PathBuf,
    /// Manager sleep period in seconds; the watcher loops at half of it.
    pub sleeptime: u64,
}

impl Watcher {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.tick().await {
                    error!(error = %e, "watcher pass failed");
                }
                tokio::time::sleep(Duration::from_secs((self.sleeptime / 2).max(1))).await;
            }
        })
    }

    /// Reload the pool configs and run one checking pass.
    pub async fn tick(&self) -> Result<()> {
        let pools = rb_config::load_pools(&self.config_dir)?;
        self.check_pools(&pools).await
    }

    /// One pass over all UP resources of the given pools.
    pub async fn check_pools(&self, pools: &BTreeMap<String, PoolConfig>) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let up = queries::up(&mut tx, None).await?;
        self.store.commit(tx).await?;

        for res in up {
            let Some(pool) = pools.get(&res.pool) else { continue };
            let Some(cmd_livecheck) = pool.cmd_livecheck.as_deref() else {
                continue;
            };
            if res.check_last_time + pool.livecheck_period > unix_now() {
                continue;
            }

            let out = self
                .runner
                .run(
                    &HookEnv {
                        pool_id: &pool.id,
                        resource_id: res.id,
                        resource_name: Some(&res.name),
                        id_in_pool: res.id_in_pool,
                        data: res.data.as_deref(),
                    },
                    cmd_livecheck,
                    LogKind::Watch,
                    None,
                )
                .await?;

            let mut tx = self.store.begin().await?;
            let failed = !out.succeeded();
            let count = queries::record_check(&mut tx, res.id, unix_now(), failed).await?;
            self.store.commit(tx).await?;

            if failed {
                info!(resource = res.id, fail_count = count, "liveness check failed");
            }
        }
        Ok(())
    }
}
