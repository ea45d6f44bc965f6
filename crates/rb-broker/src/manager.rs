//! The manager: top-level control loop and ticket matching.
//!
//! Each tick reloads the pool configuration, runs every pool controller,
//! and then matches waiting tickets against ready resources. Between
//! ticks the manager blocks on the shared event with a timeout, so worker
//! completions and fresh tickets shorten the wait while an idle system
//! costs one pass per `sleeptime`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use rb_common::{PoolConfig, Result, ServerConfig, TState, REUSED_RESOURCE_PRIORITY};
use rb_store::{queries, ResourceRow, Store};

use crate::hooks::HookRunner;
use crate::pool::PoolController;
use crate::sync::Synchronizer;
use crate::watcher::Watcher;
use crate::workers::WorkerContext;

/// Admit a ticket and wake the manager. This is the front door the
/// client-facing layer calls on submission.
pub async fn submit_ticket(
    store: &Store,
    sync: &Synchronizer,
    tags: &[String],
    sandbox: Option<&str>,
    tid: Option<&str>,
) -> Result<i64> {
    let ticket_id = store.create_ticket(tags, sandbox, tid).await?;
    info!(ticket = ticket_id, ?tags, sandbox, "ticket admitted");
    sync.wake();
    Ok(ticket_id)
}

pub struct Manager {
    store: Store,
    sync: Arc<Synchronizer>,
    runner: HookRunner,
    config: ServerConfig,
}

impl Manager {
    pub fn new(store: Store, sync: Arc<Synchronizer>, config: ServerConfig) -> Self {
        let runner = HookRunner::new(&config.logdir);
        Self {
            store,
            sync,
            runner,
            config,
        }
    }

    fn worker_ctx(&self) -> WorkerContext {
        WorkerContext {
            store: self.store.clone(),
            runner: self.runner.clone(),
            sync: self.sync.clone(),
        }
    }

    /// Run forever: start the watcher, then tick whenever the event fires
    /// or the timeout elapses. A failed tick is logged and retried on the
    /// next round; worker crashes never propagate here.
    pub async fn run(self) {
        let _watcher = Watcher {
            store: self.store.clone(),
            runner: self.runner.clone(),
            config_dir: self.config.config_dir.clone(),
            sleeptime: self.config.sleeptime,
        }
        .spawn();

        loop {
            if let Err(e) = self.tick().await {
                error!(error = %e, "manager tick failed");
            }
            self.sync
                .wait_timeout(Duration::from_secs(self.config.sleeptime))
                .await;
        }
    }

    /// One tick: reload configs, run the pool controllers, assign
    /// tickets. Returns the worker handles spawned along the way.
    pub async fn tick(&self) -> Result<Vec<JoinHandle<()>>> {
        debug!("manager tick");
        let pools = rb_config::load_pools(&self.config.config_dir)?;
        self.tick_with_pools(&pools).await
    }

    /// Tick against an explicit pool set. Assignment runs after all pool
    /// passes so resources released this tick are eligible immediately.
    pub async fn tick_with_pools(
        &self,
        pools: &BTreeMap<String, PoolConfig>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();
        for pool in pools.values() {
            let controller = PoolController::new(pool.clone(), self.worker_ctx());
            match controller.tick().await {
                Ok(mut spawned) => handles.append(&mut spawned),
                Err(e) => error!(pool = %pool.id, error = %e, "pool pass failed"),
            }
        }
        self.assign_tickets().await?;
        Ok(handles)
    }

    /// Match waiting tickets to ready resources, oldest ticket first.
    async fn assign_tickets(&self) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let waiting: Vec<i64> = queries::waiting(&mut tx).await?.iter().map(|t| t.id).collect();
        self.store.commit(tx).await?;

        for ticket_id in waiting {
            let mut tx = self.store.begin().await?;
            let Some(ticket) = queries::ticket_by_id(&mut tx, ticket_id).await? else {
                continue;
            };
            // The ticket may have been closed or raced into an
            // assignment since the listing; skip it then.
            if ticket.tstate()? != TState::Open || ticket.resource_id.is_some() {
                continue;
            }

            let ready = queries::ready(&mut tx).await?;
            if ready.is_empty() {
                debug!(ticket = ticket.id, "no available resource, skipping");
                continue;
            }

            let ticket_tags = ticket.tag_set();
            let mut best: Option<(i64, &ResourceRow)> = None;
            for res in &ready {
                if let Some(sandbox) = &res.sandbox {
                    if ticket.sandbox.as_ref() != Some(sandbox) {
                        continue;
                    }
                }
                let res_tags = queries::resource_tags(&mut tx, res.id).await?;
                let tag_names: HashSet<&str> = res_tags.iter().map(|t| t.tag.as_str()).collect();
                if !ticket_tags.is_subset(&tag_names) {
                    continue;
                }

                let mut score: i64 = res_tags
                    .iter()
                    .filter(|t| ticket_tags.contains(t.tag.as_str()))
                    .map(|t| t.priority)
                    .sum();
                if res.sandbox.is_some() {
                    score += REUSED_RESOURCE_PRIORITY;
                }

                // Strict comparison: ties resolve to the lowest id, as
                // `ready` comes ordered by id.
                if best.map_or(true, |(top, _)| score > top) {
                    best = Some((score, res));
                }
            }

            let Some((score, resource)) = best else {
                debug!(ticket = ticket.id, ready = ready.len(),
                       "resources up but unusable for ticket");
                continue;
            };

            info!(resource = %resource.name, ticket = ticket.id, score, "assigning");
            queries::bind_ticket(&mut tx, resource, &ticket).await?;
            self.store.commit(tx).await?;

            // Notify only once the binding is visible to the waiter.
            if let Some(tid) = &ticket.tid {
                self.sync.notify_waiter(tid);
            }
        }
        Ok(())
    }
}
