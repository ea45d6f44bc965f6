//! Per-pool control logic, executed once per manager tick.
//!
//! Five steps in a fixed order: detach closed tickets (and start
//! releases), request removals (health + reuse policy), garbage-collect
//! requested removals, allocate up to the configured limits, and kick the
//! periodic unknown-resource cleanup.

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rb_common::{render_resource_name, unix_now, PoolConfig, RState, Result, TState};
use rb_store::queries;

use crate::workers::{AllocWorker, CleanUnknownWorker, ReleaseWorker, TerminateWorker, WorkerContext};

/// Consecutive liveness failures that trigger removal.
pub const CHECK_FAILED_LIMIT: i64 = 3;
/// Minimum seconds between two unknown-resource cleanups of one pool.
pub const UNKNOWN_CLEANUP_PERIOD: i64 = 30 * 60;

pub struct PoolController {
    pub config: PoolConfig,
    ctx: WorkerContext,
}

impl PoolController {
    pub fn new(config: PoolConfig, ctx: WorkerContext) -> Self {
        Self { config, ctx }
    }

    /// One pass over this pool. Returns the handles of every worker
    /// spawned so callers (and tests) can join on them.
    pub async fn tick(&self) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();
        self.detect_closed_tickets(&mut handles).await?;
        self.request_removal().await?;
        self.garbage_collect(&mut handles).await?;
        self.allocate_more(&mut handles).await?;
        self.clean_unknown(&mut handles).await?;
        Ok(handles)
    }

    /// Detach tickets that were closed since the last tick. With a
    /// release hook configured the resource goes UP → RELEASING and a
    /// ReleaseWorker takes over; without one the release completes right
    /// here and the resource is immediately reusable.
    async fn detect_closed_tickets(&self, handles: &mut Vec<JoinHandle<()>>) -> Result<()> {
        let mut to_release = Vec::new();

        let mut tx = self.ctx.store.begin().await?;
        for res in queries::taken(&mut tx, Some(self.config.id.as_str())).await? {
            let Some(ticket_id) = res.ticket_id else { continue };
            let Some(ticket) = queries::ticket_by_id(&mut tx, ticket_id).await? else {
                continue;
            };
            if ticket.tstate()? != TState::Closed {
                continue;
            }

            queries::unbind_ticket(&mut tx, res.id, ticket_id).await?;
            if self.config.cmd_release.is_some() {
                queries::set_resource_state(&mut tx, res.id, RState::Releasing).await?;
                to_release.push(res.id);
            } else {
                queries::record_release(&mut tx, res.id, unix_now()).await?;
                debug!(resource = %res.name, "released inline, no release hook");
            }
        }
        self.ctx.store.commit(tx).await?;

        // Spawn only after the unbind and the RELEASING transition are
        // committed; the workers update the same rows concurrently.
        for resource_id in to_release {
            handles.push(
                ReleaseWorker {
                    pool: self.config.clone(),
                    resource_id,
                    ctx: self.ctx.clone(),
                }
                .spawn(),
            );
        }
        Ok(())
    }

    /// Flag resources for removal, all in one transaction: first the
    /// health failures, then the reuse policy over released resources.
    async fn request_removal(&self) -> Result<()> {
        let now = unix_now();
        let mut tx = self.ctx.store.begin().await?;

        for res in queries::check_failure_candidates(&mut tx, &self.config.id).await? {
            if res.check_failed_count >= CHECK_FAILED_LIMIT {
                warn!(resource = %res.name, failures = res.check_failed_count,
                      "requesting removal for continuous failures");
                queries::set_resource_state(&mut tx, res.id, RState::DeleteRequest).await?;
            }
        }

        for res in queries::clean_candidates(&mut tx, &self.config.id).await? {
            if self.config.reuse_opportunity_time == 0 {
                // Reuse disabled: released means done.
                debug!(resource = %res.name, "removing, not reusable");
                queries::set_resource_state(&mut tx, res.id, RState::DeleteRequest).await?;
                continue;
            }

            if res.released_at.unwrap_or(0) < now - self.config.reuse_opportunity_time {
                debug!(resource = %res.name, "removing, not taken quickly enough");
                queries::set_resource_state(&mut tx, res.id, RState::DeleteRequest).await?;
                continue;
            }

            if self.config.reuse_max_time > 0 {
                if let Some(since) = res.sandboxed_since {
                    if since < now - self.config.reuse_max_time {
                        debug!(resource = %res.name, sandboxed_since = since,
                               "removing, too long in one sandbox");
                        queries::set_resource_state(&mut tx, res.id, RState::DeleteRequest)
                            .await?;
                        continue;
                    }
                }
            }

            if self.config.reuse_max_count > 0 && res.releases_counter > self.config.reuse_max_count
            {
                debug!(resource = %res.name, releases = res.releases_counter,
                       "removing, reuse limit reached");
                queries::set_resource_state(&mut tx, res.id, RState::DeleteRequest).await?;
            }
        }

        self.ctx.store.commit(tx).await
    }

    /// Spawn a terminator for every DELETE_REQUEST resource. Concurrent
    /// terminators are fine; each owns a distinct resource id.
    async fn garbage_collect(&self, handles: &mut Vec<JoinHandle<()>>) -> Result<()> {
        let mut tx = self.ctx.store.begin().await?;
        let doomed = queries::clean(&mut tx, &self.config.id).await?;
        self.ctx.store.commit(tx).await?;

        for res in doomed {
            handles.push(
                TerminateWorker {
                    pool: self.config.clone(),
                    resource_id: res.id,
                    ctx: self.ctx.clone(),
                }
                .spawn(),
            );
        }
        Ok(())
    }

    /// Start new resources until a limit kicks in: total cap, prealloc
    /// cap, concurrent-start cap, or the start delay.
    async fn allocate_more(&self, handles: &mut Vec<JoinHandle<()>>) -> Result<()> {
        loop {
            let mut tx = self.ctx.store.begin().await?;
            let stats = queries::stats(&mut tx, &self.config.id).await?;
            let pool_row = queries::ensure_pool_row(&mut tx, &self.config.id).await?;
            self.ctx.store.commit(tx).await?;

            debug!(pool = %self.config.id, on = stats.on, free = stats.free,
                   start = stats.start, "pool stats");

            if stats.on >= self.config.max
                || stats.free + stats.start >= self.config.max_prealloc
                || stats.start >= self.config.max_starting
            {
                break;
            }
            let now = unix_now();
            if pool_row.last_start + self.config.start_delay > now {
                debug!(pool = %self.config.id, "too soon after the previous start");
                break;
            }

            let mut tx = self.ctx.store.begin().await?;
            queries::set_pool_last_start(&mut tx, &self.config.id, now).await?;
            let resource_id = queries::insert_resource(&mut tx, &self.config.id).await?;
            let slot = queries::allocate_id_in_pool(&mut tx, &self.config.id, resource_id).await?;
            let name = render_resource_name(&self.config.name_pattern, &self.config.id, resource_id);
            queries::set_resource_name(&mut tx, resource_id, &name).await?;
            self.ctx.store.commit(tx).await?;

            info!(resource = %name, slot, pool = %self.config.id, "starting new resource");
            handles.push(
                AllocWorker {
                    pool: self.config.clone(),
                    resource_id,
                    ctx: self.ctx.clone(),
                }
                .spawn(),
            );
        }
        Ok(())
    }

    /// At most once per half hour, reconcile the provider's view of the
    /// pool against the store and delete what the store never owned.
    async fn clean_unknown(&self, handles: &mut Vec<JoinHandle<()>>) -> Result<()> {
        if self.config.cmd_list.is_none() {
            return Ok(());
        }

        let mut tx = self.ctx.store.begin().await?;
        let pool_row = queries::ensure_pool_row(&mut tx, &self.config.id).await?;
        self.ctx.store.commit(tx).await?;

        let now = unix_now();
        if now - pool_row.cleaning_unknown_resources.unwrap_or(0) < UNKNOWN_CLEANUP_PERIOD {
            return Ok(());
        }

        handles.push(
            CleanUnknownWorker {
                pool: self.config.clone(),
                ctx: self.ctx.clone(),
            }
            .spawn(),
        );

        // Stamp in a fresh transaction against a re-read row.
        let mut tx = self.ctx.store.begin().await?;
        queries::ensure_pool_row(&mut tx, &self.config.id).await?;
        queries::set_pool_cleanup_stamp(&mut tx, &self.config.id, now).await?;
        self.ctx.store.commit(tx).await
    }
}
