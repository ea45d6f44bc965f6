//! Single-shot worker tasks.
//!
//! One worker type per hook-driven transition: allocate, release,
//! terminate, and unknown-resource cleanup. A worker snapshots what it
//! needs in one transaction, runs its hook with no transaction held, then
//! commits the outcome in a fresh transaction. Holding a transaction
//! across a hook would starve every other task of the store.
//!
//! Workers catch their own failures in `spawn()`; a crashed worker leaves
//! the resource in whatever state the last committed transaction set, and
//! the next manager tick takes it from there.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use rb_common::{unix_now, BrokerError, PoolConfig, RState, Result, TState};
use rb_store::{queries, ResourceRow, Store};

use crate::hooks::{Capture, HookEnv, HookRunner, LogKind};
use crate::sync::Synchronizer;

/// Stdout budget for `cmd_new`; whatever fits becomes the resource data.
pub const ALLOC_CAPTURE_BYTES: usize = 512;
/// Stdout budget for `cmd_list`; parsed, so captured securely.
pub const LIST_CAPTURE_BYTES: usize = 5120;

/// Everything a worker needs besides its pool and resource id.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Store,
    pub runner: HookRunner,
    pub sync: Arc<Synchronizer>,
}

impl WorkerContext {
    async fn snapshot(&self, resource_id: i64) -> Result<ResourceRow> {
        let mut tx = self.store.begin().await?;
        let row = queries::resource_by_id(&mut tx, resource_id)
            .await?
            .ok_or_else(|| BrokerError::Invariant(format!("resource {} not found", resource_id)))?;
        self.store.commit(tx).await?;
        Ok(row)
    }
}

// ============================================================================
// AllocWorker
// ============================================================================

/// Drives one STARTING resource through `cmd_new` into UP (or ENDED on
/// hook failure).
pub struct AllocWorker {
    pub pool: PoolConfig,
    pub resource_id: i64,
    pub ctx: WorkerContext,
}

impl AllocWorker {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!(pool = %self.pool.id, resource = self.resource_id, error = %e,
                       "allocation worker failed");
            }
        })
    }

    async fn run(&self) -> Result<()> {
        let res = self.ctx.snapshot(self.resource_id).await?;
        info!(resource = %res.name, slot = ?res.id_in_pool, pool = %self.pool.id, "allocating");

        let out = self
            .ctx
            .runner
            .run(
                &HookEnv {
                    pool_id: &self.pool.id,
                    resource_id: res.id,
                    resource_name: Some(&res.name),
                    id_in_pool: res.id_in_pool,
                    data: None,
                },
                &self.pool.cmd_new,
                LogKind::Alloc,
                Some(Capture {
                    budget: ALLOC_CAPTURE_BYTES,
                    secure_lines: false,
                }),
            )
            .await?;

        let state = if out.succeeded() { RState::Up } else { RState::Ended };

        let mut tx = self.ctx.store.begin().await?;
        queries::set_alloc_result(&mut tx, res.id, state, &out.stdout).await?;
        queries::insert_resource_tags(&mut tx, res.id, &self.pool.tags).await?;
        if state == RState::Ended {
            queries::free_id_in_pool(&mut tx, res.id).await?;
        }
        self.ctx.store.commit(tx).await?;

        info!(resource = %res.name, state = %state, "allocation finished");
        self.ctx.sync.wake();
        Ok(())
    }
}

// ============================================================================
// ReleaseWorker
// ============================================================================

/// Runs `cmd_release` on a just-unbound resource and returns it to UP.
/// This is where the release bookkeeping lands: a successful release
/// increments `releases_counter` and stamps `released_at`; a failed one
/// pushes the counter past the reuse cap so the next policy pass removes
/// the resource instead of reusing it.
pub struct ReleaseWorker {
    pub pool: PoolConfig,
    pub resource_id: i64,
    pub ctx: WorkerContext,
}

impl ReleaseWorker {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!(pool = %self.pool.id, resource = self.resource_id, error = %e,
                       "release worker failed");
            }
        })
    }

    async fn run(&self) -> Result<()> {
        let cmd_release = self.pool.cmd_release.as_deref().ok_or_else(|| {
            BrokerError::Invariant(format!("pool '{}' has no cmd_release", self.pool.id))
        })?;

        let res = self.ctx.snapshot(self.resource_id).await?;
        info!(resource = %res.name, pool = %self.pool.id, "releasing");

        let out = self
            .ctx
            .runner
            .run(
                &HookEnv {
                    pool_id: &self.pool.id,
                    resource_id: res.id,
                    resource_name: Some(&res.name),
                    id_in_pool: res.id_in_pool,
                    data: res.data.as_deref(),
                },
                cmd_release,
                LogKind::Release,
                None,
            )
            .await?;

        let mut tx = self.ctx.store.begin().await?;
        if out.succeeded() {
            queries::record_release(&mut tx, res.id, unix_now()).await?;
        } else {
            error!(pool = %self.pool.id, resource = %res.name, cmd = cmd_release,
                   status = out.status, "release hook failed, marking for removal");
            queries::poison_release_counter(&mut tx, res.id, self.pool.reuse_max_count).await?;
        }
        queries::set_resource_state(&mut tx, res.id, RState::Up).await?;
        self.ctx.store.commit(tx).await?;

        // Wake the manager only when the resource is worth re-picking.
        if out.succeeded() {
            self.ctx.sync.wake();
        }
        info!(resource = %res.name, "releasing finished");
        Ok(())
    }
}

// ============================================================================
// TerminateWorker
// ============================================================================

/// Drives a DELETE_REQUEST resource through `cmd_delete` to ENDED and
/// frees its pool-local id slot.
pub struct TerminateWorker {
    pub pool: PoolConfig,
    pub resource_id: i64,
    pub ctx: WorkerContext,
}

impl TerminateWorker {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!(pool = %self.pool.id, resource = self.resource_id, error = %e,
                       "terminate worker failed");
            }
        })
    }

    async fn run(&self) -> Result<()> {
        let mut tx = self.ctx.store.begin().await?;
        let res = queries::resource_by_id(&mut tx, self.resource_id)
            .await?
            .ok_or_else(|| {
                BrokerError::Invariant(format!("resource {} not found", self.resource_id))
            })?;

        // Somebody may have re-bound the resource between the removal
        // request and now; an open ticket always wins.
        if let Some(ticket_id) = res.ticket_id {
            if let Some(ticket) = queries::ticket_by_id(&mut tx, ticket_id).await? {
                if ticket.tstate()? == TState::Open {
                    warn!(resource = %res.name, ticket = ticket_id,
                          "can't delete, ticket opened");
                    return Ok(());
                }
            }
        }
        queries::set_resource_state(&mut tx, res.id, RState::Deleting).await?;
        self.ctx.store.commit(tx).await?;

        info!(resource = %res.name, "terminating started");
        let out = self
            .ctx
            .runner
            .run(
                &HookEnv {
                    pool_id: &self.pool.id,
                    resource_id: res.id,
                    resource_name: Some(&res.name),
                    id_in_pool: res.id_in_pool,
                    data: res.data.as_deref(),
                },
                &self.pool.cmd_delete,
                LogKind::Terminate,
                None,
            )
            .await?;
        if !out.succeeded() {
            warn!(resource = %res.name, status = out.status, "delete hook exited non-zero");
        }

        let mut tx = self.ctx.store.begin().await?;
        queries::set_resource_state(&mut tx, res.id, RState::Ended).await?;
        queries::free_id_in_pool(&mut tx, res.id).await?;
        self.ctx.store.commit(tx).await?;

        self.ctx.sync.wake();
        info!(resource = %res.name, "terminating finished");
        Ok(())
    }
}

// ============================================================================
// CleanUnknownWorker
// ============================================================================

/// Deletes resources the provider reports but the store has never heard
/// of (leaked by crashed allocations, manual experiments, ...). Reads the
/// store for known names, never writes it.
pub struct CleanUnknownWorker {
    pub pool: PoolConfig,
    pub ctx: WorkerContext,
}

impl CleanUnknownWorker {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!(pool = %self.pool.id, error = %e, "unknown-resource cleanup failed");
            }
        })
    }

    async fn run(&self) -> Result<()> {
        let cmd_list = self.pool.cmd_list.as_deref().ok_or_else(|| {
            BrokerError::Invariant(format!("pool '{}' has no cmd_list", self.pool.id))
        })?;

        info!(pool = %self.pool.id, "cleaning unknown resources");

        let out = self
            .ctx
            .runner
            .run(
                &HookEnv {
                    pool_id: &self.pool.id,
                    resource_id: 0,
                    resource_name: None,
                    id_in_pool: None,
                    data: None,
                },
                cmd_list,
                LogKind::List,
                Some(Capture {
                    budget: LIST_CAPTURE_BYTES,
                    secure_lines: true,
                }),
            )
            .await?;
        if !out.succeeded() {
            warn!(pool = %self.pool.id, status = out.status, "list hook exited non-zero");
        }

        let listed: HashSet<String> = String::from_utf8_lossy(&out.stdout)
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let mut tx = self.ctx.store.begin().await?;
        let known: HashSet<String> = queries::on(&mut tx, Some(self.pool.id.as_str()))
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect();
        self.ctx.store.commit(tx).await?;

        for name in listed.difference(&known) {
            info!(pool = %self.pool.id, resource = %name, "deleting unknown resource");
            // No assigned id exists for these; everything logs under
            // hooks/000000_terminate.
            self.ctx
                .runner
                .run(
                    &HookEnv {
                        pool_id: &self.pool.id,
                        resource_id: 0,
                        resource_name: Some(name),
                        id_in_pool: None,
                        data: None,
                    },
                    &self.pool.cmd_delete,
                    LogKind::Terminate,
                    None,
                )
                .await?;
        }
        Ok(())
    }
}
