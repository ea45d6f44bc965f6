//! Query helpers over the broker tables.
//!
//! Every helper takes a plain connection so it can run inside a scoped
//! transaction (`&mut *tx`) or against a pooled connection. Mutating
//! helpers never commit; that is the caller's transaction to close.

use sqlx::SqliteConnection;

use rb_common::{unix_now, RState, Result, TagSpec};

use crate::rows::{PoolRow, PoolStats, ResourceRow, ResourceTagRow, TicketRow};
use crate::store_err;

const RESOURCE_SELECT: &str = "SELECT r.id, r.pool, r.name, r.state, r.data, \
     r.check_last_time, r.check_failed_count, r.sandbox, r.sandboxed_since, \
     r.releases_counter, r.released_at, r.ticket_id, i.id AS id_in_pool \
     FROM resources r LEFT JOIN ids_within_pool i ON i.resource_id = r.id";

/// States counted as "on": allocated and not yet on the way out.
const ON_STATES: &str = "('STARTING', 'UP', 'RELEASING', 'DELETE_REQUEST')";

pub async fn resource_by_id(conn: &mut SqliteConnection, id: i64) -> Result<Option<ResourceRow>> {
    let sql = format!("{} WHERE r.id = ?", RESOURCE_SELECT);
    sqlx::query_as(&sql)
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(store_err)
}

async fn resources_where(
    conn: &mut SqliteConnection,
    predicate: &str,
    pool: Option<&str>,
) -> Result<Vec<ResourceRow>> {
    let sql = match pool {
        Some(_) => format!(
            "{} WHERE {} AND r.pool = ? ORDER BY r.id",
            RESOURCE_SELECT, predicate
        ),
        None => format!("{} WHERE {} ORDER BY r.id", RESOURCE_SELECT, predicate),
    };
    let mut query = sqlx::query_as(&sql);
    if let Some(pool) = pool {
        query = query.bind(pool.to_string());
    }
    query.fetch_all(conn).await.map_err(store_err)
}

/// Resources in {STARTING, UP, RELEASING, DELETE_REQUEST}.
pub async fn on(conn: &mut SqliteConnection, pool: Option<&str>) -> Result<Vec<ResourceRow>> {
    resources_where(conn, &format!("r.state IN {}", ON_STATES), pool).await
}

/// Resources in UP, taken or not.
pub async fn up(conn: &mut SqliteConnection, pool: Option<&str>) -> Result<Vec<ResourceRow>> {
    resources_where(conn, "r.state = 'UP'", pool).await
}

/// UP resources with no bound ticket: assignable right now.
pub async fn ready(conn: &mut SqliteConnection) -> Result<Vec<ResourceRow>> {
    resources_where(conn, "r.state = 'UP' AND r.ticket_id IS NULL", None).await
}

/// UP resources currently bound to a ticket.
pub async fn taken(conn: &mut SqliteConnection, pool: Option<&str>) -> Result<Vec<ResourceRow>> {
    resources_where(conn, "r.state = 'UP' AND r.ticket_id IS NOT NULL", pool).await
}

/// UP resources whose failure counter may trigger removal. Resources
/// bound to an OPEN ticket are excluded: they keep being checked, but
/// removal only fires once the ticket is gone.
pub async fn check_failure_candidates(
    conn: &mut SqliteConnection,
    pool: &str,
) -> Result<Vec<ResourceRow>> {
    let sql = format!(
        "{} LEFT JOIN tickets t ON r.ticket_id = t.id \
         WHERE r.state = 'UP' AND (t.id IS NULL OR t.state != 'OPEN') \
         AND r.pool = ? ORDER BY r.id",
        RESOURCE_SELECT
    );
    sqlx::query_as(&sql)
        .bind(pool)
        .fetch_all(conn)
        .await
        .map_err(store_err)
}

/// Unbound UP resources subject to the reuse policy: those that have
/// completed at least one release. Fresh preallocated resources are not
/// candidates; removing them would defeat preallocation.
pub async fn clean_candidates(
    conn: &mut SqliteConnection,
    pool: &str,
) -> Result<Vec<ResourceRow>> {
    resources_where(
        conn,
        "r.state = 'UP' AND r.ticket_id IS NULL AND r.releases_counter > 0",
        Some(pool),
    )
    .await
}

/// Resources awaiting termination.
pub async fn clean(conn: &mut SqliteConnection, pool: &str) -> Result<Vec<ResourceRow>> {
    resources_where(conn, "r.state = 'DELETE_REQUEST'", Some(pool)).await
}

/// The `{on, free, start}` counters driving the allocation loop.
pub async fn stats(conn: &mut SqliteConnection, pool: &str) -> Result<PoolStats> {
    let sql = format!(
        "SELECT \
           COUNT(*) FILTER (WHERE state IN {on}) AS on_count, \
           COUNT(*) FILTER (WHERE state = 'UP' AND ticket_id IS NULL) AS free_count, \
           COUNT(*) FILTER (WHERE state = 'STARTING') AS start_count \
         FROM resources WHERE pool = ?",
        on = ON_STATES
    );
    let (on, free, start): (i64, i64, i64) = sqlx::query_as(&sql)
        .bind(pool)
        .fetch_one(conn)
        .await
        .map_err(store_err)?;
    Ok(PoolStats { on, free, start })
}

// ============================================================================
// Resource mutation
// ============================================================================

/// Insert a fresh STARTING resource, returning its id.
pub async fn insert_resource(conn: &mut SqliteConnection, pool: &str) -> Result<i64> {
    let result = sqlx::query("INSERT INTO resources (pool, state) VALUES (?, 'STARTING')")
        .bind(pool)
        .execute(conn)
        .await
        .map_err(store_err)?;
    Ok(result.last_insert_rowid())
}

pub async fn set_resource_name(conn: &mut SqliteConnection, id: i64, name: &str) -> Result<()> {
    sqlx::query("UPDATE resources SET name = ? WHERE id = ?")
        .bind(name)
        .bind(id)
        .execute(conn)
        .await
        .map_err(store_err)?;
    Ok(())
}

pub async fn set_resource_state(conn: &mut SqliteConnection, id: i64, state: RState) -> Result<()> {
    sqlx::query("UPDATE resources SET state = ? WHERE id = ?")
        .bind(state.as_str())
        .bind(id)
        .execute(conn)
        .await
        .map_err(store_err)?;
    Ok(())
}

/// Commit the outcome of `cmd_new`: captured stdout plus the resulting
/// state (UP on success, ENDED on failure).
pub async fn set_alloc_result(
    conn: &mut SqliteConnection,
    id: i64,
    state: RState,
    data: &[u8],
) -> Result<()> {
    sqlx::query("UPDATE resources SET state = ?, data = ? WHERE id = ?")
        .bind(state.as_str())
        .bind(data)
        .bind(id)
        .execute(conn)
        .await
        .map_err(store_err)?;
    Ok(())
}

/// Record one completed release.
pub async fn record_release(conn: &mut SqliteConnection, id: i64, now: i64) -> Result<()> {
    sqlx::query(
        "UPDATE resources SET releases_counter = releases_counter + 1, released_at = ? WHERE id = ?",
    )
    .bind(now)
    .bind(id)
    .execute(conn)
    .await
    .map_err(store_err)?;
    Ok(())
}

/// Push the release counter past the reuse cap so the next policy pass
/// removes the resource.
pub async fn poison_release_counter(
    conn: &mut SqliteConnection,
    id: i64,
    reuse_max_count: i64,
) -> Result<()> {
    sqlx::query("UPDATE resources SET releases_counter = ? WHERE id = ?")
        .bind(reuse_max_count + 1)
        .bind(id)
        .execute(conn)
        .await
        .map_err(store_err)?;
    Ok(())
}

/// Record a liveness check: reset the failure counter on success,
/// advance it otherwise.
pub async fn record_check(
    conn: &mut SqliteConnection,
    id: i64,
    now: i64,
    failed: bool,
) -> Result<i64> {
    let sql = if failed {
        "UPDATE resources SET check_last_time = ?, check_failed_count = check_failed_count + 1 \
         WHERE id = ? RETURNING check_failed_count"
    } else {
        "UPDATE resources SET check_last_time = ?, check_failed_count = 0 \
         WHERE id = ? RETURNING check_failed_count"
    };
    let (count,): (i64,) = sqlx::query_as(sql)
        .bind(now)
        .bind(id)
        .fetch_one(conn)
        .await
        .map_err(store_err)?;
    Ok(count)
}

pub async fn insert_resource_tags(
    conn: &mut SqliteConnection,
    resource_id: i64,
    tags: &[TagSpec],
) -> Result<()> {
    for tag in tags {
        sqlx::query("INSERT INTO resource_tags (resource_id, tag, priority) VALUES (?, ?, ?)")
            .bind(resource_id)
            .bind(&tag.name)
            .bind(tag.priority)
            .execute(&mut *conn)
            .await
            .map_err(store_err)?;
    }
    Ok(())
}

pub async fn resource_tags(
    conn: &mut SqliteConnection,
    resource_id: i64,
) -> Result<Vec<ResourceTagRow>> {
    sqlx::query_as(
        "SELECT resource_id, tag, priority FROM resource_tags WHERE resource_id = ? ORDER BY tag",
    )
    .bind(resource_id)
    .fetch_all(conn)
    .await
    .map_err(store_err)
}

// ============================================================================
// Pool-local id slots
// ============================================================================

/// Assign the lowest non-negative integer not currently used in the
/// pool. Slots are freed at ENDED, so numbers stay small and recycle.
pub async fn allocate_id_in_pool(
    conn: &mut SqliteConnection,
    pool: &str,
    resource_id: i64,
) -> Result<i64> {
    let used: Vec<(i64,)> =
        sqlx::query_as("SELECT id FROM ids_within_pool WHERE pool_name = ? ORDER BY id")
            .bind(pool)
            .fetch_all(&mut *conn)
            .await
            .map_err(store_err)?;

    let mut candidate = 0i64;
    for (used_id,) in used {
        if used_id == candidate {
            candidate += 1;
        } else {
            break;
        }
    }

    sqlx::query("INSERT INTO ids_within_pool (pool_name, id, resource_id) VALUES (?, ?, ?)")
        .bind(pool)
        .bind(candidate)
        .bind(resource_id)
        .execute(conn)
        .await
        .map_err(store_err)?;
    Ok(candidate)
}

/// Free a resource's id slot (part of the ENDED transition).
pub async fn free_id_in_pool(conn: &mut SqliteConnection, resource_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM ids_within_pool WHERE resource_id = ?")
        .bind(resource_id)
        .execute(conn)
        .await
        .map_err(store_err)?;
    Ok(())
}

// ============================================================================
// Tickets
// ============================================================================

pub async fn ticket_by_id(conn: &mut SqliteConnection, id: i64) -> Result<Option<TicketRow>> {
    sqlx::query_as("SELECT id, state, tags, sandbox, tid, resource_id FROM tickets WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(store_err)
}

/// OPEN tickets with no bound resource, oldest first.
pub async fn waiting(conn: &mut SqliteConnection) -> Result<Vec<TicketRow>> {
    sqlx::query_as(
        "SELECT id, state, tags, sandbox, tid, resource_id FROM tickets \
         WHERE state = 'OPEN' AND resource_id IS NULL ORDER BY id",
    )
    .fetch_all(conn)
    .await
    .map_err(store_err)
}

/// Bind a ticket to a resource. Both foreign keys are set in the same
/// transaction; the first sandboxed binding locks the sandbox in for the
/// resource's remaining lifetime.
pub async fn bind_ticket(
    conn: &mut SqliteConnection,
    resource: &ResourceRow,
    ticket: &TicketRow,
) -> Result<()> {
    sqlx::query("UPDATE tickets SET resource_id = ? WHERE id = ?")
        .bind(resource.id)
        .bind(ticket.id)
        .execute(&mut *conn)
        .await
        .map_err(store_err)?;

    if resource.sandbox.is_none() && ticket.sandbox.is_some() {
        sqlx::query("UPDATE resources SET ticket_id = ?, sandbox = ?, sandboxed_since = ? WHERE id = ?")
            .bind(ticket.id)
            .bind(&ticket.sandbox)
            .bind(unix_now())
            .bind(resource.id)
            .execute(conn)
            .await
            .map_err(store_err)?;
    } else {
        sqlx::query("UPDATE resources SET ticket_id = ? WHERE id = ?")
            .bind(ticket.id)
            .bind(resource.id)
            .execute(conn)
            .await
            .map_err(store_err)?;
    }
    Ok(())
}

/// Detach a (closed) ticket from its resource, clearing both sides.
pub async fn unbind_ticket(
    conn: &mut SqliteConnection,
    resource_id: i64,
    ticket_id: i64,
) -> Result<()> {
    sqlx::query("UPDATE resources SET ticket_id = NULL WHERE id = ?")
        .bind(resource_id)
        .execute(&mut *conn)
        .await
        .map_err(store_err)?;
    sqlx::query("UPDATE tickets SET resource_id = NULL WHERE id = ?")
        .bind(ticket_id)
        .execute(conn)
        .await
        .map_err(store_err)?;
    Ok(())
}

// ============================================================================
// Pool rows
// ============================================================================

/// Load the pool's persistent row, creating it on first contact.
pub async fn ensure_pool_row(conn: &mut SqliteConnection, name: &str) -> Result<PoolRow> {
    sqlx::query("INSERT INTO pools (name, last_start) VALUES (?, 0) ON CONFLICT(name) DO NOTHING")
        .bind(name)
        .execute(&mut *conn)
        .await
        .map_err(store_err)?;
    sqlx::query_as(
        "SELECT name, last_start, cleaning_unknown_resources FROM pools WHERE name = ?",
    )
    .bind(name)
    .fetch_one(conn)
    .await
    .map_err(store_err)
}

pub async fn set_pool_last_start(conn: &mut SqliteConnection, name: &str, now: i64) -> Result<()> {
    sqlx::query("UPDATE pools SET last_start = ? WHERE name = ?")
        .bind(now)
        .bind(name)
        .execute(conn)
        .await
        .map_err(store_err)?;
    Ok(())
}

pub async fn set_pool_cleanup_stamp(
    conn: &mut SqliteConnection,
    name: &str,
    now: i64,
) -> Result<()> {
    sqlx::query("UPDATE pools SET cleaning_unknown_resources = ? WHERE name = ?")
        .bind(now)
        .bind(name)
        .execute(conn)
        .await
        .map_err(store_err)?;
    Ok(())
}
