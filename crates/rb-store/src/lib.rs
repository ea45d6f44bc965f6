//! Persistent state of the broker: pools, resources, tags, per-pool id
//! slots, and tickets, in a single-process SQLite database.
//!
//! All mutation happens inside scoped transactions obtained from
//! [`Store::begin`]; the query helpers in [`queries`] take any executor so
//! they compose inside a transaction or run standalone against the pool.

pub mod queries;
pub mod rows;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};

use rb_common::{BrokerError, Result};

pub use rows::{PoolRow, PoolStats, ResourceRow, ResourceTagRow, TicketRow};

/// Map a driver error onto the broker error taxonomy. Callers abort the
/// current tick or worker iteration on any store failure.
pub(crate) fn store_err(e: sqlx::Error) -> BrokerError {
    BrokerError::Store(e.to_string())
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS pools (
        name TEXT PRIMARY KEY,
        last_start INTEGER NOT NULL DEFAULT 0,
        cleaning_unknown_resources INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        pool TEXT NOT NULL,
        name TEXT NOT NULL DEFAULT '',
        state TEXT NOT NULL DEFAULT 'STARTING',
        data BLOB,
        check_last_time INTEGER NOT NULL DEFAULT 0,
        check_failed_count INTEGER NOT NULL DEFAULT 0,
        sandbox TEXT,
        sandboxed_since INTEGER,
        releases_counter INTEGER NOT NULL DEFAULT 0,
        released_at INTEGER,
        ticket_id INTEGER REFERENCES tickets(id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_resources_pool_state ON resources(pool, state)",
    r#"
    CREATE TABLE IF NOT EXISTS resource_tags (
        resource_id INTEGER NOT NULL REFERENCES resources(id),
        tag TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (resource_id, tag)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ids_within_pool (
        pool_name TEXT NOT NULL,
        id INTEGER NOT NULL,
        resource_id INTEGER NOT NULL REFERENCES resources(id),
        PRIMARY KEY (pool_name, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tickets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        state TEXT NOT NULL DEFAULT 'OPEN',
        tags TEXT NOT NULL DEFAULT '',
        sandbox TEXT,
        tid TEXT,
        resource_id INTEGER REFERENCES resources(id)
    )
    "#,
];

/// Handle on the broker database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `url` and apply the
    /// schema. WAL mode keeps the manager, watcher, and workers from
    /// serializing on every read.
    pub async fn connect(url: &str) -> Result<Store> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(store_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(store_err)?;

        let store = Store { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// A fresh private database for tests.
    pub async fn open_in_memory() -> Result<Store> {
        // A single connection so every handle sees the same :memory: db.
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(store_err)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(store_err)?;
        let store = Store { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for ddl in SCHEMA {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }

    /// Begin a scoped transaction. Dropping it without commit rolls back,
    /// so no partial pass is ever observable.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool.begin().await.map_err(store_err)
    }

    /// Commit a transaction obtained from [`Store::begin`].
    pub async fn commit(&self, tx: Transaction<'static, Sqlite>) -> Result<()> {
        tx.commit().await.map_err(store_err)
    }

    /// Raw pool access for one-statement reads and for tests.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Admit a new ticket. The caller is responsible for waking the
    /// manager afterwards.
    pub async fn create_ticket(
        &self,
        tags: &[String],
        sandbox: Option<&str>,
        tid: Option<&str>,
    ) -> Result<i64> {
        let joined = tags.join(" ");
        let result = sqlx::query("INSERT INTO tickets (state, tags, sandbox, tid) VALUES ('OPEN', ?, ?, ?)")
            .bind(joined)
            .bind(sandbox)
            .bind(tid)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.last_insert_rowid())
    }

    /// Close a ticket. The bound resource (if any) is detected and
    /// released by the next pool-controller tick.
    pub async fn close_ticket(&self, ticket_id: i64) -> Result<()> {
        sqlx::query("UPDATE tickets SET state = 'CLOSED' WHERE id = ?")
            .bind(ticket_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}
