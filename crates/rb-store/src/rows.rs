//! Row types mapped from the five tables.

use std::collections::HashSet;

use rb_common::{BrokerError, RState, Result, TState};

/// One resource, joined with its pool-local id slot (null once freed).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResourceRow {
    pub id: i64,
    pub pool: String,
    pub name: String,
    pub state: String,
    pub data: Option<Vec<u8>>,
    pub check_last_time: i64,
    pub check_failed_count: i64,
    pub sandbox: Option<String>,
    pub sandboxed_since: Option<i64>,
    pub releases_counter: i64,
    pub released_at: Option<i64>,
    pub ticket_id: Option<i64>,
    pub id_in_pool: Option<i64>,
}

impl ResourceRow {
    pub fn rstate(&self) -> Result<RState> {
        RState::parse(&self.state).ok_or_else(|| {
            BrokerError::Invariant(format!("resource {} has unknown state '{}'", self.id, self.state))
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResourceTagRow {
    pub resource_id: i64,
    pub tag: String,
    pub priority: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TicketRow {
    pub id: i64,
    pub state: String,
    pub tags: String,
    pub sandbox: Option<String>,
    pub tid: Option<String>,
    pub resource_id: Option<i64>,
}

impl TicketRow {
    pub fn tstate(&self) -> Result<TState> {
        TState::parse(&self.state).ok_or_else(|| {
            BrokerError::Invariant(format!("ticket {} has unknown state '{}'", self.id, self.state))
        })
    }

    /// Required tags, stored space-separated.
    pub fn tag_set(&self) -> HashSet<&str> {
        self.tags.split_whitespace().collect()
    }
}

/// Per-pool persistent row (distinct from the reloaded configuration).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PoolRow {
    pub name: String,
    pub last_start: i64,
    pub cleaning_unknown_resources: Option<i64>,
}

/// Counters driving the allocation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Resources neither ENDED nor DELETING.
    pub on: i64,
    /// UP resources with no bound ticket.
    pub free: i64,
    /// Resources currently STARTING.
    pub start: i64,
}
