use chrono::Utc;
use serde::{Deserialize, Serialize};

// ============================================================================
// Resource / Ticket States
// ============================================================================

/// Lifecycle state of a provisioned resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RState {
    Starting,
    Up,
    Releasing,
    DeleteRequest,
    Deleting,
    Ended,
}

impl RState {
    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            RState::Starting => "STARTING",
            RState::Up => "UP",
            RState::Releasing => "RELEASING",
            RState::DeleteRequest => "DELETE_REQUEST",
            RState::Deleting => "DELETING",
            RState::Ended => "ENDED",
        }
    }

    pub fn parse(s: &str) -> Option<RState> {
        match s {
            "STARTING" => Some(RState::Starting),
            "UP" => Some(RState::Up),
            "RELEASING" => Some(RState::Releasing),
            "DELETE_REQUEST" => Some(RState::DeleteRequest),
            "DELETING" => Some(RState::Deleting),
            "ENDED" => Some(RState::Ended),
            _ => None,
        }
    }
}

impl std::fmt::Display for RState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a client ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TState {
    Open,
    Closed,
}

impl TState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TState::Open => "OPEN",
            TState::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<TState> {
        match s {
            "OPEN" => Some(TState::Open),
            "CLOSED" => Some(TState::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Bonus score added to candidates that already carry a sandbox, so
/// previously-used resources win over allocating-fresh on ties.
pub const REUSED_RESOURCE_PRIORITY: i64 = 500;

/// A capability tag attached to every resource a pool allocates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSpec {
    pub name: String,
    pub priority: i64,
}

impl TagSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
        }
    }

    pub fn with_priority(name: impl Into<String>, priority: i64) -> Self {
        Self {
            name: name.into(),
            priority,
        }
    }
}

/// One pool of homogeneous resources, reloaded from configuration on
/// every manager tick. Immutable within a tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub id: String,

    /// Max total live (not ENDED, not DELETING) resources.
    pub max: i64,
    /// Max concurrent STARTING resources.
    pub max_starting: i64,
    /// Max idle + starting resources kept ahead of demand.
    pub max_prealloc: i64,
    /// Minimal seconds between two resource starts.
    pub start_delay: i64,

    pub cmd_new: String,
    pub cmd_delete: String,
    pub cmd_livecheck: Option<String>,
    pub cmd_release: Option<String>,
    pub cmd_list: Option<String>,

    /// Seconds between liveness checks of one resource.
    pub livecheck_period: i64,

    pub tags: Vec<TagSpec>,
    pub name_pattern: String,

    /// Seconds a released resource waits for a new ticket before removal.
    /// 0 disables reuse entirely.
    pub reuse_opportunity_time: i64,
    /// Releases allowed per resource before forced removal. 0 = unlimited.
    pub reuse_max_count: i64,
    /// Max seconds a resource may stay in one sandbox. 0 = unlimited.
    pub reuse_max_time: i64,
}

impl PoolConfig {
    /// A pool with the stock defaults; only the two required hook
    /// commands must be supplied.
    pub fn new(id: impl Into<String>, cmd_new: impl Into<String>, cmd_delete: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            max: 4,
            max_starting: 1,
            max_prealloc: 2,
            start_delay: 0,
            cmd_new: cmd_new.into(),
            cmd_delete: cmd_delete.into(),
            cmd_livecheck: None,
            cmd_release: None,
            cmd_list: None,
            livecheck_period: 600,
            tags: Vec::new(),
            name_pattern: "{pool_name}_{id}_{datetime}".to_string(),
            reuse_opportunity_time: 0,
            reuse_max_count: 0,
            reuse_max_time: 3600,
        }
    }
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Directory receiving `hooks/` logs.
    pub logdir: std::path::PathBuf,
    /// Directory holding `pools.yaml`.
    pub config_dir: std::path::PathBuf,
    /// Manager wait timeout in seconds; the watcher runs at half this period.
    pub sleeptime: u64,
    /// SQLite database URL owned by this single process.
    pub database_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            logdir: "/var/log/resbroker".into(),
            config_dir: "/etc/resbroker".into(),
            sleeptime: 20,
            database_url: "sqlite://resbroker.db?mode=rwc".to_string(),
        }
    }
}

// ============================================================================
// Naming / Time Helpers
// ============================================================================

/// Render a resource name from a pool's `name_pattern`. Recognized
/// placeholders: `{pool_name}`, `{id}` (zero-padded to 8 digits) and
/// `{datetime}` (UTC). Unknown placeholders are left untouched.
pub fn render_resource_name(pattern: &str, pool_name: &str, resource_id: i64) -> String {
    pattern
        .replace("{pool_name}", pool_name)
        .replace("{id}", &format!("{:08}", resource_id))
        .replace("{datetime}", &Utc::now().format("%Y%m%d_%H%M%S").to_string())
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("hook runner error: {0}")]
    Hook(String),

    #[error("invariant violation: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
