//! Configuration loading for the resbroker daemon.
//!
//! Two inputs:
//! - `<config_dir>/pools.yaml`: top-level mapping from pool id to pool
//!   fields. Reloaded by the manager on every tick so edits take effect
//!   without a restart.
//! - server settings (logdir, config_dir, sleeptime, database URL) from an
//!   optional YAML file with environment-variable overrides.
//!
//! Unknown pool keys are warned about and skipped; a malformed `tags`
//! entry is warned about and dropped. Only a missing required command
//! (`cmd_new` / `cmd_delete`) rejects a pool outright.

use std::collections::BTreeMap;
use std::path::Path;

use serde_yaml::Value;
use tracing::warn;

use rb_common::{BrokerError, PoolConfig, Result, ServerConfig, TagSpec};

pub const POOLS_FILE: &str = "pools.yaml";

/// Load and validate every pool defined in `<config_dir>/pools.yaml`.
pub fn load_pools(config_dir: &Path) -> Result<BTreeMap<String, PoolConfig>> {
    let path = config_dir.join(POOLS_FILE);
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| BrokerError::Config(format!("read {}: {}", path.display(), e)))?;
    parse_pools(&raw)
}

/// Parse the pools.yaml payload. Split out of [`load_pools`] so tests can
/// feed strings directly.
pub fn parse_pools(raw: &str) -> Result<BTreeMap<String, PoolConfig>> {
    let doc: Value = serde_yaml::from_str(raw)
        .map_err(|e| BrokerError::Config(format!("pools.yaml: {}", e)))?;

    let mapping = match doc {
        Value::Mapping(m) => m,
        Value::Null => return Ok(BTreeMap::new()),
        _ => {
            return Err(BrokerError::Config(
                "pools.yaml: top level must be a mapping of pool ids".to_string(),
            ))
        }
    };

    let mut pools = BTreeMap::new();
    for (key, fields) in mapping {
        let pool_id = match key {
            Value::String(s) => s,
            other => {
                return Err(BrokerError::Config(format!(
                    "pools.yaml: pool id must be a string, got {:?}",
                    other
                )))
            }
        };
        let pool = pool_from_value(&pool_id, fields)?;
        pools.insert(pool_id, pool);
    }
    Ok(pools)
}

/// Build one `PoolConfig` record from its YAML mapping, starting from the
/// stock defaults. Scalar fields replace the default; `tags` replaces the
/// (empty) default list.
fn pool_from_value(pool_id: &str, fields: Value) -> Result<PoolConfig> {
    let mapping = match fields {
        Value::Mapping(m) => m,
        other => {
            return Err(BrokerError::Config(format!(
                "pool '{}': fields must be a mapping, got {:?}",
                pool_id, other
            )))
        }
    };

    let mut cmd_new = None;
    let mut cmd_delete = None;
    let mut pool = PoolConfig::new(pool_id, "", "");

    for (key, value) in mapping {
        let key = match key {
            Value::String(s) => s,
            other => {
                warn!(pool = %pool_id, key = ?other, "ignoring non-string config key");
                continue;
            }
        };

        match key.as_str() {
            "max" => pool.max = expect_int(pool_id, &key, &value)?,
            "max_starting" => pool.max_starting = expect_int(pool_id, &key, &value)?,
            "max_prealloc" => pool.max_prealloc = expect_int(pool_id, &key, &value)?,
            "start_delay" => pool.start_delay = expect_int(pool_id, &key, &value)?,
            "livecheck_period" => pool.livecheck_period = expect_int(pool_id, &key, &value)?,
            "reuse_opportunity_time" => {
                pool.reuse_opportunity_time = expect_int(pool_id, &key, &value)?
            }
            "reuse_max_count" => pool.reuse_max_count = expect_int(pool_id, &key, &value)?,
            "reuse_max_time" => pool.reuse_max_time = expect_int(pool_id, &key, &value)?,
            "cmd_new" => cmd_new = Some(expect_string(pool_id, &key, &value)?),
            "cmd_delete" => cmd_delete = Some(expect_string(pool_id, &key, &value)?),
            "cmd_livecheck" => pool.cmd_livecheck = Some(expect_string(pool_id, &key, &value)?),
            "cmd_release" => pool.cmd_release = Some(expect_string(pool_id, &key, &value)?),
            "cmd_list" => pool.cmd_list = Some(expect_string(pool_id, &key, &value)?),
            "name_pattern" => pool.name_pattern = expect_string(pool_id, &key, &value)?,
            "tags" => pool.tags = parse_tags(pool_id, &value),
            _ => {
                warn!(pool = %pool_id, key = %key, "useless config option");
            }
        }
    }

    pool.cmd_new = cmd_new
        .ok_or_else(|| BrokerError::Config(format!("pool '{}': cmd_new is required", pool_id)))?;
    pool.cmd_delete = cmd_delete.ok_or_else(|| {
        BrokerError::Config(format!("pool '{}': cmd_delete is required", pool_id))
    })?;

    Ok(pool)
}

/// Tags come in two forms: a bare string (priority 0) or a mapping with
/// `name` and an optional integer `priority`.
fn parse_tags(pool_id: &str, value: &Value) -> Vec<TagSpec> {
    let seq = match value {
        Value::Sequence(seq) => seq,
        _ => {
            warn!(pool = %pool_id, "'tags' is set but is not an array");
            return Vec::new();
        }
    };

    let mut tags = Vec::with_capacity(seq.len());
    for entry in seq {
        match entry {
            Value::String(name) => tags.push(TagSpec::new(name.clone())),
            Value::Mapping(m) => {
                let name = m.get("name").and_then(|v| v.as_str());
                let priority = m.get("priority").and_then(|v| v.as_i64()).unwrap_or(0);
                match name {
                    Some(name) => tags.push(TagSpec::with_priority(name, priority)),
                    None => warn!(pool = %pool_id, "tag mapping without 'name', skipping"),
                }
            }
            other => {
                warn!(pool = %pool_id, tag = ?other, "tag is neither a string nor a mapping, skipping");
            }
        }
    }
    tags
}

fn expect_int(pool_id: &str, key: &str, value: &Value) -> Result<i64> {
    value.as_i64().ok_or_else(|| {
        BrokerError::Config(format!("pool '{}': '{}' must be an integer", pool_id, key))
    })
}

fn expect_string(pool_id: &str, key: &str, value: &Value) -> Result<String> {
    value.as_str().map(str::to_string).ok_or_else(|| {
        BrokerError::Config(format!("pool '{}': '{}' must be a string", pool_id, key))
    })
}

// ============================================================================
// Server settings
// ============================================================================

/// Environment variables overriding the server settings file.
const ENV_LOGDIR: &str = "RB_LOGDIR";
const ENV_CONFIG_DIR: &str = "RB_CONFIG_DIR";
const ENV_SLEEPTIME: &str = "RB_SLEEPTIME";
const ENV_DATABASE_URL: &str = "RB_DATABASE_URL";

/// Load the server settings. `path`, when given, points at a YAML file
/// whose keys mirror [`ServerConfig`]; missing keys keep their defaults.
/// Environment variables win over the file.
pub fn load_server(path: Option<&Path>) -> Result<ServerConfig> {
    let mut config = ServerConfig::default();

    if let Some(path) = path {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BrokerError::Config(format!("read {}: {}", path.display(), e)))?;
        let doc: Value = serde_yaml::from_str(&raw)
            .map_err(|e| BrokerError::Config(format!("{}: {}", path.display(), e)))?;
        if let Value::Mapping(m) = doc {
            for (key, value) in m {
                match key.as_str() {
                    Some("logdir") => {
                        config.logdir = expect_string("server", "logdir", &value)?.into()
                    }
                    Some("config_dir") => {
                        config.config_dir = expect_string("server", "config_dir", &value)?.into()
                    }
                    Some("sleeptime") => {
                        config.sleeptime = expect_int("server", "sleeptime", &value)? as u64
                    }
                    Some("database_url") => {
                        config.database_url = expect_string("server", "database_url", &value)?
                    }
                    Some(other) => warn!(key = %other, "useless server config option"),
                    None => warn!(key = ?key, "ignoring non-string server config key"),
                }
            }
        }
    }

    if let Ok(v) = std::env::var(ENV_LOGDIR) {
        config.logdir = v.into();
    }
    if let Ok(v) = std::env::var(ENV_CONFIG_DIR) {
        config.config_dir = v.into();
    }
    if let Ok(v) = std::env::var(ENV_SLEEPTIME) {
        config.sleeptime = v
            .parse()
            .map_err(|_| BrokerError::Config(format!("{} must be an integer", ENV_SLEEPTIME)))?;
    }
    if let Ok(v) = std::env::var(ENV_DATABASE_URL) {
        config.database_url = v;
    }

    Ok(config)
}
