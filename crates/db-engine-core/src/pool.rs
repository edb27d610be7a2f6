//! The Pool Registry: a process-wide, concurrency-safe map from pool name
//! to an established connection pool plus the settings it was opened with.
//!
//! Grounded in `ouroboros-postgres::connection::{PoolConfig, Connection}`,
//! generalised from a single `PgPool` wrapper into a `Pool` enum covering
//! all three dialects, and lifted from a single global (`PG_POOL` in
//! `data-bridge::postgres`) into a named registry so a process can hold
//! pools for more than one backend at a time.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::RwLock;
use tracing::{info, instrument};

use crate::dialect::Dialect;
use crate::error::{DbError, Result};

/// Pool sizing, timeout, and lifecycle settings. Negative durations or
/// zero-sized bounds are rejected at construction time (`CONFIG`), not
/// discovered later as a connect-time failure.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
    pub test_before_acquire: bool,
    /// Statement cache capacity; SQLite and MySQL ignore this (no
    /// server-side prepared statement cache to size).
    pub statement_cache_capacity: usize,
    /// Interval at which the transaction reaper sweeps this pool's
    /// outstanding transaction handles.
    pub transaction_cleanup_interval: Duration,
    /// Default statement timeout applied to transactions opened against
    /// this pool, absent a per-call override.
    pub transaction_timeout: Duration,
    /// SQLite-only: PRAGMA statements applied to every new connection
    /// (e.g. `journal_mode=WAL`, `foreign_keys=ON`, `busy_timeout=5000`).
    pub sqlite_pragmas: Vec<(String, String)>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_connections: 1,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
            test_before_acquire: true,
            statement_cache_capacity: 100,
            transaction_cleanup_interval: Duration::from_secs(30),
            transaction_timeout: Duration::from_secs(60),
            sqlite_pragmas: vec![
                ("journal_mode".to_string(), "WAL".to_string()),
                ("foreign_keys".to_string(), "ON".to_string()),
                ("synchronous".to_string(), "NORMAL".to_string()),
                ("cache_size".to_string(), "10000".to_string()),
                ("busy_timeout".to_string(), "5000".to_string()),
            ],
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(DbError::config("max_connections must be at least 1"));
        }
        if self.min_connections > self.max_connections {
            return Err(DbError::config("min_connections cannot exceed max_connections"));
        }
        if self.acquire_timeout.is_zero() {
            return Err(DbError::config("acquire_timeout must be positive"));
        }
        if self.transaction_cleanup_interval.is_zero() {
            return Err(DbError::config("transaction_cleanup_interval must be positive"));
        }
        Ok(())
    }
}

/// The underlying `sqlx` pool handle for whichever dialect was opened.
#[derive(Clone)]
pub enum Pool {
    Postgres(PgPool),
    Sqlite(SqlitePool),
    MySql(MySqlPool),
}

impl Pool {
    pub fn dialect(&self) -> Dialect {
        match self {
            Pool::Postgres(_) => Dialect::Postgres,
            Pool::Sqlite(_) => Dialect::Sqlite,
            Pool::MySql(_) => Dialect::MySql,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Pool::Postgres(p) => p.is_closed(),
            Pool::Sqlite(p) => p.is_closed(),
            Pool::MySql(p) => p.is_closed(),
        }
    }

    pub async fn close(&self) {
        match self {
            Pool::Postgres(p) => p.close().await,
            Pool::Sqlite(p) => p.close().await,
            Pool::MySql(p) => p.close().await,
        }
    }
}

struct PoolEntry {
    pool: Pool,
    config: PoolConfig,
}

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<PoolEntry>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Opens a new pool for `url` and registers it under `name`. Re-registering
/// an already-open name is a `USAGE` error; close it first.
#[instrument(skip(url, config), fields(pool_name = name, max_connections = config.max_connections))]
pub async fn register(name: &str, url: &str, config: PoolConfig) -> Result<()> {
    config.validate()?;

    {
        let registry = REGISTRY.read().await;
        if registry.contains_key(name) {
            return Err(DbError::usage(format!("a pool named '{name}' is already registered")));
        }
    }

    let dialect = Dialect::from_url(url)?;
    let pool = open_pool(dialect, url, &config).await?;

    info!(pool_name = name, %dialect, "pool registered");

    let mut registry = REGISTRY.write().await;
    if registry.contains_key(name) {
        pool.close().await;
        return Err(DbError::usage(format!("a pool named '{name}' is already registered")));
    }
    registry.insert(name.to_string(), Arc::new(PoolEntry { pool, config }));
    Ok(())
}

async fn open_pool(dialect: Dialect, url: &str, config: &PoolConfig) -> Result<Pool> {
    match dialect {
        Dialect::Postgres => {
            let options = PgConnectOptions::from_str(url)
                .map_err(|e| DbError::config(format!("invalid postgres connection url: {e}")))?
                .statement_cache_capacity(config.statement_cache_capacity);
            let mut builder = PgPoolOptions::new()
                .min_connections(config.min_connections)
                .max_connections(config.max_connections)
                .acquire_timeout(config.acquire_timeout)
                .test_before_acquire(config.test_before_acquire);
            if let Some(idle) = config.idle_timeout {
                builder = builder.idle_timeout(idle);
            }
            if let Some(lifetime) = config.max_lifetime {
                builder = builder.max_lifetime(lifetime);
            }
            let pool = builder
                .connect_with(options)
                .await
                .map_err(|e| DbError::Connection(e.to_string()))?;
            Ok(Pool::Postgres(pool))
        }
        Dialect::Sqlite => {
            let mut options = SqliteConnectOptions::from_str(url)
                .map_err(|e| DbError::config(format!("invalid sqlite connection url: {e}")))?
                .create_if_missing(true);
            for (pragma, value) in &config.sqlite_pragmas {
                options = options.pragma(pragma.clone(), value.clone());
            }
            let mut builder = SqlitePoolOptions::new()
                .min_connections(config.min_connections)
                .max_connections(config.max_connections)
                .acquire_timeout(config.acquire_timeout)
                .test_before_acquire(config.test_before_acquire);
            if let Some(idle) = config.idle_timeout {
                builder = builder.idle_timeout(idle);
            }
            if let Some(lifetime) = config.max_lifetime {
                builder = builder.max_lifetime(lifetime);
            }
            let pool = builder
                .connect_with(options)
                .await
                .map_err(|e| DbError::Connection(e.to_string()))?;
            Ok(Pool::Sqlite(pool))
        }
        Dialect::MySql => {
            let options = MySqlConnectOptions::from_str(url)
                .map_err(|e| DbError::config(format!("invalid mysql connection url: {e}")))?
                .statement_cache_capacity(config.statement_cache_capacity);
            let mut builder = MySqlPoolOptions::new()
                .min_connections(config.min_connections)
                .max_connections(config.max_connections)
                .acquire_timeout(config.acquire_timeout)
                .test_before_acquire(config.test_before_acquire);
            if let Some(idle) = config.idle_timeout {
                builder = builder.idle_timeout(idle);
            }
            if let Some(lifetime) = config.max_lifetime {
                builder = builder.max_lifetime(lifetime);
            }
            let pool = builder
                .connect_with(options)
                .await
                .map_err(|e| DbError::Connection(e.to_string()))?;
            Ok(Pool::MySql(pool))
        }
    }
}

/// Looks up a registered pool by name.
pub async fn get(name: &str) -> Result<Pool> {
    let registry = REGISTRY.read().await;
    registry
        .get(name)
        .map(|entry| entry.pool.clone())
        .ok_or_else(|| DbError::usage(format!("no pool named '{name}' is registered")))
}

pub async fn get_config(name: &str) -> Result<PoolConfig> {
    let registry = REGISTRY.read().await;
    registry
        .get(name)
        .map(|entry| entry.config.clone())
        .ok_or_else(|| DbError::usage(format!("no pool named '{name}' is registered")))
}

/// Closes and deregisters a single pool. Closing an already-closed or
/// unknown name is a no-op rather than an error, matching the idempotent
/// close required of the embedder-facing lifecycle.
///
/// Drains in dependency order: first rolling back every live
/// transaction pinned to this pool, then closing idle connections, so a
/// pool is never closed out from under an in-flight transaction's
/// connection.
pub async fn close(name: &str) {
    crate::transaction::rollback_all_for_pool(name).await;

    let mut registry = REGISTRY.write().await;
    if let Some(entry) = registry.remove(name) {
        entry.pool.close().await;
    }
}

/// Closes every registered pool, for process shutdown.
pub async fn close_all() {
    let names: Vec<String> = {
        let registry = REGISTRY.read().await;
        registry.keys().cloned().collect()
    };
    for name in &names {
        crate::transaction::rollback_all_for_pool(name).await;
    }

    let mut registry = REGISTRY.write().await;
    for (_, entry) in registry.drain() {
        entry.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sqlite_pragmas_match_documented_defaults() {
        let config = PoolConfig::default();
        let get = |pragma: &str| {
            config.sqlite_pragmas.iter().find(|(p, _)| p == pragma).map(|(_, v)| v.as_str())
        };
        assert_eq!(get("journal_mode"), Some("WAL"));
        assert_eq!(get("synchronous"), Some("NORMAL"));
        assert_eq!(get("cache_size"), Some("10000"));
        assert_eq!(get("busy_timeout"), Some("5000"));
    }

    #[test]
    fn rejects_zero_max_connections() {
        let config = PoolConfig { max_connections: 0, ..PoolConfig::default() };
        assert_eq!(config.validate().unwrap_err().kind(), "CONFIG");
    }

    #[test]
    fn rejects_min_exceeding_max() {
        let config = PoolConfig { min_connections: 5, max_connections: 2, ..PoolConfig::default() };
        assert_eq!(config.validate().unwrap_err().kind(), "CONFIG");
    }

    #[test]
    fn rejects_zero_acquire_timeout() {
        let config = PoolConfig { acquire_timeout: Duration::ZERO, ..PoolConfig::default() };
        assert_eq!(config.validate().unwrap_err().kind(), "CONFIG");
    }

    #[tokio::test]
    async fn close_of_unknown_pool_is_a_no_op() {
        close("never-registered").await;
    }

    #[tokio::test]
    async fn get_of_unknown_pool_is_usage_error() {
        let err = get("never-registered-either").await.unwrap_err();
        assert_eq!(err.kind(), "USAGE");
    }
}
