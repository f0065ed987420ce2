//! Postgres pool sizing and construction.
//!
//! Every stage worker holds at most one connection at a time, as do the
//! recovery sweep and each usage writer, so the pool is sized from the
//! pipeline's worker counts rather than a fixed number.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use knowhere_core::{Error, Result};

/// Connections reserved for the recovery sweep and ad-hoc calls
/// (`content_updated`, dead-letter listing).
const RESERVED_CONNECTIONS: u32 = 2;

pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a worker waits for a free connection before its store call
    /// fails and the attempt is retry-counted.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::for_pipeline(
            knowhere_core::defaults::PIPELINE_CONCURRENCY,
            knowhere_core::defaults::USAGE_WORKERS,
        )
    }
}

impl PoolConfig {
    /// Size the pool for two stage pools of `concurrency` workers plus
    /// `usage_workers` writers per usage subject.
    pub fn for_pipeline(concurrency: usize, usage_workers: usize) -> Self {
        let subjects = knowhere_core::UsageSubject::ALL.len();
        let workers = 2 * concurrency + subjects * usage_workers;
        Self {
            max_connections: workers as u32 + RESERVED_CONNECTIONS,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }

    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `DATABASE_MAX_CONNECTIONS` and `DATABASE_ACQUIRE_TIMEOUT_SECS`
    /// when set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_parse::<u32>("DATABASE_MAX_CONNECTIONS") {
            self.max_connections = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("DATABASE_ACQUIRE_TIMEOUT_SECS") {
            self.acquire_timeout = Duration::from_secs(secs);
        }
        self
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n.max(1);
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let start = Instant::now();

    info!(
        subsystem = "database",
        component = "pool",
        max_connections = config.max_connections,
        acquire_timeout_secs = config.acquire_timeout.as_secs(),
        "Connecting to Postgres"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections.min(config.max_connections))
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "database",
        component = "pool",
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Postgres pool ready"
    );
    Ok(pool)
}

/// Log pool occupancy. Warns when every connection is checked out, which
/// usually means stage workers are queueing on the database.
pub fn log_pool_metrics(pool: &PgPool) {
    let size = pool.size();
    let idle = pool.num_idle();

    debug!(
        subsystem = "database",
        component = "pool",
        pool_size = size,
        pool_idle = idle,
        "Pool occupancy"
    );

    if idle == 0 && size > 0 {
        warn!(
            subsystem = "database",
            component = "pool",
            pool_size = size,
            "All pool connections in use"
        );
    }
}
