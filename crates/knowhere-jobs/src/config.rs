//! Pipeline configuration.

use std::time::Duration;

use knowhere_core::defaults;

/// Configuration for the knowledge pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Whether to start stage workers and the sweep.
    pub enabled: bool,
    /// Workers per stage.
    pub concurrency: usize,
    /// Capacity of each stage queue.
    pub queue_capacity: usize,
    /// How long `enqueue` waits for capacity before reporting busy.
    pub enqueue_timeout: Duration,
    /// Timeout for the AI call inside a stage handler.
    pub stage_timeout: Duration,
    /// Timeout for the retry counter update after a failure.
    pub retry_update_timeout: Duration,
    /// Lease of the per-item processing lock.
    pub lock_lease: Duration,
    /// Lease of the per-(object, sub-type) usage write lock.
    pub usage_lock_lease: Duration,
    /// Retry ceiling.
    pub max_retry: i32,
    pub sweep_interval: Duration,
    pub sweep_page_size: i64,
    /// Usage workers per subject queue.
    pub usage_workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: defaults::PIPELINE_CONCURRENCY,
            queue_capacity: defaults::STAGE_QUEUE_CAPACITY,
            enqueue_timeout: Duration::from_millis(defaults::ENQUEUE_TIMEOUT_MS),
            stage_timeout: Duration::from_secs(defaults::STAGE_TIMEOUT_SECS),
            retry_update_timeout: Duration::from_secs(defaults::RETRY_UPDATE_TIMEOUT_SECS),
            lock_lease: Duration::from_secs(defaults::PROCESS_LOCK_LEASE_SECS),
            usage_lock_lease: Duration::from_secs(defaults::USAGE_LOCK_LEASE_SECS),
            max_retry: defaults::MAX_RETRY_TIMES,
            sweep_interval: Duration::from_secs(defaults::SWEEP_INTERVAL_SECS),
            sweep_page_size: defaults::SWEEP_PAGE_SIZE,
            usage_workers: defaults::USAGE_WORKERS,
        }
    }
}

/// Shortest sweep period accepted; `tokio::time::interval` rejects zero.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl PipelineConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `PIPELINE_ENABLED` | `true` | Start workers and sweep |
    /// | `PIPELINE_CONCURRENCY` | `4` | Workers per stage |
    /// | `PIPELINE_QUEUE_CAPACITY` | `1000` | Per-stage queue capacity |
    /// | `PIPELINE_ENQUEUE_TIMEOUT_MS` | `5000` | Enqueue wait before `Busy` |
    /// | `PIPELINE_STAGE_TIMEOUT_SECS` | `300` | AI call timeout |
    /// | `PIPELINE_LOCK_LEASE_SECS` | `180` | Processing lock lease |
    /// | `PIPELINE_MAX_RETRY` | `3` | Retry ceiling |
    /// | `PIPELINE_SWEEP_INTERVAL_SECS` | `60` | Recovery sweep interval |
    /// | `PIPELINE_SWEEP_PAGE_SIZE` | `20` | Items per sweep page |
    /// | `USAGE_WORKERS` | `2` | Usage workers per subject |
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            enabled: std::env::var("PIPELINE_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(d.enabled),
            concurrency: env_parse::<usize>("PIPELINE_CONCURRENCY")
                .unwrap_or(d.concurrency)
                .max(1),
            queue_capacity: env_parse::<usize>("PIPELINE_QUEUE_CAPACITY")
                .unwrap_or(d.queue_capacity)
                .max(1),
            enqueue_timeout: env_parse("PIPELINE_ENQUEUE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.enqueue_timeout),
            stage_timeout: env_parse("PIPELINE_STAGE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.stage_timeout),
            retry_update_timeout: d.retry_update_timeout,
            lock_lease: env_parse("PIPELINE_LOCK_LEASE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.lock_lease),
            usage_lock_lease: d.usage_lock_lease,
            max_retry: env_parse::<i32>("PIPELINE_MAX_RETRY")
                .unwrap_or(d.max_retry)
                .max(1),
            sweep_interval: env_parse::<u64>("PIPELINE_SWEEP_INTERVAL_SECS")
                .map(|secs| Duration::from_secs(secs.max(1)))
                .unwrap_or(d.sweep_interval),
            sweep_page_size: env_parse::<i64>("PIPELINE_SWEEP_PAGE_SIZE")
                .unwrap_or(d.sweep_page_size)
                .max(1),
            usage_workers: env_parse::<usize>("USAGE_WORKERS")
                .unwrap_or(d.usage_workers)
                .max(1),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    pub fn with_max_retry(mut self, max_retry: i32) -> Self {
        self.max_retry = max_retry.max(1);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval.max(MIN_SWEEP_INTERVAL);
        self
    }

    pub fn with_sweep_page_size(mut self, page_size: i64) -> Self {
        self.sweep_page_size = page_size.max(1);
        self
    }

    pub fn with_usage_workers(mut self, workers: usize) -> Self {
        self.usage_workers = workers.max(1);
        self
    }
}
