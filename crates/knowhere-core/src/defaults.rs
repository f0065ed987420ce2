//! Centralized default constants for the knowhere pipeline.
//!
//! **This module is the single source of truth** for shared default values.
//! Config structs fall back to these when the matching environment variable
//! is unset.

// =============================================================================
// STAGE WORKERS
// =============================================================================

/// Workers per stage.
pub const PIPELINE_CONCURRENCY: usize = 4;

/// Capacity of each in-memory stage queue.
pub const STAGE_QUEUE_CAPACITY: usize = 1000;

/// How long `enqueue` waits for queue capacity before reporting busy.
pub const ENQUEUE_TIMEOUT_MS: u64 = 5_000;

/// Timeout for the AI call inside a stage handler (5 minutes).
pub const STAGE_TIMEOUT_SECS: u64 = 300;

/// Timeout for the best-effort retry counter update.
pub const RETRY_UPDATE_TIMEOUT_SECS: u64 = 10;

/// Retry ceiling. Items at or above it are no longer swept.
pub const MAX_RETRY_TIMES: i32 = 3;

// =============================================================================
// LOCKING
// =============================================================================

/// Key prefix shared by all pipeline locks.
pub const LOCK_DOMAIN: &str = "knowledge";

/// Lease for per-item processing locks (3 minutes).
///
/// Shorter than `STAGE_TIMEOUT_SECS`; the guard renews it while work runs.
pub const PROCESS_LOCK_LEASE_SECS: u64 = 180;

/// Lease for usage dedupe locks. Not released, so it bounds the dedupe window.
pub const USAGE_LOCK_LEASE_SECS: u64 = 180;

// =============================================================================
// RECOVERY SWEEP
// =============================================================================

/// Interval between recovery sweeps.
pub const SWEEP_INTERVAL_SECS: u64 = 60;

/// Items fetched per sweep page.
pub const SWEEP_PAGE_SIZE: i64 = 20;

// =============================================================================
// USAGE RECORDER
// =============================================================================

/// Usage workers per subject queue.
pub const USAGE_WORKERS: usize = 2;

/// Knowledge usage queue capacity (two records per item: summarize + embed).
pub const USAGE_QUEUE_KNOWLEDGE: usize = 1000;

/// Chat message usage queue capacity (highest burst volume).
pub const USAGE_QUEUE_CHAT_MESSAGE: usize = 5000;

/// Chat session usage queue capacity.
pub const USAGE_QUEUE_CHAT_SESSION: usize = 500;

/// Generic usage queue capacity.
pub const USAGE_QUEUE_GENERIC: usize = 1000;

// =============================================================================
// EVENTS
// =============================================================================

/// Broadcast buffer for the in-process event bus.
pub const EVENT_BUS_CAPACITY: usize = 256;
