//! Shared-lock helpers for per-item processing and usage dedupe.
//!
//! A processing lock is held for the whole stage handler and renewed in the
//! background at a third of its lease, so slow AI calls do not let the lease
//! lapse under a live holder. Usage writes take the same kind of lock per
//! (object, sub-type) so concurrent duplicates are skipped.

use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use knowhere_core::defaults::LOCK_DOMAIN;
use knowhere_core::{LockLease, LockStore, UsageSubject};

/// Lock key guarding all stage work on one item.
pub fn process_key(knowledge_id: Uuid) -> String {
    format!("{}:process:{}", LOCK_DOMAIN, knowledge_id)
}

/// Lock key held while one usage row is written.
pub fn usage_key(subject: UsageSubject, object_id: &str, sub_type: &str) -> String {
    format!("{}:{}:{}:{}", LOCK_DOMAIN, subject, object_id, sub_type)
}

/// Result of [`LockGuard::with_lock`].
#[derive(Debug, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// The lock was acquired and the closure ran.
    Ran(T),
    /// Someone else holds the lock, or the lock store was unavailable.
    Skipped,
}

impl<T> LockOutcome<T> {
    pub fn ran(self) -> Option<T> {
        match self {
            LockOutcome::Ran(v) => Some(v),
            LockOutcome::Skipped => None,
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs work under a named lease from a [`LockStore`].
#[derive(Clone)]
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    lease: Duration,
}

impl LockGuard {
    pub fn new(store: Arc<dyn LockStore>, lease: Duration) -> Self {
        Self { store, lease }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Run `f` only if `key` can be acquired right now.
    ///
    /// The lease is renewed until `f` finishes and released afterwards, also
    /// when `f` panics. The panic is then resumed on the caller.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, f: F) -> LockOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = match self.store.try_acquire(key, self.lease).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(key, "Lock held elsewhere, skipping");
                return LockOutcome::Skipped;
            }
            Err(e) => {
                warn!(key, error = %e, "Lock acquire failed, skipping");
                return LockOutcome::Skipped;
            }
        };

        let heartbeat = AbortOnDrop(self.spawn_heartbeat(lease.clone()));
        let result = AssertUnwindSafe(f()).catch_unwind().await;
        drop(heartbeat);

        if let Err(e) = self.store.release(&lease).await {
            warn!(key, error = %e, "Lock release failed, lease will expire");
        }

        match result {
            Ok(value) => LockOutcome::Ran(value),
            Err(panic) => resume_unwind(panic),
        }
    }

    fn spawn_heartbeat(&self, lease: LockLease) -> JoinHandle<()> {
        let store = self.store.clone();
        let ttl = self.lease;
        let every = (ttl / 3).max(Duration::from_millis(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                match store.renew(&lease, ttl).await {
                    Ok(true) => debug!(key = %lease.key, "Lease renewed"),
                    Ok(false) => {
                        warn!(key = %lease.key, "Lease lost before work finished");
                        break;
                    }
                    Err(e) => warn!(key = %lease.key, error = %e, "Lease renewal failed"),
                }
            }
        })
    }
}
