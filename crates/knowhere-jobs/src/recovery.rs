//! Recovery sweep: rediscovers items whose queued job was lost.
//!
//! Queues carry no durability, so anything in flight at shutdown, dropped as
//! busy, or failed and retry-counted is found here again and re-enqueued.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use knowhere_core::{ContentCipher, KnowledgeStore, Result};

use crate::config::MIN_SWEEP_INTERVAL;
use crate::dispatcher::{Dispatcher, EnqueueOutcome};
use crate::stages::StageContext;

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub enqueued: usize,
    pub undecryptable: usize,
}

pub struct RecoverySweep {
    ctx: Arc<StageContext>,
    dispatcher: Arc<Dispatcher>,
}

impl RecoverySweep {
    pub fn new(ctx: Arc<StageContext>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { ctx, dispatcher }
    }

    /// Page through unfinished items below the retry ceiling, oldest first,
    /// and enqueue each on its stage queue.
    ///
    /// Pages follow a `(updated_at, id)` cursor. Rows touched during the pass
    /// (by this sweep or by running workers) reappear after the cursor and
    /// are skipped, so each item is handled at most once per pass.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let config = &self.ctx.config;
        let mut report = SweepReport::default();
        let mut cursor = None;
        let mut seen = HashSet::new();
        let now = Utc::now();

        loop {
            let page = self
                .ctx
                .store
                .list_unfinished(config.max_retry, config.sweep_page_size, cursor)
                .await?;
            let fetched = page.len() as i64;
            cursor = page.last().map(|item| item.cursor()).or(cursor);

            for item in page {
                if !seen.insert(item.id) {
                    continue;
                }
                report.scanned += 1;
                if item.stage.is_terminal()
                    || item.retry_times >= config.max_retry
                    || item.is_expired(now)
                {
                    continue;
                }
                if let Err(e) = self.ctx.cipher.decrypt(&item.content) {
                    report.undecryptable += 1;
                    self.ctx.record_failure(&item, item.stage, &e).await;
                    continue;
                }
                match self.dispatcher.enqueue_blocking(item.id, item.stage).await {
                    EnqueueOutcome::Queued => report.enqueued += 1,
                    EnqueueOutcome::Closed => {
                        debug!(subsystem = "sweep", "Dispatcher closed, stopping sweep");
                        return Ok(report);
                    }
                    EnqueueOutcome::Busy | EnqueueOutcome::Terminal => {}
                }
            }

            if fetched < config.sweep_page_size {
                break;
            }
        }

        Ok(report)
    }

    /// Sweep immediately and then every sweep interval until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.ctx.config.sweep_interval.max(MIN_SWEEP_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            subsystem = "sweep",
            interval_secs = self.ctx.config.sweep_interval.as_secs(),
            "Recovery sweep started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.sweep_once().await {
                    Ok(report) if report.scanned > 0 => info!(
                        subsystem = "sweep",
                        scanned = report.scanned,
                        enqueued = report.enqueued,
                        undecryptable = report.undecryptable,
                        "Recovery sweep finished"
                    ),
                    Ok(_) => debug!(subsystem = "sweep", "Nothing to recover"),
                    Err(e) => error!(subsystem = "sweep", error = %e, "Recovery sweep failed"),
                },
            }
        }
        info!(subsystem = "sweep", "Recovery sweep stopped");
    }
}
