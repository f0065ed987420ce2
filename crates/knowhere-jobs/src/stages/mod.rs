//! Stage handlers and the context they share.
//!
//! Every handler follows the same protocol: re-read the item, abort if its
//! stage moved on, run the AI call under a timeout, then commit artifacts and
//! the stage advance in one compare-and-set transaction. Failures bump the
//! retry counter and return; the recovery sweep picks the item up again.

mod embed;
mod summarize;

pub use embed::EmbedHandler;
pub use summarize::SummarizeHandler;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use knowhere_core::{
    knowledge_topic, new_v7, ContentCipher, Error, EventPublisher, KnowledgeItem, KnowledgeStore,
    PipelineEvent, Result, Stage, TokenUsage, UsageSubject,
};

use crate::config::PipelineConfig;
use crate::content;
use crate::usage::{UsageEvent, UsageRecorder};

/// What a handler invocation did. Used for logs and tests only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Artifacts committed and the stage advanced.
    Advanced,
    /// The item is gone or its stage no longer matches.
    Stale,
    /// The item could not be read; left for the sweep.
    Skipped,
    /// The attempt failed and was retry-counted.
    Retried,
    /// The attempt failed and exhausted the retry ceiling.
    DeadLettered,
}

/// A handler for one pipeline stage.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// The stage this handler consumes.
    fn stage(&self) -> Stage;

    /// Process one item. Never returns an error: failures are recorded on
    /// the item itself.
    async fn handle(&self, knowledge_id: Uuid) -> StageOutcome;
}

/// Collaborators shared by all stage handlers and the recovery sweep.
pub struct StageContext {
    pub store: Arc<dyn KnowledgeStore>,
    pub cipher: Arc<dyn ContentCipher>,
    pub publisher: Arc<dyn EventPublisher>,
    pub usage: UsageRecorder,
    pub config: PipelineConfig,
}

impl StageContext {
    /// Re-read an item and check that it is in one of `accepted` stages.
    pub(crate) async fn load(
        &self,
        knowledge_id: Uuid,
        accepted: &[Stage],
    ) -> std::result::Result<KnowledgeItem, StageOutcome> {
        match self.store.get(knowledge_id).await {
            Ok(Some(item)) if accepted.contains(&item.stage) => Ok(item),
            Ok(Some(item)) => {
                info!(
                    %knowledge_id,
                    stage = %item.stage,
                    expected = ?accepted,
                    "Stage moved on, skipping stale job"
                );
                Err(StageOutcome::Stale)
            }
            Ok(None) => {
                info!(%knowledge_id, "Knowledge item gone, skipping job");
                Err(StageOutcome::Stale)
            }
            Err(e) => {
                warn!(%knowledge_id, error = %e, "Failed to load knowledge item");
                Err(StageOutcome::Skipped)
            }
        }
    }

    /// Decrypt and normalize an item's content.
    pub(crate) fn plaintext(&self, item: &KnowledgeItem) -> Result<String> {
        let raw = self.cipher.decrypt_text(&item.content)?;
        content::normalize(item.content_type, &raw)
    }

    /// Run an AI call under the stage timeout.
    pub(crate) async fn with_stage_timeout<T>(
        &self,
        op: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let limit = self.config.stage_timeout;
        timeout(limit, fut).await.map_err(|_| {
            Error::Timeout(format!("{} after {}s", op, limit.as_secs()))
        })?
    }

    pub(crate) fn publish_advance(&self, item: &KnowledgeItem, from: Stage, to: Stage) {
        self.publisher.publish(
            &knowledge_topic(item.space_id),
            PipelineEvent::StageChanged {
                knowledge_id: item.id,
                space_id: item.space_id,
                from,
                to,
            },
        );
    }

    pub(crate) fn record_usage(&self, item: &KnowledgeItem, sub_type: &str, usage: TokenUsage) {
        self.usage.record(UsageEvent {
            space_id: item.space_id,
            user_id: item.user_id,
            subject: UsageSubject::Knowledge,
            object_id: item.id.to_string(),
            sub_type: sub_type.to_string(),
            call_id: new_v7(),
            usage,
        });
    }

    /// Count a failed attempt against the item.
    ///
    /// The counter update is best effort with its own timeout. When it
    /// reaches the retry ceiling the item is moved to `Failed`.
    pub async fn record_failure(
        &self,
        item: &KnowledgeItem,
        stage: Stage,
        err: &Error,
    ) -> StageOutcome {
        let retry_times = item.retry_times + 1;
        warn!(
            knowledge_id = %item.id,
            %stage,
            retry_times,
            error = %err,
            "Stage attempt failed"
        );

        let counted = match timeout(
            self.config.retry_update_timeout,
            self.store.set_retry_times(item.id, retry_times),
        )
        .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(knowledge_id = %item.id, error = %e, "Failed to update retry counter");
                false
            }
            Err(_) => {
                error!(knowledge_id = %item.id, "Retry counter update timed out");
                false
            }
        };

        let topic = knowledge_topic(item.space_id);
        self.publisher.publish(
            &topic,
            PipelineEvent::ProcessingFailed {
                knowledge_id: item.id,
                space_id: item.space_id,
                stage,
                retry_times,
                error: err.to_string(),
            },
        );

        if !counted || retry_times < self.config.max_retry {
            return StageOutcome::Retried;
        }

        match self.store.mark_failed(item.id, item.stage).await {
            Ok(true) => {
                warn!(knowledge_id = %item.id, %stage, retry_times, "Retries exhausted, item dead-lettered");
                self.publisher.publish(
                    &topic,
                    PipelineEvent::DeadLettered {
                        knowledge_id: item.id,
                        space_id: item.space_id,
                        stage,
                        retry_times,
                    },
                );
                StageOutcome::DeadLettered
            }
            Ok(false) => StageOutcome::Retried,
            Err(e) => {
                error!(knowledge_id = %item.id, error = %e, "Failed to dead-letter item");
                StageOutcome::Retried
            }
        }
    }
}
