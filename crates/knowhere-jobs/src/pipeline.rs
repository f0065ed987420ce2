//! `KnowledgeProcess`: the assembled pipeline.
//!
//! Built explicitly from its collaborators with [`KnowledgeProcessBuilder`];
//! there is no global instance. Tests build isolated pipelines over the
//! in-memory store and lock.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use knowhere_core::{
    ContentCipher, EmbeddingBackend, Error, EventPublisher, KnowledgeItem, KnowledgeStore,
    LockStore, NoOpPublisher, Result, Stage, Summarizer, SummaryDirective, UsageRepository,
};

use crate::config::PipelineConfig;
use crate::dispatcher::{Dispatcher, EnqueueOutcome, QueueDepths};
use crate::lock_guard::LockGuard;
use crate::recovery::{RecoverySweep, SweepReport};
use crate::stages::{EmbedHandler, StageContext, StageHandler, SummarizeHandler};
use crate::usage::UsageRecorder;

/// Builder for [`KnowledgeProcess`].
#[derive(Default)]
pub struct KnowledgeProcessBuilder {
    store: Option<Arc<dyn KnowledgeStore>>,
    cipher: Option<Arc<dyn ContentCipher>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    embedder: Option<Arc<dyn EmbeddingBackend>>,
    locks: Option<Arc<dyn LockStore>>,
    usage_repo: Option<Arc<dyn UsageRepository>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    config: PipelineConfig,
}

impl KnowledgeProcessBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, store: Arc<dyn KnowledgeStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn cipher(mut self, cipher: Arc<dyn ContentCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingBackend>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn locks(mut self, locks: Arc<dyn LockStore>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn usage_repository(mut self, repo: Arc<dyn UsageRepository>) -> Self {
        self.usage_repo = Some(repo);
        self
    }

    /// Event publisher. Defaults to dropping every event.
    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<KnowledgeProcess> {
        fn missing(name: &str) -> Error {
            Error::Config(format!("KnowledgeProcess requires a {}", name))
        }

        let store = self.store.ok_or_else(|| missing("knowledge store"))?;
        let cipher = self.cipher.ok_or_else(|| missing("content cipher"))?;
        let summarizer = self.summarizer.ok_or_else(|| missing("summarizer"))?;
        let embedder = self.embedder.ok_or_else(|| missing("embedding backend"))?;
        let locks = self.locks.ok_or_else(|| missing("lock store"))?;
        let usage_repo = self.usage_repo.ok_or_else(|| missing("usage repository"))?;
        let publisher = self
            .publisher
            .unwrap_or_else(|| Arc::new(NoOpPublisher) as Arc<dyn EventPublisher>);
        let config = self.config;

        let cancel = CancellationToken::new();
        let ctx = Arc::new(StageContext {
            store,
            cipher,
            publisher,
            usage: UsageRecorder::new(),
            config: config.clone(),
        });
        let dispatcher = Arc::new(Dispatcher::new(
            config.queue_capacity,
            config.enqueue_timeout,
            LockGuard::new(locks.clone(), config.lock_lease),
            cancel.clone(),
        ));
        let handlers: Vec<Arc<dyn StageHandler>> = vec![
            Arc::new(SummarizeHandler::new(ctx.clone(), summarizer)),
            Arc::new(EmbedHandler::new(ctx.clone(), embedder)),
        ];
        let sweep = Arc::new(RecoverySweep::new(ctx.clone(), dispatcher.clone()));

        Ok(KnowledgeProcess {
            ctx,
            dispatcher,
            handlers,
            sweep,
            usage_guard: LockGuard::new(locks, config.usage_lock_lease),
            usage_repo,
            config,
            cancel,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// The knowledge-processing pipeline.
pub struct KnowledgeProcess {
    ctx: Arc<StageContext>,
    dispatcher: Arc<Dispatcher>,
    handlers: Vec<Arc<dyn StageHandler>>,
    sweep: Arc<RecoverySweep>,
    usage_guard: LockGuard,
    usage_repo: Arc<dyn UsageRepository>,
    config: PipelineConfig,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KnowledgeProcess {
    pub fn builder() -> KnowledgeProcessBuilder {
        KnowledgeProcessBuilder::new()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Start stage workers, usage workers and the recovery sweep.
    ///
    /// Does nothing when the pipeline is disabled or already started.
    pub async fn start(&self) {
        if !self.config.enabled {
            info!("Knowledge pipeline is disabled, not starting");
            return;
        }
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("Knowledge pipeline already started");
            return;
        }

        tasks.extend(
            self.dispatcher
                .start(self.handlers.clone(), self.config.concurrency),
        );
        tasks.extend(self.ctx.usage.start(
            self.usage_repo.clone(),
            self.usage_guard.clone(),
            self.config.usage_workers,
            self.cancel.clone(),
        ));
        tasks.push(tokio::spawn(self.sweep.clone().run(self.cancel.clone())));

        info!(
            concurrency = self.config.concurrency,
            queue_capacity = self.config.queue_capacity,
            max_retry = self.config.max_retry,
            "Knowledge pipeline started"
        );
    }

    /// Hand a newly created or updated item to its stage queue.
    pub async fn enqueue(&self, item: &KnowledgeItem) -> EnqueueOutcome {
        self.dispatcher.enqueue(item.id, item.stage).await
    }

    /// Reprocess an item after its content changed.
    ///
    /// Resets the retry counter and moves the item back to `Summarize`.
    pub async fn content_updated(&self, knowledge_id: Uuid) -> Result<EnqueueOutcome> {
        self.reset(knowledge_id, None).await
    }

    /// Re-run summarization applying only the fields in `directive`.
    pub async fn resummarize(
        &self,
        knowledge_id: Uuid,
        directive: SummaryDirective,
    ) -> Result<EnqueueOutcome> {
        self.reset(knowledge_id, Some(directive)).await
    }

    async fn reset(
        &self,
        knowledge_id: Uuid,
        directive: Option<SummaryDirective>,
    ) -> Result<EnqueueOutcome> {
        self.ctx
            .store
            .reset_for_reprocess(knowledge_id, directive)
            .await?;
        info!(%knowledge_id, "Knowledge reset for reprocessing");
        Ok(self.dispatcher.enqueue(knowledge_id, Stage::Summarize).await)
    }

    /// Items that exhausted their retries, most recently touched first.
    pub async fn list_dead_lettered(&self, limit: i64, offset: i64) -> Result<Vec<KnowledgeItem>> {
        self.ctx
            .store
            .list_exhausted(self.config.max_retry, limit, offset)
            .await
    }

    pub fn queue_depths(&self) -> QueueDepths {
        self.dispatcher.queue_depths()
    }

    /// Run one recovery sweep now.
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        self.sweep.sweep_once().await
    }

    /// Stop all workers after their current item and wait for them.
    ///
    /// Queued stage jobs are dropped; the sweep finds them on next start.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = ?e, "Pipeline task ended abnormally");
            }
        }
        info!("Knowledge pipeline stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
