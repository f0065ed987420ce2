//! Shared harness: a pipeline over the in-memory store and lock with mock AI.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use knowhere_core::{
    ContentCipher, ContentType, EventBus, EventEnvelope, KnowledgeItem, KnowledgeKind,
    PipelineEvent, Stage,
};
use knowhere_crypto::{generate_key, AesContentCipher};
use knowhere_db::{MemoryKnowledgeStore, MemoryLockStore, MemoryUsageRepository};
use knowhere_inference::mock::{MockEmbedder, MockSummarizer};
use knowhere_jobs::{KnowledgeProcess, PipelineConfig};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub store: Arc<MemoryKnowledgeStore>,
    pub usage: Arc<MemoryUsageRepository>,
    pub locks: Arc<MemoryLockStore>,
    pub cipher: Arc<AesContentCipher>,
    pub summarizer: Arc<MockSummarizer>,
    pub embedder: Arc<MockEmbedder>,
    pub bus: EventBus,
    pub process: KnowledgeProcess,
}

/// Config with short timings so tests finish quickly.
pub fn fast_config() -> PipelineConfig {
    PipelineConfig::default()
        .with_concurrency(2)
        .with_enqueue_timeout(Duration::from_millis(50))
        .with_sweep_interval(Duration::from_millis(50))
}

impl Harness {
    pub fn new(summarizer: MockSummarizer, embedder: MockEmbedder, config: PipelineConfig) -> Self {
        let store = Arc::new(MemoryKnowledgeStore::new());
        let usage = Arc::new(MemoryUsageRepository::new());
        let locks = Arc::new(MemoryLockStore::new());
        let cipher = Arc::new(AesContentCipher::new(generate_key()));
        let summarizer = Arc::new(summarizer);
        let embedder = Arc::new(embedder);
        let bus = EventBus::new(256);

        let process = KnowledgeProcess::builder()
            .store(store.clone())
            .usage_repository(usage.clone())
            .locks(locks.clone())
            .cipher(cipher.clone())
            .summarizer(summarizer.clone())
            .embedder(embedder.clone())
            .publisher(Arc::new(bus.clone()))
            .config(config)
            .build()
            .expect("pipeline builds");

        Self {
            store,
            usage,
            locks,
            cipher,
            summarizer,
            embedder,
            bus,
            process,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(MockSummarizer::new(), MockEmbedder::new(), fast_config())
    }

    pub fn item(
        &self,
        kind: KnowledgeKind,
        content_type: ContentType,
        stage: Stage,
        text: &str,
    ) -> KnowledgeItem {
        let now = Utc::now();
        KnowledgeItem {
            id: Uuid::new_v4(),
            space_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            kind,
            content_type,
            content: self.cipher.encrypt(text.as_bytes()).unwrap(),
            title: String::new(),
            summary: String::new(),
            tags: Vec::new(),
            maybe_date: None,
            stage,
            retry_times: 0,
            summarize_directive: None,
            created_at: now,
            updated_at: now,
            expired_at: None,
        }
    }

    /// Insert a markdown item awaiting summarization.
    pub async fn insert_new(&self, kind: KnowledgeKind, text: &str) -> KnowledgeItem {
        let item = self.item(kind, ContentType::Markdown, Stage::Summarize, text);
        self.store.insert(item.clone()).await;
        item
    }

    /// Poll until the item reaches `stage`, failing the test after [`WAIT`].
    pub async fn wait_for_stage(&self, id: Uuid, stage: Stage) {
        let reached = tokio::time::timeout(WAIT, async {
            loop {
                if self.store.stage_of(id).await == Some(stage) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(
            reached.is_ok(),
            "item {} never reached {:?}, stuck at {:?}",
            id,
            stage,
            self.store.stage_of(id).await
        );
    }

    /// Poll until `check` holds, failing the test after [`WAIT`].
    pub async fn wait_until<F, Fut>(&self, what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let done = tokio::time::timeout(WAIT, async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(done.is_ok(), "timed out waiting for {}", what);
    }
}

/// Drain every event already delivered to `rx`.
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<EventEnvelope>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope.payload);
    }
    events
}
