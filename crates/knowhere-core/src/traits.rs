//! Port traits for the pipeline's external collaborators.
//!
//! Stage handlers only see these traits; concrete stores, AI clients, lock
//! stores and event transports live in the sibling crates and in tests.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::events::PipelineEvent;
use crate::models::*;

// =============================================================================
// STORE PORTS
// =============================================================================

/// Durable store for knowledge items and their derived chunks and vectors.
///
/// The store is the single source of truth for `stage` and `retry_times`.
/// The two `*_and_advance` methods are transactional: artifacts and stage are
/// written together or not at all.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Fetch an item by ID.
    async fn get(&self, id: Uuid) -> Result<Option<KnowledgeItem>>;

    /// Items not yet `Done`/`Failed`, below the retry ceiling and not expired,
    /// in `(updated_at, id)` order starting strictly after `after`.
    async fn list_unfinished(
        &self,
        max_retry: i32,
        page_size: i64,
        after: Option<SweepCursor>,
    ) -> Result<Vec<KnowledgeItem>>;

    /// Items that exhausted their retries (stage `Failed`, or unfinished with
    /// `retry_times >= max_retry`), for operator inspection.
    async fn list_exhausted(&self, max_retry: i32, limit: i64, offset: i64)
        -> Result<Vec<KnowledgeItem>>;

    /// Overwrite the retry counter.
    async fn set_retry_times(&self, id: Uuid, retry_times: i32) -> Result<()>;

    /// Move an item from `from` to `Failed`. Returns false if the stage moved.
    async fn mark_failed(&self, id: Uuid, from: Stage) -> Result<bool>;

    /// Replace chunks (when `commit.chunks` is set), apply summary fields,
    /// clear any re-summarization directive and advance the stage.
    ///
    /// Returns false without writing anything if the persisted stage no
    /// longer equals `advance.from`.
    async fn replace_chunks_and_advance(
        &self,
        id: Uuid,
        advance: StageAdvance,
        commit: SummaryCommit,
    ) -> Result<bool>;

    /// All chunks of an item ordered by `chunk_index`.
    async fn list_chunks(&self, knowledge_id: Uuid) -> Result<Vec<KnowledgeChunk>>;

    /// Delete the item's vectors, insert `vectors` and advance the stage.
    ///
    /// Returns false without writing anything if the persisted stage no
    /// longer equals `advance.from`.
    async fn replace_vectors_and_advance(
        &self,
        id: Uuid,
        advance: StageAdvance,
        vectors: Vec<VectorRecord>,
    ) -> Result<bool>;

    /// Reset an edited item for reprocessing: `retry_times = 0`,
    /// `stage = Summarize`, and the given re-summarization directive.
    async fn reset_for_reprocess(
        &self,
        id: Uuid,
        directive: Option<SummaryDirective>,
    ) -> Result<()>;
}

/// Append-only store for usage accounting.
#[async_trait]
pub trait UsageRepository: Send + Sync {
    async fn insert(&self, record: UsageRecord) -> Result<()>;
}

/// Encryption-at-rest for content blobs and chunk texts.
pub trait ContentCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt and interpret as UTF-8 text.
    fn decrypt_text(&self, blob: &[u8]) -> Result<String> {
        let bytes = self.decrypt(blob)?;
        String::from_utf8(bytes)
            .map_err(|e| crate::Error::Crypto(format!("content is not valid UTF-8: {}", e)))
    }
}

// =============================================================================
// AI PORTS
// =============================================================================

/// Summarization and chunking of normalized content.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<SummarizeOutput>;
}

/// Batch text embedding.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Embed all texts in one call. Implementations return one vector per
    /// input in input order, but callers must still verify the count.
    async fn embed_batch(&self, texts: &[String]) -> Result<EmbedOutput>;

    /// Get the model name.
    fn model_name(&self) -> &str;
}

// =============================================================================
// LOCK PORT
// =============================================================================

/// A held lease. The token identifies the holder so renew/release only ever
/// touch the caller's own lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub token: String,
}

/// Shared lock store with bounded leases (e.g. Redis `SET NX PX`).
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Non-blocking acquire. `Ok(None)` means somebody else holds the key.
    async fn try_acquire(&self, key: &str, lease: Duration) -> Result<Option<LockLease>>;

    /// Extend a held lease. Returns false if the lease was lost.
    async fn renew(&self, lease: &LockLease, ttl: Duration) -> Result<bool>;

    /// Release a held lease. Releasing a lost lease is not an error.
    async fn release(&self, lease: &LockLease) -> Result<()>;
}

// =============================================================================
// EVENT PORT
// =============================================================================

/// Fire-and-forget notification transport.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, topic: &str, event: PipelineEvent);
}

/// Publisher that drops every event.
pub struct NoOpPublisher;

impl EventPublisher for NoOpPublisher {
    fn publish(&self, _topic: &str, _event: PipelineEvent) {}
}
