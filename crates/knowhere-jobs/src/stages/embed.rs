//! Embedding stage: chunks → one vector each.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use knowhere_core::{
    new_v7, ContentCipher, EmbeddingBackend, Error, KnowledgeItem, KnowledgeKind, KnowledgeStore,
    Result, Stage, StageAdvance, VectorRecord,
};

use super::{StageContext, StageHandler, StageOutcome};
use crate::usage::SUB_TYPE_EMBEDDING;

/// A text to embed and the chunk it came from (`None` for a synthetic chunk).
struct EmbedInput {
    chunk_id: Option<Uuid>,
    text: String,
}

pub struct EmbedHandler {
    ctx: Arc<StageContext>,
    embedder: Arc<dyn EmbeddingBackend>,
}

impl EmbedHandler {
    pub fn new(ctx: Arc<StageContext>, embedder: Arc<dyn EmbeddingBackend>) -> Self {
        Self { ctx, embedder }
    }

    /// Atomic items embed their whole content; long-form items embed their
    /// persisted chunks.
    async fn inputs(&self, item: &KnowledgeItem) -> Result<Vec<EmbedInput>> {
        if item.kind == KnowledgeKind::LongForm {
            let chunks = self.ctx.store.list_chunks(item.id).await?;
            if !chunks.is_empty() {
                return chunks
                    .iter()
                    .map(|chunk| {
                        Ok(EmbedInput {
                            chunk_id: Some(chunk.id),
                            text: self.ctx.cipher.decrypt_text(&chunk.content)?,
                        })
                    })
                    .collect();
            }
            debug!(knowledge_id = %item.id, "Long-form item has no chunks, embedding whole content");
        }
        Ok(vec![EmbedInput {
            chunk_id: None,
            text: self.ctx.plaintext(item)?,
        }])
    }

    async fn run(&self, item: &KnowledgeItem) -> Result<StageOutcome> {
        let start = Instant::now();
        let inputs = self.inputs(item).await?;
        let texts: Vec<String> = inputs.iter().map(|i| i.text.clone()).collect();

        let output = self
            .ctx
            .with_stage_timeout("embedding", self.embedder.embed_batch(&texts))
            .await?;
        self.ctx
            .record_usage(item, SUB_TYPE_EMBEDDING, output.usage.clone());

        if output.vectors.len() != inputs.len() {
            return Err(Error::Invariant(format!(
                "{} vectors for {} chunks",
                output.vectors.len(),
                inputs.len()
            )));
        }

        let now = Utc::now();
        let vectors: Vec<VectorRecord> = inputs
            .into_iter()
            .zip(output.vectors)
            .map(|(input, embedding)| VectorRecord {
                id: new_v7(),
                knowledge_id: item.id,
                chunk_id: input.chunk_id,
                space_id: item.space_id,
                user_id: item.user_id,
                embedding,
                model: output.model.clone(),
                created_at: now,
            })
            .collect();
        let count = vectors.len();

        let advance = StageAdvance {
            from: Stage::Embedding,
            to: Stage::Done,
        };
        if !self
            .ctx
            .store
            .replace_vectors_and_advance(item.id, advance, vectors)
            .await?
        {
            info!(knowledge_id = %item.id, "Stage changed during embedding, discarding vectors");
            return Ok(StageOutcome::Stale);
        }

        info!(
            knowledge_id = %item.id,
            op = "embedding",
            vectors = count,
            model = %output.model,
            duration_ms = start.elapsed().as_millis() as u64,
            "Embedding committed"
        );
        self.ctx.publish_advance(item, advance.from, advance.to);
        Ok(StageOutcome::Advanced)
    }
}

#[async_trait]
impl StageHandler for EmbedHandler {
    fn stage(&self) -> Stage {
        Stage::Embedding
    }

    async fn handle(&self, knowledge_id: Uuid) -> StageOutcome {
        let item = match self.ctx.load(knowledge_id, &[Stage::Embedding]).await {
            Ok(item) => item,
            Err(outcome) => return outcome,
        };
        match self.run(&item).await {
            Ok(outcome) => outcome,
            Err(e) => self.ctx.record_failure(&item, Stage::Embedding, &e).await,
        }
    }
}
