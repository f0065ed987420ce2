//! Summarize stage: content → title, summary, tags, date and chunks.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use knowhere_core::{
    new_v7, ContentCipher, KnowledgeChunk, KnowledgeItem, KnowledgeStore, Result, Stage,
    StageAdvance, SummarizeOutput, Summarizer, SummaryCommit, SummaryDirective, SummaryField,
};

use super::{StageContext, StageHandler, StageOutcome};
use crate::usage::SUB_TYPE_SUMMARIZE;

pub struct SummarizeHandler {
    ctx: Arc<StageContext>,
    summarizer: Arc<dyn Summarizer>,
}

impl SummarizeHandler {
    pub fn new(ctx: Arc<StageContext>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self { ctx, summarizer }
    }

    async fn run(&self, item: &KnowledgeItem) -> Result<StageOutcome> {
        let start = Instant::now();
        let text = self.ctx.plaintext(item)?;
        let output = self
            .ctx
            .with_stage_timeout("summarize", self.summarizer.summarize(&text))
            .await?;
        self.ctx
            .record_usage(item, SUB_TYPE_SUMMARIZE, output.usage.clone());

        let commit = build_commit(
            item,
            &item.directive(),
            output,
            &text,
            self.ctx.cipher.as_ref(),
        )?;
        let chunk_count = commit.chunks.as_ref().map(Vec::len);

        let advance = StageAdvance {
            from: item.stage,
            to: Stage::Embedding,
        };
        if !self
            .ctx
            .store
            .replace_chunks_and_advance(item.id, advance, commit)
            .await?
        {
            info!(knowledge_id = %item.id, "Stage changed during summarize, discarding result");
            return Ok(StageOutcome::Stale);
        }

        info!(
            knowledge_id = %item.id,
            op = "summarize",
            chunks = ?chunk_count,
            duration_ms = start.elapsed().as_millis() as u64,
            "Summarize committed"
        );
        self.ctx.publish_advance(item, advance.from, advance.to);
        Ok(StageOutcome::Advanced)
    }
}

#[async_trait]
impl StageHandler for SummarizeHandler {
    fn stage(&self) -> Stage {
        Stage::Summarize
    }

    async fn handle(&self, knowledge_id: Uuid) -> StageOutcome {
        // `None` items are promoted straight into summarization.
        let item = match self
            .ctx
            .load(knowledge_id, &[Stage::None, Stage::Summarize])
            .await
        {
            Ok(item) => item,
            Err(outcome) => return outcome,
        };
        match self.run(&item).await {
            Ok(outcome) => outcome,
            Err(e) => self.ctx.record_failure(&item, Stage::Summarize, &e).await,
        }
    }
}

/// Keep only the fields the directive asks for and encrypt the chunks.
fn build_commit(
    item: &KnowledgeItem,
    directive: &SummaryDirective,
    output: SummarizeOutput,
    normalized: &str,
    cipher: &dyn ContentCipher,
) -> Result<SummaryCommit> {
    let chunks = if directive.includes(SummaryField::Chunks) {
        let mut texts: Vec<String> = output
            .chunks
            .into_iter()
            .filter(|c| !c.trim().is_empty())
            .collect();
        if texts.is_empty() {
            debug!(knowledge_id = %item.id, "No chunks returned, using whole content");
            texts.push(normalized.to_string());
        }
        let now = Utc::now();
        let chunks = texts
            .iter()
            .enumerate()
            .map(|(index, text)| {
                Ok(KnowledgeChunk {
                    id: new_v7(),
                    knowledge_id: item.id,
                    space_id: item.space_id,
                    user_id: item.user_id,
                    chunk_index: index as i32,
                    content: cipher.encrypt(text.as_bytes())?,
                    created_at: now,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Some(chunks)
    } else {
        None
    };

    Ok(SummaryCommit {
        chunks,
        title: output
            .title
            .filter(|_| directive.includes(SummaryField::Title)),
        summary: output
            .summary
            .filter(|_| directive.includes(SummaryField::Summary)),
        tags: directive
            .includes(SummaryField::Tags)
            .then_some(output.tags),
        maybe_date: output
            .date
            .filter(|_| directive.includes(SummaryField::Date)),
    })
}
