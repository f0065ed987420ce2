//! PostgreSQL implementation of [`KnowledgeStore`].
//!
//! Stage commits are compare-and-set: the `UPDATE ... WHERE stage = $from`
//! runs first inside the transaction, and artifacts are only replaced when it
//! matched a row.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row, Transaction};
use uuid::Uuid;

use knowhere_core::{
    Error, KnowledgeChunk, KnowledgeItem, KnowledgeStore, Result, Stage, StageAdvance,
    SummaryCommit, SummaryDirective, SweepCursor, VectorRecord,
};

const ITEM_COLUMNS: &str = "id, space_id, user_id, kind, content_type, content, title, summary, \
     tags, maybe_date, stage, retry_times, summarize_directive, created_at, updated_at, expired_at";

/// PostgreSQL knowledge repository.
#[derive(Clone)]
pub struct PgKnowledgeRepository {
    pool: Pool<Postgres>,
}

impl PgKnowledgeRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Insert a new item. Creation belongs to the ingest path; the pipeline
    /// itself never calls this.
    pub async fn insert(&self, item: &KnowledgeItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO knowledge (id, space_id, user_id, kind, content_type, content, title,
                 summary, tags, maybe_date, stage, retry_times, summarize_directive,
                 created_at, updated_at, expired_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(item.id)
        .bind(item.space_id)
        .bind(item.user_id)
        .bind(item.kind.as_str())
        .bind(item.content_type.as_str())
        .bind(&item.content)
        .bind(&item.title)
        .bind(&item.summary)
        .bind(&item.tags)
        .bind(&item.maybe_date)
        .bind(item.stage.as_str())
        .bind(item.retry_times)
        .bind(item.summarize_directive.as_ref().map(Json))
        .bind(item.created_at)
        .bind(item.updated_at)
        .bind(item.expired_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Vectors currently stored for an item.
    pub async fn list_vectors(&self, knowledge_id: Uuid) -> Result<Vec<VectorRecord>> {
        let rows = sqlx::query(
            "SELECT v.id, v.knowledge_id, v.chunk_id, v.space_id, v.user_id, v.embedding,
                    v.model, v.created_at
             FROM knowledge_vector v
             LEFT JOIN knowledge_chunk c ON c.id = v.chunk_id
             WHERE v.knowledge_id = $1
             ORDER BY c.chunk_index NULLS FIRST",
        )
        .bind(knowledge_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(VectorRecord {
                    id: row.try_get("id")?,
                    knowledge_id: row.try_get("knowledge_id")?,
                    chunk_id: row.try_get("chunk_id")?,
                    space_id: row.try_get("space_id")?,
                    user_id: row.try_get("user_id")?,
                    embedding: row.try_get("embedding")?,
                    model: row.try_get("model")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// Advance the stage inside `tx` only while it still equals `advance.from`.
    async fn advance_tx(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        advance: StageAdvance,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE knowledge SET stage = $3, updated_at = NOW()
             WHERE id = $1 AND stage = $2",
        )
        .bind(id)
        .bind(advance.from.as_str())
        .bind(advance.to.as_str())
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn row_to_item(row: &PgRow) -> Result<KnowledgeItem> {
    let kind: String = row.try_get("kind")?;
    let content_type: String = row.try_get("content_type")?;
    let stage: String = row.try_get("stage")?;
    let directive: Option<Json<SummaryDirective>> = row.try_get("summarize_directive")?;

    Ok(KnowledgeItem {
        id: row.try_get("id")?,
        space_id: row.try_get("space_id")?,
        user_id: row.try_get("user_id")?,
        kind: kind.parse()?,
        content_type: content_type.parse()?,
        content: row.try_get("content")?,
        title: row.try_get("title")?,
        summary: row.try_get("summary")?,
        tags: row.try_get("tags")?,
        maybe_date: row.try_get("maybe_date")?,
        stage: stage.parse()?,
        retry_times: row.try_get("retry_times")?,
        summarize_directive: directive.map(|Json(d)| d),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        expired_at: row.try_get("expired_at")?,
    })
}

fn row_to_chunk(row: &PgRow) -> Result<KnowledgeChunk> {
    Ok(KnowledgeChunk {
        id: row.try_get("id")?,
        knowledge_id: row.try_get("knowledge_id")?,
        space_id: row.try_get("space_id")?,
        user_id: row.try_get("user_id")?,
        chunk_index: row.try_get("chunk_index")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl KnowledgeStore for PgKnowledgeRepository {
    async fn get(&self, id: Uuid) -> Result<Option<KnowledgeItem>> {
        let row = sqlx::query(&format!("SELECT {} FROM knowledge WHERE id = $1", ITEM_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_item).transpose()
    }

    async fn list_unfinished(
        &self,
        max_retry: i32,
        page_size: i64,
        after: Option<SweepCursor>,
    ) -> Result<Vec<KnowledgeItem>> {
        let after_at = after.map(|c| c.updated_at);
        let after_id = after.map(|c| c.id);
        let rows = sqlx::query(&format!(
            "SELECT {} FROM knowledge
             WHERE stage NOT IN ('done', 'failed')
               AND retry_times < $1
               AND (expired_at IS NULL OR expired_at > NOW())
               AND ($3::TIMESTAMPTZ IS NULL OR (updated_at, id) > ($3, $4))
             ORDER BY updated_at ASC, id ASC
             LIMIT $2",
            ITEM_COLUMNS
        ))
        .bind(max_retry)
        .bind(page_size)
        .bind(after_at)
        .bind(after_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn list_exhausted(
        &self,
        max_retry: i32,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<KnowledgeItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM knowledge
             WHERE stage = 'failed'
                OR (stage NOT IN ('done', 'failed') AND retry_times >= $1)
             ORDER BY updated_at DESC, id ASC
             LIMIT $2 OFFSET $3",
            ITEM_COLUMNS
        ))
        .bind(max_retry)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn set_retry_times(&self, id: Uuid, retry_times: i32) -> Result<()> {
        let result = sqlx::query(
            "UPDATE knowledge SET retry_times = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(retry_times)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::KnowledgeNotFound(id));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, from: Stage) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE knowledge SET stage = 'failed', updated_at = NOW()
             WHERE id = $1 AND stage = $2",
        )
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn replace_chunks_and_advance(
        &self,
        id: Uuid,
        advance: StageAdvance,
        commit: SummaryCommit,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        if !Self::advance_tx(&mut tx, id, advance).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE knowledge SET
                 title = COALESCE($2, title),
                 summary = COALESCE($3, summary),
                 tags = COALESCE($4, tags),
                 maybe_date = COALESCE($5, maybe_date),
                 summarize_directive = NULL
             WHERE id = $1",
        )
        .bind(id)
        .bind(&commit.title)
        .bind(&commit.summary)
        .bind(&commit.tags)
        .bind(&commit.maybe_date)
        .execute(&mut *tx)
        .await?;

        if let Some(chunks) = &commit.chunks {
            sqlx::query("DELETE FROM knowledge_chunk WHERE knowledge_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;

            for chunk in chunks {
                sqlx::query(
                    "INSERT INTO knowledge_chunk
                         (id, knowledge_id, space_id, user_id, chunk_index, content, created_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)",
                )
                .bind(chunk.id)
                .bind(id)
                .bind(chunk.space_id)
                .bind(chunk.user_id)
                .bind(chunk.chunk_index)
                .bind(&chunk.content)
                .bind(chunk.created_at)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn list_chunks(&self, knowledge_id: Uuid) -> Result<Vec<KnowledgeChunk>> {
        let rows = sqlx::query(
            "SELECT id, knowledge_id, space_id, user_id, chunk_index, content, created_at
             FROM knowledge_chunk
             WHERE knowledge_id = $1
             ORDER BY chunk_index",
        )
        .bind(knowledge_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn replace_vectors_and_advance(
        &self,
        id: Uuid,
        advance: StageAdvance,
        vectors: Vec<VectorRecord>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        if !Self::advance_tx(&mut tx, id, advance).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM knowledge_vector WHERE knowledge_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for vector in &vectors {
            sqlx::query(
                "INSERT INTO knowledge_vector
                     (id, knowledge_id, chunk_id, space_id, user_id, embedding, model, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(vector.id)
            .bind(id)
            .bind(vector.chunk_id)
            .bind(vector.space_id)
            .bind(vector.user_id)
            .bind(&vector.embedding)
            .bind(&vector.model)
            .bind(vector.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn reset_for_reprocess(
        &self,
        id: Uuid,
        directive: Option<SummaryDirective>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE knowledge SET
                 stage = 'summarize',
                 retry_times = 0,
                 summarize_directive = $2,
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(directive.map(Json))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::KnowledgeNotFound(id));
        }
        Ok(())
    }
}
