//! PostgreSQL implementation of [`UsageRepository`].

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use knowhere_core::{Result, UsageRecord, UsageRepository};

/// Append-only usage record repository. Re-inserting an existing ID is a
/// no-op.
#[derive(Clone)]
pub struct PgUsageRepository {
    pool: Pool<Postgres>,
}

impl PgUsageRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Number of rows recorded for one (object, sub-type) pair.
    pub async fn count_for_object(&self, object_id: &str, sub_type: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM usage_record WHERE object_id = $1 AND sub_type = $2",
        )
        .bind(object_id)
        .bind(sub_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Total tokens recorded for a space.
    pub async fn total_tokens_for_space(&self, space_id: Uuid) -> Result<i64> {
        let total: Option<i64> = sqlx::query_scalar(
            "SELECT SUM(prompt_tokens + output_tokens)::BIGINT FROM usage_record
             WHERE space_id = $1",
        )
        .bind(space_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total.unwrap_or(0))
    }
}

#[async_trait]
impl UsageRepository for PgUsageRepository {
    async fn insert(&self, record: UsageRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO usage_record (id, space_id, user_id, subject, object_id, sub_type,
                 model, prompt_tokens, output_tokens, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(record.id)
        .bind(record.space_id)
        .bind(record.user_id)
        .bind(record.subject.as_str())
        .bind(&record.object_id)
        .bind(&record.sub_type)
        .bind(&record.model)
        .bind(record.prompt_tokens)
        .bind(record.output_tokens)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
