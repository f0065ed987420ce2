//! In-memory store adapters.
//!
//! Same semantics as the PostgreSQL repositories, including the
//! compare-and-set stage commits, so pipeline tests and local runs can go
//! without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use knowhere_core::{
    Error, KnowledgeChunk, KnowledgeItem, KnowledgeStore, Result, Stage, StageAdvance,
    SummaryCommit, SummaryDirective, SweepCursor, UsageRecord, UsageRepository, VectorRecord,
};

#[derive(Default)]
struct State {
    items: HashMap<Uuid, KnowledgeItem>,
    chunks: HashMap<Uuid, Vec<KnowledgeChunk>>,
    vectors: HashMap<Uuid, Vec<VectorRecord>>,
}

/// Knowledge store held in a single mutex-guarded map.
#[derive(Default)]
pub struct MemoryKnowledgeStore {
    state: Mutex<State>,
}

impl MemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, item: KnowledgeItem) {
        self.state.lock().await.items.insert(item.id, item);
    }

    /// Seed chunks for an item, replacing any it had.
    pub async fn insert_chunks(&self, knowledge_id: Uuid, chunks: Vec<KnowledgeChunk>) {
        self.state.lock().await.chunks.insert(knowledge_id, chunks);
    }

    pub async fn list_vectors(&self, knowledge_id: Uuid) -> Vec<VectorRecord> {
        self.state
            .lock()
            .await
            .vectors
            .get(&knowledge_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn stage_of(&self, id: Uuid) -> Option<Stage> {
        self.state.lock().await.items.get(&id).map(|i| i.stage)
    }

    pub async fn retry_times_of(&self, id: Uuid) -> Option<i32> {
        self.state.lock().await.items.get(&id).map(|i| i.retry_times)
    }
}

fn sorted_by_updated(mut items: Vec<KnowledgeItem>, newest_first: bool) -> Vec<KnowledgeItem> {
    items.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
    if newest_first {
        items.reverse();
    }
    items
}

fn page(items: Vec<KnowledgeItem>, limit: i64, offset: i64) -> Vec<KnowledgeItem> {
    items
        .into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

#[async_trait]
impl KnowledgeStore for MemoryKnowledgeStore {
    async fn get(&self, id: Uuid) -> Result<Option<KnowledgeItem>> {
        Ok(self.state.lock().await.items.get(&id).cloned())
    }

    async fn list_unfinished(
        &self,
        max_retry: i32,
        page_size: i64,
        after: Option<SweepCursor>,
    ) -> Result<Vec<KnowledgeItem>> {
        let now = Utc::now();
        let state = self.state.lock().await;
        let items: Vec<_> = state
            .items
            .values()
            .filter(|i| !i.stage.is_terminal() && i.retry_times < max_retry && !i.is_expired(now))
            .filter(|i| after.map_or(true, |cursor| i.cursor() > cursor))
            .cloned()
            .collect();
        Ok(page(sorted_by_updated(items, false), page_size, 0))
    }

    async fn list_exhausted(
        &self,
        max_retry: i32,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<KnowledgeItem>> {
        let state = self.state.lock().await;
        let items: Vec<_> = state
            .items
            .values()
            .filter(|i| {
                i.stage == Stage::Failed || (!i.stage.is_terminal() && i.retry_times >= max_retry)
            })
            .cloned()
            .collect();
        Ok(page(sorted_by_updated(items, true), limit, offset))
    }

    async fn set_retry_times(&self, id: Uuid, retry_times: i32) -> Result<()> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(&id)
            .ok_or(Error::KnowledgeNotFound(id))?;
        item.retry_times = retry_times;
        item.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, from: Stage) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.items.get_mut(&id) {
            Some(item) if item.stage == from => {
                item.stage = Stage::Failed;
                item.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn replace_chunks_and_advance(
        &self,
        id: Uuid,
        advance: StageAdvance,
        commit: SummaryCommit,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(item) = state.items.get_mut(&id) else {
            return Ok(false);
        };
        if item.stage != advance.from {
            return Ok(false);
        }

        item.stage = advance.to;
        item.updated_at = Utc::now();
        item.summarize_directive = None;
        if let Some(title) = commit.title {
            item.title = title;
        }
        if let Some(summary) = commit.summary {
            item.summary = summary;
        }
        if let Some(tags) = commit.tags {
            item.tags = tags;
        }
        if let Some(date) = commit.maybe_date {
            item.maybe_date = Some(date);
        }

        if let Some(chunks) = commit.chunks {
            let kept: Vec<Uuid> = chunks.iter().map(|c| c.id).collect();
            state.chunks.insert(id, chunks);
            // Mirror ON DELETE CASCADE from chunk to vector.
            if let Some(vectors) = state.vectors.get_mut(&id) {
                vectors.retain(|v| v.chunk_id.map_or(true, |c| kept.contains(&c)));
            }
        }
        Ok(true)
    }

    async fn list_chunks(&self, knowledge_id: Uuid) -> Result<Vec<KnowledgeChunk>> {
        let state = self.state.lock().await;
        let mut chunks = state.chunks.get(&knowledge_id).cloned().unwrap_or_default();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn replace_vectors_and_advance(
        &self,
        id: Uuid,
        advance: StageAdvance,
        vectors: Vec<VectorRecord>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(item) = state.items.get_mut(&id) else {
            return Ok(false);
        };
        if item.stage != advance.from {
            return Ok(false);
        }
        item.stage = advance.to;
        item.updated_at = Utc::now();
        state.vectors.insert(id, vectors);
        Ok(true)
    }

    async fn reset_for_reprocess(
        &self,
        id: Uuid,
        directive: Option<SummaryDirective>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(&id)
            .ok_or(Error::KnowledgeNotFound(id))?;
        item.stage = Stage::Summarize;
        item.retry_times = 0;
        item.summarize_directive = directive;
        item.updated_at = Utc::now();
        Ok(())
    }
}

/// Usage repository that keeps every record in a vector.
#[derive(Default)]
pub struct MemoryUsageRepository {
    records: Mutex<Vec<UsageRecord>>,
}

impl MemoryUsageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().await.clone()
    }

    pub async fn count_for_object(&self, object_id: &str, sub_type: &str) -> usize {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.object_id == object_id && r.sub_type == sub_type)
            .count()
    }
}

#[async_trait]
impl UsageRepository for MemoryUsageRepository {
    async fn insert(&self, record: UsageRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        if !records.iter().any(|r| r.id == record.id) {
            records.push(record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use knowhere_core::{ContentType, KnowledgeKind, Vector};

    fn item(stage: Stage, retry_times: i32) -> KnowledgeItem {
        let now = Utc::now();
        KnowledgeItem {
            id: Uuid::new_v4(),
            space_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            kind: KnowledgeKind::LongForm,
            content_type: ContentType::Markdown,
            content: b"blob".to_vec(),
            title: "old title".into(),
            summary: String::new(),
            tags: vec!["old".into()],
            maybe_date: None,
            stage,
            retry_times,
            summarize_directive: None,
            created_at: now,
            updated_at: now,
            expired_at: None,
        }
    }

    fn chunk(item: &KnowledgeItem, index: i32) -> KnowledgeChunk {
        KnowledgeChunk {
            id: Uuid::new_v4(),
            knowledge_id: item.id,
            space_id: item.space_id,
            user_id: item.user_id,
            chunk_index: index,
            content: vec![index as u8],
            created_at: Utc::now(),
        }
    }

    fn vector(item: &KnowledgeItem, chunk_id: Option<Uuid>) -> VectorRecord {
        VectorRecord {
            id: Uuid::new_v4(),
            knowledge_id: item.id,
            chunk_id,
            space_id: item.space_id,
            user_id: item.user_id,
            embedding: Vector::from(vec![0.1, 0.2]),
            model: "test".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_list_unfinished_filters_and_orders() {
        let store = MemoryKnowledgeStore::new();
        let mut older = item(Stage::Embedding, 1);
        older.updated_at = Utc::now() - Duration::minutes(5);
        let newer = item(Stage::Summarize, 0);
        let done = item(Stage::Done, 0);
        let exhausted = item(Stage::Summarize, 3);
        let mut expired = item(Stage::Summarize, 0);
        expired.expired_at = Some(Utc::now() - Duration::seconds(1));

        for i in [&older, &newer, &done, &exhausted, &expired] {
            store.insert(i.clone()).await;
        }

        let page = store.list_unfinished(3, 20, None).await.unwrap();
        let ids: Vec<_> = page.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);

        let second = store
            .list_unfinished(3, 1, Some(older.cursor()))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, newer.id);
    }

    #[tokio::test]
    async fn test_list_unfinished_after_cursor_ignores_earlier_moves() {
        let store = MemoryKnowledgeStore::new();
        let base = Utc::now() - Duration::minutes(10);
        let mut items = Vec::new();
        for n in 0..3 {
            let mut it = item(Stage::Summarize, 0);
            it.updated_at = base + Duration::seconds(n);
            store.insert(it.clone()).await;
            items.push(it);
        }

        let first = store.list_unfinished(3, 1, None).await.unwrap();
        assert_eq!(first[0].id, items[0].id);
        // Touching the first row moves it behind the others.
        store.set_retry_times(items[0].id, 1).await.unwrap();

        let rest = store
            .list_unfinished(3, 10, Some(first[0].cursor()))
            .await
            .unwrap();
        let ids: Vec<_> = rest.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![items[1].id, items[2].id, items[0].id]);
    }

    #[tokio::test]
    async fn test_list_exhausted_includes_failed_and_over_ceiling() {
        let store = MemoryKnowledgeStore::new();
        let failed = item(Stage::Failed, 3);
        let over = item(Stage::Embedding, 3);
        let fine = item(Stage::Embedding, 2);
        for i in [&failed, &over, &fine] {
            store.insert(i.clone()).await;
        }

        let exhausted = store.list_exhausted(3, 10, 0).await.unwrap();
        let mut ids: Vec<_> = exhausted.iter().map(|i| i.id).collect();
        ids.sort();
        let mut expected = vec![failed.id, over.id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_replace_chunks_compare_and_set() {
        let store = MemoryKnowledgeStore::new();
        let it = item(Stage::Embedding, 0);
        store.insert(it.clone()).await;

        let advance = StageAdvance::from_stage(Stage::Summarize).unwrap();
        let committed = store
            .replace_chunks_and_advance(
                it.id,
                advance,
                SummaryCommit {
                    chunks: Some(vec![chunk(&it, 0)]),
                    title: Some("new".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(!committed);
        let after = store.get(it.id).await.unwrap().unwrap();
        assert_eq!(after.stage, Stage::Embedding);
        assert_eq!(after.title, "old title");
        assert!(store.list_chunks(it.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_chunks_keeps_existing_when_none() {
        let store = MemoryKnowledgeStore::new();
        let mut it = item(Stage::Summarize, 2);
        it.summarize_directive = Some(SummaryDirective::parse("tags").unwrap());
        store.insert(it.clone()).await;
        store
            .insert_chunks(it.id, vec![chunk(&it, 1), chunk(&it, 0)])
            .await;

        let committed = store
            .replace_chunks_and_advance(
                it.id,
                StageAdvance::from_stage(Stage::Summarize).unwrap(),
                SummaryCommit {
                    tags: Some(vec!["rust".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(committed);
        let after = store.get(it.id).await.unwrap().unwrap();
        assert_eq!(after.stage, Stage::Embedding);
        assert_eq!(after.tags, vec!["rust".to_string()]);
        assert_eq!(after.title, "old title");
        assert_eq!(after.retry_times, 2);
        assert!(after.summarize_directive.is_none());

        let chunks = store.list_chunks(it.id).await.unwrap();
        assert_eq!(
            chunks.iter().map(|c| c.chunk_index).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[tokio::test]
    async fn test_replacing_chunks_drops_their_vectors() {
        let store = MemoryKnowledgeStore::new();
        let it = item(Stage::Embedding, 0);
        store.insert(it.clone()).await;
        let old = chunk(&it, 0);
        store.insert_chunks(it.id, vec![old.clone()]).await;
        store
            .replace_vectors_and_advance(
                it.id,
                StageAdvance::from_stage(Stage::Embedding).unwrap(),
                vec![vector(&it, Some(old.id))],
            )
            .await
            .unwrap();
        assert_eq!(store.list_vectors(it.id).await.len(), 1);

        store.reset_for_reprocess(it.id, None).await.unwrap();
        store
            .replace_chunks_and_advance(
                it.id,
                StageAdvance::from_stage(Stage::Summarize).unwrap(),
                SummaryCommit {
                    chunks: Some(vec![chunk(&it, 0)]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(store.list_vectors(it.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_mark_failed_requires_expected_stage() {
        let store = MemoryKnowledgeStore::new();
        let it = item(Stage::Embedding, 3);
        store.insert(it.clone()).await;

        assert!(!store.mark_failed(it.id, Stage::Summarize).await.unwrap());
        assert!(store.mark_failed(it.id, Stage::Embedding).await.unwrap());
        assert_eq!(store.stage_of(it.id).await, Some(Stage::Failed));
    }

    #[tokio::test]
    async fn test_reset_for_reprocess() {
        let store = MemoryKnowledgeStore::new();
        let it = item(Stage::Failed, 3);
        store.insert(it.clone()).await;

        let directive = SummaryDirective::parse("title").unwrap();
        store
            .reset_for_reprocess(it.id, Some(directive.clone()))
            .await
            .unwrap();

        let after = store.get(it.id).await.unwrap().unwrap();
        assert_eq!(after.stage, Stage::Summarize);
        assert_eq!(after.retry_times, 0);
        assert_eq!(after.summarize_directive, Some(directive));
    }

    #[tokio::test]
    async fn test_usage_insert_ignores_repeated_id() {
        let repo = MemoryUsageRepository::new();
        let record = UsageRecord {
            id: Uuid::new_v4(),
            space_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            subject: knowhere_core::UsageSubject::Knowledge,
            object_id: "obj".into(),
            sub_type: "summarize".into(),
            model: "m".into(),
            prompt_tokens: 5,
            output_tokens: 1,
            created_at: Utc::now(),
        };
        repo.insert(record.clone()).await.unwrap();
        repo.insert(record.clone()).await.unwrap();
        repo.insert(UsageRecord {
            id: Uuid::new_v4(),
            ..record
        })
        .await
        .unwrap();

        assert_eq!(repo.count_for_object("obj", "summarize").await, 2);
    }

    #[tokio::test]
    async fn test_set_retry_times_unknown_item() {
        let store = MemoryKnowledgeStore::new();
        let err = store.set_retry_times(Uuid::new_v4(), 1).await.unwrap_err();
        assert!(matches!(err, Error::KnowledgeNotFound(_)));
    }
}
