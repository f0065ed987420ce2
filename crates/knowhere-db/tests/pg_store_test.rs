//! PostgreSQL repository tests.
//!
//! Skipped unless `DATABASE_URL` is set; the database is migrated on connect.

use chrono::Utc;
use knowhere_core::{
    ContentType, KnowledgeChunk, KnowledgeItem, KnowledgeKind, KnowledgeStore, Stage,
    StageAdvance, SummaryCommit, SummaryDirective, UsageRecord, UsageRepository, UsageSubject,
    Vector, VectorRecord,
};
use knowhere_db::Database;
use uuid::Uuid;

async fn setup_test_db() -> Option<Database> {
    let _ = dotenvy::dotenv();
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping PostgreSQL test");
        return None;
    };
    let db = Database::connect(&database_url)
        .await
        .expect("Failed to connect to test database");
    db.migrate().await.expect("Failed to run migrations");
    Some(db)
}

fn item(stage: Stage) -> KnowledgeItem {
    let now = Utc::now();
    KnowledgeItem {
        id: Uuid::new_v4(),
        space_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        kind: KnowledgeKind::LongForm,
        content_type: ContentType::Blocks,
        content: vec![1, 2, 3],
        title: "draft".into(),
        summary: String::new(),
        tags: vec!["a".into()],
        maybe_date: None,
        stage,
        retry_times: 0,
        summarize_directive: Some(SummaryDirective::parse("tags").unwrap()),
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
        content: vec![index as u8; 4],
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_item_roundtrip() {
    let Some(db) = setup_test_db().await else {
        return;
    };
    let original = item(Stage::Summarize);
    db.knowledge.insert(&original).await.unwrap();

    let loaded = db.knowledge.get(original.id).await.unwrap().unwrap();
    assert_eq!(loaded.stage, Stage::Summarize);
    assert_eq!(loaded.kind, KnowledgeKind::LongForm);
    assert_eq!(loaded.content_type, ContentType::Blocks);
    assert_eq!(loaded.content, vec![1, 2, 3]);
    assert_eq!(loaded.summarize_directive, original.summarize_directive);

    assert!(db.knowledge.get(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_summary_commit_and_stale_commit() {
    let Some(db) = setup_test_db().await else {
        return;
    };
    let it = item(Stage::Summarize);
    db.knowledge.insert(&it).await.unwrap();
    let advance = StageAdvance::from_stage(Stage::Summarize).unwrap();

    let committed = db
        .knowledge
        .replace_chunks_and_advance(
            it.id,
            advance,
            SummaryCommit {
                chunks: Some(vec![chunk(&it, 0), chunk(&it, 1)]),
                tags: Some(vec!["rust".into()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(committed);

    let loaded = db.knowledge.get(it.id).await.unwrap().unwrap();
    assert_eq!(loaded.stage, Stage::Embedding);
    assert_eq!(loaded.title, "draft");
    assert_eq!(loaded.tags, vec!["rust".to_string()]);
    assert!(loaded.summarize_directive.is_none());
    assert_eq!(db.knowledge.list_chunks(it.id).await.unwrap().len(), 2);

    // Second commit from the same stage is stale.
    let again = db
        .knowledge
        .replace_chunks_and_advance(
            it.id,
            advance,
            SummaryCommit {
                chunks: Some(vec![chunk(&it, 0)]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!again);
    assert_eq!(db.knowledge.list_chunks(it.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_vector_commit_replaces_wholesale() {
    let Some(db) = setup_test_db().await else {
        return;
    };
    let it = item(Stage::Embedding);
    db.knowledge.insert(&it).await.unwrap();

    let vectors = |n: usize| {
        (0..n)
            .map(|_| VectorRecord {
                id: Uuid::new_v4(),
                knowledge_id: it.id,
                chunk_id: None,
                space_id: it.space_id,
                user_id: it.user_id,
                embedding: Vector::from(vec![0.5, 0.25, 0.125]),
                model: "test-embed".into(),
                created_at: Utc::now(),
            })
            .collect::<Vec<_>>()
    };

    let advance = StageAdvance::from_stage(Stage::Embedding).unwrap();
    assert!(db
        .knowledge
        .replace_vectors_and_advance(it.id, advance, vectors(2))
        .await
        .unwrap());
    assert_eq!(db.knowledge.list_vectors(it.id).await.unwrap().len(), 2);

    db.knowledge.reset_for_reprocess(it.id, None).await.unwrap();
    sqlx::query("UPDATE knowledge SET stage = 'embedding' WHERE id = $1")
        .bind(it.id)
        .execute(db.pool())
        .await
        .unwrap();
    assert!(db
        .knowledge
        .replace_vectors_and_advance(it.id, advance, vectors(1))
        .await
        .unwrap());
    assert_eq!(db.knowledge.list_vectors(it.id).await.unwrap().len(), 1);
    assert_eq!(
        db.knowledge.get(it.id).await.unwrap().unwrap().stage,
        Stage::Done
    );
}

#[tokio::test]
async fn test_retry_and_dead_letter_queries() {
    let Some(db) = setup_test_db().await else {
        return;
    };
    let it = item(Stage::Embedding);
    db.knowledge.insert(&it).await.unwrap();

    db.knowledge.set_retry_times(it.id, 3).await.unwrap();
    let unfinished = db.knowledge.list_unfinished(3, 10_000, None).await.unwrap();
    assert!(unfinished.iter().all(|i| i.id != it.id));

    assert!(db.knowledge.mark_failed(it.id, Stage::Embedding).await.unwrap());
    let exhausted = db.knowledge.list_exhausted(3, 10_000, 0).await.unwrap();
    assert!(exhausted.iter().any(|i| i.id == it.id && i.stage == Stage::Failed));
}

#[tokio::test]
async fn test_list_unfinished_pages_after_cursor() {
    let Some(db) = setup_test_db().await else {
        return;
    };
    let first = item(Stage::Summarize);
    db.knowledge.insert(&first).await.unwrap();

    let page = db
        .knowledge
        .list_unfinished(3, 10_000, Some(first.cursor()))
        .await
        .unwrap();
    assert!(page.iter().all(|i| i.id != first.id));

    // Bumping updated_at moves the row past the cursor.
    db.knowledge.set_retry_times(first.id, 1).await.unwrap();
    let page = db
        .knowledge
        .list_unfinished(3, 10_000, Some(first.cursor()))
        .await
        .unwrap();
    assert!(page.iter().any(|i| i.id == first.id));
}

#[tokio::test]
async fn test_usage_insert() {
    let Some(db) = setup_test_db().await else {
        return;
    };
    let object_id = Uuid::new_v4().to_string();
    let record = UsageRecord {
        id: Uuid::new_v4(),
        space_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        subject: UsageSubject::Knowledge,
        object_id: object_id.clone(),
        sub_type: "summarize".into(),
        model: "gpt-4o-mini".into(),
        prompt_tokens: 120,
        output_tokens: 30,
        created_at: Utc::now(),
    };
    db.usage.insert(record.clone()).await.unwrap();
    // Same call delivered twice.
    db.usage.insert(record).await.unwrap();

    assert_eq!(
        db.usage
            .count_for_object(&object_id, "summarize")
            .await
            .unwrap(),
        1
    );
}
