//! Retry ceiling, dead-lettering and recovery sweep through the assembled
//! pipeline.

mod common;

use std::time::Duration;

use common::{drain, fast_config, Harness};
use knowhere_core::{ContentType, KnowledgeKind, KnowledgeStore, PipelineEvent, Stage};
use knowhere_inference::mock::{MockEmbedder, MockSummarizer};

#[tokio::test]
async fn test_sweep_enqueues_only_unfinished_items() {
    let h = Harness::with_defaults();
    let mut pending = h.item(
        KnowledgeKind::Atomic,
        ContentType::Markdown,
        Stage::Embedding,
        "pending",
    );
    pending.retry_times = 1;
    let done = h.item(KnowledgeKind::Atomic, ContentType::Markdown, Stage::Done, "done");
    h.store.insert(pending.clone()).await;
    h.store.insert(done).await;

    let report = h.process.sweep_now().await.unwrap();

    assert_eq!(report.enqueued, 1);
    let depths = h.process.queue_depths();
    assert_eq!(depths.embedding, 1);
    assert_eq!(depths.summarize, 0);
}

#[tokio::test]
async fn test_retry_ceiling_boundary() {
    let h = Harness::with_defaults();
    let mut at_ceiling = h.item(KnowledgeKind::Atomic, ContentType::Markdown, Stage::Summarize, "a");
    at_ceiling.retry_times = 3;
    let mut below = h.item(KnowledgeKind::Atomic, ContentType::Markdown, Stage::Summarize, "b");
    below.retry_times = 2;
    h.store.insert(at_ceiling.clone()).await;
    h.store.insert(below.clone()).await;

    let report = h.process.sweep_now().await.unwrap();

    assert_eq!(report.scanned, 1);
    assert_eq!(report.enqueued, 1);
    let dead = h.process.list_dead_lettered(10, 0).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, at_ceiling.id);
}

#[tokio::test]
async fn test_sweep_recovers_lost_work_at_startup() {
    let h = Harness::with_defaults();
    let item = h.insert_new(KnowledgeKind::LongForm, "never enqueued").await;

    h.process.start().await;
    h.wait_for_stage(item.id, Stage::Done).await;
    h.process.shutdown().await;

    assert_eq!(h.store.list_vectors(item.id).await.len(), 1);
}

#[tokio::test]
async fn test_zero_sweep_interval_still_recovers() {
    let mut config = fast_config();
    config.sweep_interval = Duration::ZERO;
    let h = Harness::new(MockSummarizer::new(), MockEmbedder::new(), config);
    let item = h.insert_new(KnowledgeKind::Atomic, "never enqueued").await;

    h.process.start().await;
    h.wait_for_stage(item.id, Stage::Done).await;
    h.process.shutdown().await;

    let zero_via_builder = fast_config().with_sweep_interval(Duration::ZERO);
    assert!(zero_via_builder.sweep_interval > Duration::ZERO);
}

#[tokio::test]
async fn test_failing_item_is_dead_lettered() {
    let h = Harness::new(
        MockSummarizer::new().always_failing(),
        MockEmbedder::new(),
        fast_config(),
    );
    let mut rx = h.bus.subscribe();
    let item = h.insert_new(KnowledgeKind::Atomic, "doomed").await;

    h.process.start().await;
    h.wait_for_stage(item.id, Stage::Failed).await;
    h.process.shutdown().await;

    let stored = h.store.get(item.id).await.unwrap().unwrap();
    assert_eq!(stored.retry_times, 3);
    assert_eq!(h.summarizer.call_count(), 3);
    assert!(h.store.list_chunks(item.id).await.unwrap().is_empty());

    let dead = h.process.list_dead_lettered(10, 0).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].stage, Stage::Failed);

    let events = drain(&mut rx);
    let failures = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::ProcessingFailed { .. }))
        .count();
    assert_eq!(failures, 3);
    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::DeadLettered {
            stage: Stage::Summarize,
            retry_times: 3,
            ..
        }
    )));
}

#[tokio::test]
async fn test_transient_failure_recovers_on_next_sweep() {
    let h = Harness::new(
        MockSummarizer::new().failing_times(1),
        MockEmbedder::new().failing_times(1),
        fast_config(),
    );
    let item = h.insert_new(KnowledgeKind::Atomic, "flaky").await;

    h.process.start().await;
    h.wait_for_stage(item.id, Stage::Done).await;
    h.process.shutdown().await;

    // The counter is never reset by a successful stage.
    assert_eq!(h.store.retry_times_of(item.id).await, Some(2));
}

#[tokio::test]
async fn test_vector_count_mismatch_never_commits() {
    let h = Harness::new(
        MockSummarizer::new().with_chunks(["one", "two", "three"]),
        MockEmbedder::new().with_vector_count(2),
        fast_config().with_sweep_interval(Duration::from_secs(3600)),
    );
    let item = h.insert_new(KnowledgeKind::LongForm, "three parts").await;

    h.process.start().await;
    let store = h.store.clone();
    let id = item.id;
    h.wait_until("retry counted", || {
        let store = store.clone();
        async move { store.retry_times_of(id).await == Some(1) }
    })
    .await;
    h.process.shutdown().await;

    assert_eq!(h.store.stage_of(item.id).await, Some(Stage::Embedding));
    assert_eq!(h.store.list_chunks(item.id).await.unwrap().len(), 3);
    assert!(h.store.list_vectors(item.id).await.is_empty());
}
