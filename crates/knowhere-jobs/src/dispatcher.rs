//! Bounded per-stage queues and the workers draining them.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use knowhere_core::Stage;

use crate::lock_guard::{process_key, LockGuard, LockOutcome};
use crate::stages::{StageHandler, StageOutcome};

/// Result of handing an item to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The queue stayed full for the whole enqueue timeout.
    Busy,
    /// The pipeline is shutting down.
    Closed,
    /// The item's stage has no handler (`Done` or `Failed`).
    Terminal,
}

/// An item waiting for a stage worker. Only the ID travels; workers re-read
/// the item from the store.
#[derive(Debug, Clone)]
pub struct PipelineJob {
    pub knowledge_id: Uuid,
    pub stage: Stage,
    pub enqueued_at: Instant,
}

/// Items waiting per stage queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub summarize: usize,
    pub embedding: usize,
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<PipelineJob>>>;

struct StageQueue {
    tx: mpsc::Sender<PipelineJob>,
    rx: SharedReceiver,
}

impl StageQueue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Routes items to stage queues and runs the stage workers.
pub struct Dispatcher {
    summarize: StageQueue,
    embedding: StageQueue,
    guard: LockGuard,
    enqueue_timeout: Duration,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        capacity: usize,
        enqueue_timeout: Duration,
        guard: LockGuard,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            summarize: StageQueue::new(capacity),
            embedding: StageQueue::new(capacity),
            guard,
            enqueue_timeout,
            cancel,
        }
    }

    fn queue_for(&self, stage: Stage) -> Option<&StageQueue> {
        match stage {
            Stage::None | Stage::Summarize => Some(&self.summarize),
            Stage::Embedding => Some(&self.embedding),
            Stage::Done | Stage::Failed => None,
        }
    }

    /// Queue an item, waiting at most the enqueue timeout for capacity.
    pub async fn enqueue(&self, knowledge_id: Uuid, stage: Stage) -> EnqueueOutcome {
        if self.cancel.is_cancelled() {
            return EnqueueOutcome::Closed;
        }
        let Some(queue) = self.queue_for(stage) else {
            return EnqueueOutcome::Terminal;
        };
        let job = PipelineJob {
            knowledge_id,
            stage,
            enqueued_at: Instant::now(),
        };
        match tokio::time::timeout(self.enqueue_timeout, queue.tx.send(job)).await {
            Ok(Ok(())) => EnqueueOutcome::Queued,
            Ok(Err(_)) => EnqueueOutcome::Closed,
            Err(_) => {
                warn!(
                    %knowledge_id,
                    %stage,
                    timeout_ms = self.enqueue_timeout.as_millis() as u64,
                    "Stage queue full, enqueue rejected"
                );
                EnqueueOutcome::Busy
            }
        }
    }

    /// Queue an item, waiting for capacity until shutdown.
    pub async fn enqueue_blocking(&self, knowledge_id: Uuid, stage: Stage) -> EnqueueOutcome {
        let Some(queue) = self.queue_for(stage) else {
            return EnqueueOutcome::Terminal;
        };
        let job = PipelineJob {
            knowledge_id,
            stage,
            enqueued_at: Instant::now(),
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => EnqueueOutcome::Closed,
            sent = queue.tx.send(job) => match sent {
                Ok(()) => EnqueueOutcome::Queued,
                Err(_) => EnqueueOutcome::Closed,
            },
        }
    }

    pub fn queue_depths(&self) -> QueueDepths {
        QueueDepths {
            summarize: self.summarize.depth(),
            embedding: self.embedding.depth(),
        }
    }

    /// Spawn `concurrency` workers for each handler's stage queue.
    pub fn start(
        &self,
        handlers: Vec<Arc<dyn StageHandler>>,
        concurrency: usize,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        for handler in handlers {
            let stage = handler.stage();
            let Some(queue) = self.queue_for(stage) else {
                warn!(%stage, "No queue for handler stage, not starting workers");
                continue;
            };
            let next = stage
                .next()
                .and_then(|to| self.queue_for(to).map(|q| (to, q.tx.clone())));
            for worker_id in 0..concurrency.max(1) {
                let worker = StageWorker {
                    worker_id,
                    handler: handler.clone(),
                    rx: queue.rx.clone(),
                    next: next.clone(),
                    guard: self.guard.clone(),
                    enqueue_timeout: self.enqueue_timeout,
                    cancel: self.cancel.clone(),
                };
                tasks.push(tokio::spawn(worker.run()));
            }
            info!(%stage, concurrency, "Stage workers started");
        }
        tasks
    }
}

struct StageWorker {
    worker_id: usize,
    handler: Arc<dyn StageHandler>,
    rx: SharedReceiver,
    /// Queue for the stage this handler advances items into, if any.
    next: Option<(Stage, mpsc::Sender<PipelineJob>)>,
    guard: LockGuard,
    enqueue_timeout: Duration,
    cancel: CancellationToken,
}

impl StageWorker {
    async fn run(self) {
        let stage = self.handler.stage();
        loop {
            let job = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    job = rx.recv() => job,
                }
            };
            let Some(job) = job else { break };
            self.process(job).await;
        }
        debug!(%stage, worker_id = self.worker_id, "Stage worker stopped");
    }

    async fn process(&self, job: PipelineJob) {
        let start = Instant::now();
        let knowledge_id = job.knowledge_id;
        let key = process_key(knowledge_id);
        let handler = self.handler.clone();
        let run = self
            .guard
            .with_lock(&key, move || async move { handler.handle(knowledge_id).await });

        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(LockOutcome::Ran(outcome)) => {
                debug!(
                    %knowledge_id,
                    stage = %job.stage,
                    ?outcome,
                    queued_ms = start.duration_since(job.enqueued_at).as_millis() as u64,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Job finished"
                );
                if outcome == StageOutcome::Advanced {
                    self.hand_off(knowledge_id).await;
                }
            }
            Ok(LockOutcome::Skipped) => {
                debug!(%knowledge_id, stage = %job.stage, "Item locked elsewhere, job skipped")
            }
            Err(panic) => error!(
                %knowledge_id,
                stage = %job.stage,
                worker_id = self.worker_id,
                panic = %panic_message(panic.as_ref()),
                "Stage handler panicked"
            ),
        }
    }

    /// Queue an advanced item for its next stage. A full queue leaves it to
    /// the recovery sweep.
    async fn hand_off(&self, knowledge_id: Uuid) {
        let Some((stage, tx)) = &self.next else {
            return;
        };
        let job = PipelineJob {
            knowledge_id,
            stage: *stage,
            enqueued_at: Instant::now(),
        };
        match tokio::time::timeout(self.enqueue_timeout, tx.send(job)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!(%knowledge_id, %stage, "Stage queue closed, hand-off dropped"),
            Err(_) => warn!(%knowledge_id, %stage, "Stage queue full, leaving item for the sweep"),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use knowhere_db::MemoryLockStore;

    fn dispatcher(capacity: usize, cancel: CancellationToken) -> Dispatcher {
        let guard = LockGuard::new(Arc::new(MemoryLockStore::new()), Duration::from_secs(180));
        Dispatcher::new(capacity, Duration::from_millis(50), guard, cancel)
    }

    /// Panics on the first item it sees, counts the rest.
    struct FlakyHandler {
        seen: AtomicUsize,
        done: mpsc::UnboundedSender<Uuid>,
    }

    #[async_trait]
    impl StageHandler for FlakyHandler {
        fn stage(&self) -> Stage {
            Stage::Summarize
        }

        async fn handle(&self, knowledge_id: Uuid) -> StageOutcome {
            if self.seen.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first item explodes");
            }
            let _ = self.done.send(knowledge_id);
            StageOutcome::Advanced
        }
    }

    #[tokio::test]
    async fn test_routes_by_stage() {
        let d = dispatcher(10, CancellationToken::new());
        assert_eq!(d.enqueue(Uuid::new_v4(), Stage::None).await, EnqueueOutcome::Queued);
        assert_eq!(d.enqueue(Uuid::new_v4(), Stage::Summarize).await, EnqueueOutcome::Queued);
        assert_eq!(d.enqueue(Uuid::new_v4(), Stage::Embedding).await, EnqueueOutcome::Queued);
        assert_eq!(d.enqueue(Uuid::new_v4(), Stage::Done).await, EnqueueOutcome::Terminal);
        assert_eq!(d.enqueue(Uuid::new_v4(), Stage::Failed).await, EnqueueOutcome::Terminal);
        assert_eq!(
            d.queue_depths(),
            QueueDepths {
                summarize: 2,
                embedding: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_returns_busy() {
        let d = dispatcher(1, CancellationToken::new());
        assert_eq!(d.enqueue(Uuid::new_v4(), Stage::Summarize).await, EnqueueOutcome::Queued);
        assert_eq!(d.enqueue(Uuid::new_v4(), Stage::Summarize).await, EnqueueOutcome::Busy);
        assert_eq!(d.queue_depths().summarize, 1);
    }

    #[tokio::test]
    async fn test_cancelled_dispatcher_is_closed() {
        let cancel = CancellationToken::new();
        let d = dispatcher(1, cancel.clone());
        cancel.cancel();
        assert_eq!(d.enqueue(Uuid::new_v4(), Stage::Summarize).await, EnqueueOutcome::Closed);
        assert_eq!(
            d.enqueue_blocking(Uuid::new_v4(), Stage::Embedding).await,
            EnqueueOutcome::Closed
        );
    }

    #[tokio::test]
    async fn test_worker_survives_handler_panic() {
        let cancel = CancellationToken::new();
        let d = dispatcher(10, cancel.clone());
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn StageHandler> = Arc::new(FlakyHandler {
            seen: AtomicUsize::new(0),
            done: done_tx,
        });
        let tasks = d.start(vec![handler], 1);

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        d.enqueue(first, Stage::Summarize).await;
        d.enqueue(second, Stage::Summarize).await;

        let handled = tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
            .await
            .unwrap();
        assert_eq!(handled, Some(second));

        cancel.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }

    struct AdvancingHandler;

    #[async_trait]
    impl StageHandler for AdvancingHandler {
        fn stage(&self) -> Stage {
            Stage::Summarize
        }

        async fn handle(&self, _knowledge_id: Uuid) -> StageOutcome {
            StageOutcome::Advanced
        }
    }

    #[tokio::test]
    async fn test_advanced_item_is_handed_to_next_stage() {
        let cancel = CancellationToken::new();
        let d = dispatcher(10, cancel.clone());
        let tasks = d.start(vec![Arc::new(AdvancingHandler) as Arc<dyn StageHandler>], 1);

        d.enqueue(Uuid::new_v4(), Stage::Summarize).await;
        let handed_off = tokio::time::timeout(Duration::from_secs(5), async {
            while d.queue_depths().embedding == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(handed_off.is_ok());

        cancel.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[test]
    fn test_panic_message_extracts_text() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
