//! Usage recorder: a side pipeline that persists token usage off the hot path.
//!
//! Stage handlers call [`UsageRecorder::record`], which never blocks. One
//! bounded channel per [`UsageSubject`] is drained by a small worker pool that
//! writes each row under the (object, sub-type) lock.
//!
//! Every successful AI call gets its own `call_id`, which becomes the row ID.
//! Repositories ignore a second insert of the same ID, so a call queued twice
//! is written once while two separate calls for the same item both count.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use knowhere_core::defaults;
use knowhere_core::{TokenUsage, UsageRecord, UsageRepository, UsageSubject};

use crate::lock_guard::{usage_key, LockGuard, LockOutcome};

/// Sub-type for summarization usage.
pub const SUB_TYPE_SUMMARIZE: &str = "summarize";

/// Sub-type for embedding usage.
pub const SUB_TYPE_EMBEDDING: &str = "embedding";

/// Channel capacity for a usage subject.
pub fn queue_capacity(subject: UsageSubject) -> usize {
    match subject {
        UsageSubject::Knowledge => defaults::USAGE_QUEUE_KNOWLEDGE,
        UsageSubject::ChatMessage => defaults::USAGE_QUEUE_CHAT_MESSAGE,
        UsageSubject::ChatSession => defaults::USAGE_QUEUE_CHAT_SESSION,
        UsageSubject::Generic => defaults::USAGE_QUEUE_GENERIC,
    }
}

/// A usage fact waiting to be persisted.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub space_id: Uuid,
    pub user_id: Uuid,
    pub subject: UsageSubject,
    pub object_id: String,
    pub sub_type: String,
    /// Identifies the AI call; reused as the usage row ID.
    pub call_id: Uuid,
    pub usage: TokenUsage,
}

impl UsageEvent {
    fn dedupe_key(&self) -> String {
        usage_key(self.subject, &self.object_id, &self.sub_type)
    }

    fn into_record(self) -> UsageRecord {
        UsageRecord {
            id: self.call_id,
            space_id: self.space_id,
            user_id: self.user_id,
            subject: self.subject,
            object_id: self.object_id,
            sub_type: self.sub_type,
            model: self.usage.model,
            prompt_tokens: self.usage.prompt_tokens,
            output_tokens: self.usage.output_tokens,
            created_at: Utc::now(),
        }
    }
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<UsageEvent>>>;

/// Cloneable handle to the per-subject usage channels.
#[derive(Clone)]
pub struct UsageRecorder {
    senders: Arc<HashMap<UsageSubject, mpsc::Sender<UsageEvent>>>,
    receivers: Arc<HashMap<UsageSubject, SharedReceiver>>,
}

impl Default for UsageRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageRecorder {
    pub fn new() -> Self {
        Self::with_capacity(queue_capacity)
    }

    /// Build with a custom capacity per subject.
    pub fn with_capacity(capacity: impl Fn(UsageSubject) -> usize) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for subject in UsageSubject::ALL {
            let (tx, rx) = mpsc::channel(capacity(subject).max(1));
            senders.insert(subject, tx);
            receivers.insert(subject, Arc::new(Mutex::new(rx)));
        }
        Self {
            senders: Arc::new(senders),
            receivers: Arc::new(receivers),
        }
    }

    /// Queue a usage event without waiting. Returns false if it was dropped.
    pub fn record(&self, event: UsageEvent) -> bool {
        let Some(tx) = self.senders.get(&event.subject) else {
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    subsystem = "usage",
                    subject = %event.subject,
                    object_id = %event.object_id,
                    sub_type = %event.sub_type,
                    "Usage queue full, dropping record"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(
                    subsystem = "usage",
                    subject = %event.subject,
                    "Usage queue closed, dropping record"
                );
                false
            }
        }
    }

    /// Number of events waiting for `subject`.
    pub fn pending(&self, subject: UsageSubject) -> usize {
        self.senders
            .get(&subject)
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    /// Spawn `workers` drainers per subject.
    ///
    /// On cancellation each worker writes whatever is still queued before
    /// exiting.
    pub fn start(
        &self,
        repo: Arc<dyn UsageRepository>,
        guard: LockGuard,
        workers: usize,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for subject in UsageSubject::ALL {
            let Some(rx) = self.receivers.get(&subject) else {
                continue;
            };
            for worker_id in 0..workers.max(1) {
                let writer = UsageWriter {
                    repo: repo.clone(),
                    guard: guard.clone(),
                };
                handles.push(tokio::spawn(writer.run(
                    subject,
                    worker_id,
                    rx.clone(),
                    cancel.clone(),
                )));
            }
        }
        info!(subsystem = "usage", workers, "Usage recorder started");
        handles
    }
}

struct UsageWriter {
    repo: Arc<dyn UsageRepository>,
    guard: LockGuard,
}

impl UsageWriter {
    async fn run(
        self,
        subject: UsageSubject,
        worker_id: usize,
        rx: SharedReceiver,
        cancel: CancellationToken,
    ) {
        loop {
            let event = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    event = rx.recv() => event,
                }
            };
            match event {
                Some(event) => self.persist(event).await,
                None => break,
            }
        }

        loop {
            let next = rx.lock().await.try_recv();
            match next {
                Ok(event) => self.persist(event).await,
                Err(_) => break,
            }
        }
        debug!(subsystem = "usage", %subject, worker_id, "Usage worker stopped");
    }

    async fn persist(&self, event: UsageEvent) {
        let key = event.dedupe_key();
        let record = event.into_record();
        let (call_id, object_id, sub_type) =
            (record.id, record.object_id.clone(), record.sub_type.clone());

        let repo = self.repo.clone();
        let outcome = self
            .guard
            .with_lock(&key, || async move { repo.insert(record).await })
            .await;
        match outcome {
            LockOutcome::Ran(Ok(())) => {}
            LockOutcome::Ran(Err(e)) => {
                error!(
                    subsystem = "usage",
                    %object_id,
                    %sub_type,
                    %call_id,
                    error = %e,
                    "Failed to write usage record"
                );
            }
            LockOutcome::Skipped => {
                debug!(subsystem = "usage", %key, %call_id, "Concurrent usage write, dropped");
            }
        }
    }
}
