//! # knowhere-jobs
//!
//! Asynchronous knowledge-processing pipeline.
//!
//! This crate provides:
//! - Bounded per-stage queues drained by a fixed pool of workers
//! - Per-item lease locks with background renewal
//! - Summarize and embedding stage handlers with compare-and-set commits
//! - A periodic recovery sweep that re-enqueues lost work
//! - A side pipeline that records token usage exactly once per call
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use knowhere_jobs::{KnowledgeProcess, PipelineConfig};
//!
//! let process = KnowledgeProcess::builder()
//!     .store(Arc::new(db.knowledge.clone()))
//!     .usage_repository(Arc::new(db.usage.clone()))
//!     .cipher(Arc::new(cipher))
//!     .summarizer(backend.clone())
//!     .embedder(backend)
//!     .locks(Arc::new(locks))
//!     .config(PipelineConfig::from_env())
//!     .build()?;
//!
//! process.start().await;
//! process.enqueue(&item).await;
//! // ...
//! process.shutdown().await;
//! ```

pub mod config;
pub mod content;
pub mod dispatcher;
pub mod lock_guard;
pub mod pipeline;
pub mod recovery;
pub mod stages;
pub mod usage;

pub use config::PipelineConfig;
pub use dispatcher::{Dispatcher, EnqueueOutcome, PipelineJob, QueueDepths};
pub use lock_guard::{process_key, usage_key, LockGuard, LockOutcome};
pub use pipeline::{KnowledgeProcess, KnowledgeProcessBuilder};
pub use recovery::{RecoverySweep, SweepReport};
pub use stages::{EmbedHandler, StageContext, StageHandler, StageOutcome, SummarizeHandler};
pub use usage::{UsageEvent, UsageRecorder, SUB_TYPE_EMBEDDING, SUB_TYPE_SUMMARIZE};
