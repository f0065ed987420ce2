//! # knowhere-core
//!
//! Core types, ports, and abstractions for the knowhere knowledge pipeline.
//!
//! This crate defines the knowledge data model, the stage state machine
//! values, the port traits implemented by stores, AI clients, lock stores and
//! event transports, and the in-process [`EventBus`].

pub mod defaults;
pub mod error;
pub mod events;
pub mod models;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{knowledge_topic, EventBus, EventEnvelope, PipelineEvent};
pub use models::*;
pub use traits::*;
pub use uuid_utils::new_v7;
