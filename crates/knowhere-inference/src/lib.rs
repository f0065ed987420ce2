//! # knowhere-inference
//!
//! AI backends for the knowhere pipeline.
//!
//! This crate provides:
//! - [`openai::OpenAIBackend`]: summarization over chat completions and batch
//!   embeddings over any OpenAI-compatible endpoint (feature `openai`, default)
//! - the summarization prompt and reply parser
//! - [`mock`] backends with configurable output and failures (feature `mock`)

pub mod prompt;

#[cfg(feature = "openai")]
pub mod openai;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(feature = "openai")]
pub use openai::{OpenAIBackend, OpenAIConfig};
