//! OpenAI-compatible backend.
//!
//! Works with any endpoint that speaks the OpenAI chat completions and
//! embeddings APIs (OpenAI, Azure OpenAI, Ollama, vLLM, LocalAI, LM Studio).
//!
//! # Example
//!
//! ```rust,no_run
//! use knowhere_core::{EmbeddingBackend, Summarizer};
//! use knowhere_inference::openai::{OpenAIBackend, OpenAIConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = OpenAIBackend::new(OpenAIConfig {
//!         base_url: "http://localhost:11434/v1".to_string(),
//!         embed_model: "nomic-embed-text".to_string(),
//!         gen_model: "llama3".to_string(),
//!         ..Default::default()
//!     })
//!     .unwrap();
//!
//!     let summary = backend.summarize("# Notes\n\nRust ownership.").await.unwrap();
//!     let vectors = backend.embed_batch(&summary.chunks).await.unwrap();
//! }
//! ```

mod backend;
mod error;
mod types;

pub use backend::{
    OpenAIBackend, OpenAIConfig, DEFAULT_EMBED_MODEL, DEFAULT_GEN_MODEL, DEFAULT_MAX_INPUT_CHARS,
    DEFAULT_OPENAI_URL, DEFAULT_TIMEOUT_SECS,
};
pub use error::{to_core_error, ApiOperation, OpenAIErrorCode};
pub use types::*;
