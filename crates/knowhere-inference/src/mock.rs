//! Mock AI backends for deterministic testing.
//!
//! ```rust
//! use knowhere_core::{EmbeddingBackend, Summarizer};
//! use knowhere_inference::mock::{MockEmbedder, MockSummarizer};
//!
//! # tokio_test_block_on(async {
//! let summarizer = MockSummarizer::new()
//!     .with_title("Fixed title")
//!     .with_chunks(["first", "second"]);
//! let out = summarizer.summarize("anything").await.unwrap();
//! assert_eq!(out.chunks.len(), 2);
//!
//! let embedder = MockEmbedder::new().with_dimension(8);
//! let out = embedder.embed_batch(&out.chunks).await.unwrap();
//! assert_eq!(out.vectors.len(), 2);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use knowhere_core::{
    EmbedOutput, EmbeddingBackend, Error, Result, SummarizeOutput, Summarizer, TokenUsage, Vector,
};

/// Model name reported by the mocks.
pub const MOCK_MODEL: &str = "mock-model";

#[derive(Debug, Clone, Default)]
struct Failures {
    /// Fail this many calls, then succeed.
    remaining: Arc<AtomicUsize>,
    /// Fail every call.
    always: bool,
}

impl Failures {
    fn should_fail(&self) -> bool {
        if self.always {
            return true;
        }
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

async fn simulate_latency(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

// =============================================================================
// SUMMARIZER
// =============================================================================

/// Summarizer returning a configured result.
#[derive(Clone)]
pub struct MockSummarizer {
    output: SummarizeOutput,
    failures: Failures,
    latency: Duration,
    calls: Arc<Mutex<Vec<String>>>,
}

impl Default for MockSummarizer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSummarizer {
    pub fn new() -> Self {
        Self {
            output: SummarizeOutput {
                chunks: vec![],
                title: Some("Mock title".to_string()),
                summary: Some("Mock summary".to_string()),
                tags: vec!["mock".to_string()],
                date: None,
                usage: TokenUsage {
                    model: MOCK_MODEL.to_string(),
                    prompt_tokens: 100,
                    output_tokens: 20,
                },
            },
            failures: Failures::default(),
            latency: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.output.title = Some(title.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.output.summary = Some(summary.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.output.date = Some(date.into());
        self
    }

    pub fn with_chunks<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output.chunks = chunks.into_iter().map(Into::into).collect();
        self
    }

    /// Fail the next `n` calls.
    pub fn failing_times(mut self, n: usize) -> Self {
        self.failures.remaining = Arc::new(AtomicUsize::new(n));
        self
    }

    /// Fail every call.
    pub fn always_failing(mut self) -> Self {
        self.failures.always = true;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Texts passed to `summarize`, in call order.
    pub fn inputs(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Summarizer for MockSummarizer {
    async fn summarize(&self, text: &str) -> Result<SummarizeOutput> {
        self.calls.lock().unwrap().push(text.to_string());
        simulate_latency(self.latency).await;

        if self.failures.should_fail() {
            return Err(Error::Inference("Simulated failure for testing".to_string()));
        }
        Ok(self.output.clone())
    }
}

// =============================================================================
// EMBEDDER
// =============================================================================

/// Embedder producing deterministic vectors.
#[derive(Clone)]
pub struct MockEmbedder {
    dimension: usize,
    /// Return this many vectors regardless of input size.
    vector_count: Option<usize>,
    failures: Failures,
    latency: Duration,
    calls: Arc<Mutex<Vec<Vec<String>>>>,
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self {
            dimension: 16,
            vector_count: None,
            failures: Failures::default(),
            latency: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    /// Return exactly `n` vectors per call (to provoke count mismatches).
    pub fn with_vector_count(mut self, n: usize) -> Self {
        self.vector_count = Some(n);
        self
    }

    pub fn failing_times(mut self, n: usize) -> Self {
        self.failures.remaining = Arc::new(AtomicUsize::new(n));
        self
    }

    pub fn always_failing(mut self) -> Self {
        self.failures.always = true;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Batches passed to `embed_batch`, in call order.
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Deterministic unit vector derived from the text's characters.
    pub fn embedding_for(text: &str, dimension: usize) -> Vec<f32> {
        let mut vec = vec![0.0f32; dimension.max(1)];
        for (i, c) in text.chars().enumerate() {
            let idx = (c as usize + i) % vec.len();
            vec[idx] += 0.1;
        }
        let magnitude: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            vec.iter_mut().for_each(|x| *x /= magnitude);
        }
        vec
    }
}

#[async_trait]
impl EmbeddingBackend for MockEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<EmbedOutput> {
        self.calls.lock().unwrap().push(texts.to_vec());
        simulate_latency(self.latency).await;

        if self.failures.should_fail() {
            return Err(Error::Embedding("Simulated failure for testing".to_string()));
        }

        let count = self.vector_count.unwrap_or(texts.len());
        let vectors = (0..count)
            .map(|i| {
                let text = texts.get(i).map(String::as_str).unwrap_or("");
                Vector::from(Self::embedding_for(text, self.dimension))
            })
            .collect();

        Ok(EmbedOutput {
            vectors,
            model: MOCK_MODEL.to_string(),
            usage: TokenUsage {
                model: MOCK_MODEL.to_string(),
                prompt_tokens: texts.iter().map(|t| t.len() as i32 / 4 + 1).sum(),
                output_tokens: 0,
            },
        })
    }

    fn model_name(&self) -> &str {
        MOCK_MODEL
    }
}
