//! OpenAI-compatible summarization and embedding backend.

use async_trait::async_trait;
use reqwest::{Client, Response};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use knowhere_core::{
    EmbedOutput, EmbeddingBackend, Error, Result, SummarizeOutput, Summarizer, TokenUsage, Vector,
};

use super::error::{to_core_error, ApiOperation, OpenAIErrorCode};
use super::types::*;
use crate::prompt::{parse_summary_reply, truncate_input, SUMMARIZE_SYSTEM_PROMPT};

/// Default OpenAI API endpoint.
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

/// Default embedding model.
pub const DEFAULT_EMBED_MODEL: &str = "text-embedding-3-small";

/// Default generation model.
pub const DEFAULT_GEN_MODEL: &str = "gpt-4o-mini";

/// Default HTTP timeout in seconds. The pipeline applies its own stage timeout
/// on top of this.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Longest note text sent to the summarizer, in bytes.
pub const DEFAULT_MAX_INPUT_CHARS: usize = 48_000;

/// Configuration for the OpenAI-compatible backend.
#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    pub base_url: String,
    /// API key (optional for local endpoints).
    pub api_key: Option<String>,
    pub embed_model: String,
    pub gen_model: String,
    pub timeout_seconds: u64,
    /// Ask for `response_format: json_object`. Disable for servers that
    /// reject the field.
    pub json_mode: bool,
    pub max_input_chars: usize,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPENAI_URL.to_string(),
            api_key: None,
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
            gen_model: DEFAULT_GEN_MODEL.to_string(),
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            json_mode: true,
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
        }
    }
}

impl OpenAIConfig {
    /// Read `OPENAI_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            api_key: std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            embed_model: std::env::var("OPENAI_EMBED_MODEL").unwrap_or(defaults.embed_model),
            gen_model: std::env::var("OPENAI_GEN_MODEL").unwrap_or(defaults.gen_model),
            timeout_seconds: std::env::var("OPENAI_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.timeout_seconds),
            json_mode: std::env::var("OPENAI_JSON_MODE")
                .map(|v| v != "0" && v.to_lowercase() != "false")
                .unwrap_or(defaults.json_mode),
            max_input_chars: defaults.max_input_chars,
        }
    }
}

/// OpenAI-compatible backend implementing both AI ports.
pub struct OpenAIBackend {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAIBackend {
    pub fn new(config: OpenAIConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::Inference(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            subsystem = "inference",
            component = "openai",
            base_url = %config.base_url,
            embed_model = %config.embed_model,
            gen_model = %config.gen_model,
            "Initializing OpenAI backend"
        );

        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(OpenAIConfig::from_env())
    }

    pub fn config(&self) -> &OpenAIConfig {
        &self.config
    }

    /// Build a POST request with authentication if configured.
    fn build_request(&self, endpoint: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint);
        let mut req = self.client.post(&url);

        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        req.header("Content-Type", "application/json")
    }

    async fn error_from(op: ApiOperation, response: Response) -> Error {
        let status = response.status();
        let body: OpenAIErrorResponse = response
            .json()
            .await
            .unwrap_or_else(|_| OpenAIErrorResponse::unknown());
        let code = OpenAIErrorCode::from_response(status.as_u16(), &body.error.error_type);
        to_core_error(
            op,
            code,
            &format!("OpenAI returned {}: {}", status, body.error.message),
        )
    }
}

#[async_trait]
impl Summarizer for OpenAIBackend {
    async fn summarize(&self, text: &str) -> Result<SummarizeOutput> {
        let start = Instant::now();
        let input = truncate_input(text, self.config.max_input_chars);

        let request = ChatCompletionRequest {
            model: self.config.gen_model.clone(),
            messages: vec![
                ChatMessage::system(SUMMARIZE_SYSTEM_PROMPT),
                ChatMessage::user(input),
            ],
            temperature: Some(0.2),
            max_tokens: None,
            response_format: self.config.json_mode.then(ResponseFormat::json_object),
            stream: false,
        };

        let response = self
            .build_request("/chat/completions")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Inference(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::error_from(ApiOperation::Summarize, response).await);
        }

        let result: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Inference(format!("Failed to parse response: {}", e)))?;

        let content = result
            .first_content()
            .ok_or_else(|| Error::Inference("Response contained no choices".to_string()))?;

        let reply = parse_summary_reply(content)?;
        let usage = result.token_usage(&self.config.gen_model);

        debug!(
            subsystem = "inference",
            component = "openai",
            op = "summarize",
            input_len = input.len(),
            chunk_count = reply.chunks.len(),
            prompt_tokens = usage.prompt_tokens,
            output_tokens = usage.output_tokens,
            duration_ms = start.elapsed().as_millis() as u64,
            "Summarization complete"
        );

        Ok(SummarizeOutput {
            chunks: reply.chunks,
            title: reply.title,
            summary: reply.summary,
            tags: reply.tags,
            date: reply.date,
            usage,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAIBackend {
    async fn embed_batch(&self, texts: &[String]) -> Result<EmbedOutput> {
        if texts.is_empty() {
            return Ok(EmbedOutput {
                vectors: vec![],
                model: self.config.embed_model.clone(),
                usage: TokenUsage {
                    model: self.config.embed_model.clone(),
                    ..Default::default()
                },
            });
        }

        let start = Instant::now();
        let request = EmbeddingRequest {
            model: self.config.embed_model.clone(),
            input: texts.to_vec(),
            encoding_format: Some("float".to_string()),
        };

        let response = self
            .build_request("/embeddings")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Embedding(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::error_from(ApiOperation::Embed, response).await);
        }

        let result: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::Embedding(format!("Failed to parse response: {}", e)))?;

        let usage = result.token_usage(&self.config.embed_model);
        let model = usage.model.clone();

        // Servers may return data out of input order.
        let mut data = result.data;
        data.sort_by_key(|d| d.index);
        let vectors: Vec<Vector> = data
            .into_iter()
            .map(|d| Vector::from(d.embedding))
            .collect();

        debug!(
            subsystem = "inference",
            component = "openai",
            op = "embed",
            input_count = texts.len(),
            vector_count = vectors.len(),
            prompt_tokens = usage.prompt_tokens,
            duration_ms = start.elapsed().as_millis() as u64,
            "Embedding complete"
        );

        Ok(EmbedOutput {
            vectors,
            model,
            usage,
        })
    }

    fn model_name(&self) -> &str {
        &self.config.embed_model
    }
}
