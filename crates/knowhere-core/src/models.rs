//! Data models for knowledge items and their derived artifacts.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

pub use pgvector::Vector;

// =============================================================================
// STAGE
// =============================================================================

/// Position of a knowledge item in the enrichment pipeline.
///
/// Variants are declared in pipeline order so the derived `Ord` matches
/// advancement: `None < Summarize < Embedding < Done`. `Failed` sorts last and
/// is only entered once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Not yet picked up by the pipeline.
    None,
    /// Awaiting summarization and chunking.
    Summarize,
    /// Awaiting vector embedding.
    Embedding,
    /// Fully processed and searchable.
    Done,
    /// Retries exhausted; excluded from automatic processing.
    Failed,
}

impl Stage {
    /// The stage a successful handler advances to.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::None => Some(Stage::Summarize),
            Stage::Summarize => Some(Stage::Embedding),
            Stage::Embedding => Some(Stage::Done),
            Stage::Done | Stage::Failed => None,
        }
    }

    /// Whether automatic processing has finished for this item.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::None => "none",
            Stage::Summarize => "summarize",
            Stage::Embedding => "embedding",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Stage::None),
            "summarize" => Ok(Stage::Summarize),
            "embedding" => Ok(Stage::Embedding),
            "done" => Ok(Stage::Done),
            "failed" => Ok(Stage::Failed),
            other => Err(Error::InvalidInput(format!("unknown stage: {}", other))),
        }
    }
}

/// A compare-and-set stage transition.
///
/// Stores apply the transition only while the persisted stage still equals
/// `from`, which keeps stages monotonic when two writers race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageAdvance {
    pub from: Stage,
    pub to: Stage,
}

impl StageAdvance {
    /// The forward transition out of `from`, if there is one.
    pub fn from_stage(from: Stage) -> Option<Self> {
        from.next().map(|to| Self { from, to })
    }
}

// =============================================================================
// KNOWLEDGE
// =============================================================================

/// How the stored content is encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Markdown,
    /// Structured editor blocks serialized as JSON.
    Blocks,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Markdown => "markdown",
            ContentType::Blocks => "blocks",
        }
    }
}

impl FromStr for ContentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "markdown" => Ok(ContentType::Markdown),
            "blocks" => Ok(ContentType::Blocks),
            other => Err(Error::InvalidInput(format!("unknown content type: {}", other))),
        }
    }
}

/// Whether an item is embedded as a whole or chunk by chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeKind {
    /// Short content embedded as one synthetic chunk.
    #[default]
    Atomic,
    /// Long content embedded from its persisted chunks.
    LongForm,
}

impl KnowledgeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            KnowledgeKind::Atomic => "atomic",
            KnowledgeKind::LongForm => "long_form",
        }
    }
}

impl FromStr for KnowledgeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "atomic" => Ok(KnowledgeKind::Atomic),
            "long_form" => Ok(KnowledgeKind::LongForm),
            other => Err(Error::InvalidInput(format!("unknown knowledge kind: {}", other))),
        }
    }
}

/// A field produced by summarization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryField {
    Title,
    Summary,
    Tags,
    Date,
    Chunks,
}

impl SummaryField {
    pub const ALL: [SummaryField; 5] = [
        SummaryField::Title,
        SummaryField::Summary,
        SummaryField::Tags,
        SummaryField::Date,
        SummaryField::Chunks,
    ];
}

impl FromStr for SummaryField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "title" => Ok(SummaryField::Title),
            "summary" => Ok(SummaryField::Summary),
            "tags" => Ok(SummaryField::Tags),
            "date" => Ok(SummaryField::Date),
            "chunks" => Ok(SummaryField::Chunks),
            other => Err(Error::InvalidInput(format!("unknown summary field: {}", other))),
        }
    }
}

/// Field selection for a partial re-summarization.
///
/// Only the listed fields are applied from the AI result; everything else is
/// discarded even when the model returned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SummaryDirective(BTreeSet<SummaryField>);

impl SummaryDirective {
    /// Apply every field (the default for a first run).
    pub fn all() -> Self {
        Self(SummaryField::ALL.into_iter().collect())
    }

    pub fn only(fields: impl IntoIterator<Item = SummaryField>) -> Self {
        Self(fields.into_iter().collect())
    }

    /// Parse a comma-separated list such as `"tags,title"`.
    pub fn parse(list: &str) -> Result<Self> {
        let fields = list
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(SummaryField::from_str)
            .collect::<Result<BTreeSet<_>>>()?;
        if fields.is_empty() {
            return Err(Error::InvalidInput("empty summary directive".into()));
        }
        Ok(Self(fields))
    }

    pub fn includes(&self, field: SummaryField) -> bool {
        self.0.contains(&field)
    }

    pub fn fields(&self) -> impl Iterator<Item = SummaryField> + '_ {
        self.0.iter().copied()
    }
}

impl Default for SummaryDirective {
    fn default() -> Self {
        Self::all()
    }
}

/// The unit of work flowing through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: Uuid,
    pub space_id: Uuid,
    pub user_id: Uuid,
    pub kind: KnowledgeKind,
    pub content_type: ContentType,
    /// Encrypted content blob.
    #[serde(skip_serializing)]
    pub content: Vec<u8>,
    pub title: String,
    pub summary: String,
    pub tags: Vec<String>,
    pub maybe_date: Option<String>,
    pub stage: Stage,
    pub retry_times: i32,
    /// Pending partial re-summarization, cleared on the next successful summarize.
    pub summarize_directive: Option<SummaryDirective>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl KnowledgeItem {
    /// Whether the item's expiry has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expired_at.is_some_and(|at| at <= now)
    }

    /// The directive the next summarize run should honor.
    pub fn directive(&self) -> SummaryDirective {
        self.summarize_directive.clone().unwrap_or_default()
    }

    /// Position of this item in `(updated_at, id)` order.
    pub fn cursor(&self) -> SweepCursor {
        SweepCursor {
            updated_at: self.updated_at,
            id: self.id,
        }
    }
}

/// Keyset position for paging unfinished items in `(updated_at, id)` order.
///
/// A page starts strictly after the cursor, so rows that move while a sweep
/// is paging never shift the rows behind them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SweepCursor {
    pub updated_at: DateTime<Utc>,
    pub id: Uuid,
}

/// A segment of normalized text derived from a knowledge item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: Uuid,
    pub knowledge_id: Uuid,
    pub space_id: Uuid,
    pub user_id: Uuid,
    pub chunk_index: i32,
    /// Encrypted chunk text.
    #[serde(skip_serializing)]
    pub content: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// One embedding per chunk, owned by the (item, chunk) pair.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: Uuid,
    pub knowledge_id: Uuid,
    /// `None` for the synthetic chunk of an atomic item.
    pub chunk_id: Option<Uuid>,
    pub space_id: Uuid,
    pub user_id: Uuid,
    pub embedding: Vector,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// Summary fields written together with the chunk replacement.
///
/// `None` leaves the persisted value untouched. `chunks: None` keeps the
/// existing chunks, which is how partial re-summarization preserves them.
#[derive(Debug, Clone, Default)]
pub struct SummaryCommit {
    pub chunks: Option<Vec<KnowledgeChunk>>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub tags: Option<Vec<String>>,
    pub maybe_date: Option<String>,
}

// =============================================================================
// AI RESULTS
// =============================================================================

/// Token accounting returned with every AI call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub model: String,
    pub prompt_tokens: i32,
    pub output_tokens: i32,
}

/// Result of a summarization call.
#[derive(Debug, Clone, Default)]
pub struct SummarizeOutput {
    pub chunks: Vec<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub date: Option<String>,
    pub usage: TokenUsage,
}

/// Result of a batch embedding call.
#[derive(Debug, Clone)]
pub struct EmbedOutput {
    pub vectors: Vec<Vector>,
    pub model: String,
    pub usage: TokenUsage,
}

// =============================================================================
// USAGE
// =============================================================================

/// What a usage record accounts for. Each subject has its own queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSubject {
    Knowledge,
    ChatMessage,
    ChatSession,
    Generic,
}

impl UsageSubject {
    pub const ALL: [UsageSubject; 4] = [
        UsageSubject::Knowledge,
        UsageSubject::ChatMessage,
        UsageSubject::ChatSession,
        UsageSubject::Generic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UsageSubject::Knowledge => "knowledge",
            UsageSubject::ChatMessage => "chat_message",
            UsageSubject::ChatSession => "chat_session",
            UsageSubject::Generic => "generic",
        }
    }
}

impl fmt::Display for UsageSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only token accounting fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub space_id: Uuid,
    pub user_id: Uuid,
    pub subject: UsageSubject,
    pub object_id: String,
    /// e.g. `"summarize"` or `"embedding"`.
    pub sub_type: String,
    pub model: String,
    pub prompt_tokens: i32,
    pub output_tokens: i32,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_matches_pipeline() {
        assert!(Stage::None < Stage::Summarize);
        assert!(Stage::Summarize < Stage::Embedding);
        assert!(Stage::Embedding < Stage::Done);
        assert!(Stage::Done < Stage::Failed);
    }

    #[test]
    fn test_stage_next() {
        assert_eq!(Stage::None.next(), Some(Stage::Summarize));
        assert_eq!(Stage::Summarize.next(), Some(Stage::Embedding));
        assert_eq!(Stage::Embedding.next(), Some(Stage::Done));
        assert_eq!(Stage::Done.next(), None);
        assert_eq!(Stage::Failed.next(), None);
    }

    #[test]
    fn test_stage_str_roundtrip() {
        for stage in [
            Stage::None,
            Stage::Summarize,
            Stage::Embedding,
            Stage::Done,
            Stage::Failed,
        ] {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("archived".parse::<Stage>().is_err());
    }

    #[test]
    fn test_stage_advance_from_stage() {
        let advance = StageAdvance::from_stage(Stage::Summarize).unwrap();
        assert_eq!(advance.from, Stage::Summarize);
        assert_eq!(advance.to, Stage::Embedding);
        assert!(StageAdvance::from_stage(Stage::Done).is_none());
    }

    #[test]
    fn test_stage_serializes_snake_case() {
        let json = serde_json::to_string(&Stage::Embedding).unwrap();
        assert_eq!(json, "\"embedding\"");
    }

    #[test]
    fn test_directive_parse() {
        let directive = SummaryDirective::parse("tags, title").unwrap();
        assert!(directive.includes(SummaryField::Tags));
        assert!(directive.includes(SummaryField::Title));
        assert!(!directive.includes(SummaryField::Chunks));
    }

    #[test]
    fn test_directive_parse_rejects_unknown_and_empty() {
        assert!(SummaryDirective::parse("tags,colour").is_err());
        assert!(SummaryDirective::parse(" , ").is_err());
    }

    #[test]
    fn test_directive_default_is_all() {
        let directive = SummaryDirective::default();
        for field in SummaryField::ALL {
            assert!(directive.includes(field));
        }
    }

    #[test]
    fn test_directive_serializes_as_list() {
        let directive = SummaryDirective::only([SummaryField::Tags]);
        let json = serde_json::to_string(&directive).unwrap();
        assert_eq!(json, "[\"tags\"]");
        let back: SummaryDirective = serde_json::from_str(&json).unwrap();
        assert_eq!(back, directive);
    }

    #[test]
    fn test_content_type_and_kind_parse() {
        assert_eq!("blocks".parse::<ContentType>().unwrap(), ContentType::Blocks);
        assert_eq!(
            "long_form".parse::<KnowledgeKind>().unwrap(),
            KnowledgeKind::LongForm
        );
        assert!("html".parse::<ContentType>().is_err());
    }

    #[test]
    fn test_usage_subject_as_str() {
        assert_eq!(UsageSubject::ChatMessage.as_str(), "chat_message");
        assert_eq!(UsageSubject::Knowledge.to_string(), "knowledge");
    }

    #[test]
    fn test_sweep_cursor_orders_by_time_then_id() {
        let at = Utc::now();
        let low = SweepCursor {
            updated_at: at,
            id: Uuid::nil(),
        };
        let high = SweepCursor {
            updated_at: at,
            id: Uuid::max(),
        };
        let later = SweepCursor {
            updated_at: at + chrono::Duration::milliseconds(1),
            id: Uuid::nil(),
        };
        assert!(low < high);
        assert!(high < later);
    }
}
