//! Adapter seams for the external collaborators the core consumes.
//!
//! The concrete OCR, embedding, and LLM vendors live outside this crate;
//! the core only sees these traits. Implementations are expected to be
//! cheap to clone (or `Arc`-wrapped) and safe to share across Tokio tasks.
//! The [`Clock`] is injectable so TTL, backoff, and deadline behaviour is
//! testable without waiting on wall time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;

// ── Blob store ─────────────────────────────────────────────────────────

/// Read-only access to uploaded document bytes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch the raw bytes behind an opaque blob reference.
    async fn fetch(&self, blob_ref: &str) -> Result<Vec<u8>, ServiceError>;
}

// ── OCR engine ─────────────────────────────────────────────────────────

/// Structural role of a recognised text block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    Paragraph,
    Heading,
    Table,
    List,
}

impl LayoutKind {
    /// Blocks of this kind are kept whole during layout-preserving chunking.
    #[must_use]
    pub fn is_atomic(self) -> bool {
        matches!(self, Self::Heading | Self::Table | Self::List)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Paragraph => "paragraph",
            Self::Heading => "heading",
            Self::Table => "table",
            Self::List => "list",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ServiceError> {
        match raw {
            "paragraph" => Ok(Self::Paragraph),
            "heading" => Ok(Self::Heading),
            "table" => Ok(Self::Table),
            "list" => Ok(Self::List),
            other => Err(ServiceError::Internal(format!(
                "unknown layout kind '{other}'"
            ))),
        }
    }
}

/// One recognised block of text with its position and recognition quality.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    /// 1-based page number the block was recognised on.
    pub page: u32,
    pub layout: LayoutKind,
    /// Recognition confidence in `[0.0, 1.0]`.
    pub confidence: f32,
}

impl TextBlock {
    pub fn new(text: impl Into<String>, page: u32, layout: LayoutKind, confidence: f32) -> Self {
        Self {
            text: text.into(),
            page,
            layout,
            confidence,
        }
    }
}

/// Text extraction over document bytes.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Recognise the document and return its text blocks in reading order.
    async fn process(&self, bytes: &[u8]) -> Result<Vec<TextBlock>, ServiceError>;
}

// ── Embedding engine ───────────────────────────────────────────────────

/// Batched text vectorisation.
///
/// Implementations return one vector per input text, in input order. The
/// pipeline validates dimension and norm on every returned vector, so
/// engines need not normalise.
#[async_trait]
pub trait EmbeddingEngine: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError>;
}

// ── Language model ─────────────────────────────────────────────────────

/// A single completion request.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-request identifier passed upstream for auditing; carries the
    /// tenant id.
    pub user_tag: String,
}

/// A completed LLM response.
#[derive(Clone, Debug)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub tokens_used: u32,
}

/// Answer synthesis over an assembled prompt.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ServiceError>;
}

// ── Clock ──────────────────────────────────────────────────────────────

/// Source of time for TTLs, rate-limit windows, and deadlines.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
