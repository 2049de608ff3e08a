//! Persistent metadata records and the storage backend seam.
//!
//! The [`MetadataStore`] trait abstracts over storage backends: documents,
//! chunks, embeddings, chat sessions, and messages, transactional per
//! document. Two backends ship with the crate:
//!
//! * [`memory::InMemoryMetadataStore`] — process-local, used in tests and
//!   as the zero-setup default.
//! * [`sqlite::SqliteMetadataStore`] — durable single-file backend.
//!
//! Chunk and embedding ids are content-addressed so that re-ingesting the
//! same bytes yields the same ids and the vector index converges without
//! duplicates.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::adapters::LayoutKind;
use crate::config::SCHEMA_VERSION;
use crate::errors::ServiceError;
use crate::tenant::{TenantId, TenantStatus};

// ── Records ────────────────────────────────────────────────────────────

/// Persisted tenant row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: TenantId,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
}

/// Document lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Invalid,
}

impl DocumentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Invalid => "invalid",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ServiceError> {
        match raw {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "invalid" => Ok(Self::Invalid),
            other => Err(ServiceError::Internal(format!(
                "unknown document status '{other}'"
            ))),
        }
    }
}

/// Supported upload formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Xlsx,
}

impl DocumentFormat {
    /// Derive the format from a filename extension.
    pub fn from_filename(filename: &str) -> Result<Self, ServiceError> {
        let ext = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => Ok(Self::Pdf),
            "docx" => Ok(Self::Docx),
            "xlsx" => Ok(Self::Xlsx),
            _ => Err(ServiceError::Validation(format!(
                "unsupported document format for '{filename}' (expected pdf, docx, or xlsx)"
            ))),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Xlsx => "xlsx",
        }
    }
}

/// Persisted document row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub tenant: TenantId,
    pub filename: String,
    pub format: DocumentFormat,
    /// Opaque reference into the blob store.
    pub blob_ref: String,
    pub status: DocumentStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    /// Free-form processing metadata (chunk counts, OCR retries, timings,
    /// re-ingest audit entries).
    pub metadata: serde_json::Value,
    pub schema_version: String,
}

impl DocumentRecord {
    pub fn new(
        id: impl Into<String>,
        tenant: TenantId,
        filename: impl Into<String>,
        format: DocumentFormat,
        blob_ref: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            tenant,
            filename: filename.into(),
            format,
            blob_ref: blob_ref.into(),
            status: DocumentStatus::Pending,
            retry_count: 0,
            created_at,
            processed_at: None,
            error: None,
            error_kind: None,
            metadata: serde_json::Value::Object(Default::default()),
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }
}

/// Chunk embedding state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Embedded,
    Error,
}

impl ChunkStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Embedded => "embedded",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ServiceError> {
        match raw {
            "pending" => Ok(Self::Pending),
            "embedded" => Ok(Self::Embedded),
            "error" => Ok(Self::Error),
            other => Err(ServiceError::Internal(format!(
                "unknown chunk status '{other}'"
            ))),
        }
    }
}

/// Persisted chunk row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub document_id: String,
    pub tenant: TenantId,
    /// Monotonic position within the document, unique per document.
    pub sequence: u32,
    pub content: String,
    pub page: u32,
    pub layout: LayoutKind,
    pub confidence: f32,
    pub preserving_layout: bool,
    pub status: ChunkStatus,
    pub created_at: DateTime<Utc>,
    pub schema_version: String,
}

/// Persisted embedding row: 1536 32-bit floats plus metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: String,
    pub chunk_id: String,
    pub tenant: TenantId,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub schema_version: String,
}

/// Chat session lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Inactive,
}

/// Persisted chat session row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub tenant: TenantId,
    pub user: String,
    pub title: String,
    pub status: SessionStatus,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Message author role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    System,
}

impl MessageRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
        }
    }
}

/// Persisted chat message row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub session_id: String,
    pub tenant: TenantId,
    pub role: MessageRole,
    pub content: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ── Content-addressed ids ──────────────────────────────────────────────

/// Stable chunk id derived from the owning document, the chunk's position,
/// and its content. Re-ingesting identical bytes reproduces identical ids.
#[must_use]
pub fn chunk_id(document_id: &str, sequence: u32, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(sequence.to_le_bytes());
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 32)
}

/// Stable embedding id derived from its chunk id (exactly one embedding per
/// chunk).
#[must_use]
pub fn embedding_id(chunk_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chunk_id.as_bytes());
    hasher.update(b":embedding");
    let digest = hasher.finalize();
    hex_prefix(&digest, 32)
}

fn hex_prefix(digest: &[u8], len: usize) -> String {
    let mut out = String::with_capacity(len);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
        if out.len() >= len {
            break;
        }
    }
    out.truncate(len);
    out
}

// ── MetadataStore trait ────────────────────────────────────────────────

/// Backend seam for all persisted metadata.
///
/// Every method that touches tenant-owned rows takes the owning
/// [`TenantId`]; implementations must never return rows belonging to a
/// different tenant.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Cheap connectivity probe used at startup.
    async fn ping(&self) -> Result<(), ServiceError>;

    // tenants
    async fn fetch_tenant(&self, id: &TenantId) -> Result<Option<TenantRecord>, ServiceError>;
    async fn upsert_tenant(&self, record: TenantRecord) -> Result<(), ServiceError>;

    // documents
    async fn insert_document(&self, record: DocumentRecord) -> Result<(), ServiceError>;
    async fn fetch_document(
        &self,
        tenant: &TenantId,
        id: &str,
    ) -> Result<Option<DocumentRecord>, ServiceError>;
    /// Atomic status transition. Returns `false` (without writing) when the
    /// current status is not one of `from` — the CAS that arbitrates worker
    /// ownership of a document.
    async fn transition_document(
        &self,
        tenant: &TenantId,
        id: &str,
        from: &[DocumentStatus],
        to: DocumentStatus,
    ) -> Result<bool, ServiceError>;
    /// Full-row update (status, retries, error fields, metadata).
    async fn update_document(&self, record: DocumentRecord) -> Result<(), ServiceError>;
    /// Crash recovery: every document left `processing` goes back to
    /// `queued`. Returns the number of rows reset.
    async fn reset_processing_documents(&self) -> Result<u64, ServiceError>;
    /// Documents currently carrying the given status, oldest first.
    async fn documents_with_status(
        &self,
        status: DocumentStatus,
        limit: usize,
    ) -> Result<Vec<DocumentRecord>, ServiceError>;
    /// Delete a document with its chunks and embeddings. Returns the ids of
    /// the embeddings removed so the caller can purge the index.
    async fn delete_document(
        &self,
        tenant: &TenantId,
        id: &str,
    ) -> Result<Vec<String>, ServiceError>;

    // chunks + embeddings
    /// Persist chunks and embeddings and apply the final document row
    /// (status `completed`, `processed_at`, metadata) in one unit of work.
    async fn persist_ingestion(
        &self,
        document: DocumentRecord,
        chunks: Vec<ChunkRecord>,
        embeddings: Vec<EmbeddingRecord>,
    ) -> Result<(), ServiceError>;
    /// Persist chunk rows outside the completion path (used to retain
    /// `error`-status chunks of a failed document).
    async fn persist_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<(), ServiceError>;
    /// All chunks of one document, ordered by sequence.
    async fn chunks_for_document(
        &self,
        tenant: &TenantId,
        document_id: &str,
    ) -> Result<Vec<ChunkRecord>, ServiceError>;
    /// Load the chunk payloads behind embedding ids, preserving input order.
    /// Unknown ids are skipped.
    async fn chunks_by_embedding_ids(
        &self,
        tenant: &TenantId,
        embedding_ids: &[String],
    ) -> Result<Vec<ChunkRecord>, ServiceError>;
    /// All embeddings owned by the tenant (partition rebuild).
    async fn embeddings_for_tenant(
        &self,
        tenant: &TenantId,
    ) -> Result<Vec<EmbeddingRecord>, ServiceError>;
    /// Remove a document's chunks and embeddings (re-ingest or cleanup),
    /// returning the removed embedding ids.
    async fn delete_document_chunks(
        &self,
        tenant: &TenantId,
        document_id: &str,
    ) -> Result<Vec<String>, ServiceError>;

    // chat
    async fn insert_session(&self, record: SessionRecord) -> Result<(), ServiceError>;
    async fn fetch_session(
        &self,
        tenant: &TenantId,
        id: &str,
    ) -> Result<Option<SessionRecord>, ServiceError>;
    async fn update_session(&self, record: SessionRecord) -> Result<(), ServiceError>;
    async fn append_message(&self, record: MessageRecord) -> Result<(), ServiceError>;
    /// The most recent `limit` messages of a session, returned oldest-first.
    async fn recent_messages(
        &self,
        tenant: &TenantId,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_addressed_ids_are_stable() {
        let a = chunk_id("doc-1", 0, "some content");
        let b = chunk_id("doc-1", 0, "some content");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        assert_ne!(a, chunk_id("doc-1", 1, "some content"));
        assert_ne!(a, chunk_id("doc-2", 0, "some content"));
        assert_ne!(a, chunk_id("doc-1", 0, "other content"));

        let e = embedding_id(&a);
        assert_eq!(e, embedding_id(&a));
        assert_ne!(e, a);
    }

    #[test]
    fn format_detection() {
        assert_eq!(
            DocumentFormat::from_filename("catalog.PDF").unwrap(),
            DocumentFormat::Pdf
        );
        assert_eq!(
            DocumentFormat::from_filename("specs.docx").unwrap(),
            DocumentFormat::Docx
        );
        assert!(DocumentFormat::from_filename("notes.txt").is_err());
        assert!(DocumentFormat::from_filename("no-extension").is_err());
    }

    #[test]
    fn status_round_trip() {
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Queued,
            DocumentStatus::Processing,
            DocumentStatus::Completed,
            DocumentStatus::Failed,
            DocumentStatus::Invalid,
        ] {
            assert_eq!(DocumentStatus::parse(status.as_str()).unwrap(), status);
        }
    }
}
