//! # docsmith: multi-tenant semantic document-search core
//!
//! Docsmith ingests product-catalog documents (PDF, DOCX, XLSX), OCRs
//! them, splits the text into overlapping layout-aware chunks, embeds each
//! chunk as a 1536-dimensional unit vector, indexes the vectors per
//! tenant, and answers natural-language queries by retrieving the top-k
//! most similar chunks and synthesising an answer through an LLM. Chat
//! sessions preserve bounded conversational context across turns.
//!
//! ```text
//! upload ──► JobQueue ──► IngestionCoordinator
//!                           │  blob ► ocr ► chunk ► embed
//!                           ▼
//!                 MetadataStore ──► VectorIndex (per-tenant partitions)
//!                                        ▲
//! query ──► SearchEngine ── embed ───────┘
//!              │                              ┌──► ResultCache
//! chat ──► ChatSessionManager ► QueryOrchestrator ──► LLM
//! ```
//!
//! Transport, authentication token issuance, and the concrete OCR /
//! embedding / LLM vendors stay outside this crate: the core consumes them
//! through the [`adapters`] traits and sees callers only as a resolved
//! [`context::RequestContext`].
//!
//! ## Tenant isolation
//!
//! Every document, chunk, embedding, index partition, cache namespace,
//! and rate-limit window is owned by exactly one tenant. Operations
//! authorise the request context against the target tenant before any
//! key, partition, or store query is built — see [`tenant`].
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use docsmith::service::Docsmith;
//!
//! let service = Docsmith::builder()
//!     .blob_store(blob)
//!     .ocr_engine(ocr)
//!     .embedding_engine(embedder)
//!     .language_model(llm)
//!     .build()?;
//! service.start().await?;
//!
//! let (document_id, status) = service
//!     .ingest_document(&ctx, &tenant, "catalog.pdf", "blob/catalog")
//!     .await?;
//! ```

pub mod adapters;
pub mod answer;
mod backoff;
pub mod cache;
pub mod chat;
pub mod chunking;
pub mod config;
pub mod context;
pub mod embedding;
pub mod errors;
pub mod index;
pub mod ingest;
pub mod ratelimit;
pub mod search;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod tenant;

pub use answer::{HistoryTurn, QueryResult};
pub use context::RequestContext;
pub use errors::ServiceError;
pub use service::{Docsmith, DocsmithBuilder};
pub use tenant::TenantId;
