//! The service facade: adapter wiring, lifecycle, and the transport-agnostic
//! operation surface.
//!
//! A [`Docsmith`] instance owns every component and exposes the in-process
//! operations the transport layer calls: ingest, status, search, answer,
//! and chat. Every operation takes a [`RequestContext`] and authorises it
//! against the target tenant before anything else happens.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::{BlobStore, Clock, EmbeddingEngine, LanguageModel, OcrEngine, SystemClock};
use crate::answer::{HistoryTurn, QueryOrchestrator, QueryResult};
use crate::cache::{CacheBackend, CacheKind, InMemoryCacheBackend, ResultCache};
use crate::chat::{ChatSessionManager, ChatTurn};
use crate::chunking::Chunker;
use crate::config::ServiceConfig;
use crate::context::RequestContext;
use crate::embedding::EmbeddingPipeline;
use crate::errors::ServiceError;
use crate::index::VectorIndex;
use crate::ingest::{
    IngestJob, IngestionCoordinator, JobQueue, ProgressEvent, ProgressReporter, WorkerPool,
};
use crate::ratelimit::{RateBucket, RateLimiter};
use crate::search::{SearchEngine, SearchHit};
use crate::store::memory::InMemoryMetadataStore;
use crate::store::{
    DocumentFormat, DocumentRecord, DocumentStatus, MetadataStore, SessionRecord, TenantRecord,
};
use crate::tenant::{TenantId, TenantRegistry, TenantStatus};

/// Caller-facing view of a document's processing state.
#[derive(Clone, Debug)]
pub struct DocumentStatusView {
    pub status: DocumentStatus,
    pub retry_count: u32,
    pub error: Option<String>,
    pub error_kind: Option<String>,
}

/// Liveness summary, cached per tenant under the health TTL.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub store_ok: bool,
    pub queue_depth: usize,
    pub workers: usize,
}

struct RuntimeState {
    queue: JobQueue,
    pool: WorkerPool,
}

// ── Builder ────────────────────────────────────────────────────────────

/// Builder for [`Docsmith`]. The blob store, OCR, embedding, and LLM
/// adapters are required; the metadata store, cache backend, and clock
/// default to in-process implementations.
#[derive(Default)]
pub struct DocsmithBuilder {
    config: Option<ServiceConfig>,
    store: Option<Arc<dyn MetadataStore>>,
    blob: Option<Arc<dyn BlobStore>>,
    ocr: Option<Arc<dyn OcrEngine>>,
    embedder: Option<Arc<dyn EmbeddingEngine>>,
    llm: Option<Arc<dyn LanguageModel>>,
    cache_backend: Option<Arc<dyn CacheBackend>>,
    clock: Option<Arc<dyn Clock>>,
}

impl DocsmithBuilder {
    #[must_use]
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn metadata_store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn blob_store(mut self, blob: Arc<dyn BlobStore>) -> Self {
        self.blob = Some(blob);
        self
    }

    #[must_use]
    pub fn ocr_engine(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    #[must_use]
    pub fn embedding_engine(mut self, embedder: Arc<dyn EmbeddingEngine>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    #[must_use]
    pub fn language_model(mut self, llm: Arc<dyn LanguageModel>) -> Self {
        self.llm = Some(llm);
        self
    }

    #[must_use]
    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Wire the service together. Fails when a required adapter is missing.
    pub fn build(self) -> Result<Docsmith, ServiceError> {
        let config = self.config.unwrap_or_default();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryMetadataStore::new()));
        let blob = self.blob.ok_or_else(|| missing("blob store"))?;
        let ocr = self.ocr.ok_or_else(|| missing("OCR engine"))?;
        let embedder = self.embedder.ok_or_else(|| missing("embedding engine"))?;
        let llm = self.llm.ok_or_else(|| missing("language model"))?;
        let cache_backend = self.cache_backend.unwrap_or_else(|| {
            Arc::new(InMemoryCacheBackend::new(
                config.cache.shards,
                config.cache.byte_budget,
                clock.clone(),
            ))
        });

        let registry = Arc::new(TenantRegistry::new(
            store.clone(),
            clock.clone(),
            config.tenants.resolve_ttl,
        ));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), clock.clone()));
        let cache = Arc::new(ResultCache::new(cache_backend, config.cache.clone()));
        let index = Arc::new(VectorIndex::new(store.clone(), config.index.clone()));
        let embeddings = Arc::new(EmbeddingPipeline::new(embedder, config.embedding.clone()));

        let search = Arc::new(SearchEngine::new(
            limiter.clone(),
            cache.clone(),
            embeddings.clone(),
            index.clone(),
            store.clone(),
            config.index.clone(),
        ));
        let orchestrator = Arc::new(QueryOrchestrator::new(
            limiter.clone(),
            cache.clone(),
            search.clone(),
            llm,
            config.query.clone(),
        ));
        let chat = ChatSessionManager::new(
            store.clone(),
            orchestrator.clone(),
            clock.clone(),
            config.chat.clone(),
        );

        let (progress, progress_rx) = ProgressReporter::channel();
        let coordinator = Arc::new(IngestionCoordinator::new(
            store.clone(),
            blob,
            ocr,
            Chunker::new(config.chunker.clone()),
            embeddings,
            index.clone(),
            clock.clone(),
            progress,
            config.ingestion.clone(),
        ));

        Ok(Docsmith {
            config,
            clock,
            store,
            registry,
            limiter,
            cache,
            index,
            search,
            orchestrator,
            chat,
            coordinator,
            progress_rx,
            runtime: Mutex::new(None),
        })
    }
}

fn missing(what: &str) -> ServiceError {
    ServiceError::Internal(format!("service builder is missing the {what} adapter"))
}

// ── Docsmith ───────────────────────────────────────────────────────────

/// The assembled document-search core.
pub struct Docsmith {
    config: ServiceConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn MetadataStore>,
    registry: Arc<TenantRegistry>,
    limiter: Arc<RateLimiter>,
    cache: Arc<ResultCache>,
    index: Arc<VectorIndex>,
    search: Arc<SearchEngine>,
    orchestrator: Arc<QueryOrchestrator>,
    chat: ChatSessionManager,
    coordinator: Arc<IngestionCoordinator>,
    progress_rx: flume::Receiver<ProgressEvent>,
    runtime: Mutex<Option<RuntimeState>>,
}

impl Docsmith {
    #[must_use]
    pub fn builder() -> DocsmithBuilder {
        DocsmithBuilder::default()
    }

    /// Validate store connectivity, recover documents stranded by a hard
    /// kill, start the worker pool, and re-enqueue queued work.
    pub async fn start(&self) -> Result<(), ServiceError> {
        self.store.ping().await?;

        let reset = self.store.reset_processing_documents().await?;
        if reset > 0 {
            info!(reset, "reset documents stranded in processing back to queued");
        }

        let (queue, pool) = crate::ingest::queue::start(
            self.coordinator.clone(),
            &self.config.workers,
            self.config.ingestion.max_retries,
            self.config.ingestion.retry_backoff,
        );

        let backlog = self
            .store
            .documents_with_status(DocumentStatus::Queued, self.config.workers.queue_capacity)
            .await?;
        for doc in backlog {
            let job = IngestJob {
                tenant: doc.tenant.clone(),
                document_id: doc.id.clone(),
                attempt: 0,
            };
            if queue.enqueue(job).is_err() {
                warn!(document = %doc.id, "backlog re-enqueue skipped: queue full");
                break;
            }
        }

        *self.runtime.lock() = Some(RuntimeState { queue, pool });
        info!(workers = self.config.workers.workers, "docsmith started");
        Ok(())
    }

    /// Stop intake and drain in-flight jobs under the configured deadline.
    pub async fn shutdown(&self) {
        let runtime = self.runtime.lock().take();
        if let Some(RuntimeState { queue, pool }) = runtime {
            drop(queue);
            pool.shutdown().await;
        }
        info!("docsmith stopped");
    }

    /// Subscribe to ingestion progress events.
    #[must_use]
    pub fn progress_events(&self) -> flume::Receiver<ProgressEvent> {
        self.progress_rx.clone()
    }

    /// Register (or re-activate) a tenant. An administrative operation.
    pub async fn register_tenant(&self, tenant: &TenantId) -> Result<(), ServiceError> {
        self.store
            .upsert_tenant(TenantRecord {
                id: tenant.clone(),
                status: TenantStatus::Active,
                created_at: self.clock.now(),
            })
            .await?;
        self.registry.invalidate(tenant);
        Ok(())
    }

    /// Disable a tenant; every subsequent operation for it is rejected.
    pub async fn disable_tenant(&self, tenant: &TenantId) -> Result<(), ServiceError> {
        self.store
            .upsert_tenant(TenantRecord {
                id: tenant.clone(),
                status: TenantStatus::Disabled,
                created_at: self.clock.now(),
            })
            .await?;
        self.registry.invalidate(tenant);
        Ok(())
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Accept an uploaded document and queue it for ingestion.
    pub async fn ingest_document(
        &self,
        ctx: &RequestContext,
        tenant: &TenantId,
        filename: &str,
        blob_ref: &str,
    ) -> Result<(String, DocumentStatus), ServiceError> {
        self.authorize(tenant, ctx).await?;
        self.limiter.check(tenant, ctx.identity(), RateBucket::Api)?;
        let format = DocumentFormat::from_filename(filename)?;

        let document_id = Uuid::new_v4().to_string();
        let record = DocumentRecord::new(
            document_id.clone(),
            tenant.clone(),
            filename,
            format,
            blob_ref,
            self.clock.now(),
        );
        self.store.insert_document(record).await?;
        self.store
            .transition_document(
                tenant,
                &document_id,
                &[DocumentStatus::Pending],
                DocumentStatus::Queued,
            )
            .await?;

        if let Err(err) = self.enqueue(tenant, &document_id, 0) {
            // Back out of the queued claim so the document is visibly
            // waiting rather than falsely in flight.
            let _ = self
                .store
                .transition_document(
                    tenant,
                    &document_id,
                    &[DocumentStatus::Queued],
                    DocumentStatus::Pending,
                )
                .await;
            return Err(err);
        }

        info!(tenant = %tenant, document = %document_id, filename, "document accepted");
        Ok((document_id, DocumentStatus::Queued))
    }

    /// Current processing state of a document.
    pub async fn document_status(
        &self,
        ctx: &RequestContext,
        tenant: &TenantId,
        document_id: &str,
    ) -> Result<DocumentStatusView, ServiceError> {
        self.authorize(tenant, ctx).await?;
        let doc = self
            .store
            .fetch_document(tenant, document_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound {
                what: format!("document '{document_id}'"),
            })?;
        Ok(DocumentStatusView {
            status: doc.status,
            retry_count: doc.retry_count,
            error: doc.error,
            error_kind: doc.error_kind,
        })
    }

    /// Explicit re-ingest: clears prior chunks, embeddings, and index
    /// entries, resets the retry budget, writes an audit entry, and queues
    /// the document again.
    pub async fn reingest_document(
        &self,
        ctx: &RequestContext,
        tenant: &TenantId,
        document_id: &str,
    ) -> Result<(), ServiceError> {
        self.authorize(tenant, ctx).await?;
        let mut doc = self
            .store
            .fetch_document(tenant, document_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound {
                what: format!("document '{document_id}'"),
            })?;

        let removed = self.store.delete_document_chunks(tenant, document_id).await?;
        self.index.remove(tenant, &removed).await?;

        let prior_status = doc.status.as_str();
        doc.status = DocumentStatus::Queued;
        doc.retry_count = 0;
        doc.error = None;
        doc.error_kind = None;
        doc.processed_at = None;
        append_audit(
            &mut doc.metadata,
            json!({
                "action": "reingest",
                "prior_status": prior_status,
                "by": ctx.identity(),
                "at": self.clock.now().to_rfc3339(),
            }),
        );
        self.store.update_document(doc).await?;

        self.enqueue(tenant, document_id, 0)
    }

    /// Delete a document with its chunks, embeddings, and index entries.
    pub async fn delete_document(
        &self,
        ctx: &RequestContext,
        tenant: &TenantId,
        document_id: &str,
    ) -> Result<(), ServiceError> {
        self.authorize(tenant, ctx).await?;
        let removed = self.store.delete_document(tenant, document_id).await?;
        self.index.remove(tenant, &removed).await?;
        info!(tenant = %tenant, document = document_id, "document deleted");
        Ok(())
    }

    /// Top-k semantic search over the tenant's indexed chunks.
    pub async fn search(
        &self,
        ctx: &RequestContext,
        tenant: &TenantId,
        query: &str,
        top_k: Option<usize>,
        threshold: Option<f32>,
    ) -> Result<Vec<SearchHit>, ServiceError> {
        self.authorize(tenant, ctx).await?;
        self.search.search(ctx, tenant, query, top_k, threshold).await
    }

    /// Retrieval-augmented answer for a query.
    pub async fn answer(
        &self,
        ctx: &RequestContext,
        tenant: &TenantId,
        query: &str,
        history: &[HistoryTurn],
    ) -> Result<QueryResult, ServiceError> {
        self.authorize(tenant, ctx).await?;
        self.orchestrator.answer(ctx, tenant, query, history).await
    }

    /// Open a chat session.
    pub async fn open_session(
        &self,
        ctx: &RequestContext,
        tenant: &TenantId,
        user: &str,
        title: &str,
    ) -> Result<SessionRecord, ServiceError> {
        self.authorize(tenant, ctx).await?;
        self.chat.open_session(tenant, user, title).await
    }

    /// Send one chat message and receive the answered turn.
    pub async fn send_message(
        &self,
        ctx: &RequestContext,
        tenant: &TenantId,
        session_id: &str,
        content: &str,
    ) -> Result<ChatTurn, ServiceError> {
        self.authorize(tenant, ctx).await?;
        self.chat.process_turn(ctx, tenant, session_id, content).await
    }

    /// Cached liveness summary.
    pub async fn health(
        &self,
        ctx: &RequestContext,
        tenant: &TenantId,
    ) -> Result<HealthReport, ServiceError> {
        self.authorize(tenant, ctx).await?;
        if let Some(cached) = self.cache.get_json(tenant, CacheKind::Health, "health").await
            && let Ok(report) = serde_json::from_value::<HealthReport>(cached)
        {
            return Ok(report);
        }

        let store_ok = self.store.ping().await.is_ok();
        let queue_depth = self
            .runtime
            .lock()
            .as_ref()
            .map_or(0, |r| r.queue.depth());
        let report = HealthReport {
            healthy: store_ok,
            store_ok,
            queue_depth,
            workers: self.config.workers.workers,
        };
        if let Ok(value) = serde_json::to_value(&report) {
            self.cache
                .set_json(tenant, CacheKind::Health, "health", &value)
                .await;
        }
        Ok(report)
    }

    /// Vector-partition rebuild progress for a tenant, if a rebuild started.
    #[must_use]
    pub fn index_rebuild_progress(&self, tenant: &TenantId) -> Option<usize> {
        self.index.rebuild_progress(tenant)
    }

    /// Test/ops observability: available OCR permits.
    #[must_use]
    pub fn available_ocr_permits(&self) -> usize {
        self.coordinator.available_ocr_permits()
    }

    // ── Internals ──────────────────────────────────────────────────

    async fn authorize(
        &self,
        tenant: &TenantId,
        ctx: &RequestContext,
    ) -> Result<(), ServiceError> {
        if ctx.is_expired(self.clock.as_ref()) {
            return Err(ServiceError::Cancelled("request deadline elapsed".into()));
        }
        self.registry.authorize(tenant, ctx).await?;
        Ok(())
    }

    fn enqueue(&self, tenant: &TenantId, document_id: &str, attempt: u32) -> Result<(), ServiceError> {
        let runtime = self.runtime.lock();
        let Some(state) = runtime.as_ref() else {
            return Err(ServiceError::Internal(
                "service not started: ingestion queue unavailable".into(),
            ));
        };
        state.queue.enqueue(IngestJob {
            tenant: tenant.clone(),
            document_id: document_id.to_string(),
            attempt,
        })
    }
}

fn append_audit(metadata: &mut serde_json::Value, entry: serde_json::Value) {
    if !metadata.is_object() {
        *metadata = json!({});
    }
    if let Some(map) = metadata.as_object_mut() {
        let audit = map
            .entry("audit".to_string())
            .or_insert_with(|| json!([]));
        if let Some(entries) = audit.as_array_mut() {
            entries.push(entry);
        }
    }
}
