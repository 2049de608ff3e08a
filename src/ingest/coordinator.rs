//! Per-document ingestion state machine.
//!
//! Drives one document through fetch → OCR → chunk → embed → persist →
//! index. Ownership is arbitrated by a status CAS (`queued`/`failed` →
//! `processing`); OCR runs under the process-wide GPU semaphore with the
//! permit released on every exit path; chunks, embeddings, and the
//! `completed` row commit in one store unit of work **before** the index
//! add, so a crash between the two steps is healed by the lazy partition
//! rebuild (ids are content-addressed, re-adding is idempotent).

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::{BlobStore, Clock, OcrEngine, TextBlock};
use crate::backoff::backoff_delay;
use crate::chunking::{ChunkDraft, Chunker};
use crate::config::IngestionConfig;
use crate::embedding::EmbeddingPipeline;
use crate::errors::ServiceError;
use crate::index::VectorIndex;
use crate::ingest::progress::{IngestStage, ProgressReporter};
use crate::store::{
    ChunkRecord, ChunkStatus, DocumentRecord, DocumentStatus, EmbeddingRecord, MetadataStore,
    chunk_id, embedding_id,
};
use crate::tenant::TenantId;

/// Result of one processing attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The document reached `completed`.
    Completed {
        chunk_count: usize,
        embedding_count: usize,
    },
    /// The CAS guard failed — another worker owns the document, or its
    /// retry budget is exhausted.
    NotClaimed,
}

struct PipelineStats {
    chunk_count: usize,
    embedding_count: usize,
}

/// Drives documents through the ingestion pipeline.
pub struct IngestionCoordinator {
    store: Arc<dyn MetadataStore>,
    blob: Arc<dyn BlobStore>,
    ocr: Arc<dyn OcrEngine>,
    chunker: Chunker,
    embeddings: Arc<EmbeddingPipeline>,
    index: Arc<VectorIndex>,
    clock: Arc<dyn Clock>,
    ocr_permits: Arc<Semaphore>,
    progress: ProgressReporter,
    config: IngestionConfig,
}

impl IngestionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blob: Arc<dyn BlobStore>,
        ocr: Arc<dyn OcrEngine>,
        chunker: Chunker,
        embeddings: Arc<EmbeddingPipeline>,
        index: Arc<VectorIndex>,
        clock: Arc<dyn Clock>,
        progress: ProgressReporter,
        config: IngestionConfig,
    ) -> Self {
        let ocr_permits = Arc::new(Semaphore::new(config.max_concurrent_ocr.max(1)));
        Self {
            store,
            blob,
            ocr,
            chunker,
            embeddings,
            index,
            clock,
            ocr_permits,
            progress,
            config,
        }
    }

    /// Outstanding GPU permits available right now (test observability).
    #[must_use]
    pub fn available_ocr_permits(&self) -> usize {
        self.ocr_permits.available_permits()
    }

    /// Process one document end to end.
    ///
    /// On a transient error the document lands in `failed` with
    /// `retry_count` incremented; the worker pool decides whether to
    /// re-enqueue. On cancellation before anything was persisted, the
    /// document returns to `queued`.
    pub async fn process(
        &self,
        tenant: &TenantId,
        document_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, ServiceError> {
        let document = self
            .store
            .fetch_document(tenant, document_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound {
                what: format!("document '{document_id}'"),
            })?;

        if document.retry_count >= self.config.max_retries {
            warn!(
                tenant = %tenant,
                document = document_id,
                retry_count = document.retry_count,
                "retry budget exhausted; leaving document failed"
            );
            return Ok(ProcessOutcome::NotClaimed);
        }

        let claimed = self
            .store
            .transition_document(
                tenant,
                document_id,
                &[DocumentStatus::Queued, DocumentStatus::Failed],
                DocumentStatus::Processing,
            )
            .await?;
        if !claimed {
            return Ok(ProcessOutcome::NotClaimed);
        }
        self.progress.emit(tenant, document_id, IngestStage::Claimed);

        let started = Instant::now();
        match self.run_pipeline(&document, cancel, started).await {
            Ok(stats) => {
                self.progress.emit(tenant, document_id, IngestStage::Completed);
                info!(
                    tenant = %tenant,
                    document = document_id,
                    chunks = stats.chunk_count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "document ingested"
                );
                Ok(ProcessOutcome::Completed {
                    chunk_count: stats.chunk_count,
                    embedding_count: stats.embedding_count,
                })
            }
            Err(err) if err.is_cancelled() => {
                // Nothing was persisted before the persist step, so the
                // claim simply reverts.
                let _ = self
                    .store
                    .transition_document(
                        tenant,
                        document_id,
                        &[DocumentStatus::Processing],
                        DocumentStatus::Queued,
                    )
                    .await;
                self.progress.emit(tenant, document_id, IngestStage::Cancelled);
                Err(err)
            }
            Err(err) => {
                self.fail_document(&document, &err).await;
                self.progress.emit(tenant, document_id, IngestStage::Failed);
                Err(err)
            }
        }
    }

    async fn run_pipeline(
        &self,
        document: &DocumentRecord,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<PipelineStats, ServiceError> {
        let tenant = &document.tenant;

        // Fetch bytes.
        self.progress.emit(tenant, &document.id, IngestStage::Fetching);
        let bytes = tokio::select! {
            () = cancel.cancelled() => return Err(cancelled("blob fetch")),
            fetched = tokio::time::timeout(
                self.config.metadata_timeout,
                self.blob.fetch(&document.blob_ref),
            ) => match fetched {
                Ok(inner) => inner?,
                Err(_) => {
                    return Err(ServiceError::TransientUpstream {
                        stage: "blob",
                        message: "blob fetch timed out".into(),
                    });
                }
            },
        };
        if bytes.len() > self.config.max_file_size {
            return Err(ServiceError::Validation(format!(
                "document is {} bytes, limit is {}",
                bytes.len(),
                self.config.max_file_size
            )));
        }

        // OCR under the GPU semaphore.
        self.progress.emit(tenant, &document.id, IngestStage::Ocr);
        let (blocks, ocr_retries) = self.run_ocr(&bytes, cancel).await?;

        // Chunk.
        self.progress.emit(tenant, &document.id, IngestStage::Chunking);
        let drafts = self.chunker.chunk_blocks(&blocks);
        if cancel.is_cancelled() {
            return Err(cancelled("chunking"));
        }

        // Embed.
        self.progress.emit(tenant, &document.id, IngestStage::Embedding);
        let vectors = self.run_embedding(document, &drafts, cancel).await?;

        // Persist, then index. The store commit is the point of no return;
        // everything before it leaves no durable trace.
        self.progress.emit(tenant, &document.id, IngestStage::Indexing);
        let now = self.clock.now();
        let mut chunk_records = Vec::with_capacity(drafts.len());
        let mut embedding_records = Vec::with_capacity(drafts.len());
        let mut index_entries = Vec::with_capacity(drafts.len());
        for (draft, vector) in drafts.iter().zip(&vectors) {
            let chunk = draft_to_record(document, draft, ChunkStatus::Embedded, now);
            let embedding = EmbeddingRecord {
                id: embedding_id(&chunk.id),
                chunk_id: chunk.id.clone(),
                tenant: tenant.clone(),
                vector: vector.clone(),
                created_at: now,
                schema_version: chunk.schema_version.clone(),
            };
            index_entries.push((embedding.id.clone(), vector.clone()));
            chunk_records.push(chunk);
            embedding_records.push(embedding);
        }

        let mut completed = document.clone();
        completed.status = DocumentStatus::Completed;
        completed.processed_at = Some(now);
        completed.error = None;
        completed.error_kind = None;
        merge_metadata(
            &mut completed.metadata,
            json!({
                "chunk_count": chunk_records.len(),
                "embedding_count": embedding_records.len(),
                "ocr_retries": ocr_retries,
                "processing_time_ms": started.elapsed().as_millis() as u64,
                "processing_successful": true,
            }),
        );

        let stats = PipelineStats {
            chunk_count: chunk_records.len(),
            embedding_count: embedding_records.len(),
        };
        self.store
            .persist_ingestion(completed, chunk_records, embedding_records)
            .await?;

        if let Err(err) = self.index.add_batch(tenant, index_entries).await {
            // The store already holds the truth; drop the partition so the
            // next access rebuilds a consistent view.
            warn!(
                tenant = %tenant,
                document = %document.id,
                error = %err,
                "index add failed after persistence; partition will rebuild"
            );
            self.index.clear(tenant);
        }

        Ok(stats)
    }

    /// OCR with internal retries. The GPU permit is held for the duration of
    /// the step and released on every path out, including errors and
    /// cancellation.
    async fn run_ocr(
        &self,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(Vec<TextBlock>, u32), ServiceError> {
        let permit = tokio::select! {
            () = cancel.cancelled() => return Err(cancelled("ocr permit wait")),
            permit = self.ocr_permits.clone().acquire_owned() => {
                permit.map_err(|_| ServiceError::Internal("OCR semaphore closed".into()))?
            }
        };

        let mut attempt = 0u32;
        let result = loop {
            let call = tokio::time::timeout(self.config.ocr_timeout, self.ocr.process(bytes));
            let outcome = tokio::select! {
                () = cancel.cancelled() => break Err(cancelled("ocr")),
                outcome = call => match outcome {
                    Ok(inner) => inner,
                    Err(_) => Err(ServiceError::TransientUpstream {
                        stage: "ocr",
                        message: format!(
                            "ocr timed out after {}s",
                            self.config.ocr_timeout.as_secs()
                        ),
                    }),
                },
            };

            match outcome {
                Ok(blocks) => break Ok((blocks, attempt)),
                Err(err) if err.is_transient() && attempt < self.config.ocr_retries => {
                    let delay = backoff_delay(self.config.retry_backoff, attempt);
                    attempt += 1;
                    tokio::select! {
                        () = cancel.cancelled() => break Err(cancelled("ocr backoff")),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => break Err(err),
            }
        };
        drop(permit);
        result
    }

    /// Embed all chunk texts. A permanently failed batch retains its chunks
    /// with status `error` and fails the document; no sibling batch is
    /// affected and nothing reaches the index.
    async fn run_embedding(
        &self,
        document: &DocumentRecord,
        drafts: &[ChunkDraft],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, ServiceError> {
        let texts: Vec<String> = drafts.iter().map(|d| d.content.clone()).collect();
        let outcomes = self.embeddings.embed_all(&texts, cancel).await?;

        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(drafts.len());
        let mut permanent: Option<ServiceError> = None;
        let mut transient: Option<ServiceError> = None;
        let mut error_chunks = Vec::new();
        let now = self.clock.now();

        for outcome in outcomes {
            match outcome.result {
                Ok(batch_vectors) => vectors.extend(batch_vectors),
                Err(err) => {
                    for draft in &drafts[outcome.start..outcome.start + outcome.len] {
                        error_chunks.push(draft_to_record(document, draft, ChunkStatus::Error, now));
                    }
                    if err.is_transient() {
                        transient.get_or_insert(err);
                    } else {
                        permanent.get_or_insert(err);
                    }
                }
            }
        }

        if let Some(err) = permanent {
            if !error_chunks.is_empty() {
                if let Err(persist_err) = self.store.persist_chunks(error_chunks).await {
                    warn!(error = %persist_err, "failed to retain error chunks");
                }
            }
            return Err(err);
        }
        if let Some(err) = transient {
            return Err(err);
        }
        Ok(vectors)
    }

    /// Terminal failure handling: classify, record, and bump the retry
    /// counter when the failure is retryable. Partial index entries cannot
    /// exist here — indexing only happens after the completion row commits.
    async fn fail_document(&self, document: &DocumentRecord, err: &ServiceError) {
        let Ok(Some(mut current)) = self
            .store
            .fetch_document(&document.tenant, &document.id)
            .await
        else {
            warn!(document = %document.id, "failed document vanished during error handling");
            return;
        };
        current.status = DocumentStatus::Failed;
        current.error = Some(err.to_string());
        current.error_kind = Some(err.kind().to_string());
        if err.is_transient() {
            current.retry_count += 1;
        }
        merge_metadata(
            &mut current.metadata,
            json!({ "processing_successful": false }),
        );
        if let Err(update_err) = self.store.update_document(current).await {
            warn!(
                document = %document.id,
                error = %update_err,
                "failed to record document failure"
            );
        }
    }
}

fn cancelled(step: &str) -> ServiceError {
    ServiceError::Cancelled(format!("ingestion aborted during {step}"))
}

fn draft_to_record(
    document: &DocumentRecord,
    draft: &ChunkDraft,
    status: ChunkStatus,
    now: chrono::DateTime<chrono::Utc>,
) -> ChunkRecord {
    ChunkRecord {
        id: chunk_id(&document.id, draft.sequence, &draft.content),
        document_id: document.id.clone(),
        tenant: document.tenant.clone(),
        sequence: draft.sequence,
        content: draft.content.clone(),
        page: draft.page,
        layout: draft.layout,
        confidence: draft.confidence,
        preserving_layout: draft.preserving_layout,
        status,
        created_at: now,
        schema_version: document.schema_version.clone(),
    }
}

fn merge_metadata(target: &mut serde_json::Value, additions: serde_json::Value) {
    if !target.is_object() {
        *target = json!({});
    }
    if let (Some(target_map), Some(additions_map)) = (target.as_object_mut(), additions.as_object())
    {
        for (key, value) in additions_map {
            target_map.insert(key.clone(), value.clone());
        }
    }
}
