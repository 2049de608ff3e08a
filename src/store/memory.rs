//! Process-local metadata store.
//!
//! Backs tests and zero-setup deployments. All maps live behind a single
//! write lock; operations are short and never hold the lock across an await.

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::errors::ServiceError;
use crate::tenant::TenantId;

use super::{
    ChunkRecord, DocumentRecord, DocumentStatus, EmbeddingRecord, MessageRecord, MetadataStore,
    SessionRecord, TenantRecord,
};

#[derive(Default)]
struct Inner {
    tenants: FxHashMap<String, TenantRecord>,
    documents: FxHashMap<String, DocumentRecord>,
    chunks: FxHashMap<String, ChunkRecord>,
    embeddings: FxHashMap<String, EmbeddingRecord>,
    sessions: FxHashMap<String, SessionRecord>,
    messages: FxHashMap<String, Vec<MessageRecord>>,
}

/// In-memory [`MetadataStore`] backend.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    inner: RwLock<Inner>,
}

impl InMemoryMetadataStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn ping(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn fetch_tenant(&self, id: &TenantId) -> Result<Option<TenantRecord>, ServiceError> {
        Ok(self.inner.read().tenants.get(id.as_str()).cloned())
    }

    async fn upsert_tenant(&self, record: TenantRecord) -> Result<(), ServiceError> {
        self.inner
            .write()
            .tenants
            .insert(record.id.as_str().to_string(), record);
        Ok(())
    }

    async fn insert_document(&self, record: DocumentRecord) -> Result<(), ServiceError> {
        self.inner
            .write()
            .documents
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn fetch_document(
        &self,
        tenant: &TenantId,
        id: &str,
    ) -> Result<Option<DocumentRecord>, ServiceError> {
        Ok(self
            .inner
            .read()
            .documents
            .get(id)
            .filter(|d| &d.tenant == tenant)
            .cloned())
    }

    async fn transition_document(
        &self,
        tenant: &TenantId,
        id: &str,
        from: &[DocumentStatus],
        to: DocumentStatus,
    ) -> Result<bool, ServiceError> {
        let mut inner = self.inner.write();
        match inner.documents.get_mut(id) {
            Some(doc) if &doc.tenant == tenant && from.contains(&doc.status) => {
                doc.status = to;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(ServiceError::NotFound {
                what: format!("document '{id}'"),
            }),
        }
    }

    async fn update_document(&self, record: DocumentRecord) -> Result<(), ServiceError> {
        let mut inner = self.inner.write();
        match inner.documents.get_mut(&record.id) {
            Some(existing) if existing.tenant == record.tenant => {
                *existing = record;
                Ok(())
            }
            _ => Err(ServiceError::NotFound {
                what: format!("document '{}'", record.id),
            }),
        }
    }

    async fn reset_processing_documents(&self) -> Result<u64, ServiceError> {
        let mut inner = self.inner.write();
        let mut reset = 0;
        for doc in inner.documents.values_mut() {
            if doc.status == DocumentStatus::Processing {
                doc.status = DocumentStatus::Queued;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn documents_with_status(
        &self,
        status: DocumentStatus,
        limit: usize,
    ) -> Result<Vec<DocumentRecord>, ServiceError> {
        let inner = self.inner.read();
        let mut docs: Vec<DocumentRecord> = inner
            .documents
            .values()
            .filter(|d| d.status == status)
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        docs.truncate(limit);
        Ok(docs)
    }

    async fn delete_document(
        &self,
        tenant: &TenantId,
        id: &str,
    ) -> Result<Vec<String>, ServiceError> {
        let mut inner = self.inner.write();
        let owned = inner
            .documents
            .get(id)
            .is_some_and(|d| &d.tenant == tenant);
        if !owned {
            return Err(ServiceError::NotFound {
                what: format!("document '{id}'"),
            });
        }
        inner.documents.remove(id);
        Ok(remove_document_chunks(&mut inner, id))
    }

    async fn persist_ingestion(
        &self,
        document: DocumentRecord,
        chunks: Vec<ChunkRecord>,
        embeddings: Vec<EmbeddingRecord>,
    ) -> Result<(), ServiceError> {
        let mut inner = self.inner.write();
        if !inner.documents.contains_key(&document.id) {
            return Err(ServiceError::NotFound {
                what: format!("document '{}'", document.id),
            });
        }
        for chunk in chunks {
            inner.chunks.insert(chunk.id.clone(), chunk);
        }
        for embedding in embeddings {
            inner.embeddings.insert(embedding.id.clone(), embedding);
        }
        inner.documents.insert(document.id.clone(), document);
        Ok(())
    }

    async fn persist_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<(), ServiceError> {
        let mut inner = self.inner.write();
        for chunk in chunks {
            inner.chunks.insert(chunk.id.clone(), chunk);
        }
        Ok(())
    }

    async fn chunks_for_document(
        &self,
        tenant: &TenantId,
        document_id: &str,
    ) -> Result<Vec<ChunkRecord>, ServiceError> {
        let inner = self.inner.read();
        let mut chunks: Vec<ChunkRecord> = inner
            .chunks
            .values()
            .filter(|c| c.document_id == document_id && &c.tenant == tenant)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.sequence);
        Ok(chunks)
    }

    async fn chunks_by_embedding_ids(
        &self,
        tenant: &TenantId,
        embedding_ids: &[String],
    ) -> Result<Vec<ChunkRecord>, ServiceError> {
        let inner = self.inner.read();
        let mut out = Vec::with_capacity(embedding_ids.len());
        for id in embedding_ids {
            let Some(embedding) = inner.embeddings.get(id) else {
                continue;
            };
            if &embedding.tenant != tenant {
                continue;
            }
            if let Some(chunk) = inner.chunks.get(&embedding.chunk_id)
                && &chunk.tenant == tenant
            {
                out.push(chunk.clone());
            }
        }
        Ok(out)
    }

    async fn embeddings_for_tenant(
        &self,
        tenant: &TenantId,
    ) -> Result<Vec<EmbeddingRecord>, ServiceError> {
        Ok(self
            .inner
            .read()
            .embeddings
            .values()
            .filter(|e| &e.tenant == tenant)
            .cloned()
            .collect())
    }

    async fn delete_document_chunks(
        &self,
        tenant: &TenantId,
        document_id: &str,
    ) -> Result<Vec<String>, ServiceError> {
        let mut inner = self.inner.write();
        let owned = inner
            .documents
            .get(document_id)
            .is_none_or(|d| &d.tenant == tenant);
        if !owned {
            return Err(ServiceError::Forbidden(format!(
                "document '{document_id}' is not owned by tenant '{tenant}'"
            )));
        }
        Ok(remove_document_chunks(&mut inner, document_id))
    }

    async fn insert_session(&self, record: SessionRecord) -> Result<(), ServiceError> {
        self.inner
            .write()
            .sessions
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn fetch_session(
        &self,
        tenant: &TenantId,
        id: &str,
    ) -> Result<Option<SessionRecord>, ServiceError> {
        Ok(self
            .inner
            .read()
            .sessions
            .get(id)
            .filter(|s| &s.tenant == tenant)
            .cloned())
    }

    async fn update_session(&self, record: SessionRecord) -> Result<(), ServiceError> {
        let mut inner = self.inner.write();
        match inner.sessions.get_mut(&record.id) {
            Some(existing) if existing.tenant == record.tenant => {
                *existing = record;
                Ok(())
            }
            _ => Err(ServiceError::NotFound {
                what: format!("chat session '{}'", record.id),
            }),
        }
    }

    async fn append_message(&self, record: MessageRecord) -> Result<(), ServiceError> {
        self.inner
            .write()
            .messages
            .entry(record.session_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn recent_messages(
        &self,
        tenant: &TenantId,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, ServiceError> {
        let inner = self.inner.read();
        let Some(messages) = inner.messages.get(session_id) else {
            return Ok(Vec::new());
        };
        let scoped: Vec<MessageRecord> = messages
            .iter()
            .filter(|m| &m.tenant == tenant)
            .cloned()
            .collect();
        let skip = scoped.len().saturating_sub(limit);
        Ok(scoped.into_iter().skip(skip).collect())
    }
}

fn remove_document_chunks(inner: &mut Inner, document_id: &str) -> Vec<String> {
    let chunk_ids: Vec<String> = inner
        .chunks
        .values()
        .filter(|c| c.document_id == document_id)
        .map(|c| c.id.clone())
        .collect();
    for id in &chunk_ids {
        inner.chunks.remove(id);
    }
    let embedding_ids: Vec<String> = inner
        .embeddings
        .values()
        .filter(|e| chunk_ids.contains(&e.chunk_id))
        .map(|e| e.id.clone())
        .collect();
    for id in &embedding_ids {
        inner.embeddings.remove(id);
    }
    embedding_ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::LayoutKind;
    use crate::config::SCHEMA_VERSION;
    use crate::store::{ChunkStatus, DocumentFormat, chunk_id, embedding_id};
    use chrono::Utc;

    fn tenant(name: &str) -> TenantId {
        TenantId::new(name).unwrap()
    }

    fn document(id: &str, tenant: &TenantId) -> DocumentRecord {
        DocumentRecord::new(
            id,
            tenant.clone(),
            "catalog.pdf",
            DocumentFormat::Pdf,
            format!("blob/{id}"),
            Utc::now(),
        )
    }

    fn chunk(doc: &str, tenant: &TenantId, sequence: u32, content: &str) -> ChunkRecord {
        ChunkRecord {
            id: chunk_id(doc, sequence, content),
            document_id: doc.to_string(),
            tenant: tenant.clone(),
            sequence,
            content: content.to_string(),
            page: 1,
            layout: LayoutKind::Paragraph,
            confidence: 0.95,
            preserving_layout: true,
            status: ChunkStatus::Embedded,
            created_at: Utc::now(),
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }

    fn embedding(chunk: &ChunkRecord) -> EmbeddingRecord {
        EmbeddingRecord {
            id: embedding_id(&chunk.id),
            chunk_id: chunk.id.clone(),
            tenant: chunk.tenant.clone(),
            vector: vec![1.0, 0.0, 0.0],
            created_at: Utc::now(),
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }

    #[tokio::test]
    async fn cas_transition_owns_the_document() {
        let store = InMemoryMetadataStore::new();
        let t = tenant("acme");
        let mut doc = document("d1", &t);
        doc.status = DocumentStatus::Queued;
        store.insert_document(doc).await.unwrap();

        let won = store
            .transition_document(
                &t,
                "d1",
                &[DocumentStatus::Queued, DocumentStatus::Failed],
                DocumentStatus::Processing,
            )
            .await
            .unwrap();
        assert!(won);

        // Second CAS loses: the document is already processing.
        let won = store
            .transition_document(
                &t,
                "d1",
                &[DocumentStatus::Queued, DocumentStatus::Failed],
                DocumentStatus::Processing,
            )
            .await
            .unwrap();
        assert!(!won);
    }

    #[tokio::test]
    async fn tenant_scoping_on_fetch() {
        let store = InMemoryMetadataStore::new();
        let a = tenant("tenant-a");
        let b = tenant("tenant-b");
        store.insert_document(document("d1", &a)).await.unwrap();

        assert!(store.fetch_document(&a, "d1").await.unwrap().is_some());
        assert!(store.fetch_document(&b, "d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persist_ingestion_is_visible_in_one_step() {
        let store = InMemoryMetadataStore::new();
        let t = tenant("acme");
        let mut doc = document("d1", &t);
        doc.status = DocumentStatus::Processing;
        store.insert_document(doc.clone()).await.unwrap();

        let c = chunk("d1", &t, 0, "pump specs");
        let e = embedding(&c);
        doc.status = DocumentStatus::Completed;
        doc.processed_at = Some(Utc::now());
        store
            .persist_ingestion(doc, vec![c.clone()], vec![e.clone()])
            .await
            .unwrap();

        let fetched = store.fetch_document(&t, "d1").await.unwrap().unwrap();
        assert_eq!(fetched.status, DocumentStatus::Completed);
        assert!(fetched.processed_at.is_some());

        let chunks = store
            .chunks_by_embedding_ids(&t, &[e.id.clone()])
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, c.id);
    }

    #[tokio::test]
    async fn delete_document_cascades() {
        let store = InMemoryMetadataStore::new();
        let t = tenant("acme");
        let mut doc = document("d1", &t);
        doc.status = DocumentStatus::Processing;
        store.insert_document(doc.clone()).await.unwrap();
        let c = chunk("d1", &t, 0, "row");
        let e = embedding(&c);
        doc.status = DocumentStatus::Completed;
        store.persist_ingestion(doc, vec![c], vec![e.clone()]).await.unwrap();

        let removed = store.delete_document(&t, "d1").await.unwrap();
        assert_eq!(removed, vec![e.id]);
        assert!(store.fetch_document(&t, "d1").await.unwrap().is_none());
        assert!(store.embeddings_for_tenant(&t).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_processing_documents_on_restart() {
        let store = InMemoryMetadataStore::new();
        let t = tenant("acme");
        let mut doc = document("d1", &t);
        doc.status = DocumentStatus::Processing;
        store.insert_document(doc).await.unwrap();

        assert_eq!(store.reset_processing_documents().await.unwrap(), 1);
        let doc = store.fetch_document(&t, "d1").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Queued);
    }

    #[tokio::test]
    async fn recent_messages_returns_tail_oldest_first() {
        let store = InMemoryMetadataStore::new();
        let t = tenant("acme");
        for i in 0..5 {
            store
                .append_message(MessageRecord {
                    id: format!("m{i}"),
                    session_id: "s1".into(),
                    tenant: t.clone(),
                    role: crate::store::MessageRole::User,
                    content: format!("message {i}"),
                    metadata: serde_json::Value::Null,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let tail = store.recent_messages(&t, "s1", 3).await.unwrap();
        let contents: Vec<&str> = tail.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["message 2", "message 3", "message 4"]);
    }
}
