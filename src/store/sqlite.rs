//! SQLite metadata store.
//!
//! Single-file durable backend over `tokio-rusqlite`. Per-document writes
//! (chunks + embeddings + the final document row) run inside one SQLite
//! transaction. Embedding vectors are stored as little-endian `f32` blobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio_rusqlite::{Connection, OptionalExtension, ToSql, Transaction};

use crate::adapters::LayoutKind;
use crate::errors::ServiceError;
use crate::tenant::{TenantId, TenantStatus};

use super::{
    ChunkRecord, ChunkStatus, DocumentFormat, DocumentRecord, DocumentStatus, EmbeddingRecord,
    MessageRecord, MessageRole, MetadataStore, SessionRecord, SessionStatus, TenantRecord,
};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS tenants (
    id          TEXT PRIMARY KEY,
    status      TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS documents (
    id              TEXT PRIMARY KEY,
    tenant          TEXT NOT NULL,
    filename        TEXT NOT NULL,
    format          TEXT NOT NULL,
    blob_ref        TEXT NOT NULL,
    status          TEXT NOT NULL,
    retry_count     INTEGER NOT NULL,
    created_at      TEXT NOT NULL,
    processed_at    TEXT,
    error           TEXT,
    error_kind      TEXT,
    metadata        TEXT NOT NULL,
    schema_version  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_documents_tenant ON documents(tenant);
CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);
CREATE TABLE IF NOT EXISTS chunks (
    id                  TEXT PRIMARY KEY,
    document_id         TEXT NOT NULL,
    tenant              TEXT NOT NULL,
    seq                 INTEGER NOT NULL,
    content             TEXT NOT NULL,
    page                INTEGER NOT NULL,
    layout              TEXT NOT NULL,
    confidence          REAL NOT NULL,
    preserving_layout   INTEGER NOT NULL,
    status              TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    schema_version      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);
CREATE INDEX IF NOT EXISTS idx_chunks_tenant ON chunks(tenant);
CREATE TABLE IF NOT EXISTS embeddings (
    id              TEXT PRIMARY KEY,
    chunk_id        TEXT NOT NULL,
    tenant          TEXT NOT NULL,
    vector          BLOB NOT NULL,
    created_at      TEXT NOT NULL,
    schema_version  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_embeddings_tenant ON embeddings(tenant);
CREATE INDEX IF NOT EXISTS idx_embeddings_chunk ON embeddings(chunk_id);
CREATE TABLE IF NOT EXISTS sessions (
    id              TEXT PRIMARY KEY,
    tenant          TEXT NOT NULL,
    user            TEXT NOT NULL,
    title           TEXT NOT NULL,
    status          TEXT NOT NULL,
    last_activity   TEXT NOT NULL,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_tenant ON sessions(tenant);
CREATE TABLE IF NOT EXISTS messages (
    id          TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL,
    tenant      TEXT NOT NULL,
    role        TEXT NOT NULL,
    content     TEXT NOT NULL,
    metadata    TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
";

const DOCUMENT_COLS: &str = "id, tenant, filename, format, blob_ref, status, retry_count, \
     created_at, processed_at, error, error_kind, metadata, schema_version";

/// Durable [`MetadataStore`] backend over a SQLite file.
#[derive(Clone)]
pub struct SqliteMetadataStore {
    conn: Connection,
}

impl SqliteMetadataStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let conn = Connection::open(path)
            .await
            .map_err(tokio_rusqlite::Error::Error)
            .map_err(storage_err)?;
        Self::migrate(conn).await
    }

    /// In-memory database, handy for tests.
    pub async fn open_in_memory() -> Result<Self, ServiceError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(tokio_rusqlite::Error::Error)
            .map_err(storage_err)?;
        Self::migrate(conn).await
    }

    async fn migrate(conn: Connection) -> Result<Self, ServiceError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA_SQL)
        })
        .await
        .map_err(storage_err)?;
        Ok(Self { conn })
    }
}

fn storage_err(err: tokio_rusqlite::Error) -> ServiceError {
    ServiceError::TransientUpstream {
        stage: "metadata",
        message: err.to_string(),
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, ServiceError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| ServiceError::Internal(format!("bad timestamp '{raw}': {err}")))
}

fn parse_opt_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>, ServiceError> {
    raw.map(|r| parse_time(&r)).transpose()
}

fn parse_tenant_status(raw: &str) -> Result<TenantStatus, ServiceError> {
    match raw {
        "active" => Ok(TenantStatus::Active),
        "disabled" => Ok(TenantStatus::Disabled),
        other => Err(ServiceError::Internal(format!(
            "unknown tenant status '{other}'"
        ))),
    }
}

fn tenant_status_str(status: TenantStatus) -> &'static str {
    match status {
        TenantStatus::Active => "active",
        TenantStatus::Disabled => "disabled",
    }
}

fn session_status_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Active => "active",
        SessionStatus::Inactive => "inactive",
    }
}

fn parse_session_status(raw: &str) -> Result<SessionStatus, ServiceError> {
    match raw {
        "active" => Ok(SessionStatus::Active),
        "inactive" => Ok(SessionStatus::Inactive),
        other => Err(ServiceError::Internal(format!(
            "unknown session status '{other}'"
        ))),
    }
}

fn parse_role(raw: &str) -> Result<MessageRole, ServiceError> {
    match raw {
        "user" => Ok(MessageRole::User),
        "system" => Ok(MessageRole::System),
        other => Err(ServiceError::Internal(format!(
            "unknown message role '{other}'"
        ))),
    }
}

// Raw row tuples: column extraction happens inside `conn.call` with the
// driver's error type; parsing into typed records happens outside with
// crate errors.

type RawDocument = (
    String,         // id
    String,         // tenant
    String,         // filename
    String,         // format
    String,         // blob_ref
    String,         // status
    i64,            // retry_count
    String,         // created_at
    Option<String>, // processed_at
    Option<String>, // error
    Option<String>, // error_kind
    String,         // metadata
    String,         // schema_version
);

type RawChunk = (
    String, // id
    String, // document_id
    String, // tenant
    i64,    // seq
    String, // content
    i64,    // page
    String, // layout
    f64,    // confidence
    bool,   // preserving_layout
    String, // status
    String, // created_at
    String, // schema_version
);

fn document_from_raw(raw: RawDocument) -> Result<DocumentRecord, ServiceError> {
    let (
        id,
        tenant,
        filename,
        format,
        blob_ref,
        status,
        retry_count,
        created_at,
        processed_at,
        error,
        error_kind,
        metadata,
        schema_version,
    ) = raw;
    Ok(DocumentRecord {
        id,
        tenant: TenantId::new(tenant)?,
        filename,
        format: match format.as_str() {
            "pdf" => DocumentFormat::Pdf,
            "docx" => DocumentFormat::Docx,
            "xlsx" => DocumentFormat::Xlsx,
            other => {
                return Err(ServiceError::Internal(format!(
                    "unknown document format '{other}'"
                )));
            }
        },
        blob_ref,
        status: DocumentStatus::parse(&status)?,
        retry_count: u32::try_from(retry_count.max(0)).unwrap_or(u32::MAX),
        created_at: parse_time(&created_at)?,
        processed_at: parse_opt_time(processed_at)?,
        error,
        error_kind,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        schema_version,
    })
}

fn chunk_from_raw(raw: RawChunk) -> Result<ChunkRecord, ServiceError> {
    let (
        id,
        document_id,
        tenant,
        seq,
        content,
        page,
        layout,
        confidence,
        preserving_layout,
        status,
        created_at,
        schema_version,
    ) = raw;
    Ok(ChunkRecord {
        id,
        document_id,
        tenant: TenantId::new(tenant)?,
        sequence: u32::try_from(seq.max(0)).unwrap_or(u32::MAX),
        content,
        page: u32::try_from(page.max(0)).unwrap_or(u32::MAX),
        layout: LayoutKind::parse(&layout)?,
        confidence: confidence as f32,
        preserving_layout,
        status: ChunkStatus::parse(&status)?,
        created_at: parse_time(&created_at)?,
        schema_version,
    })
}

fn insert_chunk_tx(tx: &Transaction<'_>, chunk: &ChunkRecord) -> Result<(), tokio_rusqlite::rusqlite::Error> {
    tx.execute(
        "INSERT OR REPLACE INTO chunks (id, document_id, tenant, seq, content, page, layout, \
         confidence, preserving_layout, status, created_at, schema_version) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        (
            &chunk.id,
            &chunk.document_id,
            chunk.tenant.as_str(),
            i64::from(chunk.sequence),
            &chunk.content,
            i64::from(chunk.page),
            chunk.layout.as_str(),
            f64::from(chunk.confidence),
            chunk.preserving_layout,
            chunk.status.as_str(),
            chunk.created_at.to_rfc3339(),
            &chunk.schema_version,
        ),
    )?;
    Ok(())
}

fn update_document_tx(
    tx: &Transaction<'_>,
    doc: &DocumentRecord,
) -> Result<usize, tokio_rusqlite::rusqlite::Error> {
    tx.execute(
        "UPDATE documents SET filename = ?1, format = ?2, blob_ref = ?3, status = ?4, \
         retry_count = ?5, processed_at = ?6, error = ?7, error_kind = ?8, metadata = ?9, \
         schema_version = ?10 WHERE id = ?11 AND tenant = ?12",
        (
            &doc.filename,
            doc.format.as_str(),
            &doc.blob_ref,
            doc.status.as_str(),
            i64::from(doc.retry_count),
            doc.processed_at.map(|t| t.to_rfc3339()),
            &doc.error,
            &doc.error_kind,
            doc.metadata.to_string(),
            &doc.schema_version,
            &doc.id,
            doc.tenant.as_str(),
        ),
    )
}

fn delete_chunks_tx(
    tx: &Transaction<'_>,
    document_id: &str,
    tenant: &str,
) -> Result<Vec<String>, tokio_rusqlite::rusqlite::Error> {
    let mut stmt = tx
        .prepare(
            "SELECT e.id FROM embeddings e JOIN chunks c ON e.chunk_id = c.id \
             WHERE c.document_id = ?1 AND c.tenant = ?2",
        )?;
    let ids: Vec<String> = stmt
        .query_map((document_id, tenant), |row| row.get::<_, String>(0))?
        .collect::<Result<_, _>>()?;
    drop(stmt);
    tx.execute(
        "DELETE FROM embeddings WHERE chunk_id IN \
         (SELECT id FROM chunks WHERE document_id = ?1 AND tenant = ?2)",
        (document_id, tenant),
    )?;
    tx.execute(
        "DELETE FROM chunks WHERE document_id = ?1 AND tenant = ?2",
        (document_id, tenant),
    )?;
    Ok(ids)
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn ping(&self) -> Result<(), ServiceError> {
        self.conn
            .call(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            })
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn fetch_tenant(&self, id: &TenantId) -> Result<Option<TenantRecord>, ServiceError> {
        let id_raw = id.as_str().to_string();
        let raw = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, status, created_at FROM tenants WHERE id = ?1",
                    [&id_raw],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()
            })
            .await
            .map_err(storage_err)?;

        raw.map(|(id, status, created_at)| {
            Ok(TenantRecord {
                id: TenantId::new(id)?,
                status: parse_tenant_status(&status)?,
                created_at: parse_time(&created_at)?,
            })
        })
        .transpose()
    }

    async fn upsert_tenant(&self, record: TenantRecord) -> Result<(), ServiceError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO tenants (id, status, created_at) VALUES (?1, ?2, ?3)",
                    (
                        record.id.as_str(),
                        tenant_status_str(record.status),
                        record.created_at.to_rfc3339(),
                    ),
                )
            })
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn insert_document(&self, record: DocumentRecord) -> Result<(), ServiceError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO documents (id, tenant, filename, format, blob_ref, status, \
                     retry_count, created_at, processed_at, error, error_kind, metadata, \
                     schema_version) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    (
                        &record.id,
                        record.tenant.as_str(),
                        &record.filename,
                        record.format.as_str(),
                        &record.blob_ref,
                        record.status.as_str(),
                        i64::from(record.retry_count),
                        record.created_at.to_rfc3339(),
                        record.processed_at.map(|t| t.to_rfc3339()),
                        &record.error,
                        &record.error_kind,
                        record.metadata.to_string(),
                        &record.schema_version,
                    ),
                )
            })
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn fetch_document(
        &self,
        tenant: &TenantId,
        id: &str,
    ) -> Result<Option<DocumentRecord>, ServiceError> {
        let tenant_raw = tenant.as_str().to_string();
        let id = id.to_string();
        let raw = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {DOCUMENT_COLS} FROM documents WHERE id = ?1 AND tenant = ?2"),
                    (&id, &tenant_raw),
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                            row.get(8)?,
                            row.get(9)?,
                            row.get(10)?,
                            row.get(11)?,
                            row.get(12)?,
                        ))
                    },
                )
                .optional()
            })
            .await
            .map_err(storage_err)?;
        raw.map(document_from_raw).transpose()
    }

    async fn transition_document(
        &self,
        tenant: &TenantId,
        id: &str,
        from: &[DocumentStatus],
        to: DocumentStatus,
    ) -> Result<bool, ServiceError> {
        let tenant_raw = tenant.as_str().to_string();
        let id_raw = id.to_string();
        let from: Vec<&'static str> = from.iter().map(|s| s.as_str()).collect();
        let placeholders = from
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 4))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE documents SET status = ?1 WHERE id = ?2 AND tenant = ?3 \
             AND status IN ({placeholders})"
        );

        let changed = self
            .conn
            .call(move |conn| {
                let mut params: Vec<Box<dyn ToSql>> = vec![
                    Box::new(to.as_str().to_string()),
                    Box::new(id_raw),
                    Box::new(tenant_raw),
                ];
                for status in &from {
                    params.push(Box::new((*status).to_string()));
                }
                let refs: Vec<&dyn ToSql> = params.iter().map(AsRef::as_ref).collect();
                conn.execute(&sql, refs.as_slice())
            })
            .await
            .map_err(storage_err)?;

        if changed > 0 {
            return Ok(true);
        }
        // A lost CAS returns false; a missing document is an error.
        if self.fetch_document(tenant, id).await?.is_none() {
            return Err(ServiceError::NotFound {
                what: format!("document '{id}'"),
            });
        }
        Ok(false)
    }

    async fn update_document(&self, record: DocumentRecord) -> Result<(), ServiceError> {
        let changed = self
            .conn
            .call(move |conn| {
                let tx = conn
                    .transaction()?;
                let changed = update_document_tx(&tx, &record)?;
                tx.commit()?;
                Ok(changed)
            })
            .await
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(ServiceError::NotFound {
                what: "document for update".into(),
            });
        }
        Ok(())
    }

    async fn reset_processing_documents(&self) -> Result<u64, ServiceError> {
        let changed = self
            .conn
            .call(|conn| {
                conn.execute(
                    "UPDATE documents SET status = 'queued' WHERE status = 'processing'",
                    [],
                )
            })
            .await
            .map_err(storage_err)?;
        Ok(changed as u64)
    }

    async fn documents_with_status(
        &self,
        status: DocumentStatus,
        limit: usize,
    ) -> Result<Vec<DocumentRecord>, ServiceError> {
        let raws = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {DOCUMENT_COLS} FROM documents WHERE status = ?1 \
                         ORDER BY created_at ASC LIMIT ?2"
                    ))?;
                let rows = stmt
                    .query_map((status.as_str(), limit as i64), |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                            row.get(8)?,
                            row.get(9)?,
                            row.get(10)?,
                            row.get(11)?,
                            row.get(12)?,
                        ))
                    })?;
                let mut out: Vec<RawDocument> = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
            .map_err(storage_err)?;
        raws.into_iter().map(document_from_raw).collect()
    }

    async fn delete_document(
        &self,
        tenant: &TenantId,
        id: &str,
    ) -> Result<Vec<String>, ServiceError> {
        let tenant_raw = tenant.as_str().to_string();
        let id_raw = id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let tx = conn
                    .transaction()?;
                let deleted = tx
                    .execute(
                        "DELETE FROM documents WHERE id = ?1 AND tenant = ?2",
                        (&id_raw, &tenant_raw),
                    )?;
                if deleted == 0 {
                    return Ok(None);
                }
                let ids = delete_chunks_tx(&tx, &id_raw, &tenant_raw)?;
                tx.commit()?;
                Ok(Some(ids))
            })
            .await
            .map_err(storage_err)?;
        removed.ok_or_else(|| ServiceError::NotFound {
            what: format!("document '{id}'"),
        })
    }

    async fn persist_ingestion(
        &self,
        document: DocumentRecord,
        chunks: Vec<ChunkRecord>,
        embeddings: Vec<EmbeddingRecord>,
    ) -> Result<(), ServiceError> {
        let changed = self
            .conn
            .call(move |conn| {
                let tx = conn
                    .transaction()?;
                for chunk in &chunks {
                    insert_chunk_tx(&tx, chunk)?;
                }
                for embedding in &embeddings {
                    tx.execute(
                        "INSERT OR REPLACE INTO embeddings (id, chunk_id, tenant, vector, \
                         created_at, schema_version) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        (
                            &embedding.id,
                            &embedding.chunk_id,
                            embedding.tenant.as_str(),
                            encode_vector(&embedding.vector),
                            embedding.created_at.to_rfc3339(),
                            &embedding.schema_version,
                        ),
                    )?;
                }
                let changed = update_document_tx(&tx, &document)?;
                tx.commit()?;
                Ok(changed)
            })
            .await
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(ServiceError::NotFound {
                what: "document for ingestion persistence".into(),
            });
        }
        Ok(())
    }

    async fn persist_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<(), ServiceError> {
        self.conn
            .call(move |conn| {
                let tx = conn
                    .transaction()?;
                for chunk in &chunks {
                    insert_chunk_tx(&tx, chunk)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(storage_err)
    }

    async fn chunks_for_document(
        &self,
        tenant: &TenantId,
        document_id: &str,
    ) -> Result<Vec<ChunkRecord>, ServiceError> {
        let tenant_raw = tenant.as_str().to_string();
        let document_id = document_id.to_string();
        let raws = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, document_id, tenant, seq, content, page, layout, \
                         confidence, preserving_layout, status, created_at, schema_version \
                         FROM chunks WHERE document_id = ?1 AND tenant = ?2 ORDER BY seq ASC",
                    )?;
                let rows = stmt
                    .query_map((&document_id, &tenant_raw), |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                            row.get(8)?,
                            row.get(9)?,
                            row.get(10)?,
                            row.get(11)?,
                        ))
                    })?;
                let mut out: Vec<RawChunk> = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
            .map_err(storage_err)?;
        raws.into_iter().map(chunk_from_raw).collect()
    }

    async fn chunks_by_embedding_ids(
        &self,
        tenant: &TenantId,
        embedding_ids: &[String],
    ) -> Result<Vec<ChunkRecord>, ServiceError> {
        let tenant_raw = tenant.as_str().to_string();
        let ids: Vec<String> = embedding_ids.to_vec();
        let raws = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT c.id, c.document_id, c.tenant, c.seq, c.content, c.page, \
                         c.layout, c.confidence, c.preserving_layout, c.status, c.created_at, \
                         c.schema_version \
                         FROM chunks c JOIN embeddings e ON e.chunk_id = c.id \
                         WHERE e.id = ?1 AND e.tenant = ?2 AND c.tenant = ?2",
                    )?;
                let mut out: Vec<RawChunk> = Vec::new();
                for id in &ids {
                    let row = stmt
                        .query_row((id, &tenant_raw), |row| {
                            Ok((
                                row.get(0)?,
                                row.get(1)?,
                                row.get(2)?,
                                row.get(3)?,
                                row.get(4)?,
                                row.get(5)?,
                                row.get(6)?,
                                row.get(7)?,
                                row.get(8)?,
                                row.get(9)?,
                                row.get(10)?,
                                row.get(11)?,
                            ))
                        })
                        .optional()?;
                    if let Some(raw) = row {
                        out.push(raw);
                    }
                }
                Ok(out)
            })
            .await
            .map_err(storage_err)?;
        raws.into_iter().map(chunk_from_raw).collect()
    }

    async fn embeddings_for_tenant(
        &self,
        tenant: &TenantId,
    ) -> Result<Vec<EmbeddingRecord>, ServiceError> {
        let tenant_raw = tenant.as_str().to_string();
        let raws = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, chunk_id, tenant, vector, created_at, schema_version \
                         FROM embeddings WHERE tenant = ?1",
                    )?;
                let rows = stmt
                    .query_map([&tenant_raw], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Vec<u8>>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
            .map_err(storage_err)?;

        raws.into_iter()
            .map(|(id, chunk_id, tenant, vector, created_at, schema_version)| {
                Ok(EmbeddingRecord {
                    id,
                    chunk_id,
                    tenant: TenantId::new(tenant)?,
                    vector: decode_vector(&vector),
                    created_at: parse_time(&created_at)?,
                    schema_version,
                })
            })
            .collect()
    }

    async fn delete_document_chunks(
        &self,
        tenant: &TenantId,
        document_id: &str,
    ) -> Result<Vec<String>, ServiceError> {
        let tenant_raw = tenant.as_str().to_string();
        let document_id = document_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn
                    .transaction()?;
                let ids = delete_chunks_tx(&tx, &document_id, &tenant_raw)?;
                tx.commit()?;
                Ok(ids)
            })
            .await
            .map_err(storage_err)
    }

    async fn insert_session(&self, record: SessionRecord) -> Result<(), ServiceError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (id, tenant, user, title, status, last_activity, \
                     created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    (
                        &record.id,
                        record.tenant.as_str(),
                        &record.user,
                        &record.title,
                        session_status_str(record.status),
                        record.last_activity.to_rfc3339(),
                        record.created_at.to_rfc3339(),
                    ),
                )
            })
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn fetch_session(
        &self,
        tenant: &TenantId,
        id: &str,
    ) -> Result<Option<SessionRecord>, ServiceError> {
        let tenant_raw = tenant.as_str().to_string();
        let id = id.to_string();
        let raw = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, tenant, user, title, status, last_activity, created_at \
                     FROM sessions WHERE id = ?1 AND tenant = ?2",
                    (&id, &tenant_raw),
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                        ))
                    },
                )
                .optional()
            })
            .await
            .map_err(storage_err)?;

        raw.map(|(id, tenant, user, title, status, last_activity, created_at)| {
            Ok(SessionRecord {
                id,
                tenant: TenantId::new(tenant)?,
                user,
                title,
                status: parse_session_status(&status)?,
                last_activity: parse_time(&last_activity)?,
                created_at: parse_time(&created_at)?,
            })
        })
        .transpose()
    }

    async fn update_session(&self, record: SessionRecord) -> Result<(), ServiceError> {
        let changed = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE sessions SET user = ?1, title = ?2, status = ?3, \
                     last_activity = ?4 WHERE id = ?5 AND tenant = ?6",
                    (
                        &record.user,
                        &record.title,
                        session_status_str(record.status),
                        record.last_activity.to_rfc3339(),
                        &record.id,
                        record.tenant.as_str(),
                    ),
                )
            })
            .await
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(ServiceError::NotFound {
                what: "chat session for update".into(),
            });
        }
        Ok(())
    }

    async fn append_message(&self, record: MessageRecord) -> Result<(), ServiceError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO messages (id, session_id, tenant, role, content, metadata, \
                     created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    (
                        &record.id,
                        &record.session_id,
                        record.tenant.as_str(),
                        record.role.as_str(),
                        &record.content,
                        record.metadata.to_string(),
                        record.created_at.to_rfc3339(),
                    ),
                )
            })
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn recent_messages(
        &self,
        tenant: &TenantId,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, ServiceError> {
        let tenant_raw = tenant.as_str().to_string();
        let session_id = session_id.to_string();
        let raws = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, session_id, tenant, role, content, metadata, created_at \
                         FROM messages WHERE session_id = ?1 AND tenant = ?2 \
                         ORDER BY created_at DESC, id DESC LIMIT ?3",
                    )?;
                let rows = stmt
                    .query_map((&session_id, &tenant_raw, limit as i64), |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                        ))
                    })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
            .map_err(storage_err)?;

        let mut messages: Vec<MessageRecord> = raws
            .into_iter()
            .map(|(id, session_id, tenant, role, content, metadata, created_at)| {
                Ok::<MessageRecord, ServiceError>(MessageRecord {
                    id,
                    session_id,
                    tenant: TenantId::new(tenant)?,
                    role: parse_role(&role)?,
                    content: content.clone(),
                    metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
                    created_at: parse_time(&created_at)?,
                })
            })
            .collect::<Result<_, _>>()?;
        messages.reverse();
        Ok(messages)
    }
}
