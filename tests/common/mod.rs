//! Shared test doubles: deterministic embedder, scripted OCR and LLM,
//! in-memory blob store, and a manually advanced clock.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use regex::Regex;

use docsmith::RequestContext;
use docsmith::TenantId;
use docsmith::adapters::{
    BlobStore, Clock, Completion, CompletionRequest, EmbeddingEngine, LanguageModel, LayoutKind,
    OcrEngine, TextBlock,
};
use docsmith::errors::ServiceError;
use docsmith::service::Docsmith;
use docsmith::store::memory::InMemoryMetadataStore;

// ── Clock ──────────────────────────────────────────────────────────────

pub struct ManualClock(RwLock<DateTime<Utc>>);

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(RwLock::new(Utc::now())))
    }

    pub fn advance(&self, d: Duration) {
        *self.0.write() += chrono::Duration::from_std(d).unwrap();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.read()
    }
}

// ── Blob store ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockBlobStore {
    pub fn insert(&self, blob_ref: &str, bytes: impl Into<Vec<u8>>) {
        self.blobs.lock().insert(blob_ref.to_string(), bytes.into());
    }
}

#[async_trait]
impl BlobStore for MockBlobStore {
    async fn fetch(&self, blob_ref: &str) -> Result<Vec<u8>, ServiceError> {
        self.blobs
            .lock()
            .get(blob_ref)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound {
                what: format!("blob '{blob_ref}'"),
            })
    }
}

// ── OCR ────────────────────────────────────────────────────────────────

/// OCR double: interprets blob bytes as UTF-8, one paragraph block per
/// blank-line-separated section. Can be scripted to fail the first N calls
/// and to stall for a fixed delay before answering.
#[derive(Default)]
pub struct ScriptedOcr {
    failures_remaining: AtomicU32,
    delay: Mutex<Option<Duration>>,
    pub calls: AtomicUsize,
}

impl ScriptedOcr {
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn stall_for(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }
}

#[async_trait]
impl OcrEngine for ScriptedOcr {
    async fn process(&self, bytes: &[u8]) -> Result<Vec<TextBlock>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ServiceError::TransientUpstream {
                stage: "ocr",
                message: "gpu worker dropped the request".into(),
            });
        }
        let text = String::from_utf8_lossy(bytes);
        Ok(text
            .split("\n\n")
            .enumerate()
            .map(|(i, section)| TextBlock::new(section, i as u32 / 2 + 1, LayoutKind::Paragraph, 0.95))
            .collect())
    }
}

// ── Embedder ───────────────────────────────────────────────────────────

/// Deterministic embedder: product codes (`A123`) project heavily onto one
/// axis in the lower half of the space, distinct words onto axes in the
/// upper half. Texts about the same product land close together; texts
/// about different products stay apart.
pub struct HashEmbedder {
    dimension: usize,
    code_pattern: Regex,
    /// When >0, that many upcoming calls return vectors one component short.
    short_vector_calls: AtomicU32,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            code_pattern: Regex::new(r"\b[A-Z]+[0-9]+\b").unwrap(),
            short_vector_calls: AtomicU32::new(0),
        }
    }

    pub fn break_dimension_for(&self, calls: u32) {
        self.short_vector_calls.store(calls, Ordering::SeqCst);
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let half = self.dimension / 2;
        let mut v = vec![0.0_f32; self.dimension];

        let mut codes: Vec<&str> = self
            .code_pattern
            .find_iter(text)
            .map(|m| m.as_str())
            .collect();
        codes.sort_unstable();
        codes.dedup();
        for code in codes {
            v[stable_hash(code) % half] += 6.0;
        }

        let mut words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        words.sort_unstable();
        words.dedup();
        for word in words {
            v[half + stable_hash(&word) % half] += 1.0;
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        } else {
            v[0] = 1.0;
        }
        v
    }
}

fn stable_hash(s: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish() as usize
}

#[async_trait]
impl EmbeddingEngine for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        let broken = self
            .short_vector_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = self.embed_text(text);
                if broken {
                    v.pop();
                }
                v
            })
            .collect())
    }
}

// ── LLM ────────────────────────────────────────────────────────────────

/// LLM double: answers from whatever the prompt contains and records every
/// prompt for assertions.
#[derive(Default)]
pub struct EchoLlm {
    pub prompts: Mutex<Vec<String>>,
    failures_remaining: AtomicU32,
}

impl EchoLlm {
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().last().cloned()
    }
}

#[async_trait]
impl LanguageModel for EchoLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ServiceError> {
        self.prompts.lock().push(request.prompt.clone());
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ServiceError::TransientUpstream {
                stage: "llm",
                message: "upstream 503".into(),
            });
        }

        let flow = Regex::new(r"flow rate (\d+) GPM").unwrap();
        let text = if let Some(caps) = flow.captures(&request.prompt) {
            format!("The flow rate is {} GPM.", &caps[1])
        } else if request.prompt.contains("No relevant documents found.") {
            "I could not find relevant catalog data.".to_string()
        } else {
            "Based on the catalog context, see the referenced sections.".to_string()
        };
        Ok(Completion {
            text,
            model: "mock-llm".into(),
            tokens_used: (request.prompt.len() / 4) as u32,
        })
    }
}

// ── World ──────────────────────────────────────────────────────────────

/// A fully wired service over the mock adapters, with handles kept on the
/// concrete doubles for scripting and inspection.
pub struct TestWorld {
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryMetadataStore>,
    pub blob: Arc<MockBlobStore>,
    pub ocr: Arc<ScriptedOcr>,
    pub embedder: Arc<HashEmbedder>,
    pub llm: Arc<EchoLlm>,
    pub service: Docsmith,
}

impl TestWorld {
    pub fn new() -> Self {
        let clock = ManualClock::new();
        let store = Arc::new(InMemoryMetadataStore::new());
        let blob = Arc::new(MockBlobStore::default());
        let ocr = Arc::new(ScriptedOcr::default());
        let embedder = Arc::new(HashEmbedder::new(1536));
        let llm = Arc::new(EchoLlm::default());

        let service = Docsmith::builder()
            .metadata_store(store.clone())
            .blob_store(blob.clone())
            .ocr_engine(ocr.clone())
            .embedding_engine(embedder.clone())
            .language_model(llm.clone())
            .clock(clock.clone())
            .build()
            .expect("service wiring");

        Self {
            clock,
            store,
            blob,
            ocr,
            embedder,
            llm,
            service,
        }
    }

    pub async fn started() -> Self {
        let world = Self::new();
        world.service.start().await.expect("service start");
        world
    }

    pub async fn tenant(&self, name: &str) -> TenantId {
        let tenant = TenantId::new(name).unwrap();
        self.service.register_tenant(&tenant).await.unwrap();
        tenant
    }

    pub fn ctx(&self, tenant: &TenantId) -> RequestContext {
        RequestContext::builder(tenant.clone())
            .identity(format!("user@{tenant}"))
            .build()
    }

    /// Store a blob and submit it for ingestion.
    pub async fn upload(&self, tenant: &TenantId, filename: &str, text: &str) -> String {
        let blob_ref = format!("blob/{tenant}/{filename}");
        self.blob.insert(&blob_ref, text.as_bytes().to_vec());
        let ctx = self.ctx(tenant);
        let (document_id, _) = self
            .service
            .ingest_document(&ctx, tenant, filename, &blob_ref)
            .await
            .expect("ingest accepted");
        document_id
    }

    /// Poll (under virtual time) until the document reaches one of the
    /// wanted states.
    pub async fn wait_for_status(
        &self,
        tenant: &TenantId,
        document_id: &str,
        wanted: &[docsmith::store::DocumentStatus],
    ) -> docsmith::service::DocumentStatusView {
        let ctx = self.ctx(tenant);
        for _ in 0..2000 {
            let view = self
                .service
                .document_status(&ctx, tenant, document_id)
                .await
                .expect("status fetch");
            if wanted.contains(&view.status) {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("document '{document_id}' never reached {wanted:?}");
    }
}

/// The catalog text used across scenarios, ~2.5 KB of pump A123 specs.
pub fn pump_catalog_text() -> String {
    "Pump A123 flow rate 500 GPM pressure 150 PSI. ".repeat(54)
}
