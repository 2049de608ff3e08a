//! Component configuration.
//!
//! One plain struct per component, populated once at startup and passed in
//! explicitly — components never read process globals. Defaults carry the
//! documented constants; [`ServiceConfig::from_env`] overrides the common
//! operational knobs from `DOCSMITH_*` environment variables (a `.env` file
//! is honoured via `dotenvy`).

use std::time::Duration;

/// Embedding dimensionality used across the whole system.
pub const VECTOR_DIMENSION: usize = 1536;

/// Maximum accepted upload size in bytes (50 MiB).
pub const MAX_FILE_SIZE: usize = 50 * 1024 * 1024;

/// Maximum accepted metadata payload in bytes (1 MiB).
pub const MAX_METADATA_SIZE: usize = 1024 * 1024;

/// Schema version tag written on every persisted record.
pub const SCHEMA_VERSION: &str = "1.0";

// ── Chunker ────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct ChunkerConfig {
    /// Maximum chunk content length in characters.
    pub chunk_size: usize,
    /// Approximate overlap carried between consecutive chunks, in characters.
    pub chunk_overlap: usize,
    /// Keep tables, lists, and headings atomic; never split sentences.
    pub preserve_layout: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 100,
            preserve_layout: true,
        }
    }
}

// ── Embedding pipeline ─────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct EmbeddingConfig {
    pub dimension: usize,
    /// Texts per upstream call.
    pub batch_size: usize,
    /// Retries per batch before the batch fails permanently.
    pub max_retries: u32,
    /// Backoff base; attempt `n` waits `2^n · retry_delay`.
    pub retry_delay: Duration,
    /// Upper bound on a single upstream batch call.
    pub batch_timeout: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: VECTOR_DIMENSION,
            batch_size: 32,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            batch_timeout: Duration::from_secs(120),
        }
    }
}

// ── Vector index ───────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct IndexConfig {
    pub dimension: usize,
    pub default_top_k: usize,
    /// Minimum inner-product score for a result to be returned.
    pub default_threshold: f32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimension: VECTOR_DIMENSION,
            default_top_k: 5,
            default_threshold: 0.8,
        }
    }
}

// ── Result cache ───────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Approximate byte budget before LRU eviction kicks in.
    pub byte_budget: u64,
    /// Shard count for the in-memory backend.
    pub shards: usize,
    pub search_ttl: Duration,
    pub answer_ttl: Duration,
    pub health_ttl: Duration,
    /// Upper bound on a single backend operation.
    pub op_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            byte_budget: 512 * 1024 * 1024,
            shards: 16,
            search_ttl: Duration::from_secs(3600),
            answer_ttl: Duration::from_secs(86_400),
            health_ttl: Duration::from_secs(300),
            op_timeout: Duration::from_secs(5),
        }
    }
}

// ── Rate limiter ───────────────────────────────────────────────────────

/// One sliding-window policy: at most `max_requests` per `window`.
#[derive(Clone, Copy, Debug)]
pub struct RatePolicy {
    pub max_requests: u32,
    pub window: Duration,
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Authentication attempts per IP+email.
    pub auth: RatePolicy,
    /// Default API traffic per tenant+IP.
    pub api: RatePolicy,
    /// Administrative traffic.
    pub admin: RatePolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            auth: RatePolicy {
                max_requests: 5,
                window: Duration::from_secs(300),
            },
            api: RatePolicy {
                max_requests: 1000,
                window: Duration::from_secs(3600),
            },
            admin: RatePolicy {
                max_requests: 10_000,
                window: Duration::from_secs(3600),
            },
        }
    }
}

// ── Ingestion ──────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct IngestionConfig {
    /// Whole-document retries before a document fails terminally.
    pub max_retries: u32,
    /// Whole-document backoff base; retry `n` waits `retry_backoff · 2^n`.
    pub retry_backoff: Duration,
    /// GPU permits for concurrent OCR. Distinct from the worker-pool width.
    pub max_concurrent_ocr: usize,
    /// OCR attempts within one document pass.
    pub ocr_retries: u32,
    pub ocr_timeout: Duration,
    pub metadata_timeout: Duration,
    pub max_file_size: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_secs(5),
            max_concurrent_ocr: 4,
            ocr_retries: 3,
            ocr_timeout: Duration::from_secs(600),
            metadata_timeout: Duration::from_secs(30),
            max_file_size: MAX_FILE_SIZE,
        }
    }
}

// ── Query orchestration ────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct QueryConfig {
    /// Prompt context budget in tokens.
    pub context_window_tokens: usize,
    /// Chat-history tail included in the prompt, in characters.
    pub history_window_chars: usize,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub llm_retries: u32,
    pub llm_retry_delay: Duration,
    pub llm_timeout: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            context_window_tokens: 8192,
            history_window_chars: 1000,
            temperature: 0.7,
            max_output_tokens: 4096,
            llm_retries: 3,
            llm_retry_delay: Duration::from_secs(2),
            llm_timeout: Duration::from_secs(300),
        }
    }
}

// ── Chat sessions ──────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct ChatConfig {
    /// Most-recent messages presented to the LLM.
    pub history_messages: usize,
    /// Maximum message content length in bytes (16 KiB).
    pub max_message_bytes: usize,
    pub max_title_len: usize,
    /// Idle interval after which a session becomes read-only.
    pub session_timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_messages: 50,
            max_message_bytes: 16 * 1024,
            max_title_len: 255,
            session_timeout: Duration::from_secs(1800),
        }
    }
}

// ── Worker pool ────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Worker count; defaults to `min(8, cpus)`.
    pub workers: usize,
    /// Bounded job-queue capacity; enqueue past this returns `QueueFull`.
    pub queue_capacity: usize,
    /// Grace period for draining in-flight jobs on shutdown.
    pub drain_deadline: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(std::num::NonZero::get)
            .unwrap_or(1);
        Self {
            workers: cpus.min(8),
            queue_capacity: 128,
            drain_deadline: Duration::from_secs(30),
        }
    }
}

// ── Tenant registry ────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct TenantConfig {
    /// How long a resolved tenant handle stays cached.
    pub resolve_ttl: Duration,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            resolve_ttl: Duration::from_secs(300),
        }
    }
}

// ── Aggregate ──────────────────────────────────────────────────────────

/// Full service configuration, one field per component.
#[derive(Clone, Debug, Default)]
pub struct ServiceConfig {
    pub chunker: ChunkerConfig,
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub ingestion: IngestionConfig,
    pub query: QueryConfig,
    pub chat: ChatConfig,
    pub workers: WorkerConfig,
    pub tenants: TenantConfig,
}

impl ServiceConfig {
    /// Build a configuration from the environment, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Some(v) = env_usize("DOCSMITH_CHUNK_SIZE") {
            config.chunker.chunk_size = v;
        }
        if let Some(v) = env_usize("DOCSMITH_CHUNK_OVERLAP") {
            config.chunker.chunk_overlap = v;
        }
        if let Some(v) = env_usize("DOCSMITH_EMBED_BATCH_SIZE") {
            config.embedding.batch_size = v;
        }
        if let Some(v) = env_u32("DOCSMITH_MAX_RETRIES") {
            config.embedding.max_retries = v;
            config.ingestion.max_retries = v;
        }
        if let Some(v) = env_usize("DOCSMITH_MAX_CONCURRENT_OCR") {
            config.ingestion.max_concurrent_ocr = v;
        }
        if let Some(v) = env_usize("DOCSMITH_WORKERS") {
            config.workers.workers = v.max(1);
        }
        if let Some(v) = env_usize("DOCSMITH_QUEUE_CAPACITY") {
            config.workers.queue_capacity = v.max(1);
        }
        if let Some(v) = env_u64("DOCSMITH_CACHE_BYTE_BUDGET") {
            config.cache.byte_budget = v;
        }

        config
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let config = ServiceConfig::default();
        assert_eq!(config.chunker.chunk_size, 1000);
        assert_eq!(config.chunker.chunk_overlap, 100);
        assert_eq!(config.embedding.batch_size, 32);
        assert_eq!(config.embedding.dimension, 1536);
        assert_eq!(config.index.default_top_k, 5);
        assert!((config.index.default_threshold - 0.8).abs() < f32::EPSILON);
        assert_eq!(config.ingestion.max_concurrent_ocr, 4);
        assert_eq!(config.rate_limit.auth.max_requests, 5);
        assert_eq!(config.chat.history_messages, 50);
        assert!(config.workers.workers >= 1 && config.workers.workers <= 8);
    }
}
