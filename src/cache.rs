//! Tenant-scoped result cache with TTL and approximate-LRU eviction.
//!
//! Every key embeds the owning tenant — the public API only accepts a
//! [`TenantId`] plus a kind and fingerprint, so a key without a tenant
//! prefix is unrepresentable. Values carry a one-byte leading tag
//! distinguishing structured (JSON) from opaque (binary) payloads.
//!
//! The cache is **fail-open**: any backend error degrades to a miss (or a
//! dropped write) and is logged; callers never see cache failures.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::adapters::Clock;
use crate::config::CacheConfig;
use crate::errors::ServiceError;
use crate::tenant::TenantId;

/// Leading tag for JSON payloads.
const TAG_JSON: u8 = 1;
/// Leading tag for opaque binary payloads.
const TAG_BLOB: u8 = 2;

// ── Kinds and fingerprints ─────────────────────────────────────────────

/// What a cache entry holds; each kind carries its own TTL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheKind {
    Search,
    Answer,
    Health,
}

impl CacheKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Answer => "answer",
            Self::Health => "health",
        }
    }

    #[must_use]
    pub fn ttl(self, config: &CacheConfig) -> Duration {
        match self {
            Self::Search => config.search_ttl,
            Self::Answer => config.answer_ttl,
            Self::Health => config.health_ttl,
        }
    }
}

/// Stable hash over the inputs of a cacheable computation.
#[must_use]
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

// ── Backend seam ───────────────────────────────────────────────────────

/// Raw KV backend with TTL. Implementations may be remote; the
/// [`ResultCache`] wrapper adds tenant scoping, tagging, timeouts, and the
/// fail-open policy.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ServiceError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), ServiceError>;
    async fn remove(&self, key: &str) -> Result<(), ServiceError>;
}

// ── In-memory backend ──────────────────────────────────────────────────

struct Entry {
    value: Vec<u8>,
    expires_at: DateTime<Utc>,
    last_used: u64,
}

#[derive(Default)]
struct Shard {
    entries: FxHashMap<String, Entry>,
    bytes: u64,
}

/// Sharded in-memory [`CacheBackend`] with a byte budget and LRU eviction.
///
/// No global lock: keys hash onto shards, each behind its own mutex. The
/// byte budget is split evenly across shards, making eviction approximate
/// at the whole-cache level.
pub struct InMemoryCacheBackend {
    shards: Vec<Mutex<Shard>>,
    budget_per_shard: u64,
    clock: Arc<dyn Clock>,
    ticks: AtomicU64,
}

impl InMemoryCacheBackend {
    pub fn new(shards: usize, byte_budget: u64, clock: Arc<dyn Clock>) -> Self {
        let shard_count = shards.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(Shard::default())).collect(),
            budget_per_shard: byte_budget / shard_count as u64,
            clock,
            ticks: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<Shard> {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let idx = usize::from(digest[0]) % self.shards.len();
        &self.shards[idx]
    }

    fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ServiceError> {
        let now = self.clock.now();
        let tick = self.tick();
        let mut shard = self.shard(key).lock();
        match shard.entries.get_mut(key) {
            Some(entry) if now < entry.expires_at => {
                entry.last_used = tick;
                Ok(Some(entry.value.clone()))
            }
            Some(_) => {
                // Expired: reclaim eagerly.
                if let Some(entry) = shard.entries.remove(key) {
                    shard.bytes = shard.bytes.saturating_sub(entry_cost(key, &entry.value));
                }
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), ServiceError> {
        let expires_at = self.clock.now()
            + chrono::Duration::from_std(ttl)
                .map_err(|err| ServiceError::Internal(format!("bad ttl: {err}")))?;
        let tick = self.tick();
        let cost = entry_cost(key, &value);
        let mut shard = self.shard(key).lock();

        if let Some(old) = shard.entries.remove(key) {
            shard.bytes = shard.bytes.saturating_sub(entry_cost(key, &old.value));
        }
        shard.bytes += cost;
        shard.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at,
                last_used: tick,
            },
        );

        // Evict least-recently-used entries until the shard fits its budget.
        while shard.bytes > self.budget_per_shard && shard.entries.len() > 1 {
            let Some(victim) = shard
                .entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            if let Some(entry) = shard.entries.remove(&victim) {
                shard.bytes = shard.bytes.saturating_sub(entry_cost(&victim, &entry.value));
            }
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), ServiceError> {
        let mut shard = self.shard(key).lock();
        if let Some(entry) = shard.entries.remove(key) {
            shard.bytes = shard.bytes.saturating_sub(entry_cost(key, &entry.value));
        }
        Ok(())
    }
}

fn entry_cost(key: &str, value: &[u8]) -> u64 {
    (key.len() + value.len()) as u64
}

// ── ResultCache ────────────────────────────────────────────────────────

/// Tenant-scoped, tagged, fail-open cache front-end.
pub struct ResultCache {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self { backend, config }
    }

    /// The only way to construct a key: tenant is always the prefix.
    fn key(tenant: &TenantId, kind: CacheKind, fingerprint: &str) -> String {
        format!("{}:{}:{}", tenant, kind.as_str(), fingerprint)
    }

    /// Look up a JSON value. Backend errors, timeouts, wrong tags, and
    /// decode failures all degrade to a miss.
    pub async fn get_json(
        &self,
        tenant: &TenantId,
        kind: CacheKind,
        fingerprint: &str,
    ) -> Option<serde_json::Value> {
        let raw = self.get_raw(tenant, kind, fingerprint).await?;
        match raw.split_first() {
            Some((&TAG_JSON, body)) => serde_json::from_slice(body).ok(),
            _ => None,
        }
    }

    /// Look up an opaque binary value.
    pub async fn get_blob(
        &self,
        tenant: &TenantId,
        kind: CacheKind,
        fingerprint: &str,
    ) -> Option<Vec<u8>> {
        let raw = self.get_raw(tenant, kind, fingerprint).await?;
        match raw.split_first() {
            Some((&TAG_BLOB, body)) => Some(body.to_vec()),
            _ => None,
        }
    }

    /// Store a JSON value under the kind's TTL. Returns whether the write
    /// was accepted; failures are logged, never propagated.
    pub async fn set_json(
        &self,
        tenant: &TenantId,
        kind: CacheKind,
        fingerprint: &str,
        value: &serde_json::Value,
    ) -> bool {
        let Ok(body) = serde_json::to_vec(value) else {
            return false;
        };
        let mut tagged = Vec::with_capacity(body.len() + 1);
        tagged.push(TAG_JSON);
        tagged.extend_from_slice(&body);
        self.set_raw(tenant, kind, fingerprint, tagged).await
    }

    /// Store an opaque binary value under the kind's TTL.
    pub async fn set_blob(
        &self,
        tenant: &TenantId,
        kind: CacheKind,
        fingerprint: &str,
        value: &[u8],
    ) -> bool {
        let mut tagged = Vec::with_capacity(value.len() + 1);
        tagged.push(TAG_BLOB);
        tagged.extend_from_slice(value);
        self.set_raw(tenant, kind, fingerprint, tagged).await
    }

    async fn get_raw(
        &self,
        tenant: &TenantId,
        kind: CacheKind,
        fingerprint: &str,
    ) -> Option<Vec<u8>> {
        let key = Self::key(tenant, kind, fingerprint);
        let call = tokio::time::timeout(self.config.op_timeout, self.backend.get(&key));
        match call.await {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                warn!(key = %key, error = %err, "cache get failed; treating as miss");
                None
            }
            Err(_) => {
                warn!(key = %key, "cache get timed out; treating as miss");
                None
            }
        }
    }

    async fn set_raw(
        &self,
        tenant: &TenantId,
        kind: CacheKind,
        fingerprint: &str,
        value: Vec<u8>,
    ) -> bool {
        let key = Self::key(tenant, kind, fingerprint);
        let ttl = kind.ttl(&self.config);
        let call = tokio::time::timeout(self.config.op_timeout, self.backend.set(&key, value, ttl));
        match call.await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(key = %key, error = %err, "cache set failed; dropping write");
                false
            }
            Err(_) => {
                warn!(key = %key, "cache set timed out; dropping write");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use serde_json::json;

    struct ManualClock(RwLock<DateTime<Utc>>);

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self(RwLock::new(Utc::now())))
        }
        fn advance(&self, d: Duration) {
            let mut now = self.0.write();
            *now += chrono::Duration::from_std(d).unwrap();
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.read()
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl CacheBackend for FailingBackend {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, ServiceError> {
            Err(ServiceError::TransientUpstream {
                stage: "cache",
                message: "backend down".into(),
            })
        }
        async fn set(&self, _: &str, _: Vec<u8>, _: Duration) -> Result<(), ServiceError> {
            Err(ServiceError::TransientUpstream {
                stage: "cache",
                message: "backend down".into(),
            })
        }
        async fn remove(&self, _: &str) -> Result<(), ServiceError> {
            Ok(())
        }
    }

    fn tenant(name: &str) -> TenantId {
        TenantId::new(name).unwrap()
    }

    fn cache_with_clock(clock: Arc<ManualClock>) -> ResultCache {
        let config = CacheConfig::default();
        let backend = Arc::new(InMemoryCacheBackend::new(4, config.byte_budget, clock));
        ResultCache::new(backend, config)
    }

    #[tokio::test]
    async fn json_round_trip_with_tag() {
        let cache = cache_with_clock(ManualClock::new());
        let t = tenant("acme");
        let value = json!({"answer": "500 GPM"});

        assert!(cache.set_json(&t, CacheKind::Answer, "fp", &value).await);
        assert_eq!(
            cache.get_json(&t, CacheKind::Answer, "fp").await,
            Some(value)
        );
        // A JSON entry is not readable as a blob.
        assert!(cache.get_blob(&t, CacheKind::Answer, "fp").await.is_none());
    }

    #[tokio::test]
    async fn ttl_expiry_is_strict() {
        let clock = ManualClock::new();
        let cache = cache_with_clock(clock.clone());
        let t = tenant("acme");
        cache
            .set_json(&t, CacheKind::Search, "fp", &json!([1, 2, 3]))
            .await;

        clock.advance(Duration::from_secs(3599));
        assert!(cache.get_json(&t, CacheKind::Search, "fp").await.is_some());

        clock.advance(Duration::from_secs(1));
        assert!(cache.get_json(&t, CacheKind::Search, "fp").await.is_none());
    }

    #[tokio::test]
    async fn tenants_never_collide() {
        let cache = cache_with_clock(ManualClock::new());
        let a = tenant("tenant-a");
        let b = tenant("tenant-b");
        cache
            .set_json(&a, CacheKind::Search, "same-fp", &json!("a-data"))
            .await;

        assert!(cache.get_json(&b, CacheKind::Search, "same-fp").await.is_none());
        assert_eq!(
            cache.get_json(&a, CacheKind::Search, "same-fp").await,
            Some(json!("a-data"))
        );
    }

    #[tokio::test]
    async fn lru_eviction_respects_byte_budget() {
        let clock = ManualClock::new();
        // One shard, tiny budget: only a few entries fit.
        let backend = Arc::new(InMemoryCacheBackend::new(1, 256, clock.clone()));
        let config = CacheConfig::default();
        let cache = ResultCache::new(backend, config);
        let t = tenant("acme");

        for i in 0..10 {
            cache
                .set_blob(&t, CacheKind::Search, &format!("fp{i}"), &[0u8; 48])
                .await;
        }
        // The earliest entries were evicted, the latest survives.
        assert!(cache.get_blob(&t, CacheKind::Search, "fp0").await.is_none());
        assert!(cache.get_blob(&t, CacheKind::Search, "fp9").await.is_some());
    }

    #[tokio::test]
    async fn fail_open_on_backend_errors() {
        let cache = ResultCache::new(Arc::new(FailingBackend), CacheConfig::default());
        let t = tenant("acme");
        // Neither call propagates the backend error.
        assert!(!cache.set_json(&t, CacheKind::Answer, "fp", &json!(1)).await);
        assert!(cache.get_json(&t, CacheKind::Answer, "fp").await.is_none());
    }

    #[test]
    fn fingerprints_are_stable_and_distinct() {
        let a = fingerprint(&["query", "5", "0.8"]);
        let b = fingerprint(&["query", "5", "0.8"]);
        let c = fingerprint(&["query", "50", ".8"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
