//! Semantic search over a tenant's indexed chunks.
//!
//! Embeds the query (batch size 1), searches the tenant's vector partition,
//! loads chunk payloads preserving score order, and caches the result set.
//! Given an index snapshot, results are deterministic — ties in score break
//! on embedding-id order inside the index.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{CacheKind, ResultCache, fingerprint};
use crate::config::IndexConfig;
use crate::context::RequestContext;
use crate::embedding::EmbeddingPipeline;
use crate::errors::ServiceError;
use crate::index::VectorIndex;
use crate::ratelimit::{RateBucket, RateLimiter};
use crate::store::{ChunkRecord, MetadataStore, embedding_id};
use crate::tenant::TenantId;

/// One search result: a chunk with its similarity score.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk: ChunkRecord,
    pub score: f32,
}

/// Query-side retrieval engine.
pub struct SearchEngine {
    limiter: Arc<RateLimiter>,
    cache: Arc<ResultCache>,
    embeddings: Arc<EmbeddingPipeline>,
    index: Arc<VectorIndex>,
    store: Arc<dyn MetadataStore>,
    config: IndexConfig,
}

impl SearchEngine {
    pub fn new(
        limiter: Arc<RateLimiter>,
        cache: Arc<ResultCache>,
        embeddings: Arc<EmbeddingPipeline>,
        index: Arc<VectorIndex>,
        store: Arc<dyn MetadataStore>,
        config: IndexConfig,
    ) -> Self {
        Self {
            limiter,
            cache,
            embeddings,
            index,
            store,
            config,
        }
    }

    /// Public search entry point: rate-limited, cached, tenant-scoped.
    pub async fn search(
        &self,
        ctx: &RequestContext,
        tenant: &TenantId,
        query: &str,
        top_k: Option<usize>,
        threshold: Option<f32>,
    ) -> Result<Vec<SearchHit>, ServiceError> {
        self.limiter.check(tenant, ctx.identity(), RateBucket::Api)?;
        self.retrieve(tenant, query, top_k, threshold).await
    }

    /// Retrieval without the rate-limit gate, for callers that already paid
    /// it (the query orchestrator counts one request, not two).
    pub(crate) async fn retrieve(
        &self,
        tenant: &TenantId,
        query: &str,
        top_k: Option<usize>,
        threshold: Option<f32>,
    ) -> Result<Vec<SearchHit>, ServiceError> {
        let top_k = top_k.unwrap_or(self.config.default_top_k);
        let threshold = threshold.unwrap_or(self.config.default_threshold);
        if query.trim().is_empty() {
            return Err(ServiceError::Validation("query text is empty".into()));
        }

        let fp = fingerprint(&[query, &top_k.to_string(), &threshold.to_string()]);
        if let Some(cached) = self.cache.get_json(tenant, CacheKind::Search, &fp).await
            && let Ok(hits) = serde_json::from_value::<Vec<SearchHit>>(cached)
        {
            debug!(tenant = %tenant, "search cache hit");
            return Ok(hits);
        }

        let query_vector = self.embeddings.embed_one(query).await?;
        let scored = self
            .index
            .search(tenant, &query_vector, top_k, threshold)
            .await?;
        if scored.is_empty() {
            return Ok(Vec::new());
        }

        // Load payloads and re-align them with the index's score order via
        // the derivable chunk→embedding id mapping.
        let ids: Vec<String> = scored.iter().map(|s| s.id.clone()).collect();
        let chunks = self.store.chunks_by_embedding_ids(tenant, &ids).await?;
        let by_embedding: rustc_hash::FxHashMap<String, ChunkRecord> = chunks
            .into_iter()
            .map(|chunk| (embedding_id(&chunk.id), chunk))
            .collect();

        let hits: Vec<SearchHit> = scored
            .into_iter()
            .filter_map(|s| {
                by_embedding.get(&s.id).map(|chunk| SearchHit {
                    chunk: chunk.clone(),
                    score: s.score,
                })
            })
            .collect();

        if let Ok(value) = serde_json::to_value(&hits) {
            self.cache
                .set_json(tenant, CacheKind::Search, &fp, &value)
                .await;
        }
        Ok(hits)
    }
}
