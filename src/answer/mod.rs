//! Query orchestration: context retrieval, prompt assembly, LLM
//! invocation, and answer caching.

pub mod prompt;

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::adapters::{Completion, CompletionRequest, LanguageModel};
use crate::backoff::backoff_delay;
use crate::cache::{CacheKind, ResultCache, fingerprint};
use crate::config::QueryConfig;
use crate::context::RequestContext;
use crate::errors::ServiceError;
use crate::ratelimit::{RateBucket, RateLimiter};
use crate::search::{SearchEngine, SearchHit};
use crate::store::MessageRole;
use crate::tenant::{TenantId, assert_scope};

pub use prompt::{HistoryTurn, PromptAssembler};

// ── Result types ───────────────────────────────────────────────────────

/// A chunk that contributed to an answer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelevantChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub score: f32,
    pub page: u32,
}

/// Answer provenance and accounting.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerMetadata {
    pub model: String,
    pub tokens_used: u32,
    pub cache_hit: bool,
    /// False when no retrieved chunk made it into the prompt.
    pub grounded: bool,
}

/// The result of one answered query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryResult {
    pub answer: String,
    pub relevant_chunks: Vec<RelevantChunk>,
    /// Maximum similarity score among chunks included in the prompt.
    pub confidence_score: f32,
    pub processing_time_ms: u64,
    /// Distinct source documents, in chunk score order.
    pub source_documents: Vec<String>,
    pub metadata: AnswerMetadata,
}

// ── Orchestrator ───────────────────────────────────────────────────────

/// Assembles context, invokes the LLM, and caches answers per tenant.
pub struct QueryOrchestrator {
    limiter: Arc<RateLimiter>,
    cache: Arc<ResultCache>,
    search: Arc<SearchEngine>,
    llm: Arc<dyn LanguageModel>,
    assembler: PromptAssembler,
    config: QueryConfig,
}

impl QueryOrchestrator {
    pub fn new(
        limiter: Arc<RateLimiter>,
        cache: Arc<ResultCache>,
        search: Arc<SearchEngine>,
        llm: Arc<dyn LanguageModel>,
        config: QueryConfig,
    ) -> Self {
        Self {
            limiter,
            cache,
            search,
            llm,
            assembler: PromptAssembler::new(config.clone()),
            config,
        }
    }

    /// Answer a query for a tenant, optionally continuing a conversation.
    pub async fn answer(
        &self,
        ctx: &RequestContext,
        tenant: &TenantId,
        query: &str,
        history: &[HistoryTurn],
    ) -> Result<QueryResult, ServiceError> {
        assert_scope(tenant, ctx)?;
        self.limiter.check(tenant, ctx.identity(), RateBucket::Api)?;
        if query.trim().is_empty() {
            return Err(ServiceError::Validation("query text is empty".into()));
        }

        let started = Instant::now();
        let fp = fingerprint(&[tenant.as_str(), query]);
        if let Some(cached) = self.cache.get_json(tenant, CacheKind::Answer, &fp).await
            && let Ok(mut result) = serde_json::from_value::<QueryResult>(cached)
        {
            debug!(tenant = %tenant, "answer cache hit");
            result.metadata.cache_hit = true;
            result.processing_time_ms = started.elapsed().as_millis() as u64;
            return Ok(result);
        }

        // Follow-up turns rarely repeat their referent ("what's *its* flow
        // rate?"), so retrieval sees the newest user turn alongside the
        // query. The answer cache key stays on the query alone.
        let retrieval_text = match history
            .iter()
            .rev()
            .find(|turn| turn.role == MessageRole::User)
        {
            Some(turn) => format!("{query}\n{}", turn.content),
            None => query.to_string(),
        };

        let hits = self
            .search
            .retrieve(tenant, &retrieval_text, None, None)
            .await?;

        let assembled = self.assembler.assemble(query, history, &hits);
        let completion = self
            .complete_with_retries(tenant, &assembled.system, &assembled.prompt)
            .await?;

        let result = self.build_result(&hits, &assembled.included, assembled.confidence, completion, started);

        if let Ok(value) = serde_json::to_value(&result) {
            self.cache
                .set_json(tenant, CacheKind::Answer, &fp, &value)
                .await;
        }
        info!(
            tenant = %tenant,
            correlation_id = %ctx.correlation_id(),
            chunks = result.relevant_chunks.len(),
            confidence = result.confidence_score,
            elapsed_ms = result.processing_time_ms,
            "query answered"
        );
        Ok(result)
    }

    async fn complete_with_retries(
        &self,
        tenant: &TenantId,
        system: &str,
        prompt: &str,
    ) -> Result<Completion, ServiceError> {
        let mut attempt = 0u32;
        loop {
            let request = CompletionRequest {
                system: system.to_string(),
                prompt: prompt.to_string(),
                temperature: self.config.temperature,
                max_tokens: self.config.max_output_tokens,
                user_tag: format!("tenant_{tenant}"),
            };
            let call = tokio::time::timeout(self.config.llm_timeout, self.llm.complete(request));
            let outcome = match call.await {
                Ok(inner) => inner,
                Err(_) => Err(ServiceError::TransientUpstream {
                    stage: "llm",
                    message: format!("completion timed out after {}s", self.config.llm_timeout.as_secs()),
                }),
            };
            match outcome {
                Ok(completion) => return Ok(completion),
                Err(err) if err.is_transient() && attempt < self.config.llm_retries => {
                    let delay = backoff_delay(self.config.llm_retry_delay, attempt);
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn build_result(
        &self,
        hits: &[SearchHit],
        included: &[usize],
        confidence: f32,
        completion: Completion,
        started: Instant,
    ) -> QueryResult {
        let relevant_chunks: Vec<RelevantChunk> = included
            .iter()
            .filter_map(|&idx| hits.get(idx))
            .map(|hit| RelevantChunk {
                chunk_id: hit.chunk.id.clone(),
                document_id: hit.chunk.document_id.clone(),
                content: hit.chunk.content.clone(),
                score: hit.score,
                page: hit.chunk.page,
            })
            .collect();

        let mut source_documents = Vec::new();
        for chunk in &relevant_chunks {
            if !source_documents.contains(&chunk.document_id) {
                source_documents.push(chunk.document_id.clone());
            }
        }

        let grounded = !relevant_chunks.is_empty();
        QueryResult {
            answer: completion.text,
            relevant_chunks,
            confidence_score: if grounded { confidence } else { 0.0 },
            processing_time_ms: started.elapsed().as_millis() as u64,
            source_documents,
            metadata: AnswerMetadata {
                model: completion.model,
                tokens_used: completion.tokens_used,
                cache_hit: false,
                grounded,
            },
        }
    }
}
