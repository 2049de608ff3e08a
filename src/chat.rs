//! Stateful chat sessions over the query orchestrator.
//!
//! Each session owns an append-only, ordered message list. Turns are
//! linearised per session id through an async lock, so a session is
//! effectively single-threaded while different sessions proceed in
//! parallel. Sessions idle past the configured timeout become read-only.

use std::sync::Arc;
use std::sync::LazyLock;

use parking_lot::Mutex;
use regex::Regex;
use rustc_hash::FxHashMap;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::adapters::Clock;
use crate::answer::{HistoryTurn, QueryOrchestrator, QueryResult};
use crate::config::ChatConfig;
use crate::context::RequestContext;
use crate::errors::ServiceError;
use crate::store::{MessageRecord, MessageRole, MetadataStore, SessionRecord, SessionStatus};
use crate::tenant::TenantId;

/// Content patterns that are stripped from incoming messages.
static BLOCKED_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?is)<script.*?>.*?</script>").expect("script pattern"),
        Regex::new(r"(?i)<script[^>]*>").expect("script tag pattern"),
        Regex::new(r"(?i)javascript:[^\s]*").expect("javascript pattern"),
        Regex::new(r"(?i)data:[^\s]*").expect("data-url pattern"),
    ]
});

/// The outcome of one chat turn.
#[derive(Clone, Debug)]
pub struct ChatTurn {
    /// Id of the appended system (answer) message.
    pub message_id: String,
    /// The answer content.
    pub content: String,
    /// Full query result, including context provenance.
    pub result: QueryResult,
}

/// Manages chat sessions and routes turns through the orchestrator.
pub struct ChatSessionManager {
    store: Arc<dyn MetadataStore>,
    orchestrator: Arc<QueryOrchestrator>,
    clock: Arc<dyn Clock>,
    config: ChatConfig,
    locks: Mutex<FxHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChatSessionManager {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        orchestrator: Arc<QueryOrchestrator>,
        clock: Arc<dyn Clock>,
        config: ChatConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            clock,
            config,
            locks: Mutex::new(FxHashMap::default()),
        }
    }

    /// Open a new session for a user.
    pub async fn open_session(
        &self,
        tenant: &TenantId,
        user: &str,
        title: &str,
    ) -> Result<SessionRecord, ServiceError> {
        let title = title.trim();
        if title.is_empty() || title.len() > self.config.max_title_len {
            return Err(ServiceError::Validation(format!(
                "session title must be 1..={} characters",
                self.config.max_title_len
            )));
        }
        let now = self.clock.now();
        let session = SessionRecord {
            id: Uuid::new_v4().to_string(),
            tenant: tenant.clone(),
            user: user.to_string(),
            title: title.to_string(),
            status: SessionStatus::Active,
            last_activity: now,
            created_at: now,
        };
        self.store.insert_session(session.clone()).await?;
        info!(tenant = %tenant, session = %session.id, "chat session opened");
        Ok(session)
    }

    /// Process one user turn: append the user message, answer against the
    /// session history, append the system message, and bump activity.
    pub async fn process_turn(
        &self,
        ctx: &RequestContext,
        tenant: &TenantId,
        session_id: &str,
        content: &str,
    ) -> Result<ChatTurn, ServiceError> {
        let lock = self.session_lock(session_id);
        let _serialised = lock.lock().await;

        let mut session = self
            .store
            .fetch_session(tenant, session_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound {
                what: format!("chat session '{session_id}'"),
            })?;

        let now = self.clock.now();
        if session.status == SessionStatus::Inactive {
            return Err(ServiceError::Validation(
                "chat session is inactive and read-only".into(),
            ));
        }
        let idle = now - session.last_activity;
        if idle.to_std().unwrap_or_default() > self.config.session_timeout {
            session.status = SessionStatus::Inactive;
            self.store.update_session(session).await?;
            return Err(ServiceError::Validation(
                "chat session timed out and is read-only".into(),
            ));
        }

        let content = self.sanitize(content)?;

        // History covers the turns before this one.
        let history: Vec<HistoryTurn> = self
            .store
            .recent_messages(tenant, session_id, self.config.history_messages)
            .await?
            .into_iter()
            .map(|m| HistoryTurn {
                role: m.role,
                content: m.content,
            })
            .collect();

        let user_message = MessageRecord {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            tenant: tenant.clone(),
            role: MessageRole::User,
            content: content.clone(),
            metadata: json!({}),
            created_at: now,
        };
        self.store.append_message(user_message).await?;

        let result = self
            .orchestrator
            .answer(ctx, tenant, &content, &history)
            .await?;

        let context_ids: Vec<&str> = result
            .relevant_chunks
            .iter()
            .map(|c| c.chunk_id.as_str())
            .collect();
        let system_message = MessageRecord {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            tenant: tenant.clone(),
            role: MessageRole::System,
            content: result.answer.clone(),
            metadata: json!({
                "context": context_ids,
                "model": result.metadata.model,
                "confidence": result.confidence_score,
            }),
            created_at: self.clock.now(),
        };
        let message_id = system_message.id.clone();
        self.store.append_message(system_message).await?;

        session.last_activity = self.clock.now();
        self.store.update_session(session).await?;

        Ok(ChatTurn {
            message_id,
            content: result.answer.clone(),
            result,
        })
    }

    /// Length validation plus removal of blocked content patterns.
    fn sanitize(&self, content: &str) -> Result<String, ServiceError> {
        if content.len() > self.config.max_message_bytes {
            return Err(ServiceError::Validation(format!(
                "message exceeds {} bytes",
                self.config.max_message_bytes
            )));
        }
        let mut cleaned = content.to_string();
        for pattern in BLOCKED_PATTERNS.iter() {
            cleaned = pattern.replace_all(&cleaned, "").into_owned();
        }
        let cleaned = cleaned.trim().to_string();
        if cleaned.is_empty() {
            return Err(ServiceError::Validation(
                "message is empty after sanitisation".into(),
            ));
        }
        Ok(cleaned)
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_config(config: ChatConfig) -> ChatSessionManager {
        use crate::adapters::SystemClock;
        use crate::cache::{InMemoryCacheBackend, ResultCache};
        use crate::config::{CacheConfig, EmbeddingConfig, IndexConfig, QueryConfig, RateLimitConfig};
        use crate::embedding::EmbeddingPipeline;
        use crate::index::VectorIndex;
        use crate::ratelimit::RateLimiter;
        use crate::search::SearchEngine;
        use crate::store::memory::InMemoryMetadataStore;
        use async_trait::async_trait;

        struct NoopEmbedder;
        #[async_trait]
        impl crate::adapters::EmbeddingEngine for NoopEmbedder {
            async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
                Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
            }
        }
        struct NoopLlm;
        #[async_trait]
        impl crate::adapters::LanguageModel for NoopLlm {
            async fn complete(
                &self,
                _request: crate::adapters::CompletionRequest,
            ) -> Result<crate::adapters::Completion, ServiceError> {
                Ok(crate::adapters::Completion {
                    text: "answer".into(),
                    model: "mock".into(),
                    tokens_used: 1,
                })
            }
        }

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let cache_config = CacheConfig::default();
        let cache = Arc::new(ResultCache::new(
            Arc::new(InMemoryCacheBackend::new(4, cache_config.byte_budget, clock.clone())),
            cache_config,
        ));
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default(), clock.clone()));
        let index_config = IndexConfig {
            dimension: 4,
            ..IndexConfig::default()
        };
        let index = Arc::new(VectorIndex::new(store.clone(), index_config.clone()));
        let embeddings = Arc::new(EmbeddingPipeline::new(
            Arc::new(NoopEmbedder),
            EmbeddingConfig {
                dimension: 4,
                ..EmbeddingConfig::default()
            },
        ));
        let search = Arc::new(SearchEngine::new(
            limiter.clone(),
            cache.clone(),
            embeddings,
            index,
            store.clone(),
            index_config,
        ));
        let orchestrator = Arc::new(QueryOrchestrator::new(
            limiter,
            cache,
            search,
            Arc::new(NoopLlm),
            QueryConfig::default(),
        ));
        ChatSessionManager::new(store, orchestrator, clock, config)
    }

    fn manager() -> ChatSessionManager {
        manager_config(ChatConfig::default())
    }

    #[tokio::test]
    async fn title_validation() {
        let manager = manager();
        let t = TenantId::new("acme").unwrap();
        assert!(manager.open_session(&t, "u1", "").await.is_err());
        assert!(
            manager
                .open_session(&t, "u1", &"x".repeat(256))
                .await
                .is_err()
        );
        assert!(manager.open_session(&t, "u1", "Pump questions").await.is_ok());
    }

    #[tokio::test]
    async fn sanitisation_strips_blocked_patterns() {
        let manager = manager();
        let cleaned = manager
            .sanitize("hello <script>alert(1)</script> world javascript:evil()")
            .unwrap();
        assert!(!cleaned.contains("<script"));
        assert!(!cleaned.contains("javascript:"));
        assert!(cleaned.contains("hello"));
        assert!(cleaned.contains("world"));

        // Nothing but blocked content is a validation error.
        assert!(manager.sanitize("<script>only</script>").is_err());
    }

    #[tokio::test]
    async fn oversized_message_rejected() {
        let manager = manager();
        let big = "x".repeat(16 * 1024 + 1);
        let err = manager.sanitize(&big).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn turn_appends_user_and_system_messages() {
        let manager = manager();
        let t = TenantId::new("acme").unwrap();
        let session = manager.open_session(&t, "u1", "Pumps").await.unwrap();
        let ctx = RequestContext::builder(t.clone()).identity("u1").build();

        let turn = manager
            .process_turn(&ctx, &t, &session.id, "Show me A123 specs")
            .await
            .unwrap();
        assert_eq!(turn.content, "answer");

        let messages = manager
            .store
            .recent_messages(&t, &session.id, 10)
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].role, MessageRole::System);
        assert_eq!(messages[1].id, turn.message_id);
    }
}
