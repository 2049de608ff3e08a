//! Tenant identity, validation, and scope enforcement.
//!
//! Every data item, index partition, and cache namespace is owned by exactly
//! one tenant. [`TenantId`] can only be constructed through validation, and
//! every public entry point authorises the request context against the
//! target tenant before doing anything else.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::adapters::Clock;
use crate::context::RequestContext;
use crate::errors::ServiceError;
use crate::store::MetadataStore;

/// Maximum accepted length of a tenant identifier.
pub const MAX_TENANT_ID_LEN: usize = 64;

// ── TenantId ───────────────────────────────────────────────────────────

/// Opaque, validated tenant identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Validate and wrap a raw tenant identifier.
    ///
    /// Accepts non-empty printable ASCII (no whitespace) up to
    /// [`MAX_TENANT_ID_LEN`] characters.
    pub fn new(raw: impl Into<String>) -> Result<Self, ServiceError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(ServiceError::Validation("tenant id is empty".into()));
        }
        if raw.len() > MAX_TENANT_ID_LEN {
            return Err(ServiceError::Validation(format!(
                "tenant id exceeds {MAX_TENANT_ID_LEN} characters"
            )));
        }
        if !raw.chars().all(|c| c.is_ascii_graphic()) {
            return Err(ServiceError::Validation(
                "tenant id contains non-printable characters".into(),
            ));
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Tenant handle ──────────────────────────────────────────────────────

/// Lifecycle status of a tenant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Disabled,
}

/// Resolved tenant handle returned by the registry.
#[derive(Clone, Debug)]
pub struct Tenant {
    pub id: TenantId,
    pub status: TenantStatus,
}

impl Tenant {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}

/// Fail unless the request context is scoped to the target tenant.
pub fn assert_scope(target: &TenantId, ctx: &RequestContext) -> Result<(), ServiceError> {
    if ctx.tenant() == target {
        Ok(())
    } else {
        Err(ServiceError::Forbidden(format!(
            "request scoped to tenant '{}' may not touch tenant '{}'",
            ctx.tenant(),
            target
        )))
    }
}

// ── TenantRegistry ─────────────────────────────────────────────────────

struct CachedTenant {
    tenant: Tenant,
    fetched_at: DateTime<Utc>,
}

/// Validates tenant ids against the metadata store and enforces isolation
/// scope on every call. Resolved handles are cached for a bounded interval.
pub struct TenantRegistry {
    store: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
    cache_ttl: Duration,
    cache: RwLock<FxHashMap<String, CachedTenant>>,
}

impl TenantRegistry {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        clock: Arc<dyn Clock>,
        cache_ttl: std::time::Duration,
    ) -> Self {
        Self {
            store,
            clock,
            cache_ttl: Duration::from_std(cache_ttl).unwrap_or_else(|_| Duration::seconds(300)),
            cache: RwLock::new(FxHashMap::default()),
        }
    }

    /// Resolve a tenant handle, consulting the cache first.
    pub async fn resolve(&self, id: &TenantId) -> Result<Tenant, ServiceError> {
        let now = self.clock.now();
        {
            let cache = self.cache.read();
            if let Some(cached) = cache.get(id.as_str())
                && now - cached.fetched_at < self.cache_ttl
            {
                return Ok(cached.tenant.clone());
            }
        }

        let record = self
            .store
            .fetch_tenant(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound {
                what: format!("tenant '{id}'"),
            })?;

        let tenant = Tenant {
            id: record.id,
            status: record.status,
        };
        self.cache.write().insert(
            id.as_str().to_string(),
            CachedTenant {
                tenant: tenant.clone(),
                fetched_at: now,
            },
        );
        Ok(tenant)
    }

    /// Resolve and require an active tenant, then verify the request scope.
    ///
    /// This is the single authorisation gate called by every public entry
    /// point before any cache key, index partition, or store query is built.
    pub async fn authorize(
        &self,
        target: &TenantId,
        ctx: &RequestContext,
    ) -> Result<Tenant, ServiceError> {
        assert_scope(target, ctx)?;
        let tenant = self.resolve(target).await?;
        if !tenant.is_active() {
            return Err(ServiceError::Forbidden(format!(
                "tenant '{target}' is disabled"
            )));
        }
        Ok(tenant)
    }

    /// Drop a cached handle (after a status change).
    pub fn invalidate(&self, id: &TenantId) {
        self.cache.write().remove(id.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_validation() {
        assert!(TenantId::new("acme-industrial").is_ok());
        assert!(TenantId::new("f47ac10b-58cc-4372-a567-0e02b2c3d479").is_ok());
        assert!(TenantId::new("").is_err());
        assert!(TenantId::new("has space").is_err());
        assert!(TenantId::new("tab\there").is_err());
        assert!(TenantId::new("x".repeat(65)).is_err());
        assert!(TenantId::new("x".repeat(64)).is_ok());
    }

    #[test]
    fn scope_assertion() {
        let a = TenantId::new("tenant-a").unwrap();
        let b = TenantId::new("tenant-b").unwrap();
        let ctx = RequestContext::builder(a.clone()).identity("u").build();

        assert!(assert_scope(&a, &ctx).is_ok());
        let err = assert_scope(&b, &ctx).unwrap_err();
        assert_eq!(err.kind(), "forbidden");
    }
}
