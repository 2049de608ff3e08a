//! Per-request context threaded through every operation.
//!
//! The transport adapter resolves authentication, tenant extraction, and
//! deadlines once, then hands the core a [`RequestContext`]. No component
//! reads process globals for tenant or identity.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::adapters::Clock;
use crate::tenant::TenantId;

/// Resolved request metadata: who is calling, on behalf of which tenant,
/// traceable under which correlation id, and until when.
#[derive(Clone, Debug)]
pub struct RequestContext {
    tenant: TenantId,
    identity: String,
    correlation_id: Uuid,
    deadline: Option<DateTime<Utc>>,
}

impl RequestContext {
    /// Start building a context.
    #[must_use]
    pub fn builder(tenant: TenantId) -> RequestContextBuilder {
        RequestContextBuilder {
            tenant,
            identity: String::new(),
            correlation_id: None,
            deadline: None,
        }
    }

    /// The tenant this request is scoped to.
    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Caller identity (user id, or an `ip+email` composite for auth flows).
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Correlation id attached to logs and caller-facing errors.
    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// End-to-end deadline, if the transport supplied one.
    #[must_use]
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    /// Whether the deadline has already elapsed.
    #[must_use]
    pub fn is_expired(&self, clock: &dyn Clock) -> bool {
        self.deadline.is_some_and(|d| clock.now() >= d)
    }
}

/// Builder for [`RequestContext`].
#[derive(Debug)]
pub struct RequestContextBuilder {
    tenant: TenantId,
    identity: String,
    correlation_id: Option<Uuid>,
    deadline: Option<DateTime<Utc>>,
}

impl RequestContextBuilder {
    #[must_use]
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    #[must_use]
    pub fn correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    #[must_use]
    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Build the context. A fresh correlation id is generated when none was
    /// supplied.
    #[must_use]
    pub fn build(self) -> RequestContext {
        RequestContext {
            tenant: self.tenant,
            identity: self.identity,
            correlation_id: self.correlation_id.unwrap_or_else(Uuid::new_v4),
            deadline: self.deadline,
        }
    }
}
