//! Collaborator Contracts (spec §4.6): what the core consumes from its host.
//!
//! `async_trait`-based, mirroring `kernel/jobs/queue.rs::JobQueue` and
//! `kernel/jobs/manager.rs::JobManager`'s service-trait pattern. `SystemClock` and
//! `UuidIdGen` ship as the production defaults; `AuthResolver`/`TenantResolver` are
//! boundary-owned, so only a permissive development-mode default lives here — the
//! HTTP layer supplies the real implementation (out of core scope per spec §1).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::common::entity_ids::{LeaseId, ReceiptId, TaskId, TenantId};
use crate::common::principal::Principal;
use crate::error::Result;

/// Monotonic UTC wall-clock time, injected so tests can control `now()`.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock: thin wrapper over `common::time::now`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        crate::common::time::now()
    }
}

/// Unique id generation for tasks, leases, and receipts.
pub trait IdGen: Send + Sync {
    fn task_id(&self) -> TaskId;
    fn lease_id(&self) -> LeaseId;
    fn receipt_id(&self) -> ReceiptId;
}

/// Production id generator: time-ordered (v7) uuids, via `Id::new()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIdGen;

impl IdGen for UuidIdGen {
    fn task_id(&self) -> TaskId {
        TaskId::new()
    }

    fn lease_id(&self) -> LeaseId {
        LeaseId::new()
    }

    fn receipt_id(&self) -> ReceiptId {
        ReceiptId::new()
    }
}

/// What an authenticated caller resolves to: the acting principal, and whether it
/// carries internal (`sys:`/`svc:`) authority.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub principal: Principal,
    pub is_internal: bool,
}

/// Given an incoming request, yields the acting principal (spec §4.6).
///
/// The HTTP layer owns the concrete implementation (header parsing, token
/// verification, etc.) — out of core scope per spec §1. `AuthContext` is the only
/// shape the core needs from it.
#[async_trait]
pub trait AuthResolver: Send + Sync {
    async fn resolve(&self, raw_principal_header: Option<&str>) -> Result<AuthContext>;
}

/// Development-mode default: trusts an `X-Asyncgate-Principal`-shaped
/// `kind:id` string verbatim and marks nothing as internal. Matches the teacher's
/// `TestJobManager`/mock-handler pattern for running locally without external auth
/// infrastructure.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevAuthResolver;

#[async_trait]
impl AuthResolver for DevAuthResolver {
    async fn resolve(&self, raw_principal_header: Option<&str>) -> Result<AuthContext> {
        let header = raw_principal_header.unwrap_or("agent:dev-agent");
        let (kind_str, id) = header.split_once(':').unwrap_or(("agent", header));
        let kind = match kind_str {
            "worker" => crate::common::principal::PrincipalKind::Worker,
            "service" => crate::common::principal::PrincipalKind::Service,
            "system" => crate::common::principal::PrincipalKind::System,
            "human" => crate::common::principal::PrincipalKind::Human,
            _ => crate::common::principal::PrincipalKind::Agent,
        };
        let is_internal = crate::common::principal::is_internal_principal_id(id);
        Ok(AuthContext {
            principal: Principal::new(kind, id),
            is_internal,
        })
    }
}

/// Given an incoming request, yields the tenant id it acts within (spec §4.6).
#[async_trait]
pub trait TenantResolver: Send + Sync {
    async fn resolve(&self, raw_tenant_header: Option<&str>) -> Result<TenantId>;
}

/// Development-mode default: parses a raw `X-Asyncgate-Tenant` uuid header, falling
/// back to the nil tenant so a bare `curl` against a dev server works out of the box.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevTenantResolver;

#[async_trait]
impl TenantResolver for DevTenantResolver {
    async fn resolve(&self, raw_tenant_header: Option<&str>) -> Result<TenantId> {
        match raw_tenant_header {
            Some(raw) => TenantId::parse(raw).map_err(|e| crate::error::AsyncGateError::Internal(e.into())),
            None => Ok(TenantId::nil()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_close_to_chrono_now() {
        let clock = SystemClock;
        let delta = (Utc::now() - clock.now()).num_seconds().abs();
        assert!(delta < 5);
    }

    #[tokio::test]
    async fn dev_auth_resolver_defaults_to_external_agent() {
        let ctx = DevAuthResolver.resolve(None).await.unwrap();
        assert!(!ctx.is_internal);
        assert_eq!(ctx.principal.id, "dev-agent");
    }

    #[tokio::test]
    async fn dev_auth_resolver_recognizes_internal_prefixes() {
        let ctx = DevAuthResolver.resolve(Some("service:svc:asyncgate")).await.unwrap();
        assert!(ctx.is_internal);
    }

    #[tokio::test]
    async fn dev_tenant_resolver_falls_back_to_nil() {
        let tenant = DevTenantResolver.resolve(None).await.unwrap();
        assert!(tenant.is_nil());
    }
}
