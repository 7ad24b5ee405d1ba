//! Distinguished failure kinds surfaced from the core (spec §7).

use thiserror::Error;

/// Errors surfaced by the Task Engine, Receipt Ledger, and Lease Sweeper.
///
/// Transient kinds (`LeaseInvalidOrExpired`, `RateLimitExceeded`) invite retry;
/// terminal kinds (`InvalidStateTransition`, `Unauthorized`, `TaskNotFound`) do not.
#[derive(Error, Debug)]
pub enum AsyncGateError {
    #[error("task not found")]
    TaskNotFound,

    #[error("invalid state transition: {current} -> {requested}")]
    InvalidStateTransition { current: String, requested: String },

    #[error("lease missing, expired, or not owned by the calling worker")]
    LeaseInvalidOrExpired,

    #[error("lease renewal limit exceeded: {renewal_count}/{max}")]
    LeaseRenewalLimitExceeded { renewal_count: i32, max: i32 },

    #[error("lease lifetime exceeded: {lifetime_seconds}s/{max}s")]
    LeaseLifetimeExceeded { lifetime_seconds: i64, max: i64 },

    #[error("principal not permitted for this operation")]
    Unauthorized,

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("body/parents/artifacts exceeded hard caps or a non-dedup unique constraint was violated")]
    IntegrityViolation,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// A lenient, non-error outcome: a `task.completed` receipt was accepted without
/// locatable evidence (no `artifacts` or `delivery_proof`). The row is stored with
/// `parents = []`, leaving the obligation open, and a `system.anomaly` receipt is
/// emitted alongside. Callers should log a warning, not surface a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnomalyAccepted;

pub type Result<T> = std::result::Result<T, AsyncGateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_transition_carries_current_and_requested() {
        let err = AsyncGateError::InvalidStateTransition {
            current: "succeeded".to_string(),
            requested: "running".to_string(),
        };
        assert_eq!(err.to_string(), "invalid state transition: succeeded -> running");
    }

    #[test]
    fn lease_renewal_limit_exceeded_carries_counts() {
        let err = AsyncGateError::LeaseRenewalLimitExceeded {
            renewal_count: 10,
            max: 10,
        };
        assert_eq!(err.to_string(), "lease renewal limit exceeded: 10/10");
    }
}
