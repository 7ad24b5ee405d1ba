//! Instance Identity (spec §4.5): a stable id, unique per running process, stamped
//! onto every task and receipt this instance creates (`owning_instance`) and used
//! to partition the Lease Sweeper's work.
//!
//! Probe order and exact strings pinned from `instance.py`'s
//! `detect_instance_id`/`validate_instance_uniqueness`.

use std::env;

use tracing::{info, warn};

use crate::config::Environment;

/// The literal default instance id a fresh `Config` carries when nothing else is
/// configured; rejected outright in staging/production.
const DEFAULT_INSTANCE_ID: &str = "asyncgate-1";

const UNSAFE_PATTERNS: [&str; 3] = [DEFAULT_INSTANCE_ID, "localhost", "127.0.0.1"];

/// Auto-detect a unique instance identifier from the deployment environment
/// (spec §4.5 probe order), falling back to an explicit override, then to
/// hostname/random suffixes.
pub fn detect_instance_id(explicit_override: Option<&str>) -> String {
    if let Ok(fly_alloc_id) = env::var("FLY_ALLOC_ID") {
        if !fly_alloc_id.is_empty() {
            info!(instance_id = %fly_alloc_id, "detected Fly.io instance");
            return fly_alloc_id;
        }
    }

    if let Ok(hostname) = env::var("HOSTNAME") {
        if hostname.contains('-') {
            info!(instance_id = %hostname, "detected Kubernetes instance");
            return hostname;
        }
    }

    if let Ok(ecs_metadata_uri) = env::var("ECS_CONTAINER_METADATA_URI_V4") {
        if let Some(container_id) = ecs_metadata_uri.rsplit('/').next() {
            let truncated: String = container_id.chars().take(12).collect();
            let instance_id = format!("ecs-{truncated}");
            info!(instance_id = %instance_id, "detected AWS ECS instance");
            return instance_id;
        }
    }

    if let Ok(cloud_run_revision) = env::var("K_REVISION") {
        if !cloud_run_revision.is_empty() {
            let instance_id = format!("{cloud_run_revision}-{}", random_suffix());
            info!(instance_id = %instance_id, "detected Cloud Run instance");
            return instance_id;
        }
    }

    if let Some(explicit_id) = explicit_override {
        if explicit_id != DEFAULT_INSTANCE_ID {
            info!(instance_id = %explicit_id, "using explicit instance ID");
            return explicit_id.to_string();
        }
    }

    match hostname_fallback() {
        Some(hostname) => {
            let instance_id = format!("{hostname}-{}", random_suffix());
            warn!(instance_id = %instance_id, "no deployment environment detected, using fallback");
            instance_id
        }
        None => {
            let instance_id = format!("asyncgate-{}", uuid::Uuid::new_v4());
            warn!(instance_id = %instance_id, "failed to detect hostname, using random ID");
            instance_id
        }
    }
}

/// Validate an instance id for the current environment (spec §4.5). Hard-fails in
/// staging/production for ids that could plausibly collide across replicas; warns
/// (but does not fail) for merely-short ids.
pub fn validate_instance_uniqueness(instance_id: &str, env: Environment) -> anyhow::Result<()> {
    if matches!(env, Environment::Staging | Environment::Production) {
        for pattern in UNSAFE_PATTERNS {
            if instance_id == pattern || instance_id.starts_with(pattern) {
                anyhow::bail!(
                    "INSTANCE ID CONFLICT RISK: instance_id='{instance_id}' is not safe for \
                     this environment. Multiple instances could share the same ID, causing \
                     lease conflicts and data corruption.\n\n\
                     Solutions:\n\
                     \x20 1. Deploy to a platform with auto-detection (Fly.io, K8s, ECS, Cloud Run)\n\
                     \x20 2. Set ASYNCGATE_INSTANCE_ID to a unique value per instance\n\
                     \x20    Example: ASYNCGATE_INSTANCE_ID=$(hostname)-$(uuidgen | cut -d'-' -f1)\n\
                     \x20 3. Use deployment platform identifiers:\n\
                     \x20    - Fly.io: FLY_ALLOC_ID is automatically detected\n\
                     \x20    - Kubernetes: HOSTNAME (pod name) is automatically detected\n\
                     \x20    - AWS ECS: ECS_CONTAINER_METADATA_URI_V4 is automatically parsed\n\
                     \x20    - Cloud Run: K_REVISION is automatically detected\n\n\
                     Current instance_id: {instance_id}"
                );
            }
        }

        if instance_id.len() < 8 {
            warn!(instance_id = %instance_id, "instance id is very short; consider a more unique identifier");
        }
    }

    info!(instance_id = %instance_id, environment = ?env, "instance ID validated");
    Ok(())
}

fn random_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// `socket.gethostname()`'s nearest portable stdlib equivalent: the `HOSTNAME`
/// env var, which is set in every container runtime this probe order targets.
fn hostname_fallback() -> Option<String> {
    env::var("HOSTNAME").ok().filter(|h| !h.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_instance_uniqueness_allows_anything_in_development() {
        assert!(validate_instance_uniqueness(DEFAULT_INSTANCE_ID, Environment::Development).is_ok());
    }

    #[test]
    fn validate_instance_uniqueness_rejects_default_in_production() {
        assert!(validate_instance_uniqueness(DEFAULT_INSTANCE_ID, Environment::Production).is_err());
    }

    #[test]
    fn validate_instance_uniqueness_rejects_localhost_prefix_in_staging() {
        assert!(validate_instance_uniqueness("localhost-1", Environment::Staging).is_err());
    }

    #[test]
    fn validate_instance_uniqueness_accepts_unique_id_in_production() {
        assert!(validate_instance_uniqueness("fly-01j9k2m3n4p5q6r7", Environment::Production).is_ok());
    }
}
