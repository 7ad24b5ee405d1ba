//! Principals: the actors that create, own, and act on tasks.
//!
//! Grounded on `original_source/principals.py`: internal principals (system,
//! service) are addressed by a reserved, well-known id; external principals
//! (agent, worker, human) carry a normalized id with an `ext:` marker stripped on
//! input.

use serde::{Deserialize, Serialize};

/// Closed set of principal kinds (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "principal_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    Agent,
    Worker,
    Service,
    System,
    Human,
}

/// The canonical system principal id, reserved and unforgeable by external callers.
pub const SYSTEM_PRINCIPAL_ID: &str = "sys:legivellum";

/// The canonical service principal id AsyncGate itself acts as (e.g. when emitting
/// `task.assigned` or `task.result_ready`).
pub const SERVICE_PRINCIPAL_ID: &str = "svc:asyncgate";

/// Reserved prefixes: external callers may not mint ids starting with these.
pub const INTERNAL_PRINCIPAL_PREFIXES: [&str; 2] = ["sys:", "svc:"];

/// An actor pair `(kind, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub kind: PrincipalKind,
    pub id: String,
}

impl Principal {
    pub fn new(kind: PrincipalKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }

    pub fn system() -> Self {
        Self::new(PrincipalKind::System, SYSTEM_PRINCIPAL_ID)
    }

    pub fn service() -> Self {
        Self::new(PrincipalKind::Service, SERVICE_PRINCIPAL_ID)
    }

    pub fn is_system(&self) -> bool {
        self.kind == PrincipalKind::System && self.id == SYSTEM_PRINCIPAL_ID
    }
}

/// Whether an id string carries one of the reserved internal prefixes.
pub fn is_internal_principal_id(id: &str) -> bool {
    INTERNAL_PRINCIPAL_PREFIXES
        .iter()
        .any(|prefix| id.starts_with(prefix))
}

/// Strip a leading `ext:` marker from an externally supplied id, if present.
pub fn normalize_external(id: &str) -> &str {
    id.strip_prefix("ext:").unwrap_or(id)
}

/// Normalize a principal id for storage: internal ids pass through unchanged,
/// external ids have their `ext:` marker stripped.
pub fn normalize_principal_id(id: &str) -> String {
    if is_internal_principal_id(id) {
        id.to_string()
    } else {
        normalize_external(id).to_string()
    }
}

/// The set of id strings that should be treated as equivalent to `id` when
/// searching historical receipts: the normalized form, and — for external
/// principals only — the legacy `ext:`-prefixed form.
pub fn principal_id_variants(id: &str) -> Vec<String> {
    let normalized = normalize_principal_id(id);
    if is_internal_principal_id(&normalized) {
        vec![normalized]
    } else {
        vec![normalized.clone(), format!("ext:{normalized}")]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_external_strips_prefix() {
        assert_eq!(normalize_external("ext:abc123"), "abc123");
        assert_eq!(normalize_external("abc123"), "abc123");
    }

    #[test]
    fn is_internal_principal_id_recognizes_reserved_prefixes() {
        assert!(is_internal_principal_id(SYSTEM_PRINCIPAL_ID));
        assert!(is_internal_principal_id(SERVICE_PRINCIPAL_ID));
        assert!(!is_internal_principal_id("agent-42"));
    }

    #[test]
    fn principal_id_variants_includes_legacy_ext_form_for_external_ids() {
        let variants = principal_id_variants("agent-42");
        assert_eq!(variants, vec!["agent-42".to_string(), "ext:agent-42".to_string()]);
    }

    #[test]
    fn principal_id_variants_is_single_form_for_internal_ids() {
        let variants = principal_id_variants(SYSTEM_PRINCIPAL_ID);
        assert_eq!(variants, vec![SYSTEM_PRINCIPAL_ID.to_string()]);
    }

    #[test]
    fn system_principal_is_recognized() {
        assert!(Principal::system().is_system());
        assert!(!Principal::new(PrincipalKind::Agent, "a1").is_system());
    }
}
