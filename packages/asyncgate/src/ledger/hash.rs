//! Canonical serialization and content hashing for receipts (spec §4.2.1, §9).
//!
//! Hashing is the sole equivalence relation for receipts: two emission calls that
//! produce the same hash are the same receipt, full stop. The algorithm here is
//! pinned to `original_source/models/receipt.py::compute_receipt_hash` rather than
//! invented, since spec.md leaves the exact field set implicit.

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::common::principal::Principal;

/// Serialize a value to its canonical form: sorted object keys, no whitespace.
///
/// `serde_json::Value`'s object representation is a `BTreeMap` (this crate does not
/// enable serde_json's `preserve_order` feature), so round-tripping any serializable
/// value through `Value` before re-serializing yields deterministic, sorted-key
/// output regardless of the original struct's field declaration order.
fn canonical_json_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    let as_value = serde_json::to_value(value).expect("value must be JSON-serializable");
    serde_json::to_vec(&as_value).expect("canonicalized value must serialize")
}

/// SHA-256 of the canonical body serialization, or `None` if the body is empty.
///
/// An empty body is the JSON object `{}` or a body that was never supplied; both are
/// treated as "no body" for hashing purposes, matching the original's
/// `if body else None` check.
pub fn body_hash(body: &Value) -> Option<String> {
    let is_empty = match body {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if is_empty {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(canonical_json_bytes(body));
    Some(hex::encode(hasher.finalize()))
}

/// Inputs that participate in a receipt's content hash. `schedule_id` is
/// deliberately excluded — schedule linkage does not participate in deduplication.
pub struct ReceiptHashInput<'a> {
    pub receipt_type: &'a str,
    pub task_id: Option<uuid::Uuid>,
    pub from: &'a Principal,
    pub to: &'a Principal,
    pub lease_id: Option<uuid::Uuid>,
    pub parents: &'a [uuid::Uuid],
    pub body: &'a Value,
}

/// Compute the receipt's content hash per spec §4.2.1 step 2 / §9.
///
/// Two emission calls identical except for `parents` must hash differently
/// (spec §8 invariant 5); two calls whose `parents` are permutations of each other
/// must hash identically (invariant 6) — both follow from sorting the parent id
/// strings before hashing.
pub fn receipt_hash(input: &ReceiptHashInput<'_>) -> String {
    let mut parents: Vec<String> = input.parents.iter().map(|p| p.to_string()).collect();
    parents.sort();

    let data = json!({
        "receipt_type": input.receipt_type,
        "task_id": input.task_id.map(|id| id.to_string()),
        "from_kind": input.from.kind,
        "from_id": input.from.id,
        "to_kind": input.to.kind,
        "to_id": input.to.id,
        "lease_id": input.lease_id.map(|id| id.to_string()),
        "parents": parents,
        "body_hash": body_hash(input.body),
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical_json_bytes(&data));
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::principal::PrincipalKind;
    use uuid::Uuid;

    fn worker() -> Principal {
        Principal::new(PrincipalKind::Worker, "w1")
    }

    fn agent() -> Principal {
        Principal::new(PrincipalKind::Agent, "a1")
    }

    #[test]
    fn body_hash_is_none_for_empty_body() {
        assert_eq!(body_hash(&json!({})), None);
        assert_eq!(body_hash(&Value::Null), None);
    }

    #[test]
    fn body_hash_is_stable_regardless_of_key_order() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(body_hash(&a), body_hash(&b));
    }

    #[test]
    fn hash_differs_with_different_parents() {
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let body = json!({"result_summary": "ok"});

        let h1 = receipt_hash(&ReceiptHashInput {
            receipt_type: "task.completed",
            task_id: None,
            from: &worker(),
            to: &agent(),
            lease_id: None,
            parents: &[p1],
            body: &body,
        });
        let h2 = receipt_hash(&ReceiptHashInput {
            receipt_type: "task.completed",
            task_id: None,
            from: &worker(),
            to: &agent(),
            lease_id: None,
            parents: &[p2],
            body: &body,
        });
        assert_ne!(h1, h2);
    }

    #[test]
    fn hash_is_identical_for_identical_calls() {
        let p1 = Uuid::new_v4();
        let body = json!({"k": 1});
        let make = || {
            receipt_hash(&ReceiptHashInput {
                receipt_type: "task.started",
                task_id: None,
                from: &worker(),
                to: &agent(),
                lease_id: None,
                parents: &[p1],
                body: &body,
            })
        };
        assert_eq!(make(), make());
    }

    #[test]
    fn hash_is_invariant_to_parent_order() {
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let body = json!({});

        let h1 = receipt_hash(&ReceiptHashInput {
            receipt_type: "task.completed",
            task_id: None,
            from: &worker(),
            to: &agent(),
            lease_id: None,
            parents: &[p1, p2],
            body: &body,
        });
        let h2 = receipt_hash(&ReceiptHashInput {
            receipt_type: "task.completed",
            task_id: None,
            from: &worker(),
            to: &agent(),
            lease_id: None,
            parents: &[p2, p1],
            body: &body,
        });
        assert_eq!(h1, h2);
    }
}
