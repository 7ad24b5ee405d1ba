//! Obligation termination type semantics (spec §4.2.2).
//!
//! This is a static type truth table: "what types are ALLOWED to terminate this
//! obligation type." Whether termination actually happened is a database fact
//! (parent linkage), never inferred here. Pinned from
//! `original_source/models/termination.py`.

use std::collections::HashSet;

use super::ReceiptType;

/// `task.assigned` is the only obligation type with emission paths today.
/// `lease.granted -> {lease.released, lease.expired}` and
/// `schedule.created -> {schedule.deleted, schedule.failed}` are commented out in
/// the upstream table and have no corresponding emission path here either — adding
/// them is a future extension, not a gap in this implementation.
fn termination_rules() -> Vec<(ReceiptType, &'static [ReceiptType])> {
    vec![(
        ReceiptType::TaskAssigned,
        &[
            ReceiptType::TaskCompleted,
            ReceiptType::TaskFailed,
            ReceiptType::TaskCanceled,
        ],
    )]
}

/// Receipt types that create obligations (the keys of the termination table).
pub fn obligation_types() -> Vec<ReceiptType> {
    termination_rules().into_iter().map(|(k, _)| k).collect()
}

/// Receipt types that can terminate *some* obligation (the union of all values).
pub fn terminal_types() -> HashSet<ReceiptType> {
    termination_rules()
        .into_iter()
        .flat_map(|(_, v)| v.iter().copied())
        .collect()
}

/// Types registered to terminate `obligation_type`, empty if unregistered.
pub fn terminal_types_for(obligation_type: ReceiptType) -> Vec<ReceiptType> {
    termination_rules()
        .into_iter()
        .find(|(k, _)| *k == obligation_type)
        .map(|(_, v)| v.to_vec())
        .unwrap_or_default()
}

/// Is `receipt_type` capable of terminating anything?
pub fn is_terminal_type(receipt_type: ReceiptType) -> bool {
    terminal_types().contains(&receipt_type)
}

/// Are `terminal_type` and `obligation_type` a registered terminator/obligation
/// pair? Type compatibility only — does not check parent linkage.
pub fn can_terminate(terminal_type: ReceiptType, obligation_type: ReceiptType) -> bool {
    terminal_types_for(obligation_type).contains(&terminal_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_assigned_is_the_only_obligation_type() {
        assert_eq!(obligation_types(), vec![ReceiptType::TaskAssigned]);
    }

    #[test]
    fn task_completed_failed_canceled_terminate_task_assigned() {
        assert!(can_terminate(ReceiptType::TaskCompleted, ReceiptType::TaskAssigned));
        assert!(can_terminate(ReceiptType::TaskFailed, ReceiptType::TaskAssigned));
        assert!(can_terminate(ReceiptType::TaskCanceled, ReceiptType::TaskAssigned));
    }

    #[test]
    fn unrelated_types_do_not_terminate() {
        assert!(!can_terminate(ReceiptType::TaskStarted, ReceiptType::TaskAssigned));
        assert!(!can_terminate(ReceiptType::TaskCompleted, ReceiptType::TaskStarted));
    }

    #[test]
    fn is_terminal_type_matches_union_of_rule_values() {
        assert!(is_terminal_type(ReceiptType::TaskCompleted));
        assert!(!is_terminal_type(ReceiptType::TaskAssigned));
        assert!(!is_terminal_type(ReceiptType::TaskProgress));
    }
}
