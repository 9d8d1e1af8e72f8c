//! Condition set operations
//!
//! Conditions are kept sorted with `Ready` first and the rest alphabetically,
//! so repeated passes produce identical status documents.

use super::types::{Condition, ConditionSeverity, ConditionStatus};

/// Summary condition computed from the others
pub const READY_CONDITION: &str = "Ready";
/// Helm release was installed or upgraded for the current generation
pub const HELM_CHART_DEPLOYED_CONDITION: &str = "HelmChartDeployed";
/// Kubeconfig secret was written and the control plane was reachable
pub const KUBECONFIG_READY_CONDITION: &str = "KubeconfigReady";
/// Control plane answered its first API request
pub const CONTROL_PLANE_INITIALIZED_CONDITION: &str = "ControlPlaneInitialized";
/// Infrastructure cluster of the orchestration layer points at this cluster
pub const INFRASTRUCTURE_CLUSTER_SYNCED_CONDITION: &str = "InfrastructureClusterSynced";

/// Condition types written by this controller
pub const OWNED_CONDITIONS: &[&str] = &[
    READY_CONDITION,
    HELM_CHART_DEPLOYED_CONDITION,
    KUBECONFIG_READY_CONDITION,
    CONTROL_PLANE_INITIALIZED_CONDITION,
    INFRASTRUCTURE_CLUSTER_SYNCED_CONDITION,
];

/// Inputs of the `Ready` summary
pub const READY_SUMMARY_INPUTS: &[&str] =
    &[KUBECONFIG_READY_CONDITION, CONTROL_PLANE_INITIALIZED_CONDITION];

/// Longest condition message stored before truncation
pub const MAX_MESSAGE_LEN: usize = 512;

/// Look up a condition by type
pub fn get<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether a condition exists and is True
pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    get(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Insert or replace a condition
///
/// The transition time is kept when the status did not change.
pub fn set(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time;
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }
    sort(conditions);
}

/// Mark a condition True
pub fn mark_true(conditions: &mut Vec<Condition>, type_: &str) {
    set(
        conditions,
        Condition::new(type_, ConditionStatus::True, "", ""),
    );
}

/// Mark a condition False; the message is truncated to [`MAX_MESSAGE_LEN`]
pub fn mark_false(
    conditions: &mut Vec<Condition>,
    type_: &str,
    reason: &str,
    severity: ConditionSeverity,
    message: &str,
) {
    set(
        conditions,
        Condition::new(
            type_,
            ConditionStatus::False,
            reason,
            truncate_message(message, MAX_MESSAGE_LEN),
        )
        .with_severity(severity),
    );
}

/// Remove a condition
pub fn delete(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

/// Truncate a message to `max` characters, appending ` ... ` when cut
pub fn truncate_message(message: &str, max: usize) -> String {
    match message.char_indices().nth(max) {
        Some((idx, _)) => format!("{} ... ", &message[..idx]),
        None => message.to_string(),
    }
}

/// Recompute the summary condition `target` from `inputs`
///
/// All present inputs True gives True. Otherwise the summary is False with the
/// worst severity among the False inputs, taking reason and message from the
/// first input carrying that severity; Unknown when nothing is False but
/// something is Unknown. Nothing is written when no input is present.
pub fn set_summary(conditions: &mut Vec<Condition>, target: &str, inputs: &[&str]) {
    let present: Vec<Condition> = inputs
        .iter()
        .filter_map(|t| get(conditions, t).cloned())
        .collect();
    if present.is_empty() {
        return;
    }

    let worst_false = present
        .iter()
        .filter(|c| c.status == ConditionStatus::False)
        .fold(None::<&Condition>, |worst, c| match worst {
            Some(w) if w.severity.rank() >= c.severity.rank() => Some(w),
            _ => Some(c),
        });

    let summary = if let Some(cause) = worst_false {
        Condition::new(
            target,
            ConditionStatus::False,
            cause.reason.clone(),
            cause.message.clone(),
        )
        .with_severity(cause.severity)
    } else if let Some(unknown) = present
        .iter()
        .find(|c| c.status == ConditionStatus::Unknown)
    {
        Condition::new(
            target,
            ConditionStatus::Unknown,
            unknown.reason.clone(),
            unknown.message.clone(),
        )
    } else {
        Condition::new(target, ConditionStatus::True, "", "")
    };

    set(conditions, summary);
}

/// Merge locally computed conditions onto the latest stored ones
///
/// For each owned type that changed between `before` and `after`, the local
/// value wins (or is removed if the pass removed it). Everything else,
/// including conditions written by other controllers, comes from `latest`.
pub fn merge_owned(
    before: &[Condition],
    after: &[Condition],
    latest: &[Condition],
    owned: &[&str],
) -> Vec<Condition> {
    let mut merged = latest.to_vec();
    for type_ in owned {
        let old = get(before, type_);
        let new = get(after, type_);
        let changed = match (old, new) {
            (Some(o), Some(n)) => !o.same_state(n),
            (None, None) => false,
            _ => true,
        };
        if !changed {
            continue;
        }
        match new {
            Some(c) => {
                merged.retain(|m| m.type_ != c.type_);
                merged.push(c.clone());
            }
            None => delete(&mut merged, type_),
        }
    }
    sort(&mut merged);
    merged
}

fn sort(conditions: &mut [Condition]) {
    conditions.sort_by(|a, b| {
        let a_ready = a.type_ == READY_CONDITION;
        let b_ready = b.type_ == READY_CONDITION;
        b_ready.cmp(&a_ready).then_with(|| a.type_.cmp(&b.type_))
    });
}

/// First False condition with Error severity, in stored order
pub fn first_error(conditions: &[Condition]) -> Option<&Condition> {
    conditions
        .iter()
        .find(|c| c.status == ConditionStatus::False && c.severity == ConditionSeverity::Error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(type_: &str, status: ConditionStatus, severity: ConditionSeverity) -> Condition {
        Condition::new(type_, status, format!("{type_}Reason"), format!("{type_} message"))
            .with_severity(severity)
    }

    #[test]
    fn test_mark_true_then_false_replaces_in_place() {
        let mut conds = Vec::new();
        mark_true(&mut conds, HELM_CHART_DEPLOYED_CONDITION);
        mark_false(
            &mut conds,
            HELM_CHART_DEPLOYED_CONDITION,
            "HelmDeployFailed",
            ConditionSeverity::Error,
            "boom",
        );
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].status, ConditionStatus::False);
        assert_eq!(conds[0].severity, ConditionSeverity::Error);
        assert!(!is_true(&conds, HELM_CHART_DEPLOYED_CONDITION));
    }

    #[test]
    fn test_set_keeps_transition_time_when_status_unchanged() {
        let mut conds = Vec::new();
        mark_true(&mut conds, KUBECONFIG_READY_CONDITION);
        let first = conds[0].last_transition_time - chrono::Duration::minutes(5);
        conds[0].last_transition_time = first;
        mark_true(&mut conds, KUBECONFIG_READY_CONDITION);
        assert_eq!(conds[0].last_transition_time, first);
    }

    #[test]
    fn test_delete_removes_only_that_type() {
        let mut conds = Vec::new();
        mark_true(&mut conds, KUBECONFIG_READY_CONDITION);
        mark_true(&mut conds, HELM_CHART_DEPLOYED_CONDITION);
        delete(&mut conds, KUBECONFIG_READY_CONDITION);
        assert!(get(&conds, KUBECONFIG_READY_CONDITION).is_none());
        assert!(is_true(&conds, HELM_CHART_DEPLOYED_CONDITION));
    }

    #[test]
    fn test_ready_sorts_first() {
        let mut conds = Vec::new();
        mark_true(&mut conds, KUBECONFIG_READY_CONDITION);
        mark_true(&mut conds, READY_CONDITION);
        mark_true(&mut conds, CONTROL_PLANE_INITIALIZED_CONDITION);
        let types: Vec<&str> = conds.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(
            types,
            vec![READY_CONDITION, CONTROL_PLANE_INITIALIZED_CONDITION, KUBECONFIG_READY_CONDITION]
        );
    }

    /// Story: a helm failure produces a very long error (rendered templates,
    /// stack traces). The stored message stays bounded.
    #[test]
    fn story_long_error_is_truncated_before_storage() {
        let long = "x".repeat(1000);
        let mut conds = Vec::new();
        mark_false(
            &mut conds,
            HELM_CHART_DEPLOYED_CONDITION,
            "HelmDeployFailed",
            ConditionSeverity::Error,
            &long,
        );
        let msg = &conds[0].message;
        assert!(msg.len() <= MAX_MESSAGE_LEN + " ... ".len());
        assert!(msg.ends_with(" ... "));
        assert!(msg.starts_with(&"x".repeat(MAX_MESSAGE_LEN)));
    }

    #[test]
    fn test_short_message_is_not_truncated() {
        assert_eq!(truncate_message("fine", MAX_MESSAGE_LEN), "fine");
        let exact = "y".repeat(MAX_MESSAGE_LEN);
        assert_eq!(truncate_message(&exact, MAX_MESSAGE_LEN), exact);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "é".repeat(600);
        let cut = truncate_message(&text, MAX_MESSAGE_LEN);
        assert_eq!(cut.chars().filter(|c| *c == 'é').count(), MAX_MESSAGE_LEN);
    }

    mod summary {
        use super::*;

        #[test]
        fn test_all_true_gives_true() {
            let mut conds = vec![
                cond(KUBECONFIG_READY_CONDITION, ConditionStatus::True, ConditionSeverity::None),
                cond(CONTROL_PLANE_INITIALIZED_CONDITION, ConditionStatus::True, ConditionSeverity::None),
            ];
            set_summary(&mut conds, READY_CONDITION, READY_SUMMARY_INPUTS);
            assert!(is_true(&conds, READY_CONDITION));
        }

        #[test]
        fn test_worst_severity_wins() {
            let mut conds = vec![
                cond(KUBECONFIG_READY_CONDITION, ConditionStatus::False, ConditionSeverity::Warning),
                cond(CONTROL_PLANE_INITIALIZED_CONDITION, ConditionStatus::False, ConditionSeverity::Error),
            ];
            set_summary(&mut conds, READY_CONDITION, READY_SUMMARY_INPUTS);
            let ready = get(&conds, READY_CONDITION).unwrap();
            assert_eq!(ready.status, ConditionStatus::False);
            assert_eq!(ready.severity, ConditionSeverity::Error);
            assert_eq!(ready.reason, "ControlPlaneInitializedReason");
        }

        #[test]
        fn test_equal_severity_takes_first_input() {
            let mut conds = vec![
                cond(KUBECONFIG_READY_CONDITION, ConditionStatus::False, ConditionSeverity::Warning),
                cond(CONTROL_PLANE_INITIALIZED_CONDITION, ConditionStatus::False, ConditionSeverity::Warning),
            ];
            set_summary(&mut conds, READY_CONDITION, READY_SUMMARY_INPUTS);
            assert_eq!(get(&conds, READY_CONDITION).unwrap().reason, "KubeconfigReadyReason");
        }

        #[test]
        fn test_missing_input_is_ignored() {
            let mut conds = vec![cond(
                CONTROL_PLANE_INITIALIZED_CONDITION,
                ConditionStatus::True,
                ConditionSeverity::None,
            )];
            set_summary(&mut conds, READY_CONDITION, READY_SUMMARY_INPUTS);
            assert!(is_true(&conds, READY_CONDITION));
        }

        #[test]
        fn test_unknown_without_false_gives_unknown() {
            let mut conds = vec![
                cond(KUBECONFIG_READY_CONDITION, ConditionStatus::Unknown, ConditionSeverity::None),
                cond(CONTROL_PLANE_INITIALIZED_CONDITION, ConditionStatus::True, ConditionSeverity::None),
            ];
            set_summary(&mut conds, READY_CONDITION, READY_SUMMARY_INPUTS);
            assert_eq!(get(&conds, READY_CONDITION).unwrap().status, ConditionStatus::Unknown);
        }

        #[test]
        fn test_no_inputs_leaves_summary_alone() {
            let mut conds = Vec::new();
            set_summary(&mut conds, READY_CONDITION, READY_SUMMARY_INPUTS);
            assert!(conds.is_empty());
        }
    }

    mod ownership {
        use super::*;

        /// Story: while this controller reconciles, another controller adds its
        /// own condition to the stored object. Our patch must keep it.
        #[test]
        fn story_foreign_condition_survives_merge() {
            let before = vec![];
            let mut after = vec![];
            mark_true(&mut after, HELM_CHART_DEPLOYED_CONDITION);
            let latest = vec![cond("BackupReady", ConditionStatus::False, ConditionSeverity::Info)];

            let merged = merge_owned(&before, &after, &latest, OWNED_CONDITIONS);

            assert!(is_true(&merged, HELM_CHART_DEPLOYED_CONDITION));
            let foreign = get(&merged, "BackupReady").unwrap();
            assert_eq!(foreign.status, ConditionStatus::False);
            assert_eq!(foreign.reason, "BackupReadyReason");
        }

        #[test]
        fn test_local_deletion_of_owned_condition_is_applied() {
            let mut before = vec![];
            mark_true(&mut before, KUBECONFIG_READY_CONDITION);
            let after = vec![];
            let latest = before.clone();

            let merged = merge_owned(&before, &after, &latest, OWNED_CONDITIONS);
            assert!(get(&merged, KUBECONFIG_READY_CONDITION).is_none());
        }

        #[test]
        fn test_unchanged_owned_condition_keeps_latest() {
            let mut before = vec![];
            mark_true(&mut before, HELM_CHART_DEPLOYED_CONDITION);
            let after = before.clone();
            let latest = vec![cond(
                HELM_CHART_DEPLOYED_CONDITION,
                ConditionStatus::False,
                ConditionSeverity::Warning,
            )];

            let merged = merge_owned(&before, &after, &latest, OWNED_CONDITIONS);
            assert_eq!(
                get(&merged, HELM_CHART_DEPLOYED_CONDITION).unwrap().status,
                ConditionStatus::False
            );
        }

        #[test]
        fn test_foreign_condition_in_local_copy_is_not_written() {
            let before = vec![cond("BackupReady", ConditionStatus::True, ConditionSeverity::None)];
            let after = vec![cond("BackupReady", ConditionStatus::False, ConditionSeverity::Error)];
            let latest = before.clone();

            let merged = merge_owned(&before, &after, &latest, OWNED_CONDITIONS);
            assert!(is_true(&merged, "BackupReady"));
        }
    }

    #[test]
    fn test_first_error_returns_first_match() {
        let conds = vec![
            cond("A", ConditionStatus::False, ConditionSeverity::Warning),
            cond("B", ConditionStatus::False, ConditionSeverity::Error),
            cond("C", ConditionStatus::False, ConditionSeverity::Error),
        ];
        assert_eq!(first_error(&conds).unwrap().type_, "B");
    }
}
