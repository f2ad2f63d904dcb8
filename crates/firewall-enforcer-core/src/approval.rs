//! Caller hooks: change approval and result observation.
//!
//! A [`ChangeApprover`] sees every computed diff, including empty ones, before
//! anything is applied and can veto it. A [`ResultObserver`] is handed each project result as the batch
//! collects it. Both are optional on a batch run; closures implement both
//! traits directly.

use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::diff::RuleDiff;
use crate::enforcer::ProjectResult;

/// Veto gate consulted before a diff is applied.
///
/// Called synchronously from enforcement workers, possibly from several at
/// once for different projects. Returning `false` leaves the project
/// untouched and reports it as unchanged.
pub trait ChangeApprover: Send + Sync {
    fn approve(&self, project_id: &str, diff: &RuleDiff) -> bool;
}

impl<F> ChangeApprover for F
where
    F: Fn(&str, &RuleDiff) -> bool + Send + Sync,
{
    fn approve(&self, project_id: &str, diff: &RuleDiff) -> bool {
        self(project_id, diff)
    }
}

/// Approves everything. Used when a batch runs without an approver.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysApprove;

impl ChangeApprover for AlwaysApprove {
    fn approve(&self, _project_id: &str, _diff: &RuleDiff) -> bool {
        true
    }
}

/// Vetoes diffs with more than `max_changes` mutations.
#[derive(Debug, Clone, Copy)]
pub struct MaxChangesApprover {
    max_changes: usize,
}

impl MaxChangesApprover {
    pub fn new(max_changes: usize) -> Self {
        Self { max_changes }
    }
}

impl ChangeApprover for MaxChangesApprover {
    fn approve(&self, project_id: &str, diff: &RuleDiff) -> bool {
        let ok = diff.len() <= self.max_changes;
        if !ok {
            tracing::warn!(
                project = %project_id,
                changes = diff.len(),
                max_changes = self.max_changes,
                "diff exceeds change limit"
            );
        }
        ok
    }
}

/// Vetoes diffs that delete or rewrite any of the protected rule names.
/// Inserting a protected name is allowed.
#[derive(Debug, Clone, Default)]
pub struct ProtectedRulesApprover {
    protected: BTreeSet<String>,
}

impl ProtectedRulesApprover {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protected: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl ChangeApprover for ProtectedRulesApprover {
    fn approve(&self, project_id: &str, diff: &RuleDiff) -> bool {
        let hit = diff
            .to_delete()
            .chain(diff.to_update())
            .find(|r| self.protected.contains(&r.name));
        if let Some(rule) = hit {
            tracing::warn!(project = %project_id, rule = %rule.name, "diff touches protected rule");
            return false;
        }
        true
    }
}

/// Receives each project result once, as the batch collects it.
///
/// Called from the batch coordinator with no engine lock held; calls for
/// different projects are never concurrent within one run.
pub trait ResultObserver: Send + Sync {
    fn on_result(&self, result: &ProjectResult);
}

impl<F> ResultObserver for F
where
    F: Fn(&ProjectResult) + Send + Sync,
{
    fn on_result(&self, result: &ProjectResult) {
        self(result)
    }
}

/// Ignores results. For callers that must hand over an observer but want none.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ResultObserver for NoopObserver {
    fn on_result(&self, _result: &ProjectResult) {}
}

/// Keeps a copy of every result it sees.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    results: Mutex<Vec<ProjectResult>>,
}

impl CollectingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<ProjectResult> {
        self.results
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.results.lock().map(|r| r.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultObserver for CollectingObserver {
    fn on_result(&self, result: &ProjectResult) {
        if let Ok(mut results) = self.results.lock() {
            results.push(result.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::diff_rules;
    use crate::rule::Rule;

    fn diff_of(current: &[Rule], desired: &[Rule]) -> RuleDiff {
        diff_rules(current, desired).unwrap()
    }

    #[test]
    fn closures_are_approvers() {
        let veto = |_: &str, _: &RuleDiff| false;
        assert!(!veto.approve("p", &RuleDiff::default()));
        assert!(AlwaysApprove.approve("p", &RuleDiff::default()));
    }

    #[test]
    fn max_changes_counts_all_mutations() {
        let diff = diff_of(
            &[Rule::new("a"), Rule::new("b").with_priority(1)],
            &[Rule::new("b"), Rule::new("c")],
        );
        assert_eq!(diff.len(), 3);
        assert!(MaxChangesApprover::new(3).approve("p", &diff));
        assert!(!MaxChangesApprover::new(2).approve("p", &diff));
    }

    #[test]
    fn protected_rules_block_delete_and_update_only() {
        let approver = ProtectedRulesApprover::new(["break-glass"]);

        let deleting = diff_of(&[Rule::new("break-glass")], &[]);
        assert!(!approver.approve("p", &deleting));

        let updating = diff_of(
            &[Rule::new("break-glass")],
            &[Rule::new("break-glass").with_priority(1)],
        );
        assert!(!approver.approve("p", &updating));

        let inserting = diff_of(&[], &[Rule::new("break-glass")]);
        assert!(approver.approve("p", &inserting));
    }

    #[test]
    fn collecting_observer_keeps_results() {
        let observer = CollectingObserver::new();
        assert!(observer.is_empty());
        let counter = std::sync::atomic::AtomicUsize::new(0);
        let closure = |_: &ProjectResult| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        };
        NoopObserver.on_result(&sample_result());
        observer.on_result(&sample_result());
        closure.on_result(&sample_result());
        assert_eq!(observer.len(), 1);
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    fn sample_result() -> ProjectResult {
        serde_json::from_value(serde_json::json!({
            "project_id": "p",
            "batch_id": 1,
            "timestamp_start_msec": 1,
            "timestamp_end_msec": 2,
            "status": "success",
            "changed": false,
            "dry_run": true,
            "policy_digest": "",
            "rules_to_delete": [],
            "rules_to_insert": [],
            "rules_to_update": [],
            "rules_before": [],
            "rules_after": [],
            "rules_modified_count": 0,
            "all_rules_changed": false
        }))
        .unwrap()
    }
}
