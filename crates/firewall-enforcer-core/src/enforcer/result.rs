//! Per-project results, batch summaries and the enforcer log.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::rule::Rule;

/// Terminal status of one project run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementStatus {
    Success,
    Failure,
}

/// Why a project run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Current rules or networks could not be retrieved.
    Fetch,
    /// A mutation call failed part way through applying the diff.
    Apply,
    /// The policy (or the remote rule set) is malformed.
    Validation,
    /// Rules read back after applying do not match the policy.
    Verification,
    /// The batch was cancelled before the project started.
    Cancelled,
    /// The enforcement task ended without producing a result.
    Internal,
}

/// Mutations applied before a run stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyProgress {
    pub deleted: usize,
    pub inserted: usize,
    pub updated: usize,
}

impl ApplyProgress {
    pub fn total(&self) -> usize {
        self.deleted + self.inserted + self.updated
    }
}

impl fmt::Display for ApplyProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} deleted, {} inserted, {} updated",
            self.deleted, self.inserted, self.updated
        )
    }
}

/// Error attached to a failed [`ProjectResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: FailureKind,
    pub message: String,
    /// Set for apply failures: how far application got before the failing call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ApplyProgress>,
}

/// Outcome of enforcing a policy on one project.
///
/// The three diff fields hold what was computed, whether or not it was
/// applied. `changed` is what happened on a live run and what would have
/// happened on a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectResult {
    pub project_id: String,
    /// Id of the enclosing batch; zero until the batch stamps it.
    pub batch_id: u64,
    pub timestamp_start_msec: u64,
    pub timestamp_end_msec: u64,
    pub status: EnforcementStatus,
    pub changed: bool,
    pub dry_run: bool,
    pub policy_digest: String,
    pub rules_to_delete: Vec<Rule>,
    pub rules_to_insert: Vec<Rule>,
    pub rules_to_update: Vec<Rule>,
    /// Remote rules as fetched before enforcement, sorted by name.
    pub rules_before: Vec<Rule>,
    /// Remote rules read back after applying; empty unless verified.
    pub rules_after: Vec<Rule>,
    pub rules_modified_count: usize,
    /// The project had rules and none of them survived unchanged.
    pub all_rules_changed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl ProjectResult {
    pub fn is_success(&self) -> bool {
        self.status == EnforcementStatus::Success
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// `true` if the run computed a non-empty diff.
    pub fn has_diff(&self) -> bool {
        !(self.rules_to_delete.is_empty()
            && self.rules_to_insert.is_empty()
            && self.rules_to_update.is_empty())
    }
}

/// Aggregate counters for one batch run.
///
/// `projects_total == projects_success + projects_failure` and
/// `projects_success == projects_changed + projects_unchanged` hold after
/// every [`BatchResult::record`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: u64,
    pub timestamp_start_msec: u64,
    pub timestamp_end_msec: u64,
    pub projects_total: u64,
    pub projects_success: u64,
    pub projects_failure: u64,
    pub projects_changed: u64,
    pub projects_unchanged: u64,
}

impl BatchResult {
    pub fn new(batch_id: u64, timestamp_start_msec: u64) -> Self {
        Self {
            batch_id,
            timestamp_start_msec,
            ..Self::default()
        }
    }

    /// Count one project result.
    pub fn record(&mut self, result: &ProjectResult) {
        self.projects_total += 1;
        match result.status {
            EnforcementStatus::Failure => self.projects_failure += 1,
            EnforcementStatus::Success => {
                self.projects_success += 1;
                if result.changed {
                    self.projects_changed += 1;
                } else {
                    self.projects_unchanged += 1;
                }
            }
        }
    }
}

/// Everything a batch run produces: the summary plus one result per input
/// project, in input order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcerLog {
    pub summary: BatchResult,
    pub results: Vec<ProjectResult>,
}

impl EnforcerLog {
    /// Ids of the projects that failed, in input order. Feed these back into
    /// a new run to retry.
    pub fn failed_projects(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| r.project_id.as_str())
            .collect()
    }

    pub fn result_for(&self, project_id: &str) -> Option<&ProjectResult> {
        self.results.iter().find(|r| r.project_id == project_id)
    }
}
