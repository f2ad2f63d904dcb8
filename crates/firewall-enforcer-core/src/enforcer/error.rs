//! Error types for project enforcement.

use crate::compute::{ComputeError, MutationKind};
use crate::enforcer::result::{ApplyProgress, ErrorDetail, FailureKind};
use crate::policy::PolicyError;

/// Reasons a single project run ends in failure.
///
/// These never escape a batch: they are folded into the project's
/// [`ErrorDetail`].
#[derive(Debug, thiserror::Error)]
pub enum EnforcementError {
    #[error("failed to fetch firewall rules for project {project}: {source}")]
    FetchRules {
        project: String,
        #[source]
        source: ComputeError,
    },

    #[error("failed to list networks for project {project}: {source}")]
    FetchNetworks {
        project: String,
        #[source]
        source: ComputeError,
    },

    #[error("invalid rules for project {project}: {source}")]
    InvalidPolicy {
        project: String,
        #[source]
        source: PolicyError,
    },

    #[error("{operation} of rule '{rule}' failed in project {project} after {progress}: {source}")]
    Apply {
        project: String,
        operation: MutationKind,
        rule: String,
        progress: ApplyProgress,
        #[source]
        source: ComputeError,
    },

    #[error("rules in project {project} do not match the policy after enforcement: {detail}")]
    Verification { project: String, detail: String },

    #[error("batch cancelled before project {project} was enforced")]
    Cancelled { project: String },

    #[error("enforcement task for project {project} ended without a result: {detail}")]
    Internal { project: String, detail: String },
}

impl EnforcementError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EnforcementError::FetchRules { .. } | EnforcementError::FetchNetworks { .. } => {
                FailureKind::Fetch
            }
            EnforcementError::InvalidPolicy { .. } => FailureKind::Validation,
            EnforcementError::Apply { .. } => FailureKind::Apply,
            EnforcementError::Verification { .. } => FailureKind::Verification,
            EnforcementError::Cancelled { .. } => FailureKind::Cancelled,
            EnforcementError::Internal { .. } => FailureKind::Internal,
        }
    }

    /// Mutations already applied when the run stopped, for apply failures.
    pub fn progress(&self) -> Option<ApplyProgress> {
        match self {
            EnforcementError::Apply { progress, .. } => Some(*progress),
            _ => None,
        }
    }

    pub fn to_detail(&self) -> ErrorDetail {
        ErrorDetail {
            kind: self.kind(),
            message: self.to_string(),
            progress: self.progress(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_error_reports_progress_and_operation() {
        let err = EnforcementError::Apply {
            project: "proj-1".to_string(),
            operation: MutationKind::Insert,
            rule: "allow-web".to_string(),
            progress: ApplyProgress {
                deleted: 3,
                inserted: 1,
                updated: 0,
            },
            source: ComputeError::Api {
                status: 403,
                message: "quota exceeded".to_string(),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("insert of rule 'allow-web'"));
        assert!(msg.contains("3 deleted, 1 inserted, 0 updated"));
        assert!(msg.contains("quota exceeded"));

        let detail = err.to_detail();
        assert_eq!(detail.kind, FailureKind::Apply);
        assert_eq!(detail.progress.map(|p| p.total()), Some(4));
    }

    #[test]
    fn fetch_errors_share_a_kind() {
        let source = ComputeError::Transport("connection reset".to_string());
        let rules = EnforcementError::FetchRules {
            project: "p".to_string(),
            source: source.clone(),
        };
        let networks = EnforcementError::FetchNetworks {
            project: "p".to_string(),
            source,
        };
        assert_eq!(rules.kind(), FailureKind::Fetch);
        assert_eq!(networks.kind(), FailureKind::Fetch);
        assert!(rules.progress().is_none());
    }

    #[test]
    fn validation_error_wraps_policy_error() {
        let err = EnforcementError::InvalidPolicy {
            project: "p".to_string(),
            source: PolicyError::EmptyPolicy,
        };
        assert_eq!(err.kind(), FailureKind::Validation);
        assert!(err.to_string().contains("refusing to remove every firewall rule"));
    }
}
