//! Structured observability hooks for batch and project lifecycle events.
//!
//! Every event carries a stable `event = "..."` field so log pipelines can
//! filter on it. Set `FWENFORCE_LOG=debug` to also see per-project state
//! transitions.

use tracing::{info, warn, Span};

use crate::compute::MutationKind;
use crate::enforcer::{BatchResult, ProjectResult};

/// Span covering one batch run. Attach it with `Instrument::instrument` so
/// the run future stays `Send`.
pub fn batch_span(batch_id: u64) -> Span {
    tracing::info_span!("fwenforce.batch", batch_id = batch_id)
}

pub fn emit_batch_started(batch_id: u64, projects: usize, dry_run: bool) {
    info!(
        event = "batch.started",
        batch_id = batch_id,
        projects = projects,
        dry_run = dry_run,
    );
}

pub fn emit_batch_finished(summary: &BatchResult) {
    info!(
        event = "batch.finished",
        batch_id = summary.batch_id,
        duration_ms = summary
            .timestamp_end_msec
            .saturating_sub(summary.timestamp_start_msec),
        total = summary.projects_total,
        success = summary.projects_success,
        failure = summary.projects_failure,
        changed = summary.projects_changed,
        unchanged = summary.projects_unchanged,
    );
}

/// Emit event: a project run finished. Failures are logged at `warn`.
pub fn emit_project_enforced(result: &ProjectResult) {
    match &result.error {
        None => info!(
            event = "project.enforced",
            project = %result.project_id,
            changed = result.changed,
            dry_run = result.dry_run,
            modified = result.rules_modified_count,
        ),
        Some(detail) => warn!(
            event = "project.failed",
            project = %result.project_id,
            kind = ?detail.kind,
            error = %detail.message,
        ),
    }
}

pub fn emit_project_vetoed(project: &str, changes: usize) {
    info!(event = "project.vetoed", project = %project, changes = changes);
}

pub fn emit_rule_mutated(project: &str, kind: MutationKind, rule: &str) {
    info!(event = "rule.mutated", project = %project, kind = %kind, rule = %rule);
}
