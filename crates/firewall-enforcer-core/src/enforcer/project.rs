//! Single-project enforcement.
//!
//! [`ProjectEnforcer::enforce`] walks one project through
//! `Fetching -> Diffing -> (Vetoed | DryRun | Applying -> Verifying) -> Done`
//! and always returns a [`ProjectResult`]; errors are folded into it.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::approval::ChangeApprover;
use crate::clock::{micros_to_msec, Clock};
use crate::compute::{ComputeClient, ComputeError, MutationKind};
use crate::config::EnforcerConfig;
use crate::diff::{diff_rules, RuleDiff};
use crate::enforcer::error::EnforcementError;
use crate::enforcer::result::{ApplyProgress, EnforcementStatus, ProjectResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::policy::Policy;
use crate::rule::{sorted_by_name, Rule};

/// Where a project run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementState {
    Validating,
    Fetching,
    Diffing,
    Vetoed,
    DryRun,
    Applying,
    Verifying,
    Done,
}

/// The only path to mutating [`ComputeClient`] calls.
///
/// It cannot be opened on a dry run, so no code path holding a dry-run
/// configuration can reach a mutation.
struct MutationGate<'a> {
    client: &'a dyn ComputeClient,
}

impl<'a> MutationGate<'a> {
    fn open(client: &'a dyn ComputeClient, dry_run: bool) -> Option<Self> {
        (!dry_run).then_some(Self { client })
    }

    /// Apply deletes, then inserts, then updates. Stops at the first failure.
    async fn apply(&self, project: &str, diff: &RuleDiff) -> Result<ApplyProgress, EnforcementError> {
        let mut progress = ApplyProgress::default();

        for rule in diff.to_delete() {
            self.client
                .delete_firewall_rule(project, &rule.name)
                .await
                .map_err(|source| apply_error(project, MutationKind::Delete, rule, progress, source))?;
            progress.deleted += 1;
            mutated(project, MutationKind::Delete, rule);
        }
        for rule in diff.to_insert() {
            self.client
                .insert_firewall_rule(project, rule)
                .await
                .map_err(|source| apply_error(project, MutationKind::Insert, rule, progress, source))?;
            progress.inserted += 1;
            mutated(project, MutationKind::Insert, rule);
        }
        for rule in diff.to_update() {
            self.client
                .update_firewall_rule(project, rule)
                .await
                .map_err(|source| apply_error(project, MutationKind::Update, rule, progress, source))?;
            progress.updated += 1;
            mutated(project, MutationKind::Update, rule);
        }

        Ok(progress)
    }
}

fn apply_error(
    project: &str,
    operation: MutationKind,
    rule: &Rule,
    progress: ApplyProgress,
    source: ComputeError,
) -> EnforcementError {
    EnforcementError::Apply {
        project: project.to_string(),
        operation,
        rule: rule.name.clone(),
        progress,
        source,
    }
}

fn mutated(project: &str, kind: MutationKind, rule: &Rule) {
    METRICS.inc_mutation(kind);
    obs::emit_rule_mutated(project, kind, &rule.name);
}

/// Mutable record of one run, frozen into a [`ProjectResult`] at the end.
struct ProjectRun<'a> {
    project_id: &'a str,
    state: EnforcementState,
    changed: bool,
    modified: usize,
    all_rules_changed: bool,
    diff: RuleDiff,
    rules_before: Vec<Rule>,
    rules_after: Vec<Rule>,
}

impl<'a> ProjectRun<'a> {
    fn new(project_id: &'a str) -> Self {
        Self {
            project_id,
            state: EnforcementState::Validating,
            changed: false,
            modified: 0,
            all_rules_changed: false,
            diff: RuleDiff::default(),
            rules_before: Vec::new(),
            rules_after: Vec::new(),
        }
    }

    fn transition(&mut self, next: EnforcementState) {
        debug!(project = %self.project_id, from = ?self.state, to = ?next, "enforcement state");
        self.state = next;
    }

    fn record_diff(&mut self, current: &[Rule], diff: RuleDiff) {
        self.rules_before = sorted_by_name(current);
        self.all_rules_changed = !current.is_empty() && current.iter().all(|r| diff.touches(&r.name));
        self.diff = diff;
    }
}

/// Enforces a policy on one project through an injected [`ComputeClient`].
pub struct ProjectEnforcer {
    client: Arc<dyn ComputeClient>,
    clock: Arc<dyn Clock>,
    config: EnforcerConfig,
}

impl ProjectEnforcer {
    pub fn new(client: Arc<dyn ComputeClient>, clock: Arc<dyn Clock>, config: EnforcerConfig) -> Self {
        Self {
            client,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &EnforcerConfig {
        &self.config
    }

    /// Bring `project_id` in line with `policy`.
    ///
    /// `approver` sees every computed diff, empty or not, before the dry-run
    /// check. An empty diff leaves the project unchanged whatever it returns.
    /// Never fails: every error ends up in the result.
    #[instrument(skip_all, fields(project = %project_id, dry_run = self.config.dry_run))]
    pub async fn enforce(
        &self,
        project_id: &str,
        policy: &Policy,
        approver: &dyn ChangeApprover,
    ) -> ProjectResult {
        let start = self.clock.now_micros();
        let mut run = ProjectRun::new(project_id);
        let outcome = self.drive(&mut run, policy, approver).await;
        run.transition(EnforcementState::Done);
        let end = self.clock.now_micros();

        METRICS.inc_projects_enforced();
        self.finish(run, policy, start, end, outcome)
    }

    /// Result for a project the batch never started.
    pub fn cancelled(&self, project_id: &str, policy: &Policy) -> ProjectResult {
        self.failed_without_run(
            project_id,
            policy,
            EnforcementError::Cancelled {
                project: project_id.to_string(),
            },
        )
    }

    /// Result for a project whose task ended without reporting back.
    pub fn failed_without_run(
        &self,
        project_id: &str,
        policy: &Policy,
        error: EnforcementError,
    ) -> ProjectResult {
        let now = self.clock.now_micros();
        self.finish(ProjectRun::new(project_id), policy, now, now, Err(error))
    }

    async fn drive(
        &self,
        run: &mut ProjectRun<'_>,
        policy: &Policy,
        approver: &dyn ChangeApprover,
    ) -> Result<(), EnforcementError> {
        let project = run.project_id;
        let desired = self.desired_policy(project, policy).await?;

        run.transition(EnforcementState::Fetching);
        let current = self
            .client
            .list_firewall_rules(project)
            .await
            .map_err(|source| EnforcementError::FetchRules {
                project: project.to_string(),
                source,
            })?;

        run.transition(EnforcementState::Diffing);
        let diff = diff_rules(&current, desired.rules()).map_err(|source| {
            EnforcementError::InvalidPolicy {
                project: project.to_string(),
                source,
            }
        })?;
        run.record_diff(&current, diff);

        let approved = approver.approve(project, &run.diff);
        if run.diff.is_empty() {
            return Ok(());
        }
        if !approved {
            run.transition(EnforcementState::Vetoed);
            obs::emit_project_vetoed(project, run.diff.len());
            return Ok(());
        }

        let Some(gate) = MutationGate::open(self.client.as_ref(), self.config.dry_run) else {
            run.transition(EnforcementState::DryRun);
            run.changed = true;
            run.modified = run.diff.len();
            return Ok(());
        };

        run.transition(EnforcementState::Applying);
        match gate.apply(project, &run.diff).await {
            Ok(progress) => {
                run.changed = true;
                run.modified = progress.total();
            }
            Err(err) => {
                let applied = err.progress().map(|p| p.total()).unwrap_or(0);
                run.changed = applied > 0;
                run.modified = applied;
                return Err(err);
            }
        }

        if self.config.verify_after_apply {
            run.transition(EnforcementState::Verifying);
            self.verify(run, &desired).await?;
        }
        Ok(())
    }

    /// Validate `policy`, expanding it onto the project's networks first when
    /// configured to.
    async fn desired_policy(&self, project: &str, policy: &Policy) -> Result<Policy, EnforcementError> {
        let invalid = |source| EnforcementError::InvalidPolicy {
            project: project.to_string(),
            source,
        };

        if !self.config.expand_to_networks {
            policy
                .validate(self.config.allow_empty_ruleset)
                .map_err(invalid)?;
            return Ok(policy.clone());
        }

        let networks = self
            .client
            .list_networks(project)
            .await
            .map_err(|source| EnforcementError::FetchNetworks {
                project: project.to_string(),
                source,
            })?;
        let expanded = policy.expand_to_networks(&networks).map_err(invalid)?;
        expanded
            .validate(self.config.allow_empty_ruleset)
            .map_err(invalid)?;
        Ok(expanded)
    }

    async fn verify(&self, run: &mut ProjectRun<'_>, desired: &Policy) -> Result<(), EnforcementError> {
        let project = run.project_id;
        let verification = |detail: String| EnforcementError::Verification {
            project: project.to_string(),
            detail,
        };

        let after = self
            .client
            .list_firewall_rules(project)
            .await
            .map_err(|e| verification(format!("re-reading rules failed: {e}")))?;
        run.rules_after = sorted_by_name(&after);

        let residual = diff_rules(&after, desired.rules()).map_err(|e| verification(e.to_string()))?;
        if !residual.is_empty() {
            return Err(verification(format!(
                "{} rules still differ ({} extra, {} missing, {} modified)",
                residual.len(),
                residual.delete_count(),
                residual.insert_count(),
                residual.update_count()
            )));
        }
        Ok(())
    }

    fn finish(
        &self,
        run: ProjectRun<'_>,
        policy: &Policy,
        start_micros: u64,
        end_micros: u64,
        outcome: Result<(), EnforcementError>,
    ) -> ProjectResult {
        let (rules_to_delete, rules_to_insert, rules_to_update) = run.diff.to_sorted_vecs();
        let (status, error) = match outcome {
            Ok(()) => (EnforcementStatus::Success, None),
            Err(err) => (EnforcementStatus::Failure, Some(err.to_detail())),
        };

        ProjectResult {
            project_id: run.project_id.to_string(),
            batch_id: 0,
            timestamp_start_msec: micros_to_msec(start_micros),
            timestamp_end_msec: micros_to_msec(end_micros),
            status,
            changed: run.changed,
            dry_run: self.config.dry_run,
            policy_digest: policy.digest(),
            rules_to_delete,
            rules_to_insert,
            rules_to_update,
            rules_before: run.rules_before,
            rules_after: run.rules_after,
            rules_modified_count: run.modified,
            all_rules_changed: run.all_rules_changed,
            error,
        }
    }
}
