//! Batch orchestration across many projects.
//!
//! Workers run one [`ProjectEnforcer`] each, bounded by a semaphore, and send
//! `(index, ProjectResult)` back over a channel. A single coordinating loop
//! stamps, counts and observes results, so no worker ever touches the
//! summary.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, warn, Instrument, Span};

use crate::approval::{AlwaysApprove, ChangeApprover, ResultObserver};
use crate::clock::{micros_to_msec, Clock};
use crate::compute::ComputeClient;
use crate::config::EnforcerConfig;
use crate::enforcer::error::EnforcementError;
use crate::enforcer::project::ProjectEnforcer;
use crate::enforcer::result::{BatchResult, EnforcerLog, ProjectResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::policy::Policy;

/// Stops a batch from launching further projects.
///
/// Projects already running finish normally; projects not yet started are
/// reported as cancelled. Cancellation is permanent for the enforcer the
/// handle came from.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Runs [`ProjectEnforcer`] over a list of `(project, policy)` pairs and
/// aggregates the outcome into an [`EnforcerLog`].
pub struct BatchFirewallEnforcer {
    enforcer: Arc<ProjectEnforcer>,
    clock: Arc<dyn Clock>,
    max_concurrent: usize,
    cancel: CancelHandle,
}

impl BatchFirewallEnforcer {
    pub fn new(client: Arc<dyn ComputeClient>, clock: Arc<dyn Clock>, config: EnforcerConfig) -> Self {
        let max_concurrent = config.max_concurrent_projects.max(1);
        Self {
            enforcer: Arc::new(ProjectEnforcer::new(client, clock.clone(), config)),
            clock,
            max_concurrent,
            cancel: CancelHandle::new(),
        }
    }

    pub fn dry_run(&self) -> bool {
        self.enforcer.config().dry_run
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Enforce every pair and return the summary plus one result per pair,
    /// in input order.
    ///
    /// `approver` is consulted per project before any mutation. `observer`
    /// receives every result exactly once, as it lands. Never fails: project
    /// errors are reported in their results.
    pub async fn run(
        &self,
        project_policies: Vec<(String, Policy)>,
        approver: Option<Arc<dyn ChangeApprover>>,
        observer: Option<&dyn ResultObserver>,
    ) -> EnforcerLog {
        let start = self.clock.now_micros();
        let batch_id = start;
        self.run_batch(batch_id, project_policies, approver, observer)
            .instrument(obs::batch_span(batch_id))
            .await
    }

    async fn run_batch(
        &self,
        batch_id: u64,
        project_policies: Vec<(String, Policy)>,
        approver: Option<Arc<dyn ChangeApprover>>,
        observer: Option<&dyn ResultObserver>,
    ) -> EnforcerLog {
        let mut summary = BatchResult::new(batch_id, micros_to_msec(batch_id));
        let total = project_policies.len();
        obs::emit_batch_started(batch_id, total, self.dry_run());

        let pairs = Arc::new(project_policies);
        let approver: Arc<dyn ChangeApprover> = approver.unwrap_or_else(|| Arc::new(AlwaysApprove));
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let (deadline_tx, deadline_rx) = watch::channel(false);
        let timer = self.enforcer.config().batch_timeout().map(|timeout| {
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "batch timeout reached; no further projects will start"
                );
                deadline_tx.send_replace(true);
            })
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, ProjectResult)>();
        let mut workers = JoinSet::new();
        for index in 0..total {
            let pairs = Arc::clone(&pairs);
            let enforcer = Arc::clone(&self.enforcer);
            let approver = Arc::clone(&approver);
            let semaphore = Arc::clone(&semaphore);
            let cancel_rx = self.cancel.subscribe();
            let deadline_rx = deadline_rx.clone();
            let tx = tx.clone();

            workers.spawn(async move {
                let (project_id, policy) = &pairs[index];
                let permit = semaphore.acquire_owned().await;
                let stopped = *cancel_rx.borrow() || *deadline_rx.borrow();

                let result = match permit {
                    Ok(_permit) if !stopped => {
                        enforcer.enforce(project_id, policy, approver.as_ref()).await
                    }
                    _ => enforcer.cancelled(project_id, policy),
                };
                // The coordinator outlives every worker.
                let _ = tx.send((index, result));
            }
            .instrument(Span::current()));
        }
        drop(tx);

        let mut slots: Vec<Option<ProjectResult>> = (0..total).map(|_| None).collect();
        while let Some((index, result)) = rx.recv().await {
            slots[index] = Some(collect(&mut summary, batch_id, result, observer));
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(batch_id, error = %err, "enforcement worker failed");
            }
        }
        if let Some(timer) = timer {
            timer.abort();
        }

        let results = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| match slot {
                Some(result) => result,
                None => {
                    let (project_id, policy) = &pairs[index];
                    let lost = self.enforcer.failed_without_run(
                        project_id,
                        policy,
                        EnforcementError::Internal {
                            project: project_id.clone(),
                            detail: "worker task panicked".to_string(),
                        },
                    );
                    collect(&mut summary, batch_id, lost, observer)
                }
            })
            .collect();

        summary.timestamp_end_msec = self.clock.now_msec();
        METRICS.flush();
        obs::emit_batch_finished(&summary);

        EnforcerLog { summary, results }
    }
}

fn collect(
    summary: &mut BatchResult,
    batch_id: u64,
    mut result: ProjectResult,
    observer: Option<&dyn ResultObserver>,
) -> ProjectResult {
    result.batch_id = batch_id;
    summary.record(&result);
    obs::emit_project_enforced(&result);
    if let Some(observer) = observer {
        observer.on_result(&result);
    }
    result
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::approval::CollectingObserver;
    use crate::clock::MockClock;
    use crate::compute::fakes::MemoryComputeClient;
    use crate::compute::ComputeResult;
    use crate::enforcer::result::FailureKind;
    use crate::rule::Rule;

    fn policy() -> Policy {
        Policy::new([Rule::new("allow-ssh").allow("tcp", ["22"])])
    }

    fn batch(client: Arc<dyn ComputeClient>, config: EnforcerConfig) -> BatchFirewallEnforcer {
        BatchFirewallEnforcer::new(client, Arc::new(MockClock::new(1_234_567_890)), config)
    }

    fn seeded(projects: &[&str]) -> Arc<MemoryComputeClient> {
        let client = Arc::new(MemoryComputeClient::new());
        for project in projects {
            client.set_rules(project, [Rule::new("legacy")]);
        }
        client
    }

    fn pairs(projects: &[&str]) -> Vec<(String, Policy)> {
        projects.iter().map(|p| (p.to_string(), policy())).collect()
    }

    #[tokio::test]
    async fn empty_batch_is_well_formed() {
        let client = Arc::new(MemoryComputeClient::new());
        let log = batch(client, EnforcerConfig::default()).run(Vec::new(), None, None).await;

        assert!(log.results.is_empty());
        assert_eq!(log.summary.projects_total, 0);
        assert_eq!(log.summary.batch_id, 1_234_567_890);
        assert_eq!(log.summary.timestamp_start_msec, 1_234_567);
        assert_eq!(log.summary.timestamp_end_msec, 1_234_567);
    }

    #[tokio::test(start_paused = true)]
    async fn results_keep_input_order() {
        let names = ["slow", "medium", "fast"];
        let client = seeded(&names);
        client.set_latency("slow", Duration::from_millis(300));
        client.set_latency("medium", Duration::from_millis(200));
        client.set_latency("fast", Duration::from_millis(100));

        let observer = CollectingObserver::new();
        let log = batch(client, EnforcerConfig::default())
            .run(pairs(&names), None, Some(&observer))
            .await;

        let order: Vec<&str> = log.results.iter().map(|r| r.project_id.as_str()).collect();
        assert_eq!(order, names);
        let seen: Vec<String> = observer.results().into_iter().map(|r| r.project_id).collect();
        assert_eq!(seen, vec!["fast", "medium", "slow"]);
        assert!(log.results.iter().all(|r| r.batch_id == 1_234_567_890));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded() {
        let names = ["p1", "p2", "p3", "p4", "p5", "p6"];
        let client = seeded(&names);
        for name in names {
            client.set_latency(name, Duration::from_millis(50));
        }
        let config = EnforcerConfig {
            verify_after_apply: false,
            ..EnforcerConfig::default()
        }
        .with_max_concurrent_projects(2);

        let log = batch(client.clone(), config).run(pairs(&names), None, None).await;
        assert_eq!(log.summary.projects_success, 6);
        assert_eq!(client.max_in_flight(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_stops_launching_but_awaits_in_flight() {
        let names = ["first", "second", "third"];
        let client = seeded(&names);
        for name in names {
            client.set_latency(name, Duration::from_secs(2));
        }
        let config = EnforcerConfig {
            batch_timeout_secs: Some(1),
            verify_after_apply: false,
            ..EnforcerConfig::default()
        }
        .with_max_concurrent_projects(1);

        let observer = CollectingObserver::new();
        let log = batch(client.clone(), config)
            .run(pairs(&names), None, Some(&observer))
            .await;

        assert!(log.results[0].is_success());
        assert!(log.results[0].changed);
        assert_eq!(log.results[1].failure_kind(), Some(FailureKind::Cancelled));
        assert_eq!(log.results[2].failure_kind(), Some(FailureKind::Cancelled));
        assert_eq!(log.summary.projects_failure, 2);
        assert_eq!(observer.len(), 3);
        assert_eq!(client.rules("second"), vec![Rule::new("legacy")]);
    }

    #[tokio::test]
    async fn cancelled_before_run_launches_nothing() {
        let names = ["a", "b"];
        let client = seeded(&names);
        let enforcer = batch(client.clone(), EnforcerConfig::default());
        let handle = enforcer.cancel_handle();
        handle.cancel();
        assert!(handle.is_cancelled());

        let log = enforcer.run(pairs(&names), None, None).await;
        assert_eq!(log.summary.projects_failure, 2);
        assert_eq!(client.list_calls(), 0);
        assert_eq!(log.failed_projects(), vec!["a", "b"]);
    }

    struct PanickingClient {
        inner: MemoryComputeClient,
    }

    #[async_trait]
    impl ComputeClient for PanickingClient {
        async fn list_firewall_rules(&self, project: &str) -> ComputeResult<Vec<Rule>> {
            if project == "boom" {
                panic!("client bug");
            }
            self.inner.list_firewall_rules(project).await
        }

        async fn insert_firewall_rule(&self, project: &str, rule: &Rule) -> ComputeResult<()> {
            self.inner.insert_firewall_rule(project, rule).await
        }

        async fn delete_firewall_rule(&self, project: &str, rule_name: &str) -> ComputeResult<()> {
            self.inner.delete_firewall_rule(project, rule_name).await
        }

        async fn update_firewall_rule(&self, project: &str, rule: &Rule) -> ComputeResult<()> {
            self.inner.update_firewall_rule(project, rule).await
        }

        async fn list_networks(&self, project: &str) -> ComputeResult<Vec<String>> {
            self.inner.list_networks(project).await
        }
    }

    #[tokio::test]
    async fn panicked_worker_is_reported_as_internal_failure() {
        let inner = MemoryComputeClient::new();
        inner.set_rules("ok", [Rule::new("legacy")]);
        let client = Arc::new(PanickingClient { inner });

        let observer = CollectingObserver::new();
        let log = batch(client, EnforcerConfig::default())
            .run(pairs(&["ok", "boom"]), None, Some(&observer))
            .await;

        assert!(log.results[0].is_success());
        assert_eq!(log.results[1].project_id, "boom");
        assert_eq!(log.results[1].failure_kind(), Some(FailureKind::Internal));
        assert_eq!(log.results[1].batch_id, 1_234_567_890);
        assert_eq!(log.summary.projects_total, 2);
        assert_eq!(log.summary.projects_failure, 1);
        assert_eq!(observer.len(), 2);
    }
}
