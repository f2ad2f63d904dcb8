//! In-memory [`ComputeClient`] for tests.
//!
//! [`MemoryComputeClient`] keeps one rule table per project, applies mutations
//! to it, records every mutating call, and lets tests inject failures and
//! latency per project.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ComputeClient, ComputeError, ComputeResult, MutationKind};
use crate::rule::Rule;

/// One recorded mutating call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationCall {
    pub kind: MutationKind,
    pub project: String,
    pub rule_name: String,
}

#[derive(Debug, Default)]
struct ProjectState {
    rules: BTreeMap<String, Rule>,
    networks: Vec<String>,
}

/// In-memory compute client.
#[derive(Debug, Default)]
pub struct MemoryComputeClient {
    projects: Mutex<HashMap<String, ProjectState>>,
    calls: Mutex<Vec<MutationCall>>,
    list_failures: Mutex<HashMap<String, ComputeError>>,
    mutation_failures: Mutex<HashMap<(String, String), ComputeError>>,
    frozen: Mutex<HashSet<String>>,
    latency: Mutex<HashMap<String, Duration>>,
    list_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryComputeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rules of `project`.
    pub fn set_rules(&self, project: &str, rules: impl IntoIterator<Item = Rule>) {
        let mut projects = self.projects.lock().unwrap();
        let state = projects.entry(project.to_string()).or_default();
        state.rules = rules.into_iter().map(|r| (r.name.clone(), r)).collect();
    }

    pub fn set_networks(&self, project: &str, networks: impl IntoIterator<Item = String>) {
        let mut projects = self.projects.lock().unwrap();
        let state = projects.entry(project.to_string()).or_default();
        state.networks = networks.into_iter().collect();
    }

    /// Current rules of `project`, sorted by name.
    pub fn rules(&self, project: &str) -> Vec<Rule> {
        self.projects
            .lock()
            .unwrap()
            .get(project)
            .map(|s| s.rules.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Make every rule listing of `project` fail with `error`.
    pub fn fail_listing(&self, project: &str, error: ComputeError) {
        self.list_failures
            .lock()
            .unwrap()
            .insert(project.to_string(), error);
    }

    /// Make any mutation of `rule_name` in `project` fail with `error`.
    pub fn fail_mutation(&self, project: &str, rule_name: &str, error: ComputeError) {
        self.mutation_failures
            .lock()
            .unwrap()
            .insert((project.to_string(), rule_name.to_string()), error);
    }

    /// Accept mutations on `project` without changing its rules.
    pub fn freeze(&self, project: &str) {
        self.frozen.lock().unwrap().insert(project.to_string());
    }

    /// Delay every rule listing of `project` by `delay`.
    pub fn set_latency(&self, project: &str, delay: Duration) {
        self.latency
            .lock()
            .unwrap()
            .insert(project.to_string(), delay);
    }

    /// Every mutating call received, in order.
    pub fn mutations(&self) -> Vec<MutationCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Highest number of rule listings observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn mutate(
        &self,
        kind: MutationKind,
        project: &str,
        rule_name: &str,
        apply: impl FnOnce(&mut ProjectState) -> ComputeResult<()>,
    ) -> ComputeResult<()> {
        self.calls.lock().unwrap().push(MutationCall {
            kind,
            project: project.to_string(),
            rule_name: rule_name.to_string(),
        });

        if let Some(err) = self
            .mutation_failures
            .lock()
            .unwrap()
            .get(&(project.to_string(), rule_name.to_string()))
        {
            return Err(err.clone());
        }
        if self.frozen.lock().unwrap().contains(project) {
            return Ok(());
        }

        let mut projects = self.projects.lock().unwrap();
        let state = projects
            .get_mut(project)
            .ok_or_else(|| ComputeError::NotFound {
                resource: format!("project {project}"),
            })?;
        apply(state)
    }
}

fn rule_not_found(name: &str) -> ComputeError {
    ComputeError::NotFound {
        resource: format!("firewall rule {name}"),
    }
}

#[async_trait]
impl ComputeClient for MemoryComputeClient {
    async fn list_firewall_rules(&self, project: &str) -> ComputeResult<Vec<Rule>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.latency.lock().unwrap().get(project).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self.list_failures.lock().unwrap().get(project) {
            return Err(err.clone());
        }
        self.projects
            .lock()
            .unwrap()
            .get(project)
            .map(|s| s.rules.values().cloned().collect())
            .ok_or_else(|| ComputeError::NotFound {
                resource: format!("project {project}"),
            })
    }

    async fn insert_firewall_rule(&self, project: &str, rule: &Rule) -> ComputeResult<()> {
        self.mutate(MutationKind::Insert, project, &rule.name, |state| {
            if state.rules.contains_key(&rule.name) {
                return Err(ComputeError::Api {
                    status: 409,
                    message: format!("firewall rule {} already exists", rule.name),
                });
            }
            state.rules.insert(rule.name.clone(), rule.clone());
            Ok(())
        })
    }

    async fn delete_firewall_rule(&self, project: &str, rule_name: &str) -> ComputeResult<()> {
        self.mutate(MutationKind::Delete, project, rule_name, |state| {
            state
                .rules
                .remove(rule_name)
                .map(|_| ())
                .ok_or_else(|| rule_not_found(rule_name))
        })
    }

    async fn update_firewall_rule(&self, project: &str, rule: &Rule) -> ComputeResult<()> {
        self.mutate(MutationKind::Update, project, &rule.name, |state| {
            let slot = state
                .rules
                .get_mut(&rule.name)
                .ok_or_else(|| rule_not_found(&rule.name))?;
            *slot = rule.clone();
            Ok(())
        })
    }

    async fn list_networks(&self, project: &str) -> ComputeResult<Vec<String>> {
        self.projects
            .lock()
            .unwrap()
            .get(project)
            .map(|s| s.networks.clone())
            .ok_or_else(|| ComputeError::NotFound {
                resource: format!("project {project}"),
            })
    }
}
