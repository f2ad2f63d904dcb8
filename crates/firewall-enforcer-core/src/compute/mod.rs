//! Cloud compute API seam.
//!
//! The enforcer only talks to the cloud through [`ComputeClient`]. Inject a
//! real API client in production, [`fakes::MemoryComputeClient`] in tests, or
//! [`fs::JsonDirComputeClient`] to drive the engine against files on disk.

pub mod fakes;
pub mod fs;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::rule::Rule;

/// Errors returned by a [`ComputeClient`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComputeError {
    /// The request never got a usable answer (network, timeout, malformed reply).
    #[error("transport error: {0}")]
    Transport(String),

    #[error("permission denied on project {project}")]
    PermissionDenied { project: String },

    #[error("{resource} not found")]
    NotFound { resource: String },

    /// The API answered with an error status.
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
}

pub type ComputeResult<T> = std::result::Result<T, ComputeError>;

/// The kind of a mutating firewall call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Delete,
    Insert,
    Update,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Delete => f.write_str("delete"),
            MutationKind::Insert => f.write_str("insert"),
            MutationKind::Update => f.write_str("update"),
        }
    }
}

/// Firewall operations the enforcer consumes from the cloud provider.
///
/// Every call is scoped to one project and is expected to complete in bounded
/// time; retries, if any, belong to the implementation.
#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// All firewall rules currently defined in `project`.
    async fn list_firewall_rules(&self, project: &str) -> ComputeResult<Vec<Rule>>;

    async fn insert_firewall_rule(&self, project: &str, rule: &Rule) -> ComputeResult<()>;

    async fn delete_firewall_rule(&self, project: &str, rule_name: &str) -> ComputeResult<()>;

    /// Replace the body of the existing rule named `rule.name`.
    async fn update_firewall_rule(&self, project: &str, rule: &Rule) -> ComputeResult<()>;

    /// Identifiers of the networks defined in `project`.
    async fn list_networks(&self, project: &str) -> ComputeResult<Vec<String>>;
}
