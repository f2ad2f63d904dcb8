//! Firewall enforcer core library
//!
//! Reconciles the live firewall rules of many cloud projects against a
//! desired policy: diff, veto hook, dry-run preview, bounded-concurrency
//! batch runs with a structured summary.

pub mod approval;
pub mod clock;
pub mod compute;
pub mod config;
pub mod diff;
pub mod enforcer;
pub mod metrics;
pub mod obs;
pub mod policy;
pub mod rule;
pub mod telemetry;

pub use approval::{
    AlwaysApprove, ChangeApprover, CollectingObserver, MaxChangesApprover, NoopObserver,
    ProtectedRulesApprover, ResultObserver,
};
pub use clock::{AdvancingClock, Clock, MockClock, SystemClock};
pub use compute::fakes::{MemoryComputeClient, MutationCall};
pub use compute::fs::JsonDirComputeClient;
pub use compute::{ComputeClient, ComputeError, ComputeResult, MutationKind};
pub use config::{ConfigError, EnforcerConfig};
pub use diff::{diff_rules, RuleDiff};
pub use enforcer::{
    ApplyProgress, BatchFirewallEnforcer, BatchResult, CancelHandle, EnforcementError,
    EnforcementState, EnforcementStatus, EnforcerLog, ErrorDetail, FailureKind, ProjectEnforcer,
    ProjectResult,
};
pub use policy::{Policy, PolicyError};
pub use rule::{Action, Direction, Permission, Rule};

pub use metrics::METRICS;
pub use telemetry::init_tracing;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
