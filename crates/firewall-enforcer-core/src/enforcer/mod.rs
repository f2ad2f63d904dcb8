//! Project and batch enforcement.

pub mod batch;
pub mod error;
pub mod project;
pub mod result;

pub use batch::{BatchFirewallEnforcer, CancelHandle};
pub use error::EnforcementError;
pub use project::{EnforcementState, ProjectEnforcer};
pub use result::{
    ApplyProgress, BatchResult, EnforcementStatus, EnforcerLog, ErrorDetail, FailureKind,
    ProjectResult,
};
