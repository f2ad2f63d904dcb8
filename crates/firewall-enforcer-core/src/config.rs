//! Enforcer configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors produced while loading or checking an [`EnforcerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings shared by every project of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcerConfig {
    /// Compute and report diffs without issuing any mutating call.
    pub dry_run: bool,
    /// Upper bound on projects enforced at once.
    pub max_concurrent_projects: usize,
    /// Whole-batch deadline. Projects not started by then are reported as
    /// cancelled; projects already running are awaited.
    pub batch_timeout_secs: Option<u64>,
    /// Re-read rules after applying and fail the project if they drifted.
    pub verify_after_apply: bool,
    /// Accept policies with no rules (which delete every remote rule).
    pub allow_empty_ruleset: bool,
    /// Replicate network-less policy rules onto every network of the project.
    pub expand_to_networks: bool,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_concurrent_projects: 4,
            batch_timeout_secs: None,
            verify_after_apply: true,
            allow_empty_ruleset: false,
            expand_to_networks: false,
        }
    }
}

impl EnforcerConfig {
    /// Load a JSON config file. Missing keys take their default.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_projects == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_projects must be at least 1".to_string(),
            ));
        }
        if self.batch_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "batch_timeout_secs must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_secs.map(Duration::from_secs)
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_max_concurrent_projects(mut self, n: usize) -> Self {
        self.max_concurrent_projects = n;
        self
    }
}
