//! Firewall Enforcer CLI
//!
//! The `fwenforce` command reconciles project firewall rules kept in a state
//! directory against a policies file.
//!
//! ## Commands
//!
//! - `enforce`: Enforce policies on every listed project
//! - `diff`: Show the rule diff between two rule files

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

use firewall_enforcer_core::{
    diff_rules, BatchFirewallEnforcer, ChangeApprover, EnforcerConfig, EnforcerLog,
    JsonDirComputeClient, MaxChangesApprover, Policy, ProjectResult, ProtectedRulesApprover,
    ResultObserver, Rule, RuleDiff, SystemClock,
};

#[derive(Parser)]
#[command(name = "fwenforce")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Reconcile cloud firewall rules against a desired policy", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enforce policies on every project listed in a policies file
    Enforce(EnforceArgs),

    /// Show the rule diff between two rule files
    Diff {
        /// JSON array of the rules currently in place
        #[arg(long)]
        current: PathBuf,

        /// JSON array of the desired rules
        #[arg(long)]
        desired: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value_t = DiffFormat::Text)]
        format: DiffFormat,
    },
}

#[derive(clap::Args, Debug)]
struct EnforceArgs {
    /// Policies file: {"projects": [{"project_id": ..., "rules": [...]}]}
    #[arg(long, env = "FWENFORCE_POLICIES")]
    policies: PathBuf,

    /// Directory holding one <project>.json state file per project
    #[arg(long, env = "FWENFORCE_STATE_DIR")]
    state_dir: PathBuf,

    /// Compute and report diffs without changing anything
    #[arg(long)]
    dry_run: bool,

    /// JSON config file; flags below override it
    #[arg(long, env = "FWENFORCE_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum projects enforced at once
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Stop starting new projects after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Veto any project diff with more than this many changes
    #[arg(long)]
    max_changes: Option<usize>,

    /// Veto any diff that deletes or updates this rule (repeatable)
    #[arg(long = "protect", value_name = "NAME")]
    protect: Vec<String>,

    /// Write the full enforcer log (summary and results) to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum DiffFormat {
    Text,
    Json,
}

#[derive(Debug, Deserialize)]
struct PoliciesFile {
    projects: Vec<ProjectPolicy>,
}

#[derive(Debug, Deserialize)]
struct ProjectPolicy {
    project_id: String,
    #[serde(default)]
    rules: Vec<Rule>,
}

#[derive(Debug, Serialize)]
struct DiffReport {
    to_delete: Vec<Rule>,
    to_insert: Vec<Rule>,
    to_update: Vec<Rule>,
}

/// Streams each project result to stdout as one JSON line.
struct JsonLinesObserver;

impl ResultObserver for JsonLinesObserver {
    fn on_result(&self, result: &ProjectResult) {
        let line = match serde_json::to_string(result) {
            Ok(line) => line,
            Err(e) => {
                warn!(project = %result.project_id, error = %e, "failed to encode result");
                return;
            }
        };
        let mut out = std::io::stdout().lock();
        if let Err(e) = writeln!(out, "{line}").and_then(|_| out.flush()) {
            warn!(project = %result.project_id, error = %e, "failed to write result");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    firewall_enforcer_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Enforce(args) => cmd_enforce(&args).await,
        Commands::Diff {
            current,
            desired,
            format,
        } => cmd_diff(&current, &desired, format),
    }
}

async fn cmd_enforce(args: &EnforceArgs) -> Result<()> {
    let log = run_enforce(args, &JsonLinesObserver).await?;

    if let Some(path) = &args.output {
        write_log(path, &log)?;
        info!(path = %path.display(), "enforcer log written");
    }

    let failed = log.failed_projects();
    if !failed.is_empty() {
        bail!(
            "{} of {} projects failed: {}",
            failed.len(),
            log.summary.projects_total,
            failed.join(", ")
        );
    }
    Ok(())
}

async fn run_enforce(args: &EnforceArgs, observer: &dyn ResultObserver) -> Result<EnforcerLog> {
    let config = build_config(args)?;
    let pairs = load_policies(&args.policies)?;
    let client = JsonDirComputeClient::new(&args.state_dir)
        .with_context(|| format!("Failed to open state directory {:?}", args.state_dir))?;

    let enforcer = BatchFirewallEnforcer::new(Arc::new(client), Arc::new(SystemClock), config);
    let cancel = enforcer.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; finishing in-flight projects");
            cancel.cancel();
        }
    });

    let approver = build_approver(args.max_changes, &args.protect);
    let log = enforcer.run(pairs, approver, Some(observer)).await;
    interrupt.abort();
    Ok(log)
}

fn build_config(args: &EnforceArgs) -> Result<EnforcerConfig> {
    let mut config = match &args.config {
        Some(path) => EnforcerConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => EnforcerConfig::default(),
    };
    if args.dry_run {
        config.dry_run = true;
    }
    if let Some(n) = args.max_concurrent {
        config.max_concurrent_projects = n;
    }
    if let Some(secs) = args.timeout_secs {
        config.batch_timeout_secs = Some(secs);
    }
    config.validate()?;
    Ok(config)
}

/// Combine the flag-driven approvers; `None` when no flag asks for one.
fn build_approver(max_changes: Option<usize>, protect: &[String]) -> Option<Arc<dyn ChangeApprover>> {
    let mut approvers: Vec<Box<dyn ChangeApprover>> = Vec::new();
    if let Some(max) = max_changes {
        approvers.push(Box::new(MaxChangesApprover::new(max)));
    }
    if !protect.is_empty() {
        approvers.push(Box::new(ProtectedRulesApprover::new(protect.iter().cloned())));
    }
    if approvers.is_empty() {
        return None;
    }
    let combined: Arc<dyn ChangeApprover> = Arc::new(move |project: &str, diff: &RuleDiff| {
        approvers.iter().all(|a| a.approve(project, diff))
    });
    Some(combined)
}

fn load_policies(path: &Path) -> Result<Vec<(String, Policy)>> {
    let file: PoliciesFile = read_json_file(path)?;
    let mut seen = BTreeSet::new();
    let mut pairs = Vec::with_capacity(file.projects.len());
    for entry in file.projects {
        if !seen.insert(entry.project_id.clone()) {
            bail!("project {} is listed more than once in {:?}", entry.project_id, path);
        }
        pairs.push((entry.project_id, Policy::new(entry.rules)));
    }
    Ok(pairs)
}

fn write_log(path: &Path, log: &EnforcerLog) -> Result<()> {
    let data = serde_json::to_vec_pretty(log)?;
    std::fs::write(path, data).with_context(|| format!("Failed to write {:?}", path))
}

fn cmd_diff(current: &Path, desired: &Path, format: DiffFormat) -> Result<()> {
    let current: Vec<Rule> = read_json_file(current)?;
    let desired: Vec<Rule> = read_json_file(desired)?;
    let diff = diff_rules(&current, &desired)?;

    match format {
        DiffFormat::Json => {
            let (to_delete, to_insert, to_update) = diff.to_sorted_vecs();
            let report = DiffReport {
                to_delete,
                to_insert,
                to_update,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        DiffFormat::Text => println!("{}", render_diff_text(&diff)),
    }
    Ok(())
}

fn render_diff_text(diff: &RuleDiff) -> String {
    let mut lines = Vec::with_capacity(diff.len() + 1);
    lines.extend(diff.to_delete().map(|r| format!("- {}", r.name)));
    lines.extend(diff.to_insert().map(|r| format!("+ {}", r.name)));
    lines.extend(diff.to_update().map(|r| format!("~ {}", r.name)));
    lines.push(format!(
        "{} to delete, {} to insert, {} to update",
        diff.delete_count(),
        diff.insert_count(),
        diff.update_count()
    ));
    lines.join("\n")
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read JSON file: {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {:?}", path))
}
