//! Command-line interface for aware.
//!
//! Provides commands for running and replaying episodes, planning a single
//! isolation, inspecting the persisted audit trail and showing the merged
//! policy and configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};

use crate::config;
use crate::core::audit_store::{open_sink, AuditBackend};
use crate::core::orchestrator::timeline_digest;
use crate::core::planner::{self, PlanStamp};
use crate::core::policy::PLANNER;
use crate::core::{Orchestrator, Policy, Scenario};
use crate::domain::{ActionId, Event, NetworkGraph};

/// Pipe the built-in demo scenario reports as leaking
const DEMO_LEAK_PIPE: &str = "P_J2_J3";

/// aware - Policy-governed multi-agent control for water networks
#[derive(Parser, Debug)]
#[command(name = "aware")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Documents an episode is built from
#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    /// Site policy layered over the defaults
    #[arg(short, long, env = "AGENT_POLICY")]
    pub policy: Option<PathBuf>,

    /// Base policy document (built-in defaults if omitted)
    #[arg(long)]
    pub defaults: Option<PathBuf>,

    /// Network topology file (built-in sample network if omitted)
    #[arg(short, long)]
    pub network: Option<PathBuf>,
}

/// Inputs and overrides for one episode
#[derive(Args, Debug, Clone)]
pub struct EpisodeArgs {
    #[command(flatten)]
    pub load: LoadArgs,

    /// Scenario file (built-in demo if omitted)
    #[arg(short, long)]
    pub scenario: Option<PathBuf>,

    /// Leaking pipe used by the built-in demo scenario
    #[arg(long, default_value = DEMO_LEAK_PIPE)]
    pub leak: String,

    /// Override the watcher's chaos probability
    #[arg(long, env = "WATCHER_CHAOS_CHANCE")]
    pub chaos: Option<f64>,

    /// Let planner actions execute without operator approval
    #[arg(long)]
    pub auto_execute: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an episode and print its event timeline as JSON
    Episode {
        #[command(flatten)]
        args: EpisodeArgs,

        /// Do not persist the audit trail
        #[arg(long)]
        no_persist: bool,

        /// Print the timeline digest to stderr
        #[arg(long)]
        digest: bool,

        /// Also write the timeline to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Re-run an episode and compare it with a saved timeline
    Replay {
        /// Timeline JSON written by `episode --output`
        timeline: PathBuf,

        #[command(flatten)]
        args: EpisodeArgs,
    },

    /// Plan an isolation for one pipe without running agents
    Plan {
        /// Leaking pipe id
        pipe: String,

        #[command(flatten)]
        load: LoadArgs,
    },

    /// Show persisted isolation transitions
    Audit {
        /// Only show transitions of this action
        #[arg(short, long)]
        action: Option<String>,

        /// Audit store to read (jsonl or sqlite; configured backend if omitted)
        #[arg(short, long)]
        backend: Option<String>,
    },

    /// Print the merged policy as YAML
    Policy {
        #[command(flatten)]
        load: LoadArgs,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Episode {
                args,
                no_persist,
                digest,
                output,
            } => run_episode(&args, !no_persist, digest, output.as_deref()).await,
            Commands::Replay { timeline, args } => replay(&timeline, &args).await,
            Commands::Plan { pipe, load } => plan_isolation(&pipe, &load).await,
            Commands::Audit { action, backend } => show_audit(action.as_deref(), backend.as_deref()).await,
            Commands::Policy { load } => show_policy(&load).await,
            Commands::Config => show_config().await,
        }
    }
}

/// Fill in paths the command line left out from the config file
fn resolve_load(load: &LoadArgs) -> Result<LoadArgs> {
    let cfg = config::config()?;
    Ok(LoadArgs {
        policy: load.policy.clone().or_else(|| cfg.policy.clone()),
        defaults: load.defaults.clone().or_else(|| cfg.policy_defaults.clone()),
        network: load.network.clone().or_else(|| cfg.network.clone()),
    })
}

fn load_policy(load: &LoadArgs) -> Result<Policy> {
    let policy = Policy::load(load.defaults.as_deref(), load.policy.as_deref())
        .context("Failed to load policy")?;
    Ok(policy)
}

fn load_network(load: &LoadArgs) -> Result<NetworkGraph> {
    match &load.network {
        Some(path) => NetworkGraph::from_file(path)
            .with_context(|| format!("Failed to load network: {}", path.display())),
        None => Ok(NetworkGraph::sample()),
    }
}

/// Build the orchestrator and scenario for an episode
fn prepare(args: &EpisodeArgs) -> Result<(Orchestrator, Scenario)> {
    let load = resolve_load(&args.load)?;
    let mut policy = load_policy(&load)?;
    if let Some(chaos) = args.chaos {
        policy = policy
            .with_chaos_probability(chaos)
            .context("Invalid chaos probability")?;
    }
    if args.auto_execute {
        policy = policy.with_auto_execute(PLANNER, true)?;
    }

    let graph = load_network(&load)?;
    let scenario = match &args.scenario {
        Some(path) => Scenario::from_file(path)
            .with_context(|| format!("Failed to load scenario: {}", path.display()))?,
        None => Scenario::demo(&args.leak),
    };

    let depth = config::config()?.engine.max_cascade_depth;
    Ok((Orchestrator::new(policy, graph).with_max_cascade_depth(depth), scenario))
}

/// Run an episode and print the timeline
async fn run_episode(
    args: &EpisodeArgs,
    persist: bool,
    print_digest: bool,
    output: Option<&Path>,
) -> Result<()> {
    let (orchestrator, scenario) = prepare(args)?;
    let report = orchestrator.run_episode(&scenario)?;

    let json = report.timeline_json().context("Failed to encode timeline")?;
    println!("{}", json);

    if let Some(path) = output {
        tokio::fs::write(path, &json)
            .await
            .with_context(|| format!("Failed to write timeline: {}", path.display()))?;
    }

    if persist && !report.audit.is_empty() {
        let cfg = config::config()?;
        let sink = open_sink(cfg.audit_backend, &cfg.audit_dir()).await?;
        let written = orchestrator.persist(&report, sink.as_ref()).await?;
        eprintln!("[{} transitions appended to {} audit store]", written, sink.name());
    }

    if print_digest {
        eprintln!("{}", report.digest().context("Failed to digest timeline")?);
    }
    for error in &report.errors {
        eprintln!("[tick {} ({}) failed: {}]", error.tick, error.input_type, error.message);
    }
    eprintln!("[Episode finished in {} mode]", report.final_mode);

    Ok(())
}

/// Re-run an episode and compare digests with a saved timeline
async fn replay(timeline_path: &Path, args: &EpisodeArgs) -> Result<()> {
    let content = tokio::fs::read_to_string(timeline_path)
        .await
        .with_context(|| format!("Failed to read timeline: {}", timeline_path.display()))?;
    let saved: Vec<Event> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse timeline: {}", timeline_path.display()))?;
    let expected = timeline_digest(&saved)?;

    let (orchestrator, scenario) = prepare(args)?;
    let report = orchestrator.run_episode(&scenario)?;
    let actual = report.digest()?;

    if actual != expected {
        let diverged = saved
            .iter()
            .zip(&report.timeline)
            .position(|(a, b)| a != b)
            .unwrap_or_else(|| saved.len().min(report.timeline.len()));
        anyhow::bail!(
            "Replay diverged at event {} (saved {} events, replayed {})\n  expected {}\n  actual   {}",
            diverged + 1,
            saved.len(),
            report.timeline.len(),
            expected,
            actual
        );
    }

    println!("Replay matches: {} events, {}", report.timeline.len(), actual);
    Ok(())
}

/// Plan an isolation directly against the network
async fn plan_isolation(pipe: &str, load: &LoadArgs) -> Result<()> {
    let load = resolve_load(load)?;
    let policy = load_policy(&load)?;
    let graph = load_network(&load)?;

    let now = Utc::now();
    let stamp = PlanStamp {
        id: ActionId::derive(pipe, now, 1),
        origin_agent: PLANNER.to_string(),
        created_at: now,
    };
    let action = planner::plan(&graph, pipe, policy.agent(PLANNER), stamp)?;

    println!("{}", serde_json::to_string_pretty(&action)?);
    Ok(())
}

/// List persisted transitions
async fn show_audit(action: Option<&str>, backend: Option<&str>) -> Result<()> {
    let cfg = config::config()?;
    let backend = match backend {
        Some(name) => name.parse::<AuditBackend>()?,
        None => cfg.audit_backend,
    };
    let sink = open_sink(backend, &cfg.audit_dir()).await?;

    let records = match action {
        Some(id) => {
            let id: ActionId = id.parse().with_context(|| format!("Invalid action ID: {}", id))?;
            sink.records_for(id).await?
        }
        None => sink.load().await?,
    };

    if records.is_empty() {
        println!("No transitions found");
        return Ok(());
    }

    println!(
        "{:<5} {:<38} {:<13} {:<13} {:<12} {}",
        "SEQ", "ACTION", "FROM", "TO", "ACTOR", "AT"
    );
    println!("{}", "-".repeat(110));
    for r in records {
        println!(
            "{:<5} {:<38} {:<13} {:<13} {:<12} {}",
            r.seq,
            r.action_id.to_string(),
            r.from_state.as_str(),
            r.to_state.as_str(),
            r.actor,
            r.timestamp.to_rfc3339()
        );
    }

    Ok(())
}

/// Print the merged policy
async fn show_policy(load: &LoadArgs) -> Result<()> {
    let load = resolve_load(load)?;
    let policy = load_policy(&load)?;
    print!("{}", policy.to_yaml()?);
    Ok(())
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;
    let show = |p: &Option<PathBuf>, fallback: &str| {
        p.as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| fallback.to_string())
    };

    println!("aware configuration");
    println!();
    println!("Config file: {}", show(&cfg.config_file, "(none - using defaults)"));
    println!();
    println!("Paths:");
    println!("  Home:             {}", cfg.home.display());
    println!("  Audit:            {}", cfg.audit_dir().display());
    println!("  Policy defaults:  {}", show(&cfg.policy_defaults, "(built-in)"));
    println!("  Policy override:  {}", show(&cfg.policy, "(none)"));
    println!("  Network:          {}", show(&cfg.network, "(built-in sample)"));
    println!();
    println!("Audit backend:      {}", cfg.audit_backend);
    println!("Max cascade depth:  {}", cfg.engine.max_cascade_depth);

    Ok(())
}
