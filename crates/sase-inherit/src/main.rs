//! sase-inherit - Contract Inheritance Operator Tool
//!
//! # Usage
//!
//! ```bash
//! sase-inherit validate --config inherit.json
//! sase-inherit plan --config inherit.json --snapshot fabric.json
//! sase-inherit plan --config inherit.json --snapshot fabric.json --apply
//! sase-inherit sample-config > inherit.json
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use sase_inherit::{
    compute_delta, ControllerSettings, FabricClient, InMemoryFabric, InheritConfig, PolicyStore,
    ScopeSnapshot, ScopeWorker,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sase-inherit")]
#[command(version)]
#[command(about = "Contract inheritance for routed-network endpoint groups", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration document
    Validate {
        #[arg(long, short, env = "SASE_INHERIT_CONFIG")]
        config: PathBuf,
    },
    /// Compute the changes needed to converge a fabric snapshot
    Plan {
        #[arg(long, short, env = "SASE_INHERIT_CONFIG")]
        config: PathBuf,
        /// JSON list of scope snapshots
        #[arg(long, short)]
        snapshot: PathBuf,
        /// Reconcile an in-memory copy and print the converged snapshots
        #[arg(long)]
        apply: bool,
    },
    /// Print an example configuration document
    SampleConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => validate(&config),
        Commands::Plan {
            config,
            snapshot,
            apply,
        } => plan(&config, &snapshot, apply).await,
        Commands::SampleConfig => {
            println!("{}", serde_json::to_string_pretty(&InheritConfig::sample())?);
            Ok(())
        }
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let config = InheritConfig::load(path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    let policies = config.policy_map();

    println!(
        "{}: {} policies across {} scopes, controller {}",
        path.display(),
        policies.len(),
        policies.scopes().len(),
        config.connection.url()
    );
    Ok(())
}

async fn plan(config: &Path, snapshot: &Path, apply: bool) -> anyhow::Result<()> {
    let config = InheritConfig::load(config)
        .with_context(|| format!("invalid configuration {}", config.display()))?;
    let content = std::fs::read_to_string(snapshot)
        .with_context(|| format!("failed to read {}", snapshot.display()))?;
    let snapshots: Vec<ScopeSnapshot> = serde_json::from_str(&content)
        .with_context(|| format!("malformed snapshot list {}", snapshot.display()))?;

    let policies = config.policy_map();
    let scopes: Vec<_> = snapshots.iter().map(|s| s.scope.clone()).collect();
    let fabric = Arc::new(InMemoryFabric::with_snapshots(snapshots));

    if !apply {
        let mut deltas = Vec::new();
        for scope in &scopes {
            let snapshot = fabric.deep_fetch(scope).await?;
            let delta = compute_delta(&snapshot, &policies);
            tracing::info!(scope = %scope, changes = delta.len(), "planned");
            if !delta.is_empty() {
                deltas.push(delta);
            }
        }
        println!("{}", serde_json::to_string_pretty(&deltas)?);
        return Ok(());
    }

    let settings = ControllerSettings::default();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = ScopeWorker::new(
        fabric.clone(),
        Arc::new(PolicyStore::with_map(policies)),
        settings.retry,
        settings.max_conflict_recomputes,
        shutdown_rx,
    );
    for scope in &scopes {
        let report = worker.run_pass(scope).await?;
        tracing::info!(
            scope = %scope,
            applied = report.applied,
            unknown = report.unknown_groups.len(),
            "applied"
        );
    }
    println!("{}", serde_json::to_string_pretty(&fabric.snapshots())?);
    Ok(())
}
