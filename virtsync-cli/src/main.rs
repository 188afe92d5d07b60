//! virtsync - keeps a monitoring registry in step with a virtualization inventory
//!
//! One run:
//! - loads and validates the YAML configuration
//! - reconciles VMs, hypervisors and datastores in turn
//! - logs a summary and mails the change report when configured

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use virtsync_cli::{JsonRpcRegistry, Notifier};
use virtsync_core::config::Config;
use virtsync_core::engine::Engine;
use virtsync_core::reconcile::{RemovalAction, RunContext};

const DEFAULT_CONFIG: &str = "virtsync.yaml";

#[derive(Parser, Debug)]
#[command(name = "virtsync", version, about)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "VIRTSYNC_CONFIG", default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// What to do with hosts whose object disappeared
    #[arg(short, long, default_value_t = RemovalAction::Simulate)]
    action: RemovalAction,

    /// Remove even when the share of extra hosts looks anomalous
    #[arg(long)]
    force: bool,

    /// Debug logging for virtsync crates
    #[arg(short, long)]
    debug: bool,

    /// Concurrent per-object checks (overrides engine.workers)
    #[arg(short, long)]
    workers: Option<usize>,
}

fn init_tracing(debug: bool) {
    let fallback = if debug { "virtsync=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = Config::load(&cli.config)
        .await
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    let token = config
        .registry
        .token
        .clone()
        .or_else(|| std::env::var("VIRTSYNC_REGISTRY_TOKEN").ok())
        .filter(|t| !t.trim().is_empty())
        .context("no registry token (registry.token or VIRTSYNC_REGISTRY_TOKEN)")?;

    let registry = JsonRpcRegistry::new(
        config.registry.url.clone(),
        token,
        Duration::from_secs(config.registry.timeout_secs),
    )
    .context("failed to build registry client")?;
    let agent = config.agent.client();

    let ctx = RunContext::new(cli.action)
        .with_force(cli.force)
        .with_workers(cli.workers.unwrap_or(config.engine.workers));

    info!(config = %cli.config.display(), agent = %agent.target(), "virtsync starting");
    let engine = Engine::new(&registry, &agent, ctx);
    let outcome = engine.run(&config).await;

    for failure in &outcome.failed {
        warn!(object_type = %failure.object_type, error = %failure.error, "object type not reconciled");
    }

    let notifier = Notifier::new(config.notify.clone());
    if notifier.should_send(&outcome) {
        if let Err(e) = notifier.send(&outcome).await {
            warn!(error = %e, "change report not delivered");
        }
    }

    info!("{}", outcome.summary());
    Ok(())
}
