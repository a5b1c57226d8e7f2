//! TierStore Lifecycle Daemon
//!
//! Loads the engine configuration, wires every subsystem through one
//! engine context, and drives the retention, tiering, backup, and
//! monitoring schedulers until shutdown.

use anyhow::{Context as _, Result};
use clap::Parser;
use tierstore_common::config::EngineConfig;
use tierstore_engine::EngineContext;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tierstored")]
#[command(about = "TierStore Lifecycle Daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/tierstore/tierstored.json")]
    config: String,

    /// Log level
    #[arg(long, default_value = "info", env = "TIERSTORE_LOG")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Reconcile recorded tier usage against disk contents on startup
    #[arg(long)]
    reconcile: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| args.log_level.clone().into());
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting TierStore Lifecycle Daemon");

    let config = EngineConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config))?;
    if config.tiers.is_empty() {
        anyhow::bail!("configuration defines no storage tiers");
    }

    let ctx = EngineContext::new(config).context("building the engine context")?;
    for tier in ctx.registry.list() {
        info!(
            tier = %tier.id,
            kind = %tier.kind,
            root = %tier.root.display(),
            capacity_bytes = tier.capacity_bytes,
            "tier registered"
        );
    }

    if args.reconcile {
        for (tier, delta) in ctx.executor.reconcile_all()? {
            if delta != 0 {
                info!(tier = %tier, delta, "usage reconciled on startup");
            }
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = ctx.spawn_schedulers(shutdown_rx);
    info!(schedulers = handles.len(), "schedulers running");

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");
    shutdown_tx.send(true).ok();
    for handle in handles {
        handle.await.ok();
    }

    let stats = ctx.stats();
    info!(
        retention_policies = stats.retention_policies,
        tiering_rules = stats.tiering_rules,
        pending_migrations = stats.pending_migrations,
        unresolved_alerts = stats.unresolved_alerts,
        "TierStore daemon shut down gracefully"
    );
    Ok(())
}
