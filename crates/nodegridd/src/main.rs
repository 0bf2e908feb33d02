//! nodegridd — the nodegrid daemon.
//!
//! Hosts the node lifecycle controller of one resource-manager replica:
//! - State store (redb), shared by every replica of the cluster
//! - Cluster context rebuilt from committed state
//! - Per-node event dispatcher
//! - Pending-event sweeper (active while this replica leads)
//!
//! # Usage
//!
//! ```text
//! nodegridd --config /etc/nodegrid/nodegridd.toml format
//! nodegridd --config /etc/nodegrid/nodegridd.toml run
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use nodegrid_lifecycle::{
    ChannelNotifier, ClusterContext, LeaderFlag, NodeEventDispatcher, PendingEventSweeper,
};
use nodegrid_state::{StateStore, Variable};
use tokio::sync::watch;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::{DaemonConfig, Overrides};

#[derive(Parser)]
#[command(name = "nodegridd", about = "nodegrid node lifecycle daemon")]
struct Cli {
    /// Path to nodegridd.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Data directory for persistent state.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize cluster variables and print their values.
    Format,

    /// Run the lifecycle controller until Ctrl-C.
    Run {
        /// Identifier of this replica.
        #[arg(long)]
        replica_id: Option<String>,

        /// Defer scheduler notifications to the leader when not leading.
        #[arg(long)]
        distributed: bool,

        /// Start as a non-leader replica.
        #[arg(long)]
        follower: bool,

        /// Number of event-dispatch shards.
        #[arg(long)]
        workers: Option<usize>,

        /// Host to exclude from the cluster (repeatable).
        #[arg(long = "exclude")]
        excluded_hosts: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = DaemonConfig::load(cli.config.as_deref())
        .with_context(|| format!("failed to load config {:?}", cli.config))?;
    let mut overrides = Overrides {
        data_dir: cli.data_dir,
        ..Overrides::default()
    };
    if let Command::Run {
        replica_id,
        distributed,
        follower,
        workers,
        excluded_hosts,
    } = &cli.command
    {
        overrides.replica_id = replica_id.clone();
        overrides.distributed = distributed.then_some(true);
        overrides.leader = follower.then_some(false);
        overrides.workers = *workers;
        overrides.excluded_hosts = excluded_hosts.clone();
    }
    config.apply(overrides);
    config.validate()?;

    init_tracing(&config.log_filter, cli.json);

    match cli.command {
        Command::Format => format(&config),
        Command::Run { .. } => run(config).await,
    }
}

fn init_tracing(default_filter: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_store(config: &DaemonConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.db_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

fn format(config: &DaemonConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let vars = store.variables();
    let written = vars.register_defaults()?;

    let mut values = serde_json::Map::new();
    for var in Variable::ALL {
        values.insert(var.name().to_string(), serde_json::to_value(vars.get(var)?)?);
    }
    println!("{}", serde_json::to_string_pretty(&values)?);
    info!(written, "cluster formatted");
    Ok(())
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!(
        replica_id = %config.replica_id,
        leader = config.leader,
        distributed = config.distributed,
        "nodegrid daemon starting"
    );

    let store = open_store(&config)?;
    // Idempotent; a replica started against a fresh store still needs the
    // pending-event counter.
    store.variables().register_defaults()?;

    // ── Cluster context ────────────────────────────────────────

    let (notifier, mut notifications) = ChannelNotifier::new();
    let ctx = Arc::new(
        ClusterContext::new(Arc::new(notifier))
            .with_leadership(Arc::new(LeaderFlag::new(config.leader)))
            .with_reader(Arc::new(store.clone()))
            .with_distributed(config.distributed)
            .with_excluded_hosts(config.excluded_hosts.iter().cloned()),
    );
    let restored = ctx.recover_from(&store)?;
    info!(restored, metrics = ?ctx.metrics().snapshot(), "cluster context ready");

    let dispatcher = NodeEventDispatcher::start(ctx.clone(), store.clone(), config.workers);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let sweeper =
        PendingEventSweeper::new(store.clone(), ctx.clone()).with_interval(config.sweep_interval());
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx.clone()));

    // No scheduler is attached to the daemon itself; notifications are logged.
    let mut scheduler_shutdown = shutdown_rx.clone();
    let scheduler_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(notification) = notifications.recv() => {
                    debug!(
                        node_id = %notification.node.node_id,
                        kind = ?notification.kind,
                        state = ?notification.node.state,
                        "scheduler notification"
                    );
                }
                _ = scheduler_shutdown.changed() => break,
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    dispatcher.shutdown().await;
    let _ = sweeper_handle.await;
    let _ = scheduler_handle.await;

    info!(metrics = ?ctx.metrics().snapshot(), "nodegrid daemon stopped");
    Ok(())
}
