//! `repman`: replication manager command line.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use failover_kernel::{
    arbitration::{router, ArbitrationStore, MemoryArbitrationStore, MySqlArbitrationStore},
    config::MonitorConfig,
    monitor::{ClusterMonitor, MonitorError, MonitorHandle},
    telemetry, FailoverReport,
};
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "repman")]
#[command(about = "MariaDB/MySQL replication manager")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "REPMAN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Comma-separated host[:port] list of the first cluster
    #[arg(long, global = true)]
    hosts: Option<String>,

    /// Monitoring user as user:password
    #[arg(long, global = true)]
    user: Option<String>,

    /// Replication user as user:password
    #[arg(long, global = true)]
    rpluser: Option<String>,

    /// Host to favour during elections
    #[arg(long, global = true)]
    prefmaster: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Monitor every configured cluster
    Monitor {
        /// Prometheus scrape address
        #[arg(long, env = "REPMAN_METRICS_ADDR", default_value = "0.0.0.0:9104")]
        metrics_addr: SocketAddr,
    },
    /// Replace a dead master
    Failover {
        /// Cluster to act on, defaults to the first one
        #[arg(long)]
        cluster: Option<String>,
    },
    /// Hand mastership to a replica while the master is alive
    Switchover {
        #[arg(long)]
        cluster: Option<String>,
    },
    /// Print the discovered topology as JSON
    Topology {
        #[arg(long)]
        cluster: Option<String>,
    },
    /// Serve the arbitration API
    Arbitrator {
        #[arg(long, env = "REPMAN_ARBITRATOR_BIND", default_value = "0.0.0.0:8080")]
        bind: SocketAddr,
        /// MySQL URL of the heartbeat table; heartbeats stay in memory when unset
        #[arg(long, env = "REPMAN_ARBITRATOR_DATABASE_URL")]
        database_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let observability = telemetry::init()?;

    let result = match &cli.command {
        Command::Monitor { metrics_addr } => {
            let config = load_config(&cli)?;
            let metrics = observability.serve_metrics(*metrics_addr).await?;
            let outcome = monitor(config).await;
            metrics.abort();
            outcome
        }
        Command::Failover { cluster } => promote(&cli, cluster.as_deref(), true).await,
        Command::Switchover { cluster } => promote(&cli, cluster.as_deref(), false).await,
        Command::Topology { cluster } => topology(&cli, cluster.as_deref()).await,
        Command::Arbitrator { bind, database_url } => {
            arbitrator(*bind, database_url.as_deref()).await
        }
    };

    observability.shutdown();
    result
}

fn load_config(cli: &Cli) -> anyhow::Result<MonitorConfig> {
    let mut config = match &cli.config {
        Some(path) => MonitorConfig::load(path)?,
        None => MonitorConfig::default(),
    };
    // Creates the first cluster when the file declared none.
    config.apply_env_overrides()?;

    // Command line wins over the environment.
    let first = &mut config.clusters[0];
    if let Some(hosts) = &cli.hosts {
        first.hosts = hosts
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(user) = &cli.user {
        first.db_credentials = user.clone();
    }
    if let Some(user) = &cli.rpluser {
        first.replication_credentials = user.clone();
    }
    if let Some(preferred) = &cli.prefmaster {
        first.preferred_master = Some(preferred.clone());
    }
    Ok(config)
}

async fn monitor(config: MonitorConfig) -> anyhow::Result<()> {
    let mut handles = Vec::with_capacity(config.clusters.len());
    let mut tasks = Vec::with_capacity(config.clusters.len());
    for cluster in config.clusters {
        let name = cluster.name.clone();
        let monitor = ClusterMonitor::from_config(cluster)
            .with_context(|| format!("cannot monitor cluster {name}"))?;
        let (handle, task) = monitor.spawn();
        handles.push(handle);
        tasks.push(task);
    }
    info!(clusters = handles.len(), "replication manager started");

    if let Err(error) = signal::ctrl_c().await {
        error!(?error, "failed waiting for shutdown signal");
    }
    info!("shutdown signal received");
    for handle in &handles {
        handle.shutdown();
    }
    for task in tasks {
        if let Err(error) = task.await {
            warn!(?error, "monitor task ended abnormally");
        }
    }
    Ok(())
}

/// Spawns a monitor for the named cluster, or the first configured one.
fn start_one(cli: &Cli, cluster: Option<&str>) -> anyhow::Result<MonitorHandle> {
    let config = load_config(cli)?;
    let selected = match cluster {
        Some(name) => config
            .clusters
            .into_iter()
            .find(|candidate| candidate.name == name)
            .with_context(|| format!("cluster {name} is not configured"))?,
        None => config
            .clusters
            .into_iter()
            .next()
            .context("no cluster configured")?,
    };
    let (handle, _task) = ClusterMonitor::from_config(selected)?.spawn();
    Ok(handle)
}

async fn promote(cli: &Cli, cluster: Option<&str>, fail: bool) -> anyhow::Result<()> {
    let handle = start_one(cli, cluster)?;
    if let Err(error) = handle.discover().await {
        warn!(%error, "topology is not fully monitorable");
    }
    let result = if fail {
        handle.failover().await
    } else {
        handle.switchover().await
    };
    handle.shutdown();
    match result {
        Ok(report) => {
            print_report(&report)?;
            Ok(())
        }
        Err(error) => abort_with(error),
    }
}

fn print_report(report: &FailoverReport) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    for failure in &report.failures {
        warn!(phase = %failure.phase, server = %failure.server, error = %failure.error, "step failed");
    }
    Ok(())
}

fn abort_with(error: MonitorError) -> anyhow::Result<()> {
    error!(%error, class = ?error.class(), "promotion aborted");
    if error.class().aborts_promotion() {
        std::process::exit(1);
    }
    Err(error.into())
}

async fn topology(cli: &Cli, cluster: Option<&str>) -> anyhow::Result<()> {
    let handle = start_one(cli, cluster)?;
    let snapshot = match handle.discover().await {
        Ok(snapshot) => snapshot,
        Err(error) => {
            warn!(%error, "topology is not fully monitorable");
            handle.snapshot()
        }
    };
    handle.shutdown();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn arbitrator(bind: SocketAddr, database_url: Option<&str>) -> anyhow::Result<()> {
    let store: Arc<dyn ArbitrationStore> = match database_url {
        Some(url) => Arc::new(MySqlArbitrationStore::connect(url).await?),
        None => {
            warn!("no database configured, heartbeats are kept in memory");
            Arc::new(MemoryArbitrationStore::new())
        }
    };
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind arbitrator at {bind}"))?;
    info!(%bind, "arbitrator listening");
    axum::serve(listener, router(store).into_make_service())
        .with_graceful_shutdown(async {
            if let Err(error) = signal::ctrl_c().await {
                error!(?error, "failed waiting for shutdown signal");
            }
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
