//! Strata Node
//!
//! Runs the storage coordination operators of one node: slice rotation and
//! upload, file rotation and import, and the metadata cleanup.
//!
//! With the embedded store the node runs alone. Built with the `etcd`
//! feature and configured with `store.backend = "etcd"`, nodes connected to
//! the same etcd cluster split the work by ownership distribution.

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use strata_common::config::StoreBackend;
use strata_common::{Config, SharedClock, SystemClock};
use strata_meta_store::{KvStore, LockProvider, SharedStore};
use strata_operator::{Dependencies, LoggingProvider, Operators};
use strata_placement::DistributionNode;
use strata_storage::{CloseSyncCoordinator, Repository, StatisticsCache};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DATABASE_FILE: &str = "strata.redb";

#[derive(Parser, Debug)]
#[command(name = "strata-node")]
#[command(about = "Strata storage coordination node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    /// Node ID, overrides the configuration file
    #[arg(long)]
    node_id: Option<String>,

    /// Directory of the metadata database, overrides the configuration file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let json = args.json_logs;
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into()))
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();

    let config = load_config(&args)?;
    info!("Starting Strata node {}", config.node.node_id);

    if let Some(listen) = &config.metrics.listen {
        let addr: SocketAddr = listen
            .parse()
            .with_context(|| format!("invalid metrics listen address \"{listen}\""))?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("cannot install the Prometheus exporter")?;
        strata_operator::metrics::register_metrics();
        info!("Metrics endpoint on http://{addr}/metrics");
    }

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let (store, reaper) = open_store(&config, &cancel).await?;

    let locks = LockProvider::new(Arc::clone(&store), config.node.node_id.clone(), config.lock);
    let keep_alive = locks.spawn_keep_alive(cancel.clone());

    let statistics = StatisticsCache::start(Arc::clone(&store), cancel.clone(), &tracker)
        .await
        .context("cannot start the statistics cache")?;
    let sinks = Dependencies::sinks_mirror(&store, cancel.clone(), &tracker)
        .await
        .context("cannot start the sinks mirror")?;

    let clock: SharedClock = Arc::new(SystemClock);
    let deps = Dependencies {
        clock,
        store: Arc::clone(&store),
        repository: Repository::new(Arc::clone(&store), config.storage.clone()),
        statistics: Arc::new(statistics),
        sinks,
        close_sync: Arc::new(CloseSyncCoordinator::new(Arc::clone(&store))),
        locks: Arc::clone(&locks),
        distribution: DistributionNode::new(
            Arc::clone(&store),
            config.node.node_id.clone(),
            &config.distribution,
            cancel.clone(),
        ),
        uploader: Arc::new(LoggingProvider),
        importer: Arc::new(LoggingProvider),
        cancel: cancel.clone(),
        tracker: tracker.clone(),
        stop: CancellationToken::new(),
        workers: TaskTracker::new(),
    };

    let operators = Operators::start(&deps, &config.operator, &config.metadata_cleanup)
        .await
        .context("cannot start operators")?;
    info!("Strata node is ready");

    tokio::signal::ctrl_c().await.context("cannot listen for shutdown signal")?;
    info!("Shutting down...");

    // Running checks end while the mirrors they wait on are still up
    operators.shutdown().await;

    cancel.cancel();
    tracker.close();
    tracker.wait().await;

    // Release ownership before the leases expire so other nodes take over early
    operators.slice_rotation.group().close().await;
    operators.slice_upload.group().close().await;
    operators.file_rotation.group().close().await;
    operators.file_import.group().close().await;
    operators.metadata_cleanup.group().close().await;
    locks.close().await;

    for task in std::iter::once(keep_alive).chain(reaper) {
        if let Err(e) = task.await {
            error!("Background task failed: {e}");
        }
    }
    info!("Strata node stopped");
    Ok(())
}

/// Defaults, then the optional file, then `STRATA__SECTION__KEY` variables
fn load_config(args: &Args) -> Result<Config> {
    let mut builder = config::Config::builder();
    if let Some(path) = &args.config {
        builder = builder.add_source(config::File::from(path.as_path()));
    }
    let mut config: Config = builder
        .add_source(
            config::Environment::with_prefix("STRATA")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("cannot load configuration")?
        .try_deserialize()
        .context("invalid configuration")?;

    if let Some(node_id) = &args.node_id {
        config.node.node_id.clone_from(node_id);
    }
    if let Some(data_dir) = &args.data_dir {
        config.node.data_dir = Some(data_dir.clone());
    }
    config.validate()?;
    Ok(config)
}

/// Open the configured metadata store; the embedded one comes with its lease reaper
async fn open_store(config: &Config, cancel: &CancellationToken) -> Result<(SharedStore, Option<JoinHandle<()>>)> {
    match config.store.backend {
        StoreBackend::Embedded => {
            let embedded = Arc::new(open_embedded(config)?);
            let reaper = embedded.spawn_lease_reaper(config.node.lease_reaper_interval(), cancel.clone());
            let store: SharedStore = embedded;
            Ok((store, Some(reaper)))
        }
        StoreBackend::Etcd => Ok((connect_etcd(config).await?, None)),
    }
}

fn open_embedded(config: &Config) -> Result<KvStore> {
    let Some(dir) = &config.node.data_dir else {
        info!("Using an in-memory metadata store");
        return Ok(KvStore::new());
    };
    std::fs::create_dir_all(dir).with_context(|| format!("cannot create data directory {}", dir.display()))?;
    let path = dir.join(DATABASE_FILE);
    info!("Opening metadata store at {}", path.display());
    KvStore::open(&path).with_context(|| format!("cannot open metadata store {}", path.display()))
}

#[cfg(feature = "etcd")]
async fn connect_etcd(config: &Config) -> Result<SharedStore> {
    let store = strata_meta_store::etcd::EtcdStore::connect(&config.store)
        .await
        .context("cannot connect to etcd")?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "etcd"))]
async fn connect_etcd(_config: &Config) -> Result<SharedStore> {
    anyhow::bail!("the etcd store backend requires the node to be built with the \"etcd\" feature")
}
