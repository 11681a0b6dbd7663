use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cron_lite::config::{MasterConfig, StoreBackend, StoreConfig, WorkerConfig};
use cron_lite::logs;
use cron_lite::node::{MasterNode, WorkerNode};
use cron_lite::shutdown::install_shutdown_handler;
use cron_lite::store::{self, MemStore, SharedStore};

#[derive(Parser, Debug)]
#[command(name = "cron-lite")]
#[command(version)]
#[command(about = "A distributed cron scheduler coordinated through etcd")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a worker node
    Worker(WorkerArgs),

    /// Run the control-plane HTTP API
    Master(MasterArgs),

    /// Run the API and one worker in a single process over an in-memory store
    Standalone(StandaloneArgs),
}

#[derive(clap::Args, Debug)]
struct StoreArgs {
    /// Coordination store backend
    #[arg(long, value_enum)]
    backend: Option<StoreBackend>,

    /// etcd endpoints (comma-separated)
    #[arg(long, value_delimiter = ',')]
    endpoints: Vec<String>,
}

impl StoreArgs {
    fn apply(self, config: &mut StoreConfig) {
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if !self.endpoints.is_empty() {
            config.endpoints = self.endpoints;
        }
    }
}

#[derive(clap::Args, Debug)]
struct WorkerArgs {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    store: StoreArgs,

    /// Address published under /cron/workers/ (detected when omitted)
    #[arg(long)]
    advertise_addr: Option<String>,

    /// SQLite file for execution logs (in memory when omitted)
    #[arg(long)]
    log_db: Option<PathBuf>,

    /// Shell used to run job commands
    #[arg(long)]
    shell: Option<String>,
}

#[derive(clap::Args, Debug)]
struct MasterArgs {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    store: StoreArgs,

    /// Address to serve the API on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// SQLite file for execution logs (in memory when omitted)
    #[arg(long)]
    log_db: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct StandaloneArgs {
    /// Address to serve the API on
    #[arg(long, default_value = "127.0.0.1:8070")]
    listen: SocketAddr,

    /// SQLite file for execution logs (in memory when omitted)
    #[arg(long)]
    log_db: Option<PathBuf>,
}

fn load_worker_config(args: WorkerArgs) -> cron_lite::Result<WorkerConfig> {
    let mut config = match &args.config {
        Some(path) => WorkerConfig::load(path)?,
        None => WorkerConfig::default(),
    };
    args.store.apply(&mut config.store);
    if args.advertise_addr.is_some() {
        config.advertise_addr = args.advertise_addr;
    }
    if args.log_db.is_some() {
        config.log_store.sqlite_path = args.log_db;
    }
    if let Some(shell) = args.shell {
        config.shell = shell;
    }
    Ok(config)
}

fn load_master_config(args: MasterArgs) -> cron_lite::Result<MasterConfig> {
    let mut config = match &args.config {
        Some(path) => MasterConfig::load(path)?,
        None => MasterConfig::default(),
    };
    args.store.apply(&mut config.store);
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if args.log_db.is_some() {
        config.log_store.sqlite_path = args.log_db;
    }
    Ok(config)
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_worker_config(args)?;
    let shutdown = install_shutdown_handler()?;

    tracing::info!(
        backend = ?config.store.backend,
        endpoints = ?config.store.endpoints,
        lock_ttl_secs = config.lock_ttl_secs,
        "Starting cron-lite worker"
    );

    let store = store::connect(&config.store).await?;
    let log_store = logs::open(&config.log_store)?;

    WorkerNode::new(config, store, log_store)
        .run(shutdown)
        .await?;
    Ok(())
}

async fn run_master(args: MasterArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_master_config(args)?;
    let shutdown = install_shutdown_handler()?;

    tracing::info!(
        backend = ?config.store.backend,
        listen_addr = %config.listen_addr,
        "Starting cron-lite master"
    );

    let store = store::connect(&config.store).await?;
    let log_store = logs::open(&config.log_store)?;

    MasterNode::new(config, store, log_store)
        .run(shutdown)
        .await?;
    Ok(())
}

async fn run_standalone(args: StandaloneArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler()?;

    let store: SharedStore = Arc::new(MemStore::new());

    let mut master_config = MasterConfig {
        listen_addr: args.listen,
        ..MasterConfig::default()
    };
    master_config.log_store.sqlite_path = args.log_db;

    let mut worker_config = WorkerConfig {
        advertise_addr: Some(args.listen.ip().to_string()),
        ..WorkerConfig::default()
    };
    worker_config.log_store = master_config.log_store.clone();

    // Master and worker share one log store so the API sees the worker's logs.
    let log_store = logs::open(&master_config.log_store)?;

    tracing::info!(listen_addr = %args.listen, "Starting cron-lite standalone");

    let master = MasterNode::new(master_config, store.clone(), log_store.clone());
    let worker = WorkerNode::new(worker_config, store, log_store);

    let mut master_task = tokio::spawn(master.run(shutdown.clone()));
    let mut worker_task = tokio::spawn(worker.run(shutdown.clone()));

    // Whichever side stops first takes the other down with it.
    let (first, other) = tokio::select! {
        joined = &mut master_task => (joined, worker_task),
        joined = &mut worker_task => (joined, master_task),
    };
    shutdown.cancel();
    let second = other.await;

    first??;
    second??;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::Master(master_args) => run_master(master_args).await?,
        Commands::Standalone(standalone_args) => run_standalone(standalone_args).await?,
    }

    Ok(())
}
