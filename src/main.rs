use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use fleetd::activator::Activator;
use fleetd::config::Config;
use fleetd::daemon::{DaemonClient, DaemonServer, ExecTargetRef, LeaseHandle};
use fleetd::exec::{ExecRunner, TcpNodeClient};
use fleetd::launcher::DeploymentLauncher;
use fleetd::reconciler;
use fleetd::scheduler::Scheduler;
use fleetd::store::{EntityStore, MemoryStore};

#[derive(Parser)]
#[command(name = "fleetd")]
#[command(about = "Orchestrate app workloads as sandboxed containers across a fleet of nodes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator: reconcilers, activator, RPC server
    Serve {
        /// Path to fleetd.toml
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Acquire a lease on a running sandbox
    Acquire {
        /// AppVersion id (e.g. appVersion/v1)
        version: String,
        #[arg(short, long, default_value = "web")]
        service: String,
        /// Deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Release a lease (pass the JSON handle printed by acquire)
    Release {
        lease: String,
    },
    /// Renew a lease (pass the JSON handle printed by acquire)
    Renew {
        lease: String,
    },
    /// Execute a command in a sandbox, or in a one-off sandbox of an app
    Exec {
        /// App id; runs in a fresh ephemeral sandbox of its active version
        #[arg(long, conflicts_with = "sandbox")]
        app: Option<String>,
        /// Existing sandbox id
        #[arg(long)]
        sandbox: Option<String>,
        /// Command to execute
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Show tracked pools and their capacity
    Status,
    /// Stop a running daemon
    Shutdown,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config } => serve(config).await,
        Commands::Acquire {
            version,
            service,
            timeout_ms,
        } => {
            let client = DaemonClient::new();
            let lease = client.acquire_lease(&version, &service, timeout_ms).await?;
            println!("{}", serde_json::to_string_pretty(&lease)?);
            Ok(())
        }
        Commands::Release { lease } => {
            let lease: LeaseHandle = serde_json::from_str(&lease)?;
            DaemonClient::new().release_lease(lease).await?;
            println!("released");
            Ok(())
        }
        Commands::Renew { lease } => {
            let lease: LeaseHandle = serde_json::from_str(&lease)?;
            let lease = DaemonClient::new().renew_lease(lease).await?;
            println!("{}", serde_json::to_string_pretty(&lease)?);
            Ok(())
        }
        Commands::Exec {
            app,
            sandbox,
            command,
        } => {
            let target = match (app, sandbox) {
                (Some(app), None) => ExecTargetRef::App(app),
                (None, Some(sandbox)) => ExecTargetRef::Sandbox(sandbox),
                _ => bail!("pass exactly one of --app or --sandbox"),
            };
            let code = DaemonClient::new().exec(target, command).await?;
            std::process::exit(code);
        }
        Commands::Status => {
            let pools = DaemonClient::new().status().await?;
            if pools.is_empty() {
                println!("no tracked pools");
                return Ok(());
            }
            for p in pools {
                println!(
                    "{}  service={} version={} desired={} running={} starting={} terminal={} slots={}/{}",
                    p.pool,
                    p.service,
                    p.version,
                    p.desired_instances
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                    p.running,
                    p.starting,
                    p.terminal,
                    p.slots_used,
                    p.slots_max,
                );
            }
            Ok(())
        }
        Commands::Shutdown => {
            DaemonClient::new().shutdown().await?;
            println!("daemon shutting down");
            Ok(())
        }
    }
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let config = Config::load(config_path.as_deref())?;
    if let Some(address) = &config.store.address {
        warn!(%address, "external store adapters are not wired in this build; using the in-process store");
    }
    let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());

    let scheduler = Arc::new(Scheduler::new(&store).await);
    let node_tracker = Arc::new(scheduler.node_tracker());
    let launcher = Arc::new(DeploymentLauncher::new());
    let mut tasks = vec![
        reconciler::spawn(Arc::clone(&store), node_tracker),
        reconciler::spawn(Arc::clone(&store), scheduler),
        reconciler::spawn(Arc::clone(&store), launcher),
    ];

    let activator = Activator::new(Arc::clone(&store), config.activator.to_activator_config()).await?;
    activator.start();

    let exec = Arc::new(ExecRunner::new(
        Arc::clone(&store),
        Arc::new(TcpNodeClient::new()),
    ));
    let mut server = DaemonServer::new(Arc::clone(&activator), exec);
    if let Some(path) = config.daemon.socket_path.clone() {
        server = server.with_socket_path(path);
    }

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    activator.shutdown();
    for task in tasks.drain(..) {
        task.abort();
    }
    Ok(())
}
