//! tsmon: team server log stream monitor.
//!
//! Thin CLI over `tsmon_core`: registers team servers, runs the poller
//! supervisor, and reports mirror status.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tsmon_core::client::{self, ScriptingClient};
use tsmon_core::config::Config;
use tsmon_core::lock::{self, SupervisorLock};
use tsmon_core::poller::PollerSupervisor;
use tsmon_core::storage::{NewTeamServer, StorageHandle};

#[derive(Parser)]
#[command(name = "tsmon", version, about = "Mirror C2 team server activity into SQLite")]
struct Cli {
    /// Path to the config file.
    #[arg(long, global = true, env = "TSMON_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run pollers for every active team server until interrupted.
    Watch,
    /// Run a poller for a single team server until interrupted.
    Poll {
        /// Team server id.
        id: i64,
    },
    /// Manage registered team servers.
    Servers {
        #[command(subcommand)]
        command: ServersCommand,
    },
    /// Probe a team server: TCP reachability plus a throwaway client sync.
    Healthcheck {
        /// Team server id.
        id: i64,
        /// Per-phase timeout in seconds.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Show mirror row counts and supervisor state.
    Status,
}

#[derive(Subcommand)]
enum ServersCommand {
    /// Register a team server.
    Add {
        /// Free-form description shown in listings.
        #[arg(long)]
        description: String,
        /// Team server hostname or address.
        #[arg(long)]
        host: String,
        /// Team server port.
        #[arg(long, default_value_t = 50050)]
        port: u16,
        /// Connection password.
        #[arg(long)]
        password: String,
    },
    /// List registered team servers.
    List,
    /// Mark a server active so the supervisor polls it.
    Enable { id: i64 },
    /// Mark a server inactive; its poller stops within seconds.
    Disable { id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tsmon=info,tsmon_core=info")),
        )
        .with_target(false)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    match cli.command {
        Command::Watch => watch(&config, None).await,
        Command::Poll { id } => watch(&config, Some(id)).await,
        Command::Servers { command } => servers(&config, command).await,
        Command::Healthcheck { id, timeout } => healthcheck(&config, id, timeout).await,
        Command::Status => status(&config).await,
    }
}

async fn open_storage(config: &Config) -> anyhow::Result<StorageHandle> {
    let db_path = config.db_path();
    StorageHandle::new(&db_path.display().to_string())
        .await
        .with_context(|| format!("opening database at {}", db_path.display()))
}

async fn watch(config: &Config, only: Option<i64>) -> anyhow::Result<()> {
    let _lock = SupervisorLock::acquire(&config.lock_path())
        .context("another supervisor is already running")?;

    let storage = open_storage(config).await?;
    let supervisor = PollerSupervisor::new(
        storage.clone(),
        config.poller.clone(),
        config.client.clone(),
    );

    match only {
        Some(id) => supervisor.add(id).await?,
        None => supervisor.start_all().await?,
    }

    info!(servers = ?supervisor.running(), "Supervisor running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutting down");

    supervisor.shutdown().await?;
    storage.shutdown().await?;
    Ok(())
}

async fn servers(config: &Config, command: ServersCommand) -> anyhow::Result<()> {
    let storage = open_storage(config).await?;
    match command {
        ServersCommand::Add {
            description,
            host,
            port,
            password,
        } => {
            let id = storage
                .add_team_server(NewTeamServer {
                    description,
                    hostname: host,
                    port,
                    password,
                })
                .await?;
            println!("Registered team server {id}");
        }
        ServersCommand::List => {
            let servers = storage.list_team_servers().await?;
            if servers.is_empty() {
                println!("No team servers registered");
            }
            for s in servers {
                println!(
                    "{:>4}  {:<8}  {}:{}  {}",
                    s.id,
                    if s.active { "active" } else { "disabled" },
                    s.hostname,
                    s.port,
                    s.description
                );
            }
        }
        ServersCommand::Enable { id } => {
            if !storage.set_team_server_active(id, true).await? {
                bail!("no team server with id {id}");
            }
            println!("Team server {id} enabled");
        }
        ServersCommand::Disable { id } => {
            if !storage.set_team_server_active(id, false).await? {
                bail!("no team server with id {id}");
            }
            println!("Team server {id} disabled");
        }
    }
    storage.shutdown().await?;
    Ok(())
}

async fn healthcheck(config: &Config, id: i64, timeout: u64) -> anyhow::Result<()> {
    let storage = open_storage(config).await?;
    let Some(server) = storage.get_team_server(id).await? else {
        bail!("no team server with id {id}");
    };
    storage.shutdown().await?;

    let client = ScriptingClient::new(config.client.clone());
    let report = client::healthcheck(&client, &server, Duration::from_secs(timeout)).await;

    match &report.tcp_error {
        Some(e) => println!("TCP {}:{}  FAILED: {e}", server.hostname, server.port),
        None => println!("TCP {}:{}  ok", server.hostname, server.port),
    }
    if let Some(output) = &report.client_output {
        println!(
            "Client sync: {}",
            if report.synchronized { "ok" } else { "FAILED" }
        );
        if !report.synchronized {
            print!("{output}");
        }
    }
    if report.tcp_error.is_some() || !report.synchronized {
        std::process::exit(1);
    }
    Ok(())
}

async fn status(config: &Config) -> anyhow::Result<()> {
    match lock::check_running(&config.lock_path()) {
        Some(meta) => println!(
            "Supervisor running (pid {}, since {})",
            meta.pid, meta.started_at_human
        ),
        None => println!("Supervisor not running"),
    }

    let storage = open_storage(config).await?;
    let counts = storage.counts().await?;
    println!("team servers: {}", counts.team_servers);
    println!("listeners:    {}", counts.listeners);
    println!("beacons:      {}", counts.beacons);
    println!("beacon logs:  {}", counts.beacon_logs);
    println!("actions:      {}", counts.actions);
    println!("archives:     {}", counts.archives);
    println!("credentials:  {}", counts.credentials);
    println!("downloads:    {}", counts.downloads);
    storage.shutdown().await?;
    Ok(())
}
