//! upkeepd - The upkeep account server
//!
//! This is the main entry point for the upkeepd service.
//! It wires together all the components:
//! - Configuration loading
//! - Store initialization
//! - Account service and per-account job queues
//! - IPC server and signal handling

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use upkeep_config::{ServerSettings, load_config_or_default};
use upkeep_core::{generate_salt, hash_password};
use upkeep_ipc::IpcServer;
use upkeep_store::{AccountRepository, NewAccount, SqliteStore};
use upkeep_util::{database_path, default_config_path};
use upkeepd::{AccountService, Daemon};

/// upkeepd - Encrypted storage server for upkeep planners
#[derive(Parser, Debug)]
#[command(name = "upkeepd")]
#[command(about = "Encrypted storage server for upkeep planners", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/upkeep/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set UPKEEP_SOCKET env var)
    #[arg(short, long, env = "UPKEEP_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory override (or set UPKEEP_DATA_DIR env var)
    #[arg(short, long, env = "UPKEEP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<AdminCommand>,
}

#[derive(Subcommand, Debug)]
enum AdminCommand {
    /// Provision an account and exit
    CreateAccount {
        username: String,

        /// Contact address stored with the account
        #[arg(long)]
        email: Option<String>,

        /// Initial password (or set UPKEEP_PASSWORD env var)
        #[arg(long, env = "UPKEEP_PASSWORD", hide_env_values = true)]
        password: String,
    },
}

async fn serve(settings: &ServerSettings, accounts: AccountRepository) -> Result<()> {
    let mut ipc = IpcServer::new(&settings.socket_path);
    ipc.start().await?;
    info!(
        socket_path = %settings.socket_path.display(),
        job_timeout_secs = settings.job_timeout.as_secs(),
        "IPC server started"
    );

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to create SIGHUP handler")?;

    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
            _ = sighup.recv() => info!("Received SIGHUP, shutting down gracefully"),
        }
    };

    let service = Arc::new(AccountService::new(accounts, settings.job_timeout));
    Daemon::new(service, ipc).run_until(shutdown).await?;
    Ok(())
}

fn create_account(
    accounts: &AccountRepository,
    username: String,
    email: Option<String>,
    password: &str,
) -> Result<()> {
    let auth_salt = generate_salt();
    let auth_hash = hash_password(password, &auth_salt);
    let record = accounts.create_account(NewAccount {
        username,
        email_address: email,
        auth_salt,
        auth_hash,
        key_salt: generate_salt(),
    })?;
    println!("Created account '{}'", record.username);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "upkeepd starting");

    let mut settings = load_config_or_default(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?
        .server;
    if let Some(socket) = args.socket {
        settings.socket_path = socket;
    }
    if let Some(data_dir) = args.data_dir {
        settings.data_dir = data_dir;
    }

    std::fs::create_dir_all(&settings.data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", settings.data_dir))?;

    let db_path = database_path(&settings.data_dir);
    let store = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("Failed to open database {:?}", db_path))?,
    );
    let accounts = AccountRepository::new(store);
    if !accounts.is_healthy() {
        warn!(db_path = %db_path.display(), "Store health check failed");
    }
    info!(db_path = %db_path.display(), "Store initialized");

    match args.command {
        Some(AdminCommand::CreateAccount {
            username,
            email,
            password,
        }) => create_account(&accounts, username, email, &password),
        None => serve(&settings, accounts).await,
    }
}
