//! upkeep - Command-line client for upkeepd
//!
//! Every command reconnects with the saved credential bundle, loads the
//! planner, applies one change and waits for it to be saved.

mod client;
mod render;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use upkeep_config::load_config_or_default;
use upkeep_core::{CompletionForm, Session, TaskForm};
use upkeep_util::{ActiveMonths, default_config_path};

use crate::client::DaemonClient;

/// upkeep - Track recurring household tasks
#[derive(Parser, Debug)]
#[command(name = "upkeep")]
#[command(about = "Command-line client for upkeepd", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/upkeep/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path for upkeepd connection (or set UPKEEP_SOCKET env var)
    #[arg(short, long, env = "UPKEEP_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory for saved credentials (or set UPKEEP_DATA_DIR env var)
    #[arg(short, long, env = "UPKEEP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Log in and remember the account on this machine
    Login {
        username: String,

        /// Password (or set UPKEEP_PASSWORD env var)
        #[arg(long, env = "UPKEEP_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Forget the saved account
    Logout,

    /// Show every category and task with its status
    Tree,

    /// Add a task
    AddTask {
        name: String,

        /// Category path to add it under, e.g. `Garden`
        #[arg(long)]
        parent: Option<String>,

        /// Days between repetitions
        #[arg(long, default_value = "")]
        frequency: String,

        /// Manual due date, YYYY-MM-DD
        #[arg(long, default_value = "")]
        due: String,

        /// Days before the due date the task counts as upcoming
        #[arg(long, default_value = "")]
        upcoming: String,

        /// Days after the due date before the task is overdue
        #[arg(long, default_value = "")]
        grace: String,

        /// Months the task is in season, e.g. `--months 4,5,6`
        #[arg(long, value_delimiter = ',')]
        months: Vec<u32>,

        #[arg(long, default_value = "")]
        notes: String,
    },

    /// Add a category
    AddCategory {
        name: String,

        /// Category path to add it under
        #[arg(long)]
        parent: Option<String>,
    },

    /// Rename a category
    RenameCategory { path: String, name: String },

    /// Delete a task, or a category (its items move up a level)
    Delete { path: String },

    /// Move an item within the tree
    Move {
        path: String,

        #[arg(value_enum)]
        direction: Direction,
    },

    /// Record a completion of a task
    Complete {
        path: String,

        /// Completion date, YYYY-MM-DD; prefix with `~` if approximate
        #[arg(long, default_value = "")]
        date: String,

        #[arg(long, default_value = "")]
        notes: String,
    },

    /// Show every completion of a task
    History { path: String },

    /// Change the account password and re-encrypt everything
    ChangePassword {
        #[arg(long, env = "UPKEEP_PASSWORD", hide_env_values = true)]
        old_password: String,

        #[arg(long, env = "UPKEEP_NEW_PASSWORD", hide_env_values = true)]
        new_password: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Direction {
    Up,
    Down,
    /// Into the category just below
    In,
    /// Out of the enclosing category
    Out,
}

fn task_form(
    name: String,
    frequency: String,
    due: String,
    upcoming: String,
    grace: String,
    months: Vec<u32>,
    notes: String,
) -> Result<TaskForm> {
    let active_months = if months.is_empty() {
        None
    } else {
        Some(ActiveMonths::only(&months).context("Invalid --months")?)
    };
    Ok(TaskForm {
        name,
        frequency,
        due_date: due,
        upcoming_period: upcoming,
        grace_period: grace,
        active_months,
        notes,
    })
}

/// Wait for queued saves and report how they went
async fn finish(session: &Session) -> Result<()> {
    session.settled().await?;
    println!("{}", session.save_state().label());
    Ok(())
}

async fn run(client: &DaemonClient, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::Login { username, password } => {
            let bundle = client.log_in(&username, &password).await?;
            println!("Logged in as {}", bundle.username);
        }
        CliCommand::Logout => {
            client.log_out()?;
            println!("Logged out");
        }
        command => {
            let mut session = client.open_session().await?;
            edit(client, &mut session, command).await?;
        }
    }
    Ok(())
}

async fn edit(client: &DaemonClient, session: &mut Session, command: CliCommand) -> Result<()> {
    match command {
        // Handled by `run` before a session opens
        CliCommand::Login { .. } | CliCommand::Logout => {}
        CliCommand::Tree => {
            print!("{}", render::render_tree(session.tree(), session.today()));
        }
        CliCommand::AddTask {
            name,
            parent,
            frequency,
            due,
            upcoming,
            grace,
            months,
            notes,
        } => {
            let parent = render::resolve_parent(session.tree(), parent.as_deref())?;
            let form = task_form(name, frequency, due, upcoming, grace, months, notes)?;
            session.create_task(parent, &form, None)?;
            finish(session).await?;
        }
        CliCommand::AddCategory { name, parent } => {
            let parent = render::resolve_parent(session.tree(), parent.as_deref())?;
            session.create_category(parent, &name, None)?;
            finish(session).await?;
        }
        CliCommand::RenameCategory { path, name } => {
            let item = render::resolve(session.tree(), &path)?;
            session.rename_category(item, &name)?;
            finish(session).await?;
        }
        CliCommand::Delete { path } => {
            let item = render::resolve(session.tree(), &path)?;
            if session.tree().category(item).is_ok() {
                session.delete_category(item)?;
            } else {
                session.delete_task(item)?;
            }
            finish(session).await?;
        }
        CliCommand::Move { path, direction } => {
            let item = render::resolve(session.tree(), &path)?;
            let moved = match direction {
                Direction::Up => session.move_up(item)?,
                Direction::Down => session.move_down(item)?,
                Direction::In => session.enter_category(item)?,
                Direction::Out => session.exit_category(item)?,
            };
            if !moved {
                bail!("'{path}' cannot move {direction:?}");
            }
            finish(session).await?;
        }
        CliCommand::Complete { path, date, notes } => {
            let item = render::resolve(session.tree(), &path)?;
            session
                .record_completion(item, &CompletionForm { date, notes })
                .await?;
            finish(session).await?;
        }
        CliCommand::History { path } => {
            let item = render::resolve(session.tree(), &path)?;
            session.load_old_completions(&[item]).await?;
            print!("{}", render::render_history(session.tree().task(item)?));
        }
        CliCommand::ChangePassword {
            old_password,
            new_password,
        } => {
            session
                .change_password(&old_password, &new_password, client.credentials())
                .await?;
            println!("Password changed");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut settings = load_config_or_default(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?
        .client;
    if let Some(socket) = args.socket {
        settings.socket_path = socket;
    }
    if let Some(data_dir) = args.data_dir {
        settings.data_dir = data_dir;
    }

    let client = DaemonClient::new(settings);
    run(&client, args.command).await
}
