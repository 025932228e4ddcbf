use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use scanrun::errors::RunError;

mod cmd;

#[derive(Parser)]
#[command(name = "scanrun")]
#[command(version, about = "Sequential pipeline runs with job queue reconciliation")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding scanrun.toml and the databases (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Execute runs through the job queue. Overrides scanrun.toml and SCANRUN_ASYNC.
    #[arg(long = "async", global = true)]
    pub async_mode: bool,

    /// Run database path. Overrides scanrun.toml and SCANRUN_DB_PATH.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default scanrun.toml and create the databases
    Init {
        /// Overwrite an existing scanrun.toml
        #[arg(long)]
        force: bool,
    },
    /// View the effective configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Manage projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// List the registered pipelines and their steps
    Pipelines,
    /// Manage pipeline runs
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Execute queued runs
    Worker {
        /// Exit once the queue is empty
        #[arg(long)]
        burst: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration (file, environment and flags applied)
    Show,
}

#[derive(Subcommand, Clone)]
pub enum ProjectCommands {
    /// Create a project
    Create { name: String },
    /// List projects
    List,
    /// Delete a project and its runs
    Delete {
        /// Project name or uuid
        project: String,
    },
    /// Subscribe a URL to the project's end-of-run notifications
    Webhook {
        /// Project name or uuid
        project: String,
        url: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum RunCommands {
    /// Add a pipeline run to a project
    Add {
        /// Project name or uuid
        project: String,
        pipeline: String,
        /// Start the run right away when no earlier run is pending
        #[arg(long)]
        execute: bool,
    },
    /// List the runs of a project in execution order
    List {
        /// Project name or uuid
        project: String,
        /// Only show runs with this status
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one run
    Show { run: String },
    /// Start a run
    Start { run: String },
    /// Stop a queued or running run
    Stop { run: String },
    /// Delete a run that is not started or queued
    Delete { run: String },
    /// Reconcile one run, or every queued and running run, with the job queue
    Sync { run: Option<String> },
    /// Print the run log
    Log { run: String },
    /// Print per-step execution times of a succeeded run
    Profile { run: String },
}

/// Exit status for a command refused because the run is in the wrong state.
const EXIT_REFUSED: i32 = 2;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        let refused = e
            .downcast_ref::<RunError>()
            .is_some_and(RunError::is_precondition_violation);
        if refused {
            eprintln!("Refused: {}", e);
            std::process::exit(EXIT_REFUSED);
        }
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let config = cmd::load_config(&project_dir, &cli)?;
    scanrun::logging::init(&config.logging, cli.verbose);

    match &cli.command {
        Commands::Init { force } => cmd::cmd_init(&project_dir, &config, *force)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, &config, command.clone())?,
        Commands::Pipelines => cmd::cmd_pipelines(),
        Commands::Project { command } => {
            let app = cmd::App::open(&project_dir, config)?;
            let result = cmd::cmd_project(&app, command.clone());
            app.finish().await;
            result?;
        }
        Commands::Run { command } => {
            let app = cmd::App::open(&project_dir, config)?;
            let result = cmd::cmd_run(&app, command.clone());
            app.finish().await;
            result?;
        }
        Commands::Worker { burst } => {
            let app = cmd::App::open(&project_dir, config)?;
            cmd::cmd_worker(app, *burst).await?;
        }
    }

    Ok(())
}
