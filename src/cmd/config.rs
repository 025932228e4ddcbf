//! Configuration commands: `scanrun init` and `scanrun config`.

use anyhow::{Context, Result};
use std::path::Path;

use scanrun::config::{CONFIG_FILE, ScanrunConfig};
use scanrun::run::db::RunDb;
use scanrun::run::queue::SqliteJobQueue;

use super::super::{Cli, ConfigCommands};

/// Resolve the configuration (file, `.env`, environment) and apply the
/// global CLI overrides on top.
pub fn load_config(project_dir: &Path, cli: &Cli) -> Result<ScanrunConfig> {
    let mut config = ScanrunConfig::resolve(project_dir)?;
    if cli.async_mode {
        config.execution.async_mode = true;
    }
    if let Some(path) = &cli.db_path {
        config.database.path = path.clone();
    }
    Ok(config)
}

pub fn cmd_init(project_dir: &Path, config: &ScanrunConfig, force: bool) -> Result<()> {
    let config_path = project_dir.join(CONFIG_FILE);
    if config_path.exists() && !force {
        println!("Config already exists at {}", config_path.display());
    } else {
        std::fs::create_dir_all(project_dir).with_context(|| {
            format!("Failed to create project directory {}", project_dir.display())
        })?;
        std::fs::write(&config_path, config.to_toml_string()?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("Wrote {}", config_path.display());
    }

    let db_path = config.db_path(project_dir);
    RunDb::new(&db_path)?;
    println!("Run database: {}", db_path.display());

    if config.execution.async_mode {
        let queue_path = config.queue_path(project_dir);
        SqliteJobQueue::open(&queue_path)?;
        println!("Job queue:    {}", queue_path.display());
    }

    println!();
    println!("Next steps:");
    println!("  1. scanrun project create <name>");
    println!("  2. scanrun run add <name> <pipeline> --execute");
    Ok(())
}

pub fn cmd_config(
    project_dir: &Path,
    config: &ScanrunConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let config_path = project_dir.join(CONFIG_FILE);
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No {} found, using defaults", config_path.display());
            }
            println!("# Effective values (with env/CLI overrides):");
            println!();
            print!("{}", config.to_toml_string()?);
        }
    }
    Ok(())
}
