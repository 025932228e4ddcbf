//! Project and pipeline listing commands.

use anyhow::Result;

use scanrun::run::db::RunFilter;
use scanrun::run::pipeline::PipelineRegistry;

use super::super::ProjectCommands;
use super::{App, find_project};

pub fn cmd_project(app: &App, command: ProjectCommands) -> Result<()> {
    let db = app.db.lock_sync()?;

    match command {
        ProjectCommands::Create { name } => {
            let project = db.create_project(&name)?;
            println!("Created project '{}' ({})", project.name, project.uuid);
        }
        ProjectCommands::List => {
            let projects = db.list_projects()?;
            if projects.is_empty() {
                println!("No projects.");
                return Ok(());
            }
            for project in projects {
                let runs = db.list_runs(project.uuid, None)?.len();
                let in_flight = db.count_runs(project.uuid, RunFilter::QueuedOrRunning)?;
                println!(
                    "{}  {:<24} {} run(s), {} in flight",
                    project.uuid, project.name, runs, in_flight
                );
            }
        }
        ProjectCommands::Delete { project } => {
            let project = find_project(&db, &project)?;
            app.service.delete_project(&db, project.uuid)?;
            println!("Deleted project '{}'", project.name);
        }
        ProjectCommands::Webhook { project, url } => {
            let project = find_project(&db, &project)?;
            let subscription = db.add_webhook_subscription(project.uuid, &url)?;
            println!(
                "Subscribed {} to runs of '{}' ({})",
                subscription.target_url, project.name, subscription.uuid
            );
        }
    }

    Ok(())
}

pub fn cmd_pipelines() {
    let registry = PipelineRegistry::with_builtins();
    for pipeline in registry.iter() {
        println!("{}", pipeline.name());
        if !pipeline.description().is_empty() {
            println!("  {}", pipeline.description());
        }
        for step in pipeline.graph() {
            if step.doc.is_empty() {
                println!("  - {}", step.name);
            } else {
                println!("  - {}: {}", step.name, step.doc);
            }
        }
    }
}
