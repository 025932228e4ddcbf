//! Run lifecycle commands: `scanrun run ...`.

use anyhow::{Result, bail};

use scanrun::run::models::{Run, RunStatus, format_profile};

use super::super::RunCommands;
use super::{App, find_project, parse_run_id};

pub fn cmd_run(app: &App, command: RunCommands) -> Result<()> {
    let db = app.db.lock_sync()?;
    let service = &app.service;

    match command {
        RunCommands::Add {
            project,
            pipeline,
            execute,
        } => {
            let project = find_project(&db, &project)?;
            let run = service.add_pipeline(&db, project.uuid, &pipeline, execute)?;
            println!(
                "Added run {} ({}) to '{}': {}",
                run.uuid,
                run.pipeline_name,
                project.name,
                run.status()
            );
        }
        RunCommands::List { project, status } => {
            let project = find_project(&db, &project)?;
            let wanted = status
                .as_deref()
                .map(|s| s.parse::<RunStatus>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let runs: Vec<Run> = db
                .list_runs(project.uuid, None)?
                .into_iter()
                .filter(|run| wanted.is_none_or(|s| run.status() == s))
                .collect();
            if runs.is_empty() {
                println!("No runs.");
                return Ok(());
            }
            for run in &runs {
                println!(
                    "{}  {:<16} {:<12} {}",
                    run.uuid,
                    run.pipeline_name,
                    run.status(),
                    run.execution_time_for_display().unwrap_or_default()
                );
            }
        }
        RunCommands::Show { run } => {
            let run = db.require_run(parse_run_id(&run)?)?;
            print_run(&run);
        }
        RunCommands::Start { run } => {
            let run_id = parse_run_id(&run)?;
            match service.start(&db, run_id)? {
                Some(job) => println!("Run {} queued as job {}", run_id, job.id),
                None => {
                    let run = db.require_run(run_id)?;
                    println!("Run {} finished: {}", run_id, run.status());
                }
            }
        }
        RunCommands::Stop { run } => {
            let run = service.stop(&db, parse_run_id(&run)?)?;
            println!("Run {} is now {}", run.uuid, run.status());
        }
        RunCommands::Delete { run } => {
            let run_id = parse_run_id(&run)?;
            service.delete(&db, run_id)?;
            println!("Deleted run {}", run_id);
        }
        RunCommands::Sync { run: Some(run) } => {
            let run_id = parse_run_id(&run)?;
            let repair = service.reconcile(&db, run_id)?;
            println!("{}  {}", run_id, repair.as_str());
        }
        RunCommands::Sync { run: None } => {
            let repairs = service.reconcile_all(&db)?;
            if repairs.is_empty() {
                println!("No queued or running runs.");
            }
            for (run_id, repair) in repairs {
                println!("{}  {}", run_id, repair.as_str());
            }
        }
        RunCommands::Log { run } => {
            let run = db.require_run(parse_run_id(&run)?)?;
            print!("{}", run.log);
        }
        RunCommands::Profile { run } => {
            let run = db.require_run(parse_run_id(&run)?)?;
            let Some(timings) = run.profile() else {
                bail!("Run {} has not succeeded, no profile available", run.uuid);
            };
            for line in format_profile(&timings) {
                println!("{}", line);
            }
        }
    }

    Ok(())
}

fn print_run(run: &Run) {
    println!("Run:            {}", run.uuid);
    println!("Pipeline:       {}", run.pipeline_name);
    if !run.description.is_empty() {
        println!("Description:    {}", run.description);
    }
    println!("Project:        {}", run.project_id);
    println!("Status:         {}", run.status());
    println!("Created:        {}", run.created_date.to_rfc3339());
    if let Some(task_id) = &run.task.task_id {
        println!("Task id:        {}", task_id);
    }
    if let Some(start) = run.task.task_start_date {
        println!("Started:        {}", start.to_rfc3339());
    }
    if let Some(end) = run.task.task_end_date {
        println!("Ended:          {}", end.to_rfc3339());
    }
    if let Some(code) = run.task.task_exitcode {
        println!("Exit code:      {}", code);
    }
    if let Some(elapsed) = run.execution_time_for_display() {
        println!("Execution time: {}", elapsed);
    }
    if !run.runner_version.is_empty() {
        println!("Runner version: {}", run.runner_version);
    }
    if !run.current_step.is_empty() {
        println!("Current step:   {}", run.current_step);
    }
    if !run.task_output.is_empty() {
        println!();
        println!("{}", run.task_output);
    }
}
