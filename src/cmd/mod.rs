//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                |
//! |-----------|---------------------------------|
//! | `config`  | `Init`, `Config`                |
//! | `project` | `Project`, `Pipelines`          |
//! | `run`     | `Run`                           |
//! | `worker`  | `Worker`                        |

pub mod config;
pub mod project;
pub mod run;
pub mod worker;

pub use config::{cmd_config, cmd_init, load_config};
pub use project::{cmd_pipelines, cmd_project};
pub use run::cmd_run;
pub use worker::cmd_worker;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use scanrun::config::ScanrunConfig;
use scanrun::run::db::{DbHandle, RunDb};
use scanrun::run::models::Project;
use scanrun::run::pipeline::PipelineRegistry;
use scanrun::run::queue::SqliteJobQueue;
use scanrun::run::webhook::{WebhookDispatcher, WebhookNotifier};
use scanrun::run::{ExecutionMode, RunService};

/// Everything a command needs: the opened databases, the service wired for
/// the configured execution mode, and the pending webhook notifications.
pub struct App {
    pub config: ScanrunConfig,
    pub db: DbHandle,
    pub service: RunService,
    pub queue: Option<Arc<SqliteJobQueue>>,
    dispatcher: WebhookDispatcher,
    notifications: mpsc::UnboundedReceiver<Uuid>,
}

impl App {
    pub fn open(project_dir: &Path, config: ScanrunConfig) -> Result<Self> {
        let db_path = config.db_path(project_dir);
        let db = DbHandle::new(
            RunDb::new(&db_path)
                .with_context(|| format!("Failed to open run database {}", db_path.display()))?,
        );

        let queue = if config.execution.async_mode {
            let queue_path = config.queue_path(project_dir);
            let queue = SqliteJobQueue::open(&queue_path)
                .with_context(|| format!("Failed to open job queue {}", queue_path.display()))?;
            Some(Arc::new(queue))
        } else {
            None
        };
        let mode = match &queue {
            Some(queue) => ExecutionMode::Async(queue.clone()),
            None => ExecutionMode::Sync,
        };

        let (notifier, notifications) = WebhookNotifier::channel();
        let service = RunService::new(
            mode,
            Arc::new(PipelineRegistry::with_builtins()),
            Arc::new(notifier),
        )
        .with_task_timeout(config.task_timeout());
        let dispatcher = WebhookDispatcher::new(db.clone(), config.webhook_timeout())?;

        Ok(Self {
            config,
            db,
            service,
            queue,
            dispatcher,
            notifications,
        })
    }

    /// Deliver the webhooks of runs that ended during the command.
    pub async fn finish(self) {
        let App {
            service,
            dispatcher,
            notifications,
            ..
        } = self;
        // The notifier lives in the service; dropping it closes the channel.
        drop(service);
        dispatcher.run(notifications, CancellationToken::new()).await;
    }
}

/// Find a project by uuid or by name.
pub fn find_project(db: &RunDb, key: &str) -> Result<Project> {
    let found = match Uuid::parse_str(key) {
        Ok(id) => db.get_project(id)?,
        Err(_) => db.get_project_by_name(key)?,
    };
    found.with_context(|| format!("Project '{}' not found", key))
}

pub fn parse_run_id(key: &str) -> Result<Uuid> {
    Uuid::parse_str(key).with_context(|| format!("Invalid run id '{}'", key))
}
