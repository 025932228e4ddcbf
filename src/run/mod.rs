//! Run lifecycle engine.
//!
//! ## Overview
//!
//! A project owns an ordered list of runs; each run executes one named
//! pipeline once. The run's status is never stored: it is derived from four
//! nullable task fields (`task_id`, `task_start_date`, `task_end_date`,
//! `task_exitcode`) that only the recorder writes. Runs of one project execute
//! strictly one after the other, in creation order. Execution happens either
//! inline in the caller (sync mode) or in a worker fed by a job queue
//! (async mode), in which case the queue and the run table can drift apart
//! after a crash and the reconciler repairs them.
//!
//! ## Module Map
//!
//! ```text
//!   cli / caller
//!        │
//!        v
//!  ┌──────────────────────────── RunService ────────────────────────────┐
//!  │ gate.rs       can_start, start, add_pipeline, start_next_run       │
//!  │ reconcile.rs  reconcile, reconcile_all (queue vs. run table)       │
//!  │ control.rs    stop, delete, delete_project                         │
//!  │ worker.rs     execute_pipeline_task, Worker (dequeue loop)         │
//!  └───────┬──────────────────────┬─────────────────────────┬───────────┘
//!          │                      │                         │
//!          v                      v                         v
//!   recorder.rs             queue.rs                  pipeline.rs
//!   field-scoped writes     JobQueue trait,           Pipeline, Step,
//!   + notifications         SqliteJobQueue            PipelineRegistry
//!          │
//!          v
//!   db.rs (RunDb, DbHandle)   webhook.rs (RunNotifier, WebhookDispatcher)
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                              |
//! |------------|-------------------------------------------------------------|
//! | `models`   | `Run`, `Project`, `TaskFields`, `RunStatus`, `TaskOutcome`  |
//! | `db`       | SQLite access, `RunFilter`, transactional task writes       |
//! | `webhook`  | Subscriptions, payload, async delivery with `reqwest`       |

pub mod control;
pub mod db;
pub mod gate;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod reconcile;
pub mod recorder;
pub mod webhook;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use self::db::RunDb;
use self::models::RunStatus;
use self::pipeline::PipelineRegistry;
use self::queue::JobQueue;
use self::recorder::Recorder;
use self::webhook::RunNotifier;
use crate::errors::Result;

/// How `start` hands a run over for execution.
#[derive(Clone)]
pub enum ExecutionMode {
    /// No queue: the pipeline runs inline in the caller's thread.
    Sync,
    /// Runs are enqueued and executed by a worker.
    Async(Arc<dyn JobQueue>),
}

/// Entry point to the lifecycle operations. Holds the collaborators the
/// operations need; the database is passed per call.
#[derive(Clone)]
pub struct RunService {
    mode: ExecutionMode,
    pipelines: Arc<PipelineRegistry>,
    notifier: Arc<dyn RunNotifier>,
    task_timeout: Option<Duration>,
}

impl RunService {
    pub fn new(
        mode: ExecutionMode,
        pipelines: Arc<PipelineRegistry>,
        notifier: Arc<dyn RunNotifier>,
    ) -> Self {
        Self {
            mode,
            pipelines,
            notifier,
            task_timeout: None,
        }
    }

    /// Maximum wall time of one pipeline task in a worker.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout
    }

    pub fn is_async(&self) -> bool {
        matches!(self.mode, ExecutionMode::Async(_))
    }

    pub fn queue(&self) -> Option<&dyn JobQueue> {
        match &self.mode {
            ExecutionMode::Sync => None,
            ExecutionMode::Async(queue) => Some(queue.as_ref()),
        }
    }

    pub fn pipelines(&self) -> &PipelineRegistry {
        &self.pipelines
    }

    pub fn recorder<'a>(&'a self, db: &'a RunDb) -> Recorder<'a> {
        Recorder::new(db, self.notifier.as_ref())
    }

    /// Current status, read from one consistent row read.
    pub fn status(&self, db: &RunDb, run_id: Uuid) -> Result<RunStatus> {
        Ok(db.task_fields(run_id)?.status())
    }
}
