//! Task Lifecycle Recorder.
//!
//! Every transition of a run goes through here. Each method is one
//! field-scoped write on the run row (see `RunDb::write_task_fields`), so the
//! worker owning the task fields and a concurrent caller appending to the log
//! never overwrite each other.

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use super::db::RunDb;
use super::models::{Run, TaskOutcome};
use super::webhook::RunNotifier;
use crate::errors::{Result, RunError};

pub struct Recorder<'a> {
    db: &'a RunDb,
    notifier: &'a dyn RunNotifier,
}

impl<'a> Recorder<'a> {
    pub fn new(db: &'a RunDb, notifier: &'a dyn RunNotifier) -> Self {
        Self { db, notifier }
    }

    pub fn db(&self) -> &'a RunDb {
        self.db
    }

    /// Clear the four task fields and the task output. Always lands on
    /// `NOT_STARTED`; the log is kept.
    pub fn reset(&self, run_id: Uuid) -> Result<Run> {
        let run = self.db.reset_task(run_id)?;
        debug!(run_id = %run_id, "Task values reset");
        Ok(run)
    }

    /// Mark the run as queued by setting `task_id` to the run's own id.
    pub fn set_queued(&self, run_id: Uuid) -> Result<Run> {
        let run = self.db.set_task_queued(run_id)?;
        info!(run_id = %run_id, task_id = ?run.task.task_id, "Run queued");
        Ok(run)
    }

    pub fn set_started(&self, run_id: Uuid, external_id: &str) -> Result<Run> {
        let run = self.db.set_task_started(run_id, external_id, Utc::now())?;
        info!(run_id = %run_id, task_id = external_id, "Run started");
        Ok(run)
    }

    /// Record the end of the task and notify subscribers.
    ///
    /// Negative exit codes are rejected with `InvalidExitCode`.
    pub fn set_ended(&self, run_id: Uuid, exitcode: i32, output: &str) -> Result<Run> {
        let outcome =
            TaskOutcome::from_exitcode(exitcode).ok_or(RunError::InvalidExitCode { exitcode })?;
        self.finish(run_id, outcome, output)
    }

    pub fn finish(&self, run_id: Uuid, outcome: TaskOutcome, output: &str) -> Result<Run> {
        let run = self
            .db
            .set_task_ended(run_id, outcome.exitcode(), output, Utc::now())?;
        info!(
            run_id = %run_id,
            exitcode = outcome.exitcode(),
            status = %run.status(),
            "Run ended"
        );
        self.notifier.run_ended(&run);
        Ok(run)
    }

    pub fn set_stale(&self, run_id: Uuid) -> Result<Run> {
        self.finish(run_id, TaskOutcome::Stale, "")
    }

    pub fn set_stopped(&self, run_id: Uuid) -> Result<Run> {
        self.finish(run_id, TaskOutcome::Stopped, "")
    }

    /// Append one line to the run log. The message is stripped first and
    /// must not contain CR or LF once stripped.
    pub fn append_log(&self, run_id: Uuid, message: &str) -> Result<()> {
        let message = message.trim();
        if message.contains(['\n', '\r']) {
            return Err(RunError::InvalidLogMessage);
        }
        self.db.append_to_log(run_id, message)
    }

    pub fn set_runner_version(&self, run_id: Uuid, version: &str) -> Result<()> {
        self.db.set_runner_version(run_id, version)
    }

    pub fn set_current_step(&self, run_id: Uuid, message: &str) -> Result<()> {
        self.db.set_current_step(run_id, message)
    }
}
