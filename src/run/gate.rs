//! Sequencing Gate.
//!
//! Runs of a project execute one after the other in creation order: a run
//! may start only while it is not started and every earlier run of the same
//! project has an end date. The gate refuses; it never reorders the queue.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::db::{RunDb, RunFilter};
use super::{ExecutionMode, RunService};
use super::models::{Run, RunStatus};
use super::queue::JobHandle;
use crate::errors::{Result, RunError};

impl RunService {
    pub fn can_start(&self, db: &RunDb, run_id: Uuid) -> Result<bool> {
        let fields = db.task_fields(run_id)?;
        if fields.status() != RunStatus::NotStarted {
            return Ok(false);
        }
        let blocking = db.previous_runs(run_id, Some(RunFilter::NotExecuted))?;
        if let Some(first) = blocking.first() {
            debug!(run_id = %run_id, blocked_by = %first.uuid, "Run cannot start yet");
            return Ok(false);
        }
        Ok(true)
    }

    /// Start the run when the gate allows it, otherwise fail with
    /// `NotAllowedToStart`.
    ///
    /// In async mode the job is enqueued first and the run marked queued only
    /// once the enqueue succeeded, so a queue failure leaves the run not
    /// started. In sync mode the pipeline executes before this returns and no
    /// job handle is produced.
    pub fn start(&self, db: &RunDb, run_id: Uuid) -> Result<Option<JobHandle>> {
        if !self.can_start(db, run_id)? {
            return Err(RunError::NotAllowedToStart { id: run_id });
        }

        match &self.mode {
            ExecutionMode::Sync => {
                info!(run_id = %run_id, "Executing run inline");
                self.execute_pipeline_task(db, run_id, &run_id.to_string(), &CancellationToken::new())?;
                Ok(None)
            }
            ExecutionMode::Async(queue) => {
                let job = queue.enqueue(&run_id.to_string(), run_id)?;
                self.recorder(db).set_queued(run_id)?;
                info!(run_id = %run_id, job_id = %job.id, "Run enqueued");
                Ok(Some(job))
            }
        }
    }

    /// Create a run of a registered pipeline at the end of the project's
    /// queue. With `execute_now`, the run is started right away when the
    /// gate allows it.
    pub fn add_pipeline(
        &self,
        db: &RunDb,
        project_id: Uuid,
        pipeline_name: &str,
        execute_now: bool,
    ) -> Result<Run> {
        let pipeline = self.pipelines().resolve(pipeline_name)?;
        let run = db.create_run(project_id, pipeline.name(), pipeline.description())?;
        info!(run_id = %run.uuid, pipeline = pipeline_name, "Run created");

        if execute_now && self.can_start(db, run.uuid)? {
            self.start(db, run.uuid)?;
        }
        db.require_run(run.uuid)
    }

    /// Start the earliest not-started run of the project, if the gate allows.
    pub fn start_next_run(&self, db: &RunDb, project_id: Uuid) -> Result<Option<Run>> {
        let Some(next) = db.next_run(project_id)? else {
            return Ok(None);
        };
        if !self.can_start(db, next.uuid)? {
            return Ok(None);
        }
        self.start(db, next.uuid)?;
        Ok(Some(db.require_run(next.uuid)?))
    }
}
