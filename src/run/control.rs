//! Stop/Delete Controller.
//!
//! Stopping is cooperative: the controller signals the queue and records the
//! stop on the run, whether or not the worker process actually halts. Queue
//! lookups made here degrade to "job not found" when the queue is unreachable,
//! since the run record is the source of truth.

use tracing::{info, warn};
use uuid::Uuid;

use super::RunService;
use super::db::{RunDb, RunFilter};
use super::models::{Run, RunStatus};
use super::queue::{JobHandle, JobQueue, JobStatus};
use crate::errors::{Result, RunError};

impl RunService {
    /// Look up the run's job, treating any queue error as "not found".
    fn lookup_job(&self, queue: &dyn JobQueue, run: &Run) -> Option<JobHandle> {
        let task_id = run.task.task_id.as_deref()?;
        match queue.fetch(task_id) {
            Ok(job) => job,
            Err(e) => {
                warn!(run_id = %run.uuid, task_id, error = %e, "Job queue lookup failed, assuming no job");
                None
            }
        }
    }

    /// Request a queued or running run to stop and record the outcome on
    /// the run. Any other status is refused with `NotStoppable`.
    pub fn stop(&self, db: &RunDb, run_id: Uuid) -> Result<Run> {
        let run = db.require_run(run_id)?;
        let status = run.status();
        if !status.is_in_flight() {
            return Err(RunError::NotStoppable { id: run_id, status });
        }

        let recorder = self.recorder(db);
        recorder.append_log(run_id, "Stop task requested")?;

        let Some(queue) = self.queue() else {
            return recorder.set_stopped(run_id);
        };

        let Some(job) = self.lookup_job(queue, &run) else {
            info!(run_id = %run_id, "No job to stop, flagging run as stale");
            return recorder.set_stale(run_id);
        };

        if job.status == JobStatus::Failed {
            let latest = job.latest_result.as_deref().unwrap_or("None");
            return recorder.set_ended(
                run_id,
                1,
                &format!("Killed from outside, latest_result={}", latest),
            );
        }

        if let Err(e) = queue.send_stop_signal(&job.id) {
            warn!(run_id = %run_id, job_id = %job.id, error = %e, "Failed to send stop signal");
        }
        info!(run_id = %run_id, job_id = %job.id, "Stop signal sent");
        recorder.set_stopped(run_id)
    }

    /// Delete a run that is not started or queued. A queued run's job is
    /// removed from the queue first, when the queue can be reached.
    pub fn delete(&self, db: &RunDb, run_id: Uuid) -> Result<()> {
        let run = db.require_run(run_id)?;
        match run.status() {
            RunStatus::NotStarted => {}
            RunStatus::Queued => {
                let queued_job = self
                    .queue()
                    .and_then(|queue| self.lookup_job(queue, &run).map(|job| (queue, job)));
                if let Some((queue, job)) = queued_job {
                    if let Err(e) = queue.delete(&job.id) {
                        warn!(run_id = %run_id, job_id = %job.id, error = %e, "Failed to delete job");
                    }
                }
            }
            status => return Err(RunError::NotDeletable { id: run_id, status }),
        }
        db.delete_run(run_id)?;
        info!(run_id = %run_id, "Run deleted");
        Ok(())
    }

    /// Delete a project with all its runs, unless one of them is queued or
    /// running.
    pub fn delete_project(&self, db: &RunDb, project_id: Uuid) -> Result<()> {
        db.require_project(project_id)?;
        if db.count_runs(project_id, RunFilter::QueuedOrRunning)? > 0 {
            return Err(RunError::RunInProgress { project_id });
        }
        db.delete_project(project_id)?;
        info!(project_id = %project_id, "Project deleted");
        Ok(())
    }
}
