//! Job/Run Reconciler.
//!
//! A worker killed mid-task leaves its run queued or running forever, and a
//! queue flush loses jobs whose runs still say queued. `reconcile` compares
//! the run's derived status with the job status reported by the queue and
//! repairs the run. It is idempotent: once a run is repaired, a second pass
//! finds nothing to do.

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::RunService;
use super::db::{RunDb, RunFilter};
use super::models::{Run, RunStatus};
use super::queue::JobStatus;
use crate::errors::{QueueError, Result};

/// Message stored on runs whose job was found failed by the queue.
pub const FAILED_JOB_OUTPUT: &str = "Job was moved to the FailedJobRegistry during cleanup";

/// What `reconcile` did to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Repair {
    InSync,
    Requeued,
    MarkedStale,
    MarkedStopped,
    MarkedFailed,
}

impl Repair {
    pub fn as_str(&self) -> &'static str {
        match self {
            Repair::InSync => "in_sync",
            Repair::Requeued => "requeued",
            Repair::MarkedStale => "marked_stale",
            Repair::MarkedStopped => "marked_stopped",
            Repair::MarkedFailed => "marked_failed",
        }
    }
}

impl RunService {
    /// Status of the run's job in the queue. `None` in sync mode, when the
    /// run has no task id, or when the queue does not know the job.
    pub fn job_status(&self, run: &Run) -> std::result::Result<Option<JobStatus>, QueueError> {
        let (Some(queue), Some(task_id)) = (self.queue(), run.task.task_id.as_deref()) else {
            return Ok(None);
        };
        Ok(queue.fetch(task_id)?.map(|job| job.status))
    }

    /// Bring the run back in line with its job.
    ///
    /// An unreachable queue is an error here: marking healthy runs stale
    /// because the queue could not be asked would lose real work.
    pub fn reconcile(&self, db: &RunDb, run_id: Uuid) -> Result<Repair> {
        let run = db.require_run(run_id)?;
        let status = run.status();
        let job_status = self.job_status(&run)?;
        let recorder = self.recorder(db);

        let Some(job_status) = job_status else {
            return match status {
                RunStatus::Queued => {
                    info!(
                        run_id = %run_id,
                        task_id = ?run.task.task_id,
                        "No job found for queued run, enqueueing a new job"
                    );
                    recorder.reset(run_id)?;
                    self.start(db, run_id)?;
                    Ok(Repair::Requeued)
                }
                RunStatus::Running => {
                    info!(
                        run_id = %run_id,
                        task_id = ?run.task.task_id,
                        "No job found for running run, flagging as stale"
                    );
                    recorder.set_stale(run_id)?;
                    Ok(Repair::MarkedStale)
                }
                _ => Ok(Repair::InSync),
            };
        };

        let out_of_sync = match status {
            RunStatus::Running => job_status != JobStatus::Started,
            RunStatus::Queued => job_status != JobStatus::Queued,
            _ => false,
        };
        if !out_of_sync {
            return Ok(Repair::InSync);
        }

        match job_status {
            JobStatus::Stopped => {
                info!(run_id = %run_id, run_status = %status, job_status = %job_status, "Flagging run as stopped");
                recorder.set_stopped(run_id)?;
                Ok(Repair::MarkedStopped)
            }
            JobStatus::Failed => {
                info!(run_id = %run_id, run_status = %status, job_status = %job_status, "Flagging run as failed");
                recorder.set_ended(run_id, 1, FAILED_JOB_OUTPUT)?;
                Ok(Repair::MarkedFailed)
            }
            _ => {
                info!(run_id = %run_id, run_status = %status, job_status = %job_status, "Flagging run as stale");
                recorder.set_stale(run_id)?;
                Ok(Repair::MarkedStale)
            }
        }
    }

    /// Reconcile every queued or running run, oldest first.
    pub fn reconcile_all(&self, db: &RunDb) -> Result<Vec<(Uuid, Repair)>> {
        let mut repairs = Vec::new();
        for run in db.list_all_runs(RunFilter::QueuedOrRunning)? {
            let repair = self.reconcile(db, run.uuid)?;
            repairs.push((run.uuid, repair));
        }
        Ok(repairs)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::errors::RunError;
    use crate::run::ExecutionMode;
    use crate::run::models::TaskFields;
    use crate::run::pipeline::PipelineRegistry;
    use crate::run::queue::{JobHandle, JobQueue, SqliteJobQueue};
    use crate::run::webhook::NoopNotifier;
    use anyhow::Result;

    struct Fixture {
        service: RunService,
        queue: Arc<SqliteJobQueue>,
        db: RunDb,
        run: Run,
    }

    fn fixture() -> Result<Fixture> {
        let queue = Arc::new(SqliteJobQueue::in_memory()?);
        let service = RunService::new(
            ExecutionMode::Async(queue.clone()),
            Arc::new(PipelineRegistry::with_builtins()),
            Arc::new(NoopNotifier),
        );
        let db = RunDb::new_in_memory()?;
        let project = db.create_project("reconcile")?;
        let run = db.create_run(project.uuid, "do_nothing", "")?;
        Ok(Fixture {
            service,
            queue,
            db,
            run,
        })
    }

    fn snapshot(db: &RunDb, id: Uuid) -> Result<(TaskFields, String)> {
        let run = db.require_run(id)?;
        Ok((run.task, run.task_output))
    }

    #[test]
    fn test_sync_mode_running_without_job_goes_stale() -> Result<()> {
        let f = fixture()?;
        let service = RunService::new(
            ExecutionMode::Sync,
            Arc::new(PipelineRegistry::with_builtins()),
            Arc::new(NoopNotifier),
        );
        service.recorder(&f.db).set_started(f.run.uuid, "job")?;
        assert_eq!(service.reconcile(&f.db, f.run.uuid)?, Repair::MarkedStale);
        assert_eq!(service.status(&f.db, f.run.uuid)?, RunStatus::Stale);
        Ok(())
    }

    #[test]
    fn test_lost_queued_job_is_requeued() -> Result<()> {
        let f = fixture()?;
        f.service.start(&f.db, f.run.uuid)?;
        let job_id = f.run.uuid.to_string();
        f.queue.delete(&job_id)?;

        assert_eq!(f.service.reconcile(&f.db, f.run.uuid)?, Repair::Requeued);
        let run = f.db.require_run(f.run.uuid)?;
        assert_eq!(run.status(), RunStatus::Queued);
        assert!(run.task.task_id.is_some());
        assert!(run.task.task_start_date.is_none());
        assert_eq!(f.queue.fetch(&job_id)?.map(|j| j.status), Some(JobStatus::Queued));
        Ok(())
    }

    #[test]
    fn test_lost_running_job_goes_stale() -> Result<()> {
        let f = fixture()?;
        f.service.recorder(&f.db).set_started(f.run.uuid, "vanished")?;

        assert_eq!(f.service.reconcile(&f.db, f.run.uuid)?, Repair::MarkedStale);
        assert_eq!(f.service.status(&f.db, f.run.uuid)?, RunStatus::Stale);
        Ok(())
    }

    #[test]
    fn test_reconcile_is_idempotent() -> Result<()> {
        let f = fixture()?;
        f.service.recorder(&f.db).set_started(f.run.uuid, "vanished")?;

        f.service.reconcile(&f.db, f.run.uuid)?;
        let first = snapshot(&f.db, f.run.uuid)?;
        assert_eq!(f.service.reconcile(&f.db, f.run.uuid)?, Repair::InSync);
        assert_eq!(snapshot(&f.db, f.run.uuid)?, first);
        Ok(())
    }

    #[test]
    fn test_job_status_mismatch_repairs() -> Result<()> {
        let cases = [
            (JobStatus::Stopped, Repair::MarkedStopped, RunStatus::Stopped),
            (JobStatus::Failed, Repair::MarkedFailed, RunStatus::Failure),
            (JobStatus::Finished, Repair::MarkedStale, RunStatus::Stale),
            (JobStatus::Canceled, Repair::MarkedStale, RunStatus::Stale),
            (JobStatus::Deferred, Repair::MarkedStale, RunStatus::Stale),
            (JobStatus::Scheduled, Repair::MarkedStale, RunStatus::Stale),
        ];
        for (job_status, repair, run_status) in cases {
            let f = fixture()?;
            f.service.start(&f.db, f.run.uuid)?;
            let job_id = f.run.uuid.to_string();
            f.queue.dequeue()?;
            f.service.recorder(&f.db).set_started(f.run.uuid, &job_id)?;
            f.queue.complete(&job_id, job_status, None)?;

            assert_eq!(f.service.reconcile(&f.db, f.run.uuid)?, repair);
            let run = f.db.require_run(f.run.uuid)?;
            assert_eq!(run.status(), run_status);
            if job_status == JobStatus::Failed {
                assert_eq!(run.task_output, FAILED_JOB_OUTPUT);
            }
        }
        Ok(())
    }

    #[test]
    fn test_matching_states_are_left_alone() -> Result<()> {
        let f = fixture()?;
        f.service.start(&f.db, f.run.uuid)?;
        assert_eq!(f.service.reconcile(&f.db, f.run.uuid)?, Repair::InSync);

        let job = f.queue.dequeue()?.expect("queued job");
        f.service.recorder(&f.db).set_started(f.run.uuid, &job.id)?;
        assert_eq!(f.service.reconcile(&f.db, f.run.uuid)?, Repair::InSync);
        assert_eq!(f.service.status(&f.db, f.run.uuid)?, RunStatus::Running);
        Ok(())
    }

    #[test]
    fn test_queued_run_with_started_job_goes_stale() -> Result<()> {
        let f = fixture()?;
        f.service.start(&f.db, f.run.uuid)?;
        f.queue.dequeue()?;
        assert_eq!(f.service.reconcile(&f.db, f.run.uuid)?, Repair::MarkedStale);
        Ok(())
    }

    struct DownQueue;

    impl JobQueue for DownQueue {
        fn enqueue(&self, _: &str, _: Uuid) -> std::result::Result<JobHandle, QueueError> {
            Err(QueueError::Unavailable("connection refused".into()))
        }
        fn fetch(&self, _: &str) -> std::result::Result<Option<JobHandle>, QueueError> {
            Err(QueueError::Unavailable("connection refused".into()))
        }
        fn send_stop_signal(&self, _: &str) -> std::result::Result<(), QueueError> {
            Err(QueueError::Unavailable("connection refused".into()))
        }
        fn delete(&self, _: &str) -> std::result::Result<(), QueueError> {
            Err(QueueError::Unavailable("connection refused".into()))
        }
    }

    #[test]
    fn test_unreachable_queue_is_an_error_not_a_repair() -> Result<()> {
        let f = fixture()?;
        let service = RunService::new(
            ExecutionMode::Async(Arc::new(DownQueue)),
            Arc::new(PipelineRegistry::with_builtins()),
            Arc::new(NoopNotifier),
        );
        service.recorder(&f.db).set_started(f.run.uuid, "job")?;

        let err = service.reconcile(&f.db, f.run.uuid).unwrap_err();
        assert!(matches!(err, RunError::Queue(QueueError::Unavailable(_))));
        assert_eq!(service.status(&f.db, f.run.uuid)?, RunStatus::Running);
        Ok(())
    }

    #[test]
    fn test_reconcile_all_visits_in_flight_runs() -> Result<()> {
        let f = fixture()?;
        let other = f.db.create_project("other")?;
        let running = f.db.create_run(other.uuid, "do_nothing", "")?;
        f.service.recorder(&f.db).set_started(running.uuid, "vanished")?;
        f.service.start(&f.db, f.run.uuid)?;

        let repairs = f.service.reconcile_all(&f.db)?;
        assert_eq!(
            repairs,
            vec![(f.run.uuid, Repair::InSync), (running.uuid, Repair::MarkedStale)]
        );
        Ok(())
    }
}
