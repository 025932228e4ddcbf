//! Pipeline task execution and the queue worker.
//!
//! `execute_pipeline_task` is the body every run goes through, inline in sync
//! mode or inside a worker in async mode. The worker claims jobs from the
//! `SqliteJobQueue`, runs the task on the blocking pool, and watches the
//! queue for stop signals and the task timeout while it runs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::RunService;
use super::db::{DbAccess, DbHandle};
use super::models::Run;
use super::pipeline::{PipelineContext, PipelineOutcome};
use super::queue::{JobHandle, JobStatus, SqliteJobQueue};
use crate::errors::{QueueError, Result, RunError};

/// Version recorded on every run this build executes.
pub const RUNNER_VERSION: &str = env!("CARGO_PKG_VERSION");

impl RunService {
    /// Execute the run's pipeline under `job_id` and record the result.
    ///
    /// The end is not recorded when the run already ended meanwhile (stopped,
    /// staled or timed out by another writer). A successful run starts the
    /// next run of its project.
    pub fn execute_pipeline_task<S: DbAccess>(
        &self,
        store: &S,
        run_id: Uuid,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Run> {
        info!(run_id = %run_id, job_id, "Executing pipeline task");

        let run = store.with_db(|db| {
            let recorder = self.recorder(db);
            match recorder.set_runner_version(run_id, RUNNER_VERSION) {
                Ok(()) | Err(RunError::VersionAlreadySet { .. }) => {}
                Err(e) => return Err(e),
            }
            recorder.set_started(run_id, job_id)
        })?;

        let outcome = match self.pipelines().resolve(&run.pipeline_name) {
            Ok(pipeline) => {
                let ctx = PipelineContext::new(&run, cancel, store);
                pipeline
                    .execute(&ctx)
                    .unwrap_or_else(|e| PipelineOutcome::failure(e.to_string()))
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Cannot resolve pipeline");
                PipelineOutcome::failure(e.to_string())
            }
        };

        let run = store.with_db(|db| {
            let current = db.require_run(run_id)?;
            if current.task.is_executed() {
                info!(run_id = %run_id, status = %current.status(), "Run already ended, keeping recorded outcome");
                return Ok(current);
            }
            self.recorder(db)
                .set_ended(run_id, outcome.exitcode, &outcome.output)
        })?;

        if run.task_succeeded() {
            let project_id = run.project_id;
            match store.with_db(|db| self.start_next_run(db, project_id)) {
                Ok(Some(next)) => info!(run_id = %next.uuid, "Next run started"),
                Ok(None) => {}
                Err(e) => warn!(project_id = %project_id, error = %e, "Failed to start next run"),
            }
        }
        Ok(run)
    }
}

/// How the watcher of a running job finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchEnd {
    TaskDone,
    StopRequested,
    TimedOut,
}

pub struct Worker {
    db: DbHandle,
    queue: Arc<SqliteJobQueue>,
    service: RunService,
    poll_interval: Duration,
}

impl Worker {
    /// `service` is expected to run in async mode over the same `queue`, so
    /// the runs it chains land where this worker picks them up.
    pub fn new(db: DbHandle, queue: Arc<SqliteJobQueue>, service: RunService) -> Self {
        Self {
            db,
            queue,
            service,
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Claim and execute one job. `Ok(None)` when the queue is empty.
    pub async fn run_once(&self) -> Result<Option<Run>> {
        match self.claim().await? {
            Some(job) => self.process(job).await.map(Some),
            None => Ok(None),
        }
    }

    async fn claim(&self) -> Result<Option<JobHandle>> {
        let job = queue_call(&self.queue, |q| q.dequeue()).await?;
        if let Some(job) = &job {
            info!(job_id = %job.id, run_id = %job.run_id, "Job claimed");
        }
        Ok(job)
    }

    /// Execute a claimed job and complete it in the queue.
    async fn process(&self, job: JobHandle) -> Result<Run> {
        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(watch_job(
            self.db.clone(),
            self.queue.clone(),
            self.service.clone(),
            job.clone(),
            cancel.clone(),
            self.poll_interval,
        ));

        let result = {
            let db = self.db.clone();
            let service = self.service.clone();
            let job_id = job.id.clone();
            let run_id = job.run_id;
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                service.execute_pipeline_task(&db, run_id, &job_id, &cancel)
            })
            .await
            .context("Pipeline task panicked")?
        };

        cancel.cancel();
        let watch_end = watcher.await.context("Job watcher panicked")?;

        let (status, latest_result) = match (&result, watch_end) {
            (_, WatchEnd::TimedOut) => (JobStatus::Failed, Some(self.timeout_note())),
            (Err(e), _) => (JobStatus::Failed, Some(e.to_string())),
            (Ok(_), WatchEnd::StopRequested) => (JobStatus::Stopped, None),
            (Ok(_), WatchEnd::TaskDone) => (JobStatus::Finished, None),
        };
        let job_id = job.id.clone();
        queue_call(&self.queue, move |q| {
            q.complete(&job_id, status, latest_result.as_deref())
        })
        .await?;
        info!(job_id = %job.id, status = %status, "Job completed");

        result
    }

    fn timeout_note(&self) -> String {
        timeout_note(self.service.task_timeout().unwrap_or_default())
    }

    /// Process jobs until the queue is empty. Returns the number processed.
    /// A failing job is logged and counted; a failing queue ends the burst.
    pub async fn run_burst(&self) -> Result<usize> {
        let mut processed = 0;
        while let Some(job) = self.claim().await? {
            self.process_logged(job).await;
            processed += 1;
        }
        Ok(processed)
    }

    async fn process_logged(&self, job: JobHandle) {
        let job_id = job.id.clone();
        if let Err(e) = self.process(job).await {
            warn!(job_id = %job_id, error = %e, "Job execution failed");
        }
    }

    /// Poll the queue until `shutdown` fires. A job in progress is finished
    /// before returning.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "Worker started");
        while !shutdown.is_cancelled() {
            let idle = match self.claim().await {
                Ok(Some(job)) => {
                    self.process_logged(job).await;
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    warn!(error = %e, "Failed to poll the job queue");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        info!("Worker stopped");
        Ok(())
    }
}

fn timeout_note(timeout: Duration) -> String {
    format!(
        "Task exceeded maximum timeout value ({} seconds)",
        timeout.as_secs()
    )
}

/// Watch a running job for a stop request or the task timeout, cancelling
/// the task token when either happens. Returns once `cancel` fires.
async fn watch_job(
    db: DbHandle,
    queue: Arc<SqliteJobQueue>,
    service: RunService,
    job: JobHandle,
    cancel: CancellationToken,
    poll_interval: Duration,
) -> WatchEnd {
    let timeout = service.task_timeout();
    let deadline = async move {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return WatchEnd::TaskDone,
            _ = &mut deadline => {
                let note = timeout_note(timeout.unwrap_or_default());
                warn!(job_id = %job.id, run_id = %job.run_id, "{}", note);
                let run_id = job.run_id;
                let recorded = db
                    .call(move |db| {
                        if db.task_fields(run_id)?.is_executed() {
                            return Ok(());
                        }
                        service.recorder(db).set_ended(run_id, 1, &note).map(|_| ())
                    })
                    .await;
                if let Err(e) = recorded {
                    warn!(run_id = %run_id, error = %e, "Failed to record task timeout");
                }
                cancel.cancel();
                return WatchEnd::TimedOut;
            }
            _ = tokio::time::sleep(poll_interval) => {
                let job_id = job.id.clone();
                match queue_call(&queue, move |q| q.is_stop_requested(&job_id)).await {
                    Ok(true) => {
                        info!(job_id = %job.id, "Stop requested, cancelling task");
                        cancel.cancel();
                        return WatchEnd::StopRequested;
                    }
                    Ok(false) => {}
                    Err(e) => debug!(job_id = %job.id, error = %e, "Stop flag check failed"),
                }
            }
        }
    }
}

/// Run a queue operation on the blocking pool.
async fn queue_call<F, R>(queue: &Arc<SqliteJobQueue>, f: F) -> Result<R>
where
    F: FnOnce(&SqliteJobQueue) -> std::result::Result<R, QueueError> + Send + 'static,
    R: Send + 'static,
{
    let queue = queue.clone();
    let result = tokio::task::spawn_blocking(move || f(&queue))
        .await
        .context("Queue task panicked")?;
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::ExecutionMode;
    use crate::run::db::RunDb;
    use crate::run::models::RunStatus;
    use crate::run::pipeline::{Pipeline, PipelineRegistry};
    use crate::run::queue::JobQueue;
    use crate::run::webhook::NoopNotifier;
    use anyhow::Result;

    struct Harness {
        db: DbHandle,
        queue: Arc<SqliteJobQueue>,
        service: RunService,
        project_id: Uuid,
    }

    impl Harness {
        fn new(timeout: Option<Duration>) -> Result<Self> {
            let mut registry = PipelineRegistry::with_builtins();
            registry.register(
                Pipeline::new("explode", "Always fails.")
                    .step("boom", "", |_| anyhow::bail!("Something exploded")),
            );
            let queue = Arc::new(SqliteJobQueue::in_memory()?);
            let mut service = RunService::new(
                ExecutionMode::Async(queue.clone()),
                Arc::new(registry),
                Arc::new(NoopNotifier),
            );
            if let Some(t) = timeout {
                service = service.with_task_timeout(t);
            }
            let db = RunDb::new_in_memory()?;
            let project_id = db.create_project("worker")?.uuid;
            Ok(Self {
                db: DbHandle::new(db),
                queue,
                service,
                project_id,
            })
        }

        fn worker(&self) -> Worker {
            Worker::new(self.db.clone(), self.queue.clone(), self.service.clone())
                .with_poll_interval(Duration::from_millis(20))
        }

        async fn add(&self, pipeline: &str, execute_now: bool) -> Result<Run> {
            let service = self.service.clone();
            let project_id = self.project_id;
            let pipeline = pipeline.to_string();
            Ok(self
                .db
                .call(move |db| service.add_pipeline(db, project_id, &pipeline, execute_now))
                .await?)
        }

        async fn run(&self, id: Uuid) -> Result<Run> {
            Ok(self.db.call(move |db| db.require_run(id)).await?)
        }
    }

    #[tokio::test]
    async fn test_run_once_on_empty_queue() -> Result<()> {
        let h = Harness::new(None)?;
        assert!(h.worker().run_once().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_run_once_executes_and_finishes_job() -> Result<()> {
        let h = Harness::new(None)?;
        let run = h.add("do_nothing", true).await?;

        let done = h.worker().run_once().await?.expect("a run");
        assert_eq!(done.uuid, run.uuid);
        assert_eq!(done.status(), RunStatus::Success);
        assert_eq!(done.runner_version, RUNNER_VERSION);
        assert!(done.execution_time().is_some());
        assert!(done.log.contains("Pipeline [do_nothing] starting"));

        let job = h.queue.fetch(&run.uuid.to_string())?.expect("job");
        assert_eq!(job.status, JobStatus::Finished);
        Ok(())
    }

    #[tokio::test]
    async fn test_successful_run_starts_next_run() -> Result<()> {
        let h = Harness::new(None)?;
        let r1 = h.add("do_nothing", true).await?;
        let r2 = h.add("do_nothing", true).await?;
        assert_eq!(r2.status(), RunStatus::NotStarted);

        h.worker().run_once().await?;
        assert_eq!(h.run(r1.uuid).await?.status(), RunStatus::Success);
        assert_eq!(h.run(r2.uuid).await?.status(), RunStatus::Queued);

        assert_eq!(h.worker().run_burst().await?, 1);
        assert_eq!(h.run(r2.uuid).await?.status(), RunStatus::Success);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_run_does_not_chain() -> Result<()> {
        let h = Harness::new(None)?;
        let r1 = h.add("explode", true).await?;
        let r2 = h.add("do_nothing", true).await?;

        let done = h.worker().run_once().await?.expect("a run");
        assert_eq!(done.uuid, r1.uuid);
        assert_eq!(done.status(), RunStatus::Failure);
        assert!(done.task_output.starts_with("Something exploded"));
        assert_eq!(h.run(r2.uuid).await?.status(), RunStatus::NotStarted);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_pipeline_fails_the_run() -> Result<()> {
        let h = Harness::new(None)?;
        let project_id = h.project_id;
        let service = h.service.clone();
        let run = h
            .db
            .call(move |db| {
                let run = db.create_run(project_id, "retired_pipeline", "")?;
                service.start(db, run.uuid)?;
                Ok(run)
            })
            .await?;

        let done = h.worker().run_once().await?.expect("a run");
        assert_eq!(done.uuid, run.uuid);
        assert_eq!(done.status(), RunStatus::Failure);
        assert!(done.task_output.contains("retired_pipeline"));
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_during_execution_keeps_stopped_outcome() -> Result<()> {
        let h = Harness::new(None)?;
        let run = h.add("sleep", true).await?;
        let worker = h.worker();
        let handle = tokio::spawn(async move { worker.run_once().await });

        for _ in 0..200 {
            if h.run(run.uuid).await?.status() == RunStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let service = h.service.clone();
        let run_id = run.uuid;
        let stopped = h.db.call(move |db| service.stop(db, run_id)).await?;
        assert_eq!(stopped.status(), RunStatus::Stopped);

        let done = handle.await??.expect("a run");
        assert_eq!(done.status(), RunStatus::Stopped);
        let job = h.queue.fetch(&run.uuid.to_string())?.expect("job");
        assert_eq!(job.status, JobStatus::Stopped);
        Ok(())
    }

    #[tokio::test]
    async fn test_task_timeout_fails_run_and_job() -> Result<()> {
        let h = Harness::new(Some(Duration::from_millis(200)))?;
        let run = h.add("sleep", true).await?;

        let done = h.worker().run_once().await?.expect("a run");
        assert_eq!(done.status(), RunStatus::Failure);
        assert!(done.task_output.contains("exceeded maximum timeout"));

        let job = h.queue.fetch(&run.uuid.to_string())?.expect("job");
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.latest_result.unwrap_or_default().contains("timeout"));
        Ok(())
    }

    #[tokio::test]
    async fn test_burst_continues_past_a_failing_job() -> Result<()> {
        let h = Harness::new(None)?;
        // A job whose run row is gone cannot be executed.
        h.queue.enqueue("orphan", Uuid::new_v4())?;
        let run = h.add("do_nothing", true).await?;

        assert_eq!(h.worker().run_burst().await?, 2);

        assert_eq!(h.run(run.uuid).await?.status(), RunStatus::Success);
        let orphan = h.queue.fetch("orphan")?.expect("job");
        assert_eq!(orphan.status, JobStatus::Failed);
        assert!(orphan.latest_result.unwrap_or_default().contains("not found"));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() -> Result<()> {
        let h = Harness::new(None)?;
        let run = h.add("do_nothing", true).await?;
        let shutdown = CancellationToken::new();
        let worker = h.worker();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { worker.run(token).await });

        for _ in 0..200 {
            if h.run(run.uuid).await?.status() == RunStatus::Success {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await??;
        assert_eq!(h.run(run.uuid).await?.status(), RunStatus::Success);
        Ok(())
    }
}
