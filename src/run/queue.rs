//! External job queue interface and the SQLite-backed implementation.
//!
//! The queue is a separate store from the run database: a job can vanish
//! (expired, cleaned up, worker killed) while the run row still says
//! queued or running. The reconciler cross-checks both.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::QueueError;

/// Status of a job as reported by the queue.
///
/// `SqliteJobQueue` only produces queued, started, stopped, failed and
/// finished. `Deferred`, `Scheduled` and `Canceled` are reserved for other
/// `JobQueue` backends; reconciliation treats them like any other status that
/// does not match the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Started,
    Deferred,
    Scheduled,
    Stopped,
    Canceled,
    Failed,
    Finished,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Deferred => "deferred",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Stopped => "stopped",
            JobStatus::Canceled => "canceled",
            JobStatus::Failed => "failed",
            JobStatus::Finished => "finished",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "started" => Ok(JobStatus::Started),
            "deferred" => Ok(JobStatus::Deferred),
            "scheduled" => Ok(JobStatus::Scheduled),
            "stopped" => Ok(JobStatus::Stopped),
            "canceled" => Ok(JobStatus::Canceled),
            "failed" => Ok(JobStatus::Failed),
            "finished" => Ok(JobStatus::Finished),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Snapshot of a job read from the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    pub run_id: Uuid,
    pub status: JobStatus,
    pub latest_result: Option<String>,
}

/// Operations the run lifecycle needs from a job queue.
///
/// `fetch` returns `Ok(None)` when the job is unknown to the queue.
/// Connection problems are reported as `QueueError::Unavailable`.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job_id: &str, run_id: Uuid) -> Result<JobHandle, QueueError>;
    fn fetch(&self, job_id: &str) -> Result<Option<JobHandle>, QueueError>;
    fn send_stop_signal(&self, job_id: &str) -> Result<(), QueueError>;
    fn delete(&self, job_id: &str) -> Result<(), QueueError>;
}

/// Single logical job queue persisted in its own SQLite file.
pub struct SqliteJobQueue {
    conn: Mutex<Connection>,
}

impl SqliteJobQueue {
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        let conn = Connection::open(path).map_err(|e| {
            QueueError::Unavailable(format!("cannot open {}: {}", path.display(), e))
        })?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| QueueError::Unavailable(format!("cannot open in-memory queue: {}", e)))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, QueueError> {
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set queue busy timeout")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                stop_requested INTEGER NOT NULL DEFAULT 0,
                latest_result TEXT,
                enqueued_at TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            ",
        )
        .context("Failed to create jobs table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, QueueError> {
        self.conn
            .lock()
            .map_err(|e| QueueError::Unavailable(format!("queue lock poisoned: {}", e)))
    }

    /// Claim the oldest queued job, marking it started.
    ///
    /// Jobs that received a stop signal while still queued are marked
    /// stopped and skipped.
    pub fn dequeue(&self) -> Result<Option<JobHandle>, QueueError> {
        let conn = self.lock()?;
        let tx = conn
            .unchecked_transaction()
            .context("Failed to begin dequeue")?;
        loop {
            let next = tx
                .query_row(
                    "SELECT id, stop_requested FROM jobs WHERE status = 'queued' ORDER BY rowid LIMIT 1",
                    [],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
                )
                .optional()
                .context("Failed to select next job")?;
            let Some((id, stop_requested)) = next else {
                tx.commit().context("Failed to commit dequeue")?;
                return Ok(None);
            };
            let now = timestamp();
            if stop_requested {
                tx.execute(
                    "UPDATE jobs SET status = 'stopped', ended_at = ?1 WHERE id = ?2",
                    params![now, id],
                )
                .context("Failed to skip stopped job")?;
                continue;
            }
            tx.execute(
                "UPDATE jobs SET status = 'started', started_at = ?1 WHERE id = ?2",
                params![now, id],
            )
            .context("Failed to claim job")?;
            let job = fetch_job(&tx, &id)?;
            tx.commit().context("Failed to commit dequeue")?;
            return Ok(job);
        }
    }

    /// Record the final status of a job the worker was executing.
    pub fn complete(
        &self,
        job_id: &str,
        status: JobStatus,
        latest_result: Option<&str>,
    ) -> Result<(), QueueError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE jobs SET status = ?1, latest_result = ?2, ended_at = ?3 WHERE id = ?4",
            params![status.as_str(), latest_result, timestamp(), job_id],
        )
        .context("Failed to complete job")?;
        Ok(())
    }

    pub fn is_stop_requested(&self, job_id: &str) -> Result<bool, QueueError> {
        let conn = self.lock()?;
        let requested = conn
            .query_row(
                "SELECT stop_requested FROM jobs WHERE id = ?1",
                params![job_id],
                |row| row.get::<_, bool>(0),
            )
            .optional()
            .context("Failed to read stop flag")?;
        Ok(requested.unwrap_or(false))
    }

    pub fn list(&self) -> Result<Vec<JobHandle>, QueueError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, run_id, status, latest_result FROM jobs ORDER BY rowid")
            .context("Failed to prepare job list")?;
        let rows = stmt
            .query_map([], job_row)
            .context("Failed to list jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_handle()?);
        }
        Ok(jobs)
    }
}

impl JobQueue for SqliteJobQueue {
    /// Enqueue (or re-enqueue) a job. An existing job with the same id is
    /// replaced by a fresh queued one.
    fn enqueue(&self, job_id: &str, run_id: Uuid) -> Result<JobHandle, QueueError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO jobs (id, run_id, status, enqueued_at) VALUES (?1, ?2, 'queued', ?3)
             ON CONFLICT(id) DO UPDATE SET
                 run_id = excluded.run_id,
                 status = 'queued',
                 stop_requested = 0,
                 latest_result = NULL,
                 enqueued_at = excluded.enqueued_at,
                 started_at = NULL,
                 ended_at = NULL",
            params![job_id, run_id.to_string(), timestamp()],
        )
        .context("Failed to enqueue job")?;
        fetch_job(&conn, job_id)?
            .ok_or_else(|| QueueError::Backend(anyhow::anyhow!("Job {} missing after enqueue", job_id)))
    }

    fn fetch(&self, job_id: &str) -> Result<Option<JobHandle>, QueueError> {
        let conn = self.lock()?;
        fetch_job(&conn, job_id)
    }

    fn send_stop_signal(&self, job_id: &str) -> Result<(), QueueError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE jobs SET stop_requested = 1 WHERE id = ?1",
                params![job_id],
            )
            .context("Failed to send stop signal")?;
        if changed == 0 {
            return Err(QueueError::Backend(anyhow::anyhow!("No such job: {}", job_id)));
        }
        Ok(())
    }

    fn delete(&self, job_id: &str) -> Result<(), QueueError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM jobs WHERE id = ?1", params![job_id])
            .context("Failed to delete job")?;
        Ok(())
    }
}

struct JobRow {
    id: String,
    run_id: String,
    status: String,
    latest_result: Option<String>,
}

impl JobRow {
    fn into_handle(self) -> Result<JobHandle, QueueError> {
        let run_id = Uuid::from_str(&self.run_id)
            .with_context(|| format!("Invalid run id '{}' on job {}", self.run_id, self.id))?;
        let status = JobStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?;
        Ok(JobHandle {
            id: self.id,
            run_id,
            status,
            latest_result: self.latest_result,
        })
    }
}

fn job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        run_id: row.get(1)?,
        status: row.get(2)?,
        latest_result: row.get(3)?,
    })
}

fn fetch_job(conn: &Connection, job_id: &str) -> Result<Option<JobHandle>, QueueError> {
    let row = conn
        .query_row(
            "SELECT id, run_id, status, latest_result FROM jobs WHERE id = ?1",
            params![job_id],
            job_row,
        )
        .optional()
        .context("Failed to fetch job")?;
    row.map(JobRow::into_handle).transpose()
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
