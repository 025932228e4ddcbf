use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::models::*;
use super::webhook::WebhookSubscription;
use crate::errors::{Result, RunError};

const RUN_COLUMNS: &str = "uuid, project_id, pipeline_name, description, created_date, runner_version, \
     current_step, task_id, task_start_date, task_end_date, task_exitcode, task_output, log";

/// Async-safe handle to the run database.
///
/// Wraps `RunDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<RunDb>>,
}

impl DbHandle {
    pub fn new(db: RunDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RunDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup, CLI commands
    /// and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, RunDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e).into())
    }
}

/// Synchronous access to a `RunDb`, borrowed directly or through a
/// `DbHandle` whose lock is taken for the duration of each call.
pub trait DbAccess {
    fn with_db<R>(&self, f: impl FnOnce(&RunDb) -> Result<R>) -> Result<R>;
}

impl DbAccess for RunDb {
    fn with_db<R>(&self, f: impl FnOnce(&RunDb) -> Result<R>) -> Result<R> {
        f(self)
    }
}

impl DbAccess for DbHandle {
    fn with_db<R>(&self, f: impl FnOnce(&RunDb) -> Result<R>) -> Result<R> {
        let guard = self.lock_sync()?;
        f(&guard)
    }
}

/// Named subsets of a project's runs, expressed over the task fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunFilter {
    /// No task id assigned, not in the queue.
    NotStarted,
    /// Task id assigned but not running yet.
    Queued,
    Running,
    /// End date set, whatever the outcome.
    Executed,
    /// No end date: not started, queued or running.
    NotExecuted,
    Succeeded,
    /// Any positive exit code, stopped and stale included.
    Failed,
    QueuedOrRunning,
}

impl RunFilter {
    fn sql(&self) -> &'static str {
        match self {
            Self::NotStarted => {
                "task_exitcode IS NULL AND task_start_date IS NULL AND task_id IS NULL"
            }
            Self::Queued => {
                "task_exitcode IS NULL AND task_start_date IS NULL AND task_id IS NOT NULL"
            }
            Self::Running => {
                "task_exitcode IS NULL AND task_start_date IS NOT NULL AND task_end_date IS NULL"
            }
            Self::Executed => "task_end_date IS NOT NULL",
            Self::NotExecuted => "task_end_date IS NULL",
            Self::Succeeded => "task_exitcode = 0",
            Self::Failed => "task_exitcode > 0",
            Self::QueuedOrRunning => "task_id IS NOT NULL AND task_end_date IS NULL",
        }
    }
}

pub struct RunDb {
    conn: Connection,
}

impl RunDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        // The worker and CLI commands share the file.
        self.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS projects (
                uuid TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                created_date TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                project_id TEXT NOT NULL REFERENCES projects(uuid) ON DELETE CASCADE,
                pipeline_name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_date TEXT NOT NULL,
                runner_version TEXT NOT NULL DEFAULT '',
                current_step TEXT NOT NULL DEFAULT '',
                task_id TEXT,
                task_start_date TEXT,
                task_end_date TEXT,
                task_exitcode INTEGER,
                task_output TEXT NOT NULL DEFAULT '',
                log TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS webhook_subscriptions (
                uuid TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(uuid) ON DELETE CASCADE,
                target_url TEXT NOT NULL,
                created_date TEXT NOT NULL,
                response_status_code INTEGER,
                response_text TEXT NOT NULL DEFAULT '',
                delivery_error TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_runs_project ON runs(project_id, seq);
            CREATE INDEX IF NOT EXISTS idx_webhooks_project ON webhook_subscriptions(project_id);
            ",
        )?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, name: &str) -> Result<Project> {
        if self.get_project_by_name(name)?.is_some() {
            return Err(RunError::DuplicateProject {
                name: name.to_string(),
            });
        }
        let uuid = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO projects (uuid, name, created_date) VALUES (?1, ?2, ?3)",
                params![uuid.to_string(), name, timestamp(Utc::now())],
            )
            .context("Failed to insert project")?;
        self.require_project(uuid)
    }

    pub fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        self.query_project("SELECT uuid, name, created_date FROM projects WHERE uuid = ?1", &id.to_string())
    }

    pub fn get_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        self.query_project("SELECT uuid, name, created_date FROM projects WHERE name = ?1", name)
    }

    pub fn require_project(&self, id: Uuid) -> Result<Project> {
        self.get_project(id)?
            .ok_or(RunError::ProjectNotFound { id })
    }

    fn query_project(&self, sql: &str, key: &str) -> Result<Option<Project>> {
        let row = self
            .conn
            .query_row(sql, params![key], |row| {
                Ok(ProjectRow {
                    uuid: row.get(0)?,
                    name: row.get(1)?,
                    created_date: row.get(2)?,
                })
            })
            .optional()
            .context("Failed to query project")?;
        match row {
            Some(r) => Ok(Some(r.into_project()?)),
            None => Ok(None),
        }
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare("SELECT uuid, name, created_date FROM projects ORDER BY created_date, name")
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ProjectRow {
                    uuid: row.get(0)?,
                    name: row.get(1)?,
                    created_date: row.get(2)?,
                })
            })
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?.into_project()?);
        }
        Ok(projects)
    }

    /// Delete a project with its runs and subscriptions. No in-flight check
    /// here; see `RunService::delete_project`.
    pub fn delete_project(&self, id: Uuid) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM projects WHERE uuid = ?1", params![id.to_string()])
            .context("Failed to delete project")?;
        Ok(changed > 0)
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn create_run(&self, project_id: Uuid, pipeline_name: &str, description: &str) -> Result<Run> {
        self.require_project(project_id)?;
        let uuid = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO runs (uuid, project_id, pipeline_name, description, created_date)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    uuid.to_string(),
                    project_id.to_string(),
                    pipeline_name,
                    description,
                    timestamp(Utc::now())
                ],
            )
            .context("Failed to insert run")?;
        self.require_run(uuid)
    }

    pub fn get_run(&self, id: Uuid) -> Result<Option<Run>> {
        let sql = format!("SELECT {} FROM runs WHERE uuid = ?1", RUN_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id.to_string()], RunRow::from_row)
            .optional()
            .context("Failed to query run")?;
        match row {
            Some(r) => Ok(Some(r.into_run()?)),
            None => Ok(None),
        }
    }

    pub fn require_run(&self, id: Uuid) -> Result<Run> {
        self.get_run(id)?.ok_or(RunError::RunNotFound { id })
    }

    /// Runs of a project in creation order, optionally restricted by `filter`.
    pub fn list_runs(&self, project_id: Uuid, filter: Option<RunFilter>) -> Result<Vec<Run>> {
        let condition = filter.map(|f| format!(" AND {}", f.sql())).unwrap_or_default();
        let sql = format!(
            "SELECT {} FROM runs WHERE project_id = ?1{} ORDER BY seq",
            RUN_COLUMNS, condition
        );
        self.query_runs(&sql, params![project_id.to_string()])
    }

    /// Runs across all projects matching `filter`, in creation order.
    pub fn list_all_runs(&self, filter: RunFilter) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {} FROM runs WHERE {} ORDER BY seq",
            RUN_COLUMNS,
            filter.sql()
        );
        self.query_runs(&sql, &[])
    }

    fn query_runs(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Run>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare runs query")?;
        let rows = stmt
            .query_map(params, RunRow::from_row)
            .context("Failed to query runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read run row")?.into_run()?);
        }
        Ok(runs)
    }

    pub fn count_runs(&self, project_id: Uuid, filter: RunFilter) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM runs WHERE project_id = ?1 AND {}",
            filter.sql()
        );
        let count = self
            .conn
            .query_row(&sql, params![project_id.to_string()], |row| row.get(0))
            .context("Failed to count runs")?;
        Ok(count)
    }

    /// Runs of the same project created before `id`, matching `filter`.
    pub fn previous_runs(&self, id: Uuid, filter: Option<RunFilter>) -> Result<Vec<Run>> {
        let condition = filter.map(|f| format!(" AND {}", f.sql())).unwrap_or_default();
        let sql = format!(
            "SELECT {} FROM runs
             WHERE project_id = (SELECT project_id FROM runs WHERE uuid = ?1)
               AND seq < (SELECT seq FROM runs WHERE uuid = ?1){}
             ORDER BY seq",
            RUN_COLUMNS, condition
        );
        self.query_runs(&sql, params![id.to_string()])
    }

    /// Earliest not-started run of the project.
    pub fn next_run(&self, project_id: Uuid) -> Result<Option<Run>> {
        Ok(self
            .list_runs(project_id, Some(RunFilter::NotStarted))?
            .into_iter()
            .next())
    }

    pub fn delete_run(&self, id: Uuid) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM runs WHERE uuid = ?1", params![id.to_string()])
            .context("Failed to delete run")?;
        Ok(changed > 0)
    }

    /// Read the four task fields in one row read.
    pub fn task_fields(&self, id: Uuid) -> Result<TaskFields> {
        read_task_fields(&self.conn, id)?.ok_or(RunError::RunNotFound { id })
    }

    // ── Field-scoped task writes ──────────────────────────────────────
    //
    // Each write touches only the columns of its operation, inside a
    // transaction that re-checks the task field invariants before commit.

    pub fn reset_task(&self, id: Uuid) -> Result<Run> {
        self.write_task_fields(
            id,
            "UPDATE runs SET task_id = NULL, task_start_date = NULL, task_end_date = NULL,
                    task_exitcode = NULL, task_output = '' WHERE uuid = ?1",
            params![id.to_string()],
        )
    }

    /// Set `task_id` to the run's own uuid, only if no task id is set yet.
    pub fn set_task_queued(&self, id: Uuid) -> Result<Run> {
        let result = self.write_task_fields(
            id,
            "UPDATE runs SET task_id = uuid WHERE uuid = ?1 AND task_id IS NULL",
            params![id.to_string()],
        );
        match result {
            Err(RunError::RunNotFound { .. }) if self.get_run(id)?.is_some() => {
                Err(RunError::AlreadyQueued { id })
            }
            other => other,
        }
    }

    pub fn set_task_started(&self, id: Uuid, task_id: &str, at: DateTime<Utc>) -> Result<Run> {
        self.write_task_fields(
            id,
            "UPDATE runs SET task_id = ?1, task_start_date = ?2 WHERE uuid = ?3",
            params![task_id, timestamp(at), id.to_string()],
        )
    }

    pub fn set_task_ended(
        &self,
        id: Uuid,
        exitcode: i32,
        output: &str,
        at: DateTime<Utc>,
    ) -> Result<Run> {
        self.write_task_fields(
            id,
            "UPDATE runs SET task_exitcode = ?1, task_output = ?2, task_end_date = ?3 WHERE uuid = ?4",
            params![exitcode, output, timestamp(at), id.to_string()],
        )
    }

    fn write_task_fields(
        &self,
        id: Uuid,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Run> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin task write")?;
        let changed = tx.execute(sql, params).context("Failed to write task fields")?;
        if changed == 0 {
            return Err(RunError::RunNotFound { id });
        }
        let fields = read_task_fields(&tx, id)?.ok_or(RunError::RunNotFound { id })?;
        if let Err(reason) = fields.check_invariants() {
            // Dropping `tx` rolls the write back.
            return Err(RunError::LifecycleCorruption { id, reason });
        }
        tx.commit().context("Failed to commit task write")?;
        self.require_run(id)
    }

    /// Append one line to the log. The concatenation happens in SQL so a
    /// concurrent writer of other fields is never overwritten.
    pub fn append_to_log(&self, id: Uuid, line: &str) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET log = log || ?1 WHERE uuid = ?2",
                params![format!("{}\n", line), id.to_string()],
            )
            .context("Failed to append to run log")?;
        if changed == 0 {
            return Err(RunError::RunNotFound { id });
        }
        Ok(())
    }

    pub fn set_runner_version(&self, id: Uuid, version: &str) -> Result<()> {
        let run = self.require_run(id)?;
        if !run.runner_version.is_empty() {
            return Err(RunError::VersionAlreadySet {
                version: run.runner_version,
            });
        }
        self.conn
            .execute(
                "UPDATE runs SET runner_version = ?1 WHERE uuid = ?2",
                params![version, id.to_string()],
            )
            .context("Failed to set runner version")?;
        Ok(())
    }

    pub fn set_current_step(&self, id: Uuid, message: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET current_step = ?1 WHERE uuid = ?2",
                params![truncate_step(message), id.to_string()],
            )
            .context("Failed to set current step")?;
        Ok(())
    }

    // ── Webhook subscriptions ─────────────────────────────────────────

    pub fn add_webhook_subscription(&self, project_id: Uuid, target_url: &str) -> Result<WebhookSubscription> {
        self.require_project(project_id)?;
        let uuid = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO webhook_subscriptions (uuid, project_id, target_url, created_date)
                 VALUES (?1, ?2, ?3, ?4)",
                params![uuid.to_string(), project_id.to_string(), target_url, timestamp(Utc::now())],
            )
            .context("Failed to insert webhook subscription")?;
        self.list_webhook_subscriptions(project_id)?
            .into_iter()
            .find(|s| s.uuid == uuid)
            .context("Webhook subscription not found after insert")
            .map_err(Into::into)
    }

    pub fn list_webhook_subscriptions(&self, project_id: Uuid) -> Result<Vec<WebhookSubscription>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT uuid, project_id, target_url, created_date, response_status_code, response_text, delivery_error
                 FROM webhook_subscriptions WHERE project_id = ?1 ORDER BY created_date",
            )
            .context("Failed to prepare list_webhook_subscriptions")?;
        let rows = stmt
            .query_map(params![project_id.to_string()], |row| {
                Ok(WebhookRow {
                    uuid: row.get(0)?,
                    project_id: row.get(1)?,
                    target_url: row.get(2)?,
                    created_date: row.get(3)?,
                    response_status_code: row.get(4)?,
                    response_text: row.get(5)?,
                    delivery_error: row.get(6)?,
                })
            })
            .context("Failed to query webhook subscriptions")?;
        let mut subscriptions = Vec::new();
        for row in rows {
            subscriptions.push(row.context("Failed to read webhook row")?.into_subscription()?);
        }
        Ok(subscriptions)
    }

    pub fn record_webhook_response(&self, id: Uuid, status_code: u16, text: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE webhook_subscriptions SET response_status_code = ?1, response_text = ?2 WHERE uuid = ?3",
                params![status_code, text, id.to_string()],
            )
            .context("Failed to record webhook response")?;
        Ok(())
    }

    pub fn record_webhook_error(&self, id: Uuid, error: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE webhook_subscriptions SET delivery_error = ?1 WHERE uuid = ?2",
                params![error, id.to_string()],
            )
            .context("Failed to record webhook delivery error")?;
        Ok(())
    }
}

fn read_task_fields(conn: &Connection, id: Uuid) -> Result<Option<TaskFields>> {
    let row = conn
        .query_row(
            "SELECT task_id, task_start_date, task_end_date, task_exitcode FROM runs WHERE uuid = ?1",
            params![id.to_string()],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<i32>>(3)?,
                ))
            },
        )
        .optional()
        .context("Failed to read task fields")?;
    match row {
        Some((task_id, start, end, exitcode)) => Ok(Some(TaskFields {
            task_id,
            task_start_date: parse_optional_timestamp(start)?,
            task_end_date: parse_optional_timestamp(end)?,
            task_exitcode: exitcode,
        })),
        None => Ok(None),
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp '{}'", value))?
        .with_timezone(&Utc))
}

fn parse_optional_timestamp(value: Option<String>) -> anyhow::Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}

fn parse_uuid(value: &str) -> anyhow::Result<Uuid> {
    Uuid::from_str(value).with_context(|| format!("Invalid uuid '{}'", value))
}

/// Intermediate row struct for projects.
struct ProjectRow {
    uuid: String,
    name: String,
    created_date: String,
}

impl ProjectRow {
    fn into_project(self) -> anyhow::Result<Project> {
        Ok(Project {
            uuid: parse_uuid(&self.uuid)?,
            name: self.name,
            created_date: parse_timestamp(&self.created_date)?,
        })
    }
}

/// Intermediate row struct for runs, before parsing uuids and timestamps.
struct RunRow {
    uuid: String,
    project_id: String,
    pipeline_name: String,
    description: String,
    created_date: String,
    runner_version: String,
    current_step: String,
    task_id: Option<String>,
    task_start_date: Option<String>,
    task_end_date: Option<String>,
    task_exitcode: Option<i32>,
    task_output: String,
    log: String,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uuid: row.get(0)?,
            project_id: row.get(1)?,
            pipeline_name: row.get(2)?,
            description: row.get(3)?,
            created_date: row.get(4)?,
            runner_version: row.get(5)?,
            current_step: row.get(6)?,
            task_id: row.get(7)?,
            task_start_date: row.get(8)?,
            task_end_date: row.get(9)?,
            task_exitcode: row.get(10)?,
            task_output: row.get(11)?,
            log: row.get(12)?,
        })
    }

    fn into_run(self) -> anyhow::Result<Run> {
        Ok(Run {
            uuid: parse_uuid(&self.uuid)?,
            project_id: parse_uuid(&self.project_id)?,
            pipeline_name: self.pipeline_name,
            description: self.description,
            created_date: parse_timestamp(&self.created_date)?,
            runner_version: self.runner_version,
            current_step: self.current_step,
            task: TaskFields {
                task_id: self.task_id,
                task_start_date: parse_optional_timestamp(self.task_start_date)?,
                task_end_date: parse_optional_timestamp(self.task_end_date)?,
                task_exitcode: self.task_exitcode,
            },
            task_output: self.task_output,
            log: self.log,
        })
    }
}

/// Intermediate row struct for webhook_subscriptions.
struct WebhookRow {
    uuid: String,
    project_id: String,
    target_url: String,
    created_date: String,
    response_status_code: Option<u16>,
    response_text: String,
    delivery_error: String,
}

impl WebhookRow {
    fn into_subscription(self) -> anyhow::Result<WebhookSubscription> {
        Ok(WebhookSubscription {
            uuid: parse_uuid(&self.uuid)?,
            project_id: parse_uuid(&self.project_id)?,
            target_url: self.target_url,
            created_date: parse_timestamp(&self.created_date)?,
            response_status_code: self.response_status_code,
            response_text: self.response_text,
            delivery_error: self.delivery_error,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn setup() -> Result<(RunDb, Project)> {
        let db = RunDb::new_in_memory()?;
        let project = db.create_project("analysis")?;
        Ok((db, project))
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = RunDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('projects', 'runs', 'webhook_subscriptions')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 3, "Expected 3 tables to exist");
        Ok(())
    }

    #[test]
    fn test_create_project_rejects_duplicate_name() -> Result<()> {
        let (db, project) = setup()?;
        assert_eq!(project.name, "analysis");
        let err = db.create_project("analysis").unwrap_err();
        assert!(matches!(err, RunError::DuplicateProject { .. }));
        assert_eq!(db.list_projects()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_create_run_starts_not_started() -> Result<()> {
        let (db, project) = setup()?;
        let run = db.create_run(project.uuid, "scan_codebase", "Scan a codebase")?;
        assert_eq!(run.status(), RunStatus::NotStarted);
        assert_eq!(run.task, TaskFields::default());
        assert_eq!(run.description, "Scan a codebase");
        assert_eq!(run.log, "");

        let missing = db.create_run(Uuid::new_v4(), "scan_codebase", "").unwrap_err();
        assert!(matches!(missing, RunError::ProjectNotFound { .. }));
        Ok(())
    }

    #[test]
    fn test_set_task_queued_only_once() -> Result<()> {
        let (db, project) = setup()?;
        let run = db.create_run(project.uuid, "scan_codebase", "")?;

        let queued = db.set_task_queued(run.uuid)?;
        assert_eq!(queued.task.task_id.as_deref(), Some(run.uuid.to_string().as_str()));
        assert_eq!(queued.status(), RunStatus::Queued);

        let err = db.set_task_queued(run.uuid).unwrap_err();
        assert!(matches!(err, RunError::AlreadyQueued { .. }));

        let missing = db.set_task_queued(Uuid::new_v4()).unwrap_err();
        assert!(matches!(missing, RunError::RunNotFound { .. }));
        Ok(())
    }

    #[test]
    fn test_set_task_ended_keeps_concurrent_log_entries() -> Result<()> {
        let (db, project) = setup()?;
        let run = db.create_run(project.uuid, "scan_codebase", "")?;
        db.set_task_started(run.uuid, "job-1", Utc::now())?;

        // Another writer appends while the worker holds a stale snapshot.
        let snapshot = db.require_run(run.uuid)?;
        db.append_to_log(run.uuid, "entry in log")?;
        assert_eq!(snapshot.log, "");

        let ended = db.set_task_ended(run.uuid, 0, "output", Utc::now())?;
        assert_eq!(ended.task_output, "output");
        assert_eq!(ended.status(), RunStatus::Success);
        assert!(ended.log.contains("entry in log"));
        Ok(())
    }

    #[test]
    fn test_reset_task_clears_all_task_fields() -> Result<()> {
        let (db, project) = setup()?;
        let run = db.create_run(project.uuid, "scan_codebase", "")?;
        db.set_task_started(run.uuid, "job-1", Utc::now())?;
        db.set_task_ended(run.uuid, 1, "Traceback", Utc::now())?;
        db.append_to_log(run.uuid, "kept")?;

        let reset = db.reset_task(run.uuid)?;
        assert_eq!(reset.task, TaskFields::default());
        assert_eq!(reset.task_output, "");
        assert_eq!(reset.log, "kept\n");
        assert_eq!(reset.status(), RunStatus::NotStarted);
        Ok(())
    }

    #[test]
    fn test_corrupted_row_is_surfaced_and_write_rolled_back() -> Result<()> {
        let (db, project) = setup()?;
        let run = db.create_run(project.uuid, "scan_codebase", "")?;
        // Exit code without end date, written behind the recorder's back.
        db.conn.execute(
            "UPDATE runs SET task_exitcode = 0 WHERE uuid = ?1",
            params![run.uuid.to_string()],
        )?;

        let err = db.set_task_started(run.uuid, "job-1", Utc::now()).unwrap_err();
        assert!(matches!(err, RunError::LifecycleCorruption { .. }));

        let fields = db.task_fields(run.uuid)?;
        assert!(fields.task_id.is_none(), "write should have been rolled back");
        Ok(())
    }

    #[test]
    fn test_run_filters() -> Result<()> {
        let (db, project) = setup()?;
        let not_started = db.create_run(project.uuid, "not_started", "")?;
        let queued = db.create_run(project.uuid, "queued", "")?;
        db.set_task_queued(queued.uuid)?;
        let running = db.create_run(project.uuid, "running", "")?;
        db.set_task_started(running.uuid, "job-r", Utc::now())?;
        let succeed = db.create_run(project.uuid, "succeed", "")?;
        db.set_task_started(succeed.uuid, "job-s", Utc::now())?;
        db.set_task_ended(succeed.uuid, 0, "", Utc::now())?;
        let failed = db.create_run(project.uuid, "failed", "")?;
        db.set_task_started(failed.uuid, "job-f", Utc::now())?;
        db.set_task_ended(failed.uuid, 1, "", Utc::now())?;

        let names = |filter| -> Result<Vec<String>> {
            Ok(db
                .list_runs(project.uuid, Some(filter))?
                .into_iter()
                .map(|r| r.pipeline_name)
                .collect())
        };

        assert_eq!(names(RunFilter::NotStarted)?, vec!["not_started"]);
        assert_eq!(names(RunFilter::Queued)?, vec!["queued"]);
        assert_eq!(names(RunFilter::Running)?, vec!["running"]);
        assert_eq!(names(RunFilter::Executed)?, vec!["succeed", "failed"]);
        assert_eq!(names(RunFilter::NotExecuted)?, vec!["not_started", "queued", "running"]);
        assert_eq!(names(RunFilter::Succeeded)?, vec!["succeed"]);
        assert_eq!(names(RunFilter::Failed)?, vec!["failed"]);
        assert_eq!(names(RunFilter::QueuedOrRunning)?, vec!["queued", "running"]);
        assert_eq!(db.count_runs(project.uuid, RunFilter::Executed)?, 2);
        assert_eq!(db.list_all_runs(RunFilter::QueuedOrRunning)?.len(), 2);
        assert_eq!(db.next_run(project.uuid)?.map(|r| r.uuid), Some(not_started.uuid));
        Ok(())
    }

    #[test]
    fn test_previous_runs_follow_creation_order() -> Result<()> {
        let (db, project) = setup()?;
        let other = db.create_project("other")?;
        let run1 = db.create_run(project.uuid, "p1", "")?;
        db.create_run(other.uuid, "elsewhere", "")?;
        let run2 = db.create_run(project.uuid, "p2", "")?;
        let run3 = db.create_run(project.uuid, "p3", "")?;

        assert!(db.previous_runs(run1.uuid, None)?.is_empty());
        let previous: Vec<Uuid> = db.previous_runs(run3.uuid, None)?.iter().map(|r| r.uuid).collect();
        assert_eq!(previous, vec![run1.uuid, run2.uuid]);
        Ok(())
    }

    #[test]
    fn test_runner_version_set_once_and_step_truncated() -> Result<()> {
        let (db, project) = setup()?;
        let run = db.create_run(project.uuid, "scan_codebase", "")?;
        db.set_runner_version(run.uuid, "0.1.0")?;
        let err = db.set_runner_version(run.uuid, "0.2.0").unwrap_err();
        assert!(matches!(err, RunError::VersionAlreadySet { .. }));

        db.set_current_step(run.uuid, &"s".repeat(400))?;
        let run = db.require_run(run.uuid)?;
        assert_eq!(run.runner_version, "0.1.0");
        assert_eq!(run.current_step.len(), CURRENT_STEP_MAX_LEN);
        Ok(())
    }

    #[test]
    fn test_delete_project_cascades() -> Result<()> {
        let (db, project) = setup()?;
        let run = db.create_run(project.uuid, "scan_codebase", "")?;
        db.add_webhook_subscription(project.uuid, "https://example.com/hook")?;

        assert!(db.delete_project(project.uuid)?);
        assert!(db.get_run(run.uuid)?.is_none());
        assert!(db.list_webhook_subscriptions(project.uuid)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_webhook_subscription_records_delivery() -> Result<()> {
        let (db, project) = setup()?;
        let sub = db.add_webhook_subscription(project.uuid, "https://example.com/hook")?;
        assert!(!sub.delivered());

        db.record_webhook_response(sub.uuid, 201, "created")?;
        let sub = db.list_webhook_subscriptions(project.uuid)?.remove(0);
        assert!(sub.delivered());
        assert!(sub.success());
        assert_eq!(sub.response_text, "created");
        Ok(())
    }
}
