use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Exit code recorded when a run's job vanished without reporting an outcome.
pub const STALE_EXITCODE: i32 = 88;
/// Exit code recorded when a stop was requested for the run.
pub const STOPPED_EXITCODE: i32 = 99;
/// Maximum stored length of `Run::current_step`.
pub const CURRENT_STEP_MAX_LEN: usize = 256;

static STEP_TIMING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Step \[(?P<step>.+)] completed in (?P<time>.+) seconds").unwrap()
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub uuid: Uuid,
    pub name: String,
    pub created_date: DateTime<Utc>,
}

/// Derived state of a run. Never stored, always computed from [`TaskFields`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Queued,
    Running,
    Success,
    Failure,
    Stopped,
    Stale,
}

impl RunStatus {
    pub const ALL: [RunStatus; 7] = [
        Self::NotStarted,
        Self::Queued,
        Self::Running,
        Self::Success,
        Self::Failure,
        Self::Stopped,
        Self::Stale,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Stopped => "stopped",
            Self::Stale => "stale",
        }
    }

    /// Queued or running: an external job may exist for the run.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::Stopped | Self::Stale
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "stopped" => Ok(Self::Stopped),
            "stale" => Ok(Self::Stale),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// How an executed run ended.
///
/// The persisted record keeps a plain integer exit code; stale and stopped
/// runs are encoded with the [`STALE_EXITCODE`] and [`STOPPED_EXITCODE`]
/// sentinels so existing records stay readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "exitcode")]
pub enum TaskOutcome {
    Success,
    Failure(i32),
    Stopped,
    Stale,
}

impl TaskOutcome {
    /// Decode a stored exit code, applying the status precedence
    /// (success, stale, stopped, failure). Negative codes map to `None`.
    pub fn from_exitcode(exitcode: i32) -> Option<Self> {
        match exitcode {
            0 => Some(Self::Success),
            STALE_EXITCODE => Some(Self::Stale),
            STOPPED_EXITCODE => Some(Self::Stopped),
            code if code > 0 => Some(Self::Failure(code)),
            _ => None,
        }
    }

    pub fn exitcode(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure(code) => *code,
            Self::Stopped => STOPPED_EXITCODE,
            Self::Stale => STALE_EXITCODE,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            Self::Success => RunStatus::Success,
            Self::Failure(_) => RunStatus::Failure,
            Self::Stopped => RunStatus::Stopped,
            Self::Stale => RunStatus::Stale,
        }
    }
}

/// The four nullable fields the whole state machine is derived from.
///
/// Always read together from a single row so the derived status never
/// observes a half-applied transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFields {
    pub task_id: Option<String>,
    pub task_start_date: Option<DateTime<Utc>>,
    pub task_end_date: Option<DateTime<Utc>>,
    pub task_exitcode: Option<i32>,
}

impl TaskFields {
    /// Current status. First match wins: success, stale, stopped, failure,
    /// running, queued, not started.
    pub fn status(&self) -> RunStatus {
        if let Some(outcome) = self.outcome() {
            return outcome.status();
        }
        if self.task_start_date.is_some() {
            RunStatus::Running
        } else if self.task_id.is_some() {
            RunStatus::Queued
        } else {
            RunStatus::NotStarted
        }
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.task_exitcode.and_then(TaskOutcome::from_exitcode)
    }

    /// The run reached an end date, whatever the outcome.
    pub fn is_executed(&self) -> bool {
        self.task_end_date.is_some()
    }

    /// Elapsed seconds between start and end. `None` for stale runs since
    /// their end date only marks when the staleness was detected.
    pub fn execution_time(&self) -> Option<i64> {
        if self.task_exitcode == Some(STALE_EXITCODE) {
            return None;
        }
        match (self.task_start_date, self.task_end_date) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }

    /// Check the record invariants: the exit code is set if and only if the
    /// end date is, and a start date implies a task id.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.task_exitcode.is_some() != self.task_end_date.is_some() {
            return Err(format!(
                "task_exitcode={:?} but task_end_date={:?}",
                self.task_exitcode, self.task_end_date
            ));
        }
        if self.task_start_date.is_some() && self.task_id.is_none() {
            return Err("task_start_date is set without a task_id".to_string());
        }
        Ok(())
    }
}

/// One execution attempt of one named pipeline against a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub uuid: Uuid,
    pub project_id: Uuid,
    pub pipeline_name: String,
    pub description: String,
    pub created_date: DateTime<Utc>,
    pub runner_version: String,
    pub current_step: String,
    #[serde(flatten)]
    pub task: TaskFields,
    pub task_output: String,
    pub log: String,
}

impl Run {
    pub fn status(&self) -> RunStatus {
        self.task.status()
    }

    pub fn task_succeeded(&self) -> bool {
        self.task.task_exitcode == Some(0)
    }

    pub fn task_failed(&self) -> bool {
        self.task.task_exitcode.is_some_and(|code| code > 0)
    }

    pub fn task_stopped(&self) -> bool {
        self.task.task_exitcode == Some(STOPPED_EXITCODE)
    }

    pub fn task_staled(&self) -> bool {
        self.task.task_exitcode == Some(STALE_EXITCODE)
    }

    pub fn execution_time(&self) -> Option<i64> {
        self.task.execution_time()
    }

    pub fn execution_time_for_display(&self) -> Option<String> {
        self.execution_time()
            .filter(|secs| *secs > 0)
            .map(humanize_time)
    }

    /// Per-step execution times parsed from the log of a succeeded run, in
    /// log order. `None` unless the run succeeded.
    pub fn profile(&self) -> Option<Vec<StepTiming>> {
        if !self.task_succeeded() {
            return None;
        }

        let timings = self
            .log
            .lines()
            .filter_map(|line| {
                let caps = STEP_TIMING_REGEX.captures(line)?;
                let seconds = caps["time"].trim().parse::<f64>().ok()?;
                Some(StepTiming {
                    step: caps["step"].to_string(),
                    seconds,
                })
            })
            .collect();
        Some(timings)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTiming {
    pub step: String,
    pub seconds: f64,
}

/// Render the share of the total runtime each step took, one line per step.
pub fn format_profile(timings: &[StepTiming]) -> Vec<String> {
    let total: f64 = timings.iter().map(|t| t.seconds).sum();
    let padding = timings.iter().map(|t| t.step.len()).max().unwrap_or(0) + 1;
    timings
        .iter()
        .map(|t| {
            let percent = if total > 0.0 {
                (t.seconds * 1000.0 / total).round() / 10.0
            } else {
                0.0
            };
            format!(
                "{:<padding$} {:>3} seconds {}%",
                t.step,
                t.seconds,
                percent,
                padding = padding
            )
        })
        .collect()
}

/// Format a number of seconds with a coarser unit hint once it reaches a
/// minute: `"25 seconds"`, `"145 seconds (2.4 minutes)"`.
pub fn humanize_time(seconds: i64) -> String {
    let mut display = format!("{} seconds", seconds);
    if seconds >= 3600 {
        display.push_str(&format!(" ({:.1} hours)", seconds as f64 / 3600.0));
    } else if seconds >= 60 {
        display.push_str(&format!(" ({:.1} minutes)", seconds as f64 / 60.0));
    }
    display
}

/// Truncate a step label to the stored column width on a char boundary.
pub fn truncate_step(message: &str) -> &str {
    match message.char_indices().nth(CURRENT_STEP_MAX_LEN) {
        Some((idx, _)) => &message[..idx],
        None => message,
    }
}
