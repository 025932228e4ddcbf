//! Pipelines: named, ordered lists of steps executed against a run.
//!
//! The registry is built by the caller and handed to `RunService` and the
//! worker; nothing here is process-global.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::db::DbAccess;
use super::models::{Run, STOPPED_EXITCODE};
use super::recorder::Recorder;
use super::webhook::NoopNotifier;
use crate::errors::{Result, RunError};

/// Where a running pipeline reports its progress.
pub trait ProgressSink {
    fn log(&self, run_id: Uuid, message: &str) -> Result<()>;
    fn current_step(&self, run_id: Uuid, step: &str) -> Result<()>;
}

impl<T: DbAccess> ProgressSink for T {
    fn log(&self, run_id: Uuid, message: &str) -> Result<()> {
        self.with_db(|db| Recorder::new(db, &NoopNotifier).append_log(run_id, message))
    }

    fn current_step(&self, run_id: Uuid, step: &str) -> Result<()> {
        self.with_db(|db| db.set_current_step(run_id, step))
    }
}

/// State handed to each step while a pipeline executes.
pub struct PipelineContext<'a> {
    pub run: &'a Run,
    pub cancel: &'a CancellationToken,
    sink: &'a dyn ProgressSink,
}

impl<'a> PipelineContext<'a> {
    pub fn new(run: &'a Run, cancel: &'a CancellationToken, sink: &'a dyn ProgressSink) -> Self {
        Self { run, cancel, sink }
    }

    /// Write a timestamped line to the run log.
    pub fn log(&self, message: &str) -> Result<()> {
        let line = format!("{} {}", log_timestamp(), message);
        info!(run_id = %self.run.uuid, "{}", line);
        self.sink.log(self.run.uuid, &line)
    }

    pub fn set_current_step(&self, step: &str) -> Result<()> {
        self.sink.current_step(self.run.uuid, step)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

type StepFn = dyn Fn(&PipelineContext<'_>) -> anyhow::Result<()> + Send + Sync;

pub struct Step {
    pub name: String,
    pub doc: String,
    run: Box<StepFn>,
}

impl Step {
    pub fn new<F>(name: &str, doc: &str, run: F) -> Self
    where
        F: Fn(&PipelineContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            doc: doc.to_string(),
            run: Box::new(run),
        }
    }
}

/// What a pipeline body returns: the exit code and free-form output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub exitcode: i32,
    pub output: String,
}

impl PipelineOutcome {
    pub fn success() -> Self {
        Self {
            exitcode: 0,
            output: String::new(),
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            exitcode: 1,
            output: output.into(),
        }
    }
}

pub struct Pipeline {
    name: String,
    description: String,
    steps: Vec<Step>,
}

/// Step entry as shown by `scanrun pipelines`.
#[derive(Debug, Clone, Serialize)]
pub struct StepInfo {
    pub name: String,
    pub doc: String,
}

impl Pipeline {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            steps: Vec::new(),
        }
    }

    pub fn step<F>(mut self, name: &str, doc: &str, run: F) -> Self
    where
        F: Fn(&PipelineContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.steps.push(Step::new(name, doc, run));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn graph(&self) -> Vec<StepInfo> {
        self.steps
            .iter()
            .map(|s| StepInfo {
                name: s.name.clone(),
                doc: s.doc.clone(),
            })
            .collect()
    }

    /// Run every step in order. Cancellation is checked before each step; a
    /// cancelled pipeline returns the stopped exit code. The first failing
    /// step ends the pipeline with exit code 1 and the error chain as output.
    pub fn execute(&self, ctx: &PipelineContext<'_>) -> Result<PipelineOutcome> {
        ctx.log(&format!("Pipeline [{}] starting", self.name))?;

        for step in &self.steps {
            if ctx.is_cancelled() {
                ctx.log("Pipeline stopped")?;
                return Ok(PipelineOutcome {
                    exitcode: STOPPED_EXITCODE,
                    output: String::new(),
                });
            }

            ctx.set_current_step(&step.name)?;
            ctx.log(&format!("Step [{}] starting", step.name))?;
            let started = Instant::now();

            if let Err(e) = (step.run)(ctx) {
                warn!(run_id = %ctx.run.uuid, step = %step.name, error = %e, "Step failed");
                ctx.log("Pipeline failed")?;
                return Ok(PipelineOutcome::failure(format_failure(&e)));
            }

            ctx.log(&format!(
                "Step [{}] completed in {:.2} seconds",
                step.name,
                started.elapsed().as_secs_f64()
            ))?;
        }

        ctx.set_current_step("")?;
        ctx.log("Pipeline completed")?;
        Ok(PipelineOutcome::success())
    }
}

/// Name -> pipeline lookup, injected wherever pipelines are resolved.
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<String, Arc<Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the pipelines shipped in this crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(do_nothing());
        registry.register(sleep());
        registry
    }

    pub fn register(&mut self, pipeline: Pipeline) {
        self.pipelines
            .insert(pipeline.name.clone(), Arc::new(pipeline));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.get(name).cloned()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<Pipeline>> {
        self.get(name).ok_or_else(|| RunError::UnknownPipeline {
            name: name.to_string(),
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pipeline> {
        self.pipelines.values().map(|p| p.as_ref())
    }
}

fn do_nothing() -> Pipeline {
    Pipeline::new("do_nothing", "A pipeline that does nothing, in 2 steps.")
        .step("step1", "Step1", |_| Ok(()))
        .step("step2", "Step2", |_| Ok(()))
}

/// Waits in short slices so a stop or timeout is honoured between slices.
fn sleep() -> Pipeline {
    Pipeline::new("sleep", "Wait for 5 seconds, checking for cancellation.").step(
        "wait",
        "Sleep in 100ms slices.",
        |ctx| {
            for _ in 0..50 {
                if ctx.is_cancelled() {
                    anyhow::bail!("Cancelled while waiting");
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Ok(())
        },
    )
}

/// `YYYY-MM-DD HH:MM:SS.cc` in UTC.
fn log_timestamp() -> String {
    let now = Utc::now();
    format!(
        "{}.{:02}",
        now.format("%Y-%m-%d %H:%M:%S"),
        now.timestamp_subsec_millis() / 10
    )
}

fn format_failure(error: &anyhow::Error) -> String {
    let chain: Vec<String> = error.chain().skip(1).map(|c| format!("  {}", c)).collect();
    if chain.is_empty() {
        format!("{}\n\nTraceback:\n", error)
    } else {
        format!("{}\n\nTraceback:\n{}\n", error, chain.join("\n"))
    }
}
