//! Step hook registry: observers notified around runs and steps.
//!
//! Epistemic foundation:
//! - K_i: Hooks run synchronously, in registration order
//! - K_i: A failing or panicking hook never aborts the pipeline
//! - B_i: Downstream listeners (metrics, alerting, audit) may fail → logged, ignored

use crate::models::{RunId, RunMode, RunStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{info, warn};

/// How a step attempt ended, as reported to hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Done,
    Failed,
    /// Stopped by the operator; resumable
    Aborted,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        })
    }
}

/// Listener for pipeline lifecycle events.
///
/// Implementations must return quickly; they run on the pipeline's task.
pub trait StepHook: Send + Sync {
    fn name(&self) -> &str;

    fn on_run_start(
        &self,
        _run_id: &RunId,
        _job_type: &str,
        _mode: RunMode,
        _ts: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_run_end(
        &self,
        _run_id: &RunId,
        _job_type: &str,
        _status: RunStatus,
        _ts: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_step_start(&self, _run_id: &RunId, _step: u32, _ts: DateTime<Utc>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_step_end(
        &self,
        _run_id: &RunId,
        _step: u32,
        _ts: DateTime<Utc>,
        _rows_processed: u64,
        _outcome: StepOutcome,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered list of hooks, each isolated from the others.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn StepHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Arc<dyn StepHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn run_start(&self, run_id: &RunId, job_type: &str, mode: RunMode) {
        let ts = Utc::now();
        self.emit("run_start", |hook| hook.on_run_start(run_id, job_type, mode, ts));
    }

    pub fn run_end(&self, run_id: &RunId, job_type: &str, status: RunStatus) {
        let ts = Utc::now();
        self.emit("run_end", |hook| hook.on_run_end(run_id, job_type, status, ts));
    }

    pub fn step_start(&self, run_id: &RunId, step: u32) {
        let ts = Utc::now();
        self.emit("step_start", |hook| hook.on_step_start(run_id, step, ts));
    }

    pub fn step_end(&self, run_id: &RunId, step: u32, rows_processed: u64, outcome: StepOutcome) {
        let ts = Utc::now();
        self.emit("step_end", |hook| {
            hook.on_step_end(run_id, step, ts, rows_processed, outcome)
        });
    }

    fn emit(&self, event: &str, call: impl Fn(&dyn StepHook) -> anyhow::Result<()>) {
        for hook in &self.hooks {
            match catch_unwind(AssertUnwindSafe(|| call(hook.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(hook = hook.name(), event, error = %e, "Hook failed"),
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    warn!(hook = hook.name(), event, panic = %message, "Hook panicked");
                }
            }
        }
    }
}

/// Audit trail of run and step events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHook;

impl StepHook for TracingHook {
    fn name(&self) -> &str {
        "tracing"
    }

    fn on_run_start(
        &self,
        run_id: &RunId,
        job_type: &str,
        mode: RunMode,
        ts: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        info!(run_id = %run_id, job_type, mode = %mode, ts = %ts, "Run started");
        Ok(())
    }

    fn on_run_end(
        &self,
        run_id: &RunId,
        job_type: &str,
        status: RunStatus,
        ts: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        info!(run_id = %run_id, job_type, status = %status, ts = %ts, "Run ended");
        Ok(())
    }

    fn on_step_start(&self, run_id: &RunId, step: u32, ts: DateTime<Utc>) -> anyhow::Result<()> {
        info!(run_id = %run_id, step, ts = %ts, "Step started");
        Ok(())
    }

    fn on_step_end(
        &self,
        run_id: &RunId,
        step: u32,
        ts: DateTime<Utc>,
        rows_processed: u64,
        outcome: StepOutcome,
    ) -> anyhow::Result<()> {
        info!(run_id = %run_id, step, ts = %ts, rows = rows_processed, outcome = %outcome, "Step ended");
        Ok(())
    }
}
