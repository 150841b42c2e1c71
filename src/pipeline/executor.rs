//! Pipeline executor: the run/step state machine.
//!
//! Epistemic foundation:
//! - K_i: A `done` step is never re-executed; a `running` one resumes from its cursor
//! - K_i: Step N+1 starts only after step N's checkpoint is durably `done`
//! - K_i: A step failure halts the run; later steps are never attempted
//! - B_i: The previous attempt may have crashed anywhere → checkpoints decide
//! - B_i: A step may outlive the lease TTL → heartbeat renews it while the step runs
//! - K_i: A run that lost its lease stops and writes nothing further
//! - I^R: Fresh vs resume, concurrency and breaker thresholds are operator choices

use super::{HookRegistry, Pipeline, Step, StepHook, StepOutcome};
use crate::checkpoint::{CheckpointStore, Database, RunLedger, UnitWriter};
use crate::client::{
    BreakerRegistry, CircuitState, OrphanResourceWarning, ProcessOwner, ProcessProbe,
    ResourceTracker, SessionProvider, SystemProbe,
};
use crate::models::{Config, HarvestError, Result, RunId, RunMode, RunStatus, StepStatus};
use crate::pool::{PoolOutcome, PoolReport, StepWork, WorkerPool};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-step line of a run report.
#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub step: u32,
    pub name: String,
    pub status: StepStatus,
    /// Rows recorded on the checkpoint, across all attempts
    pub rows_processed: u64,
    pub succeeded: u64,
    pub hard_failed: u64,
    pub retries: u64,
    /// Already `done` from an earlier attempt
    pub skipped: bool,
}

/// What an operator needs to decide between resuming now and waiting out an outage.
#[derive(Debug, Clone, Serialize)]
pub struct StepFailureReport {
    pub step: u32,
    pub name: String,
    /// Units recorded as hard failures for this step
    pub hard_failed: u64,
    /// Last observed state of the step's breaker
    pub breaker: CircuitState,
    pub reason: String,
}

impl fmt::Display for StepFailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step {} ({}) failed: {}; {} hard-failed units; breaker {}",
            self.step, self.name, self.reason, self.hard_failed, self.breaker
        )
    }
}

/// Outcome of one pipeline invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub job_type: String,
    pub status: RunStatus,
    pub steps: Vec<StepSummary>,
    /// Sessions cleaned up by the startup sweep
    pub orphans: Vec<OrphanResourceWarning>,
    pub failure: Option<StepFailureReport>,
}

impl RunReport {
    /// Convert a failed run into [`HarvestError::StepFailure`].
    pub fn into_result(self) -> Result<Self> {
        match &self.failure {
            Some(failure) if self.status == RunStatus::Failed => Err(HarvestError::StepFailure {
                step: failure.step,
                name: failure.name.clone(),
                reason: failure.to_string(),
            }),
            _ => Ok(self),
        }
    }

    pub fn total_rows(&self) -> u64 {
        self.steps.iter().map(|s| s.rows_processed).sum()
    }
}

/// How a single step attempt ended.
enum StepEnd {
    Done(PoolReport),
    Stopped(PoolReport),
    Failed {
        reason: String,
        report: Option<PoolReport>,
    },
}

/// Runs pipelines against the state database.
pub struct PipelineExecutor {
    db: Arc<Database>,
    config: Config,
    sessions: Arc<dyn SessionProvider>,
    probe: Arc<dyn ProcessProbe>,
    owner: ProcessOwner,
    hooks: HookRegistry,
    stop: CancellationToken,
}

impl PipelineExecutor {
    pub fn new(db: Arc<Database>, config: Config, sessions: Arc<dyn SessionProvider>) -> Self {
        Self {
            db,
            config,
            sessions,
            probe: Arc::new(SystemProbe),
            owner: ProcessOwner::current(),
            hooks: HookRegistry::new(),
            stop: CancellationToken::new(),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Act as `owner` for leases and resource ownership.
    pub fn with_owner(mut self, owner: ProcessOwner) -> Self {
        self.owner = owner;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn StepHook>) -> Self {
        self.hooks.register(hook);
        self
    }

    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    /// Token that stops the run between units when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn ledger(&self) -> RunLedger {
        RunLedger::new(Arc::clone(&self.db), Arc::clone(&self.probe), self.config.lease.ttl())
            .with_owner(self.owner.clone())
    }

    pub fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(Arc::clone(&self.db))
    }

    pub fn tracker(&self) -> ResourceTracker {
        ResourceTracker::new(
            Arc::clone(&self.db),
            Arc::clone(&self.probe),
            self.config.sessions.max_live,
        )
        .with_owner(self.owner.clone())
    }

    /// Execute `pipeline`, fresh or resuming its latest unfinished run.
    ///
    /// Step failures are reported in the returned [`RunReport`]; `Err` is
    /// reserved for run-level problems (lease conflict, state database).
    ///
    /// A run that loses its lease stops and returns [`HarvestError::LeaseLost`]
    /// without touching the run's status, which the new holder now owns.
    pub async fn run(&self, pipeline: &Pipeline, mode: RunMode) -> Result<RunReport> {
        let job_type = pipeline.job_type();
        if pipeline.is_empty() {
            return Err(HarvestError::precondition(format!(
                "pipeline '{job_type}' has no steps"
            )));
        }

        let ledger = self.ledger();
        let store = self.checkpoints();
        let tracker = Arc::new(self.tracker());

        let run_id = ledger.register(job_type, mode)?;
        let orphans = tracker.sweep_orphans(&run_id, self.sessions.as_ref())?;
        ledger.mark_running(&run_id)?;
        self.hooks.run_start(&run_id, job_type, mode);
        info!(run_id = %run_id, job_type, mode = %mode, steps = pipeline.len(), "Pipeline started");

        let breakers = Arc::new(BreakerRegistry::new(self.config.breaker_for(job_type)));
        let pool = WorkerPool::new(
            UnitWriter::new(Arc::clone(&self.db)).with_fence(ledger.fence(job_type)),
            Arc::clone(&tracker),
            Arc::clone(&self.sessions),
            self.config.sessions.profile.clone(),
            self.config.pool_for(job_type),
            Arc::clone(&breakers),
        );

        let mut report = RunReport {
            run_id: run_id.clone(),
            job_type: job_type.to_string(),
            status: RunStatus::Running,
            steps: Vec::with_capacity(pipeline.len()),
            orphans,
            failure: None,
        };

        for (index, step) in pipeline.steps().iter().enumerate() {
            let step_no = index as u32 + 1;

            if let Some(cp) = store.get(&run_id, step_no)? {
                if cp.status == StepStatus::Done {
                    debug!(run_id = %run_id, step = step_no, "Step already done, skipping");
                    report.steps.push(StepSummary {
                        step: step_no,
                        name: step.name().to_string(),
                        status: StepStatus::Done,
                        rows_processed: cp.rows_processed,
                        succeeded: 0,
                        hard_failed: 0,
                        retries: 0,
                        skipped: true,
                    });
                    continue;
                }
            }

            if self.stop.is_cancelled() {
                return self.finish_aborted(&ledger, report);
            }

            if !ledger.renew_lease(job_type, &run_id)? {
                return Err(lease_lost(job_type, &run_id));
            }
            self.hooks.step_start(&run_id, step_no);
            info!(run_id = %run_id, step = step_no, name = step.name(), "Step starting");

            let step_stop = self.stop.child_token();
            let finished = CancellationToken::new();
            let (end, held) = tokio::join!(
                async {
                    let end = self
                        .run_step(&pool, &store, &run_id, step_no, step, &step_stop)
                        .await;
                    finished.cancel();
                    end
                },
                keep_lease(&ledger, job_type, &run_id, &finished, &step_stop),
            );
            let end = match end {
                _ if !held => Err(lease_lost(job_type, &run_id)),
                Err(e) if e.is_lease_lost() => Err(e),
                Ok(end) => Ok(end),
                Err(e) => Ok(StepEnd::Failed {
                    reason: e.to_string(),
                    report: None,
                }),
            };
            let end = match end {
                Ok(end) => end,
                Err(e) => {
                    let rows = store
                        .get(&run_id, step_no)?
                        .map_or(0, |cp| cp.rows_processed);
                    self.hooks.step_end(&run_id, step_no, rows, StepOutcome::Aborted);
                    return Err(e);
                }
            };

            match end {
                StepEnd::Done(pool_report) => {
                    let rows = store
                        .get(&run_id, step_no)?
                        .map_or(pool_report.rows_processed, |cp| cp.rows_processed);
                    self.hooks.step_end(&run_id, step_no, rows, StepOutcome::Done);
                    report.steps.push(summary(
                        step_no,
                        step.as_ref(),
                        StepStatus::Done,
                        rows,
                        &pool_report,
                    ));
                }
                StepEnd::Stopped(pool_report) => {
                    let rows = store
                        .get(&run_id, step_no)?
                        .map_or(0, |cp| cp.rows_processed);
                    self.hooks.step_end(&run_id, step_no, rows, StepOutcome::Aborted);
                    report.steps.push(summary(
                        step_no,
                        step.as_ref(),
                        StepStatus::Running,
                        rows,
                        &pool_report,
                    ));
                    return self.finish_aborted(&ledger, report);
                }
                StepEnd::Failed {
                    reason,
                    report: pool_report,
                } => {
                    let failure = self.fail_step(
                        &store,
                        &breakers,
                        &run_id,
                        step_no,
                        step.as_ref(),
                        reason,
                    )?;
                    let rows = store
                        .get(&run_id, step_no)?
                        .map_or(0, |cp| cp.rows_processed);
                    self.hooks.step_end(&run_id, step_no, rows, StepOutcome::Failed);
                    if let Some(pool_report) = &pool_report {
                        report.steps.push(summary(
                            step_no,
                            step.as_ref(),
                            StepStatus::Failed,
                            rows,
                            pool_report,
                        ));
                    }

                    error!(run_id = %run_id, failure = %failure, "Run failed");
                    ledger.mark_failed(&run_id, &failure.to_string())?;
                    self.hooks.run_end(&run_id, job_type, RunStatus::Failed);
                    report.status = RunStatus::Failed;
                    report.failure = Some(failure);
                    return Ok(report);
                }
            }
        }

        if !ledger.renew_lease(job_type, &run_id)? {
            return Err(lease_lost(job_type, &run_id));
        }
        ledger.mark_completed(&run_id)?;
        self.hooks.run_end(&run_id, job_type, RunStatus::Completed);
        report.status = RunStatus::Completed;
        info!(run_id = %run_id, rows = report.total_rows(), "Pipeline completed");
        Ok(report)
    }

    async fn run_step(
        &self,
        pool: &WorkerPool,
        store: &CheckpointStore,
        run_id: &RunId,
        step_no: u32,
        step: &Arc<dyn Step>,
        stop: &CancellationToken,
    ) -> Result<StepEnd> {
        let cursor = store.begin_step(run_id, step_no, step.name())?;
        let units = step.units(&cursor).map_err(HarvestError::Source)?;
        let work = StepWork {
            run_id: run_id.clone(),
            step: step_no,
            done: store.terminal_units(run_id, step_no)?,
            prior_failures: store.retry_counts(run_id, step_no)?,
            cursor,
            units,
        };
        if work.units.len() == 1 {
            debug!(run_id = %run_id, step = step_no, "Single-unit step, running inline");
        }

        let report = pool.run(Arc::clone(step), work, stop).await?;
        match &report.outcome {
            PoolOutcome::Completed => {
                store.complete_step(run_id, step_no)?;
                Ok(StepEnd::Done(report))
            }
            PoolOutcome::Stopped => Ok(StepEnd::Stopped(report)),
            PoolOutcome::BreakerTripped(state) => Ok(StepEnd::Failed {
                reason: format!("circuit breaker open past max pause ({state})"),
                report: Some(report),
            }),
            PoolOutcome::Incomplete { remaining } => Ok(StepEnd::Failed {
                reason: format!("{remaining} units left unprocessed"),
                report: Some(report),
            }),
        }
    }

    fn fail_step(
        &self,
        store: &CheckpointStore,
        breakers: &BreakerRegistry,
        run_id: &RunId,
        step_no: u32,
        step: &dyn Step,
        reason: String,
    ) -> Result<StepFailureReport> {
        match store.fail_step(run_id, step_no, &reason) {
            Ok(()) => {}
            // The step never got as far as `begin_step`.
            Err(HarvestError::Precondition(detail)) => {
                warn!(run_id = %run_id, step = step_no, detail = %detail, "Step checkpoint not failed");
            }
            Err(e) => return Err(e),
        }
        let hard_failed = store.unit_counts(run_id, step_no)?.hard_failure;
        Ok(StepFailureReport {
            step: step_no,
            name: step.name().to_string(),
            hard_failed,
            breaker: breakers.get(step.dependency()).snapshot(),
            reason,
        })
    }

    fn finish_aborted(&self, ledger: &RunLedger, mut report: RunReport) -> Result<RunReport> {
        warn!(run_id = %report.run_id, "Stop requested, run aborted");
        ledger.mark_aborted(&report.run_id)?;
        self.hooks
            .run_end(&report.run_id, &report.job_type, RunStatus::Aborted);
        report.status = RunStatus::Aborted;
        Ok(report)
    }
}

/// Renew the run's lease every third of its TTL until `finished` fires.
///
/// Returns `false` after cancelling `halt` once another process holds the
/// lease. Renewal errors are retried on the next tick.
async fn keep_lease(
    ledger: &RunLedger,
    job_type: &str,
    run_id: &RunId,
    finished: &CancellationToken,
    halt: &CancellationToken,
) -> bool {
    let period = (ledger.lease_ttl() / 3).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = finished.cancelled() => return true,
            _ = ticker.tick() => {}
        }
        match ledger.renew_lease(job_type, run_id) {
            Ok(true) => debug!(run_id = %run_id, "Lease renewed"),
            Ok(false) => {
                halt.cancel();
                return false;
            }
            Err(e) => warn!(run_id = %run_id, error = %e, "Lease renewal failed"),
        }
    }
}

fn lease_lost(job_type: &str, run_id: &RunId) -> HarvestError {
    error!(job_type, run_id = %run_id, "Run lease lost, stopping without further writes");
    HarvestError::LeaseLost {
        job_type: job_type.to_string(),
        run_id: run_id.clone(),
    }
}

fn summary(
    step_no: u32,
    step: &dyn Step,
    status: StepStatus,
    rows_processed: u64,
    report: &PoolReport,
) -> StepSummary {
    StepSummary {
        step: step_no,
        name: step.name().to_string(),
        status,
        rows_processed,
        succeeded: report.succeeded,
        hard_failed: report.hard_failed,
        retries: report.retries,
        skipped: false,
    }
}
