//! Worker pool driving a step's units through sessions, the breaker and the writer.
//!
//! Epistemic foundation:
//! - K_i: Workers never write checkpoints; one committer task owns all state writes
//! - K_i: Every unit ends terminal (success or hard failure) or stays resumable
//! - K_i: A unit's output, outcome and the cursor advance commit in one transaction
//! - B_i: Each attempt may fail softly → bounded retry with backoff
//! - B_i: Session slots may all be taken → wait without spending an attempt
//! - I^B: Target outage length is unknowable → breaker max pause fails the step

use super::UnitAttempt;
use crate::checkpoint::{UnitCommit, UnitWriter};
use crate::client::{
    BreakerRegistry, BreakerWait, CircuitBreaker, CircuitState, ResourceGuard, ResourceTracker,
    Session, SessionProvider,
};
use crate::models::{
    Cursor, HarvestError, PoolConfig, ReleaseReason, Result, RunId, SessionProfile, Unit,
    UnitError, UnitOutcome,
};
use crate::pipeline::Step;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Units of one step handed to the pool.
#[derive(Debug, Clone)]
pub struct StepWork {
    pub run_id: RunId,
    pub step: u32,
    /// Cursor the units were listed from
    pub cursor: Cursor,
    /// Every unit listed from `cursor`, in input order
    pub units: Vec<Unit>,
    /// Keys already terminal from an earlier attempt
    pub done: HashSet<String>,
    /// Soft failures already spent, by key
    pub prior_failures: HashMap<String, u32>,
}

impl StepWork {
    /// Units that still need processing.
    pub fn pending(&self) -> usize {
        self.units
            .iter()
            .filter(|u| !self.done.contains(&u.key))
            .count()
    }
}

/// How a pool invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolOutcome {
    /// Every unit is terminal
    Completed,
    /// The stop signal fired; remaining units stay resumable
    Stopped,
    /// The breaker stayed open past the max pause
    BreakerTripped(CircuitState),
    /// Workers exited with units left over (e.g. a worker panicked)
    Incomplete { remaining: usize },
}

/// Counters of one pool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolReport {
    pub succeeded: u64,
    pub hard_failed: u64,
    /// Soft failures that were retried
    pub retries: u64,
    /// Units made terminal by this invocation
    pub rows_processed: u64,
    pub outcome: PoolOutcome,
}

/// Message from a worker to the committer.
#[derive(Debug)]
enum WorkerEvent {
    Finished {
        index: usize,
        unit: Unit,
        attempts: u32,
        output: std::result::Result<serde_json::Value, String>,
    },
    Retrying {
        unit_key: String,
        attempts: u32,
        error: String,
    },
    Outage(CircuitState),
}

/// Bounded concurrent executor for step units.
pub struct WorkerPool {
    writer: UnitWriter,
    tracker: Arc<ResourceTracker>,
    sessions: Arc<dyn SessionProvider>,
    profile: SessionProfile,
    config: PoolConfig,
    breakers: Arc<BreakerRegistry>,
}

impl WorkerPool {
    pub fn new(
        writer: UnitWriter,
        tracker: Arc<ResourceTracker>,
        sessions: Arc<dyn SessionProvider>,
        profile: SessionProfile,
        config: PoolConfig,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            writer,
            tracker,
            sessions,
            profile,
            config,
            breakers,
        }
    }

    /// Process `work` with up to the step's concurrency in parallel workers.
    ///
    /// A single worker runs inline on the calling task. Session steps never
    /// run more workers than the tracker's live-session cap. Returns once every
    /// unit is terminal, the stop signal fires, or the breaker trips.
    pub async fn run(
        &self,
        step: Arc<dyn Step>,
        work: StepWork,
        stop: &CancellationToken,
    ) -> Result<PoolReport> {
        let pending = work.pending();
        let mut concurrency = step.concurrency().unwrap_or(self.config.concurrency);
        if step.needs_session() {
            if let Some(max) = self.tracker.max_live() {
                concurrency = concurrency.min(max);
            }
        }
        let concurrency = concurrency.clamp(1, pending.max(1));
        let breaker = self.breakers.get(step.dependency());
        let halt = stop.child_token();

        info!(
            run_id = %work.run_id,
            step = work.step,
            name = step.name(),
            units = work.units.len(),
            pending,
            concurrency,
            "Starting worker pool"
        );

        let queue: VecDeque<_> = work
            .units
            .iter()
            .enumerate()
            .filter(|(_, unit)| !work.done.contains(&unit.key))
            .map(|(index, unit)| {
                let prior = work.prior_failures.get(&unit.key).copied().unwrap_or(0);
                (index, unit.clone(), prior)
            })
            .collect();
        let queue = Arc::new(Mutex::new(queue));

        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(WorkerContext {
            run_id: work.run_id.clone(),
            step_no: work.step,
            step: Arc::clone(&step),
            breaker,
            max_pause: self.breakers.max_pause(),
            config: self.config.clone(),
            tracker: Arc::clone(&self.tracker),
            sessions: Arc::clone(&self.sessions),
            profile: self.profile.clone(),
            halt: halt.clone(),
            events: tx,
        });

        let progress = self.progress_bar(&work, step.name());
        let mut committer = Committer::new(&self.writer, step.as_ref(), &work, progress);
        if committer.low > 0 {
            committer.flush(Vec::new())?;
        }

        if pending == 0 {
            drop(ctx);
        } else if concurrency == 1 {
            let (drained, ()) = tokio::join!(
                drain(&mut committer, rx, self.config.batch_size, &halt),
                worker_loop(ctx, 0, queue),
            );
            drained?;
        } else {
            let handles: Vec<_> = (0..concurrency)
                .map(|slot| {
                    tokio::spawn(worker_loop(Arc::clone(&ctx), slot as u32, Arc::clone(&queue)))
                })
                .collect();
            drop(ctx);

            let drained = drain(&mut committer, rx, self.config.batch_size, &halt).await;
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Worker task failed");
                }
            }
            drained?;
        }

        let report = committer.finish(stop);
        info!(
            run_id = %work.run_id,
            step = work.step,
            succeeded = report.succeeded,
            hard_failed = report.hard_failed,
            retries = report.retries,
            rows = report.rows_processed,
            outcome = ?report.outcome,
            "Worker pool finished"
        );
        Ok(report)
    }

    fn progress_bar(&self, work: &StepWork, name: &str) -> ProgressBar {
        if !self.config.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(work.units.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
        {
            pb.set_style(style.progress_chars("##-"));
        }
        pb.set_message(name.to_string());
        pb.set_position((work.units.len() - work.pending()) as u64);
        pb
    }
}

/// Forward worker events to the committer in batches until every worker is gone.
async fn drain(
    committer: &mut Committer<'_>,
    mut rx: mpsc::UnboundedReceiver<WorkerEvent>,
    batch_size: usize,
    halt: &CancellationToken,
) -> Result<()> {
    while let Some(first) = rx.recv().await {
        let mut events = vec![first];
        while events.len() < batch_size.max(1) {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }
        if let Err(e) = committer.flush(events) {
            halt.cancel();
            return Err(e);
        }
    }
    Ok(())
}

/// Counters accumulated by one committed batch.
#[derive(Default)]
struct BatchTally {
    succeeded: u64,
    hard_failed: u64,
    retries: u64,
    newly_terminal: HashSet<usize>,
    /// Units found already committed by an earlier batch
    duplicates: u64,
    low: usize,
    cursor: Option<Cursor>,
}

/// Sole writer of unit outcomes and checkpoint progress for one pool run.
struct Committer<'a> {
    writer: &'a UnitWriter,
    step: &'a dyn Step,
    run_id: &'a RunId,
    step_no: u32,
    from: &'a Cursor,
    units: &'a [Unit],
    terminal: Vec<bool>,
    /// Length of the all-terminal prefix of `units`
    low: usize,
    cursor: Cursor,
    succeeded: u64,
    hard_failed: u64,
    retries: u64,
    rows_processed: u64,
    outage: Option<CircuitState>,
    progress: ProgressBar,
}

impl<'a> Committer<'a> {
    fn new(
        writer: &'a UnitWriter,
        step: &'a dyn Step,
        work: &'a StepWork,
        progress: ProgressBar,
    ) -> Self {
        let terminal: Vec<bool> = work
            .units
            .iter()
            .map(|u| work.done.contains(&u.key))
            .collect();
        let low = terminal.iter().take_while(|t| **t).count();
        Self {
            writer,
            step,
            run_id: &work.run_id,
            step_no: work.step,
            from: &work.cursor,
            units: &work.units,
            terminal,
            low,
            cursor: work.cursor.clone(),
            succeeded: 0,
            hard_failed: 0,
            retries: 0,
            rows_processed: 0,
            outage: None,
            progress,
        }
    }

    /// Commit `events` and the resulting cursor advance in one transaction.
    ///
    /// An empty batch only moves the cursor over units already terminal.
    fn flush(&mut self, events: Vec<WorkerEvent>) -> Result<()> {
        let mut outage = None;
        let tally = self.writer.commit_batch(self.run_id, self.step_no, |batch| {
            let mut tally = BatchTally::default();
            for event in events {
                match event {
                    WorkerEvent::Finished {
                        index,
                        unit,
                        attempts,
                        output: Ok(value),
                    } => {
                        let commit = batch.commit_unit(&unit.key, attempts, |conn| {
                            self.step.persist(conn, &unit, &value)
                        })?;
                        match commit {
                            UnitCommit::Committed => tally.succeeded += 1,
                            UnitCommit::AlreadyCommitted => tally.duplicates += 1,
                            UnitCommit::RolledBack { .. } => tally.hard_failed += 1,
                        }
                        tally.newly_terminal.insert(index);
                    }
                    WorkerEvent::Finished {
                        index,
                        unit,
                        attempts,
                        output: Err(error),
                    } => {
                        batch.record_outcome(
                            &unit.key,
                            UnitOutcome::HardFailure,
                            attempts,
                            Some(&error),
                        )?;
                        tally.hard_failed += 1;
                        tally.newly_terminal.insert(index);
                    }
                    WorkerEvent::Retrying {
                        unit_key,
                        attempts,
                        error,
                    } => {
                        batch.record_outcome(
                            &unit_key,
                            UnitOutcome::SoftFailure,
                            attempts,
                            Some(&error),
                        )?;
                        tally.retries += 1;
                    }
                    WorkerEvent::Outage(state) => outage = Some(state),
                }
            }

            let mut low = self.low;
            while low < self.units.len()
                && (self.terminal[low] || tally.newly_terminal.contains(&low))
            {
                low += 1;
            }
            tally.low = low;
            if low > self.low {
                tally.cursor = Some(self.step.advance_cursor(
                    self.from,
                    &self.units[low - 1],
                    low as u64,
                ));
            }

            let delta = tally.newly_terminal.len() as u64 - tally.duplicates;
            if delta > 0 || tally.cursor.is_some() {
                let cursor = tally.cursor.as_ref().unwrap_or(&self.cursor);
                batch.advance_checkpoint(cursor, delta)?;
            }
            Ok(tally)
        })?;

        for &index in &tally.newly_terminal {
            if let Some(slot) = self.terminal.get_mut(index) {
                *slot = true;
            }
        }
        self.low = tally.low;
        if let Some(cursor) = tally.cursor {
            self.cursor = cursor;
        }
        self.succeeded += tally.succeeded;
        self.hard_failed += tally.hard_failed;
        self.retries += tally.retries;
        self.rows_processed += tally.newly_terminal.len() as u64 - tally.duplicates;
        self.progress.inc(tally.newly_terminal.len() as u64);
        if outage.is_some() {
            self.outage = outage;
        }
        Ok(())
    }

    fn finish(self, stop: &CancellationToken) -> PoolReport {
        let remaining = self.terminal.iter().filter(|t| !**t).count();
        let outcome = match self.outage {
            Some(state) if remaining > 0 => PoolOutcome::BreakerTripped(state),
            _ if remaining == 0 => PoolOutcome::Completed,
            _ if stop.is_cancelled() => PoolOutcome::Stopped,
            _ => PoolOutcome::Incomplete { remaining },
        };
        self.progress.finish_and_clear();
        PoolReport {
            succeeded: self.succeeded,
            hard_failed: self.hard_failed,
            retries: self.retries,
            rows_processed: self.rows_processed,
            outcome,
        }
    }
}

/// A tracked session held by one worker.
struct LiveSession {
    guard: ResourceGuard,
    session: Session,
}

/// Why a worker has no session for its next attempt.
enum SessionUnavailable {
    /// Every session slot is live; not a failure of the unit
    AtCapacity { live: usize, max: usize },
    Failed(anyhow::Error),
}

/// State shared by the workers of one pool run.
struct WorkerContext {
    run_id: RunId,
    step_no: u32,
    step: Arc<dyn Step>,
    breaker: Arc<CircuitBreaker>,
    max_pause: Duration,
    config: PoolConfig,
    tracker: Arc<ResourceTracker>,
    sessions: Arc<dyn SessionProvider>,
    profile: SessionProfile,
    /// Child of the stop signal; also cancelled on breaker outage
    halt: CancellationToken,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

type UnitQueue = Arc<Mutex<VecDeque<(usize, Unit, u32)>>>;

async fn worker_loop(ctx: Arc<WorkerContext>, slot: u32, queue: UnitQueue) {
    let mut live: Option<LiveSession> = None;
    let mut processed = 0usize;

    loop {
        if ctx.halt.is_cancelled() {
            break;
        }
        let next = queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let Some((index, unit, prior)) = next else {
            break;
        };
        if !ctx.drive_unit(slot, index, unit, prior, &mut live).await {
            break;
        }
        processed += 1;
    }

    if let Some(live) = live.take() {
        let reason = if ctx.halt.is_cancelled() {
            ReleaseReason::Stopped
        } else {
            ReleaseReason::Completed
        };
        ctx.close_session(live, reason).await;
    }
    debug!(run_id = %ctx.run_id, step = ctx.step_no, slot, processed, "Worker finished");
}

impl WorkerContext {
    /// Run one unit to a terminal outcome. Returns `false` if the worker must stop.
    async fn drive_unit(
        &self,
        slot: u32,
        index: usize,
        unit: Unit,
        prior_failures: u32,
        live: &mut Option<LiveSession>,
    ) -> bool {
        let mut state = UnitAttempt::resume(prior_failures);
        let mut capacity_waits = 0u32;
        loop {
            let permit = match self.breaker.wait_for_permit(self.max_pause, &self.halt).await {
                BreakerWait::Permitted(permit) => permit,
                BreakerWait::Outage(circuit) => {
                    let _ = self.events.send(WorkerEvent::Outage(circuit));
                    self.halt.cancel();
                    return false;
                }
                BreakerWait::Stopped => return false,
            };

            let result = match self.ensure_session(slot, live).await {
                Ok(session) => {
                    let result = self.step.process(&unit, session).await;
                    match &result {
                        Err(UnitError::Soft(_)) => self.breaker.record_failure(permit),
                        Err(UnitError::SessionLost(reason)) => {
                            self.breaker.cancel_trial(permit);
                            warn!(slot, unit = %unit.key, reason = %reason, "Session lost, reopening");
                            if let Some(lost) = live.take() {
                                self.close_session(lost, ReleaseReason::Crashed).await;
                            }
                        }
                        Ok(_) | Err(UnitError::Hard(_)) => self.breaker.record_success(permit),
                    }
                    result
                }
                Err(SessionUnavailable::AtCapacity { live: held, max }) => {
                    self.breaker.cancel_trial(permit);
                    capacity_waits += 1;
                    let delay = self.config.backoff(capacity_waits);
                    debug!(
                        slot,
                        unit = %unit.key,
                        live = held,
                        max,
                        delay_ms = delay.as_millis() as u64,
                        "Session slots full, waiting"
                    );
                    tokio::select! {
                        _ = self.halt.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
                Err(SessionUnavailable::Failed(e)) => {
                    self.breaker.cancel_trial(permit);
                    Err(UnitError::soft(format!("session unavailable: {e:#}")))
                }
            };

            let error = result.as_ref().err().map(ToString::to_string);
            state = state.next(result.as_ref().err(), self.config.max_attempts);

            if let UnitAttempt::Terminal { attempts, outcome } = state {
                if outcome == UnitOutcome::HardFailure {
                    warn!(
                        run_id = %self.run_id,
                        step = self.step_no,
                        unit = %unit.key,
                        attempts,
                        error = error.as_deref().unwrap_or_default(),
                        "Unit hard-failed"
                    );
                }
                let _ = self.events.send(WorkerEvent::Finished {
                    index,
                    unit,
                    attempts,
                    output: result.map_err(|e| e.to_string()),
                });
                return true;
            }

            let attempts = state.attempts();
            let error = error.unwrap_or_default();
            let delay = self.config.backoff(attempts);
            debug!(
                step = self.step_no,
                unit = %unit.key,
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Unit soft-failed, retrying"
            );
            let _ = self.events.send(WorkerEvent::Retrying {
                unit_key: unit.key.clone(),
                attempts,
                error,
            });
            tokio::select! {
                _ = self.halt.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Open and track a session for this worker if the step needs one.
    async fn ensure_session<'s>(
        &self,
        slot: u32,
        live: &'s mut Option<LiveSession>,
    ) -> std::result::Result<Option<&'s Session>, SessionUnavailable> {
        if !self.step.needs_session() {
            return Ok(None);
        }
        if live.is_none() {
            let guard = match self.tracker.guard(&self.run_id, self.step_no, slot) {
                Ok(guard) => guard,
                Err(HarvestError::ResourceExhausted { live: held, max }) => {
                    return Err(SessionUnavailable::AtCapacity { live: held, max });
                }
                Err(e) => return Err(SessionUnavailable::Failed(e.into())),
            };
            let session = match self.sessions.open(&self.profile).await {
                Ok(session) => session,
                Err(e) => {
                    if let Err(re) = guard.release(ReleaseReason::Crashed) {
                        warn!(error = %re, "Failed to release resource after open failure");
                    }
                    return Err(SessionUnavailable::Failed(
                        e.context("opening automation session"),
                    ));
                }
            };
            if let Some(pid) = session.pid {
                if let Err(e) = guard.attach_pid(pid) {
                    self.close_session(LiveSession { guard, session }, ReleaseReason::Crashed)
                        .await;
                    return Err(SessionUnavailable::Failed(e.into()));
                }
            }
            debug!(slot, resource_id = %guard.id(), session = %session.id, "Session opened");
            *live = Some(LiveSession { guard, session });
        }
        Ok(live.as_ref().map(|l| &l.session))
    }

    async fn close_session(&self, live: LiveSession, reason: ReleaseReason) {
        let LiveSession { guard, session } = live;
        if let Err(e) = self.sessions.close(session).await {
            warn!(resource_id = %guard.id(), error = %e, "Failed to close session");
        }
        if let Err(e) = guard.release(reason) {
            warn!(error = %e, "Failed to release resource");
        }
    }
}
