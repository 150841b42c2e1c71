//! Per-unit transactional commits of step output and checkpoint progress.
//!
//! Epistemic foundation:
//! - K_i: A unit's output write and its outcome row commit together or not at all
//! - K_i: One failing unit rolls back only its own savepoint, never the batch
//! - K_i: The cursor advance shares the batch transaction with the units it covers
//! - K_i: A unit already `success` is never written again
//! - K_i: A batch commits only while its run still holds the job type's lease
//! - I^B: Crash before commit → the whole batch is replayed on resume

use super::database::Database;
use super::ledger::LeaseFence;
use super::state::{advance_in, record_unit_in, unit_outcome_in};
use crate::models::{Cursor, Result, RunId, UnitOutcome};
use rusqlite::{Connection, TransactionBehavior};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of committing a single unit inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitCommit {
    /// Output and `success` outcome are durable with the batch
    Committed,
    /// An earlier commit already made the unit `success`; nothing was written
    AlreadyCommitted,
    /// The write failed; its effects were discarded and the unit recorded as a hard failure
    RolledBack { error: String },
}

impl UnitCommit {
    /// Whether the unit's output is durable, from this commit or an earlier one.
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed | Self::AlreadyCommitted)
    }
}

/// Writes unit outputs and checkpoint progress to the state database.
#[derive(Clone)]
pub struct UnitWriter {
    db: Arc<Database>,
    fence: Option<LeaseFence>,
}

impl UnitWriter {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db, fence: None }
    }

    /// Renew `fence` with every batch, refusing batches once the lease is lost.
    pub fn with_fence(mut self, fence: LeaseFence) -> Self {
        self.fence = Some(fence);
        self
    }

    /// Run `f` over one outer transaction, committing if it returns `Ok`.
    ///
    /// Every unit committed through the batch gets its own savepoint. With a
    /// fence, the batch fails with `LeaseLost` before `f` runs if the run no
    /// longer holds its lease.
    pub fn commit_batch<T>(
        &self,
        run_id: &RunId,
        step: u32,
        f: impl FnOnce(&mut UnitBatch<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(fence) = &self.fence {
            fence.hold_in(&tx, run_id)?;
        }
        let mut batch = UnitBatch {
            tx,
            run_id,
            step,
            committed: 0,
            rolled_back: 0,
        };

        let value = f(&mut batch)?;

        let (committed, rolled_back) = (batch.committed, batch.rolled_back);
        batch.tx.commit()?;
        debug!(run_id = %run_id, step, committed, rolled_back, "Unit batch committed");
        Ok(value)
    }

    /// Commit a single unit in its own transaction.
    pub fn commit_unit(
        &self,
        run_id: &RunId,
        step: u32,
        unit_key: &str,
        attempts: u32,
        write_fn: impl FnOnce(&Connection) -> anyhow::Result<()>,
    ) -> Result<UnitCommit> {
        self.commit_batch(run_id, step, |batch| {
            batch.commit_unit(unit_key, attempts, write_fn)
        })
    }
}

/// Open batch transaction handed to [`UnitWriter::commit_batch`] callers.
pub struct UnitBatch<'c> {
    tx: rusqlite::Transaction<'c>,
    run_id: &'c RunId,
    step: u32,
    committed: usize,
    rolled_back: usize,
}

impl UnitBatch<'_> {
    /// Apply `write_fn` and mark the unit `success`, atomically.
    ///
    /// If `write_fn` fails, everything it wrote is rolled back and the unit is
    /// recorded as `hard_failure` instead. A unit already `success` is left
    /// as is and `write_fn` is not called. Errors from the state tables
    /// themselves abort the whole batch.
    pub fn commit_unit(
        &mut self,
        unit_key: &str,
        attempts: u32,
        write_fn: impl FnOnce(&Connection) -> anyhow::Result<()>,
    ) -> Result<UnitCommit> {
        if let Some((UnitOutcome::Success, _)) =
            unit_outcome_in(&self.tx, self.run_id, self.step, unit_key)?
        {
            debug!(
                run_id = %self.run_id,
                step = self.step,
                unit = unit_key,
                "Unit already committed"
            );
            return Ok(UnitCommit::AlreadyCommitted);
        }
        let savepoint = self.tx.savepoint()?;
        match write_fn(&savepoint) {
            Ok(()) => {
                record_unit_in(
                    &savepoint,
                    self.run_id,
                    self.step,
                    unit_key,
                    UnitOutcome::Success,
                    attempts,
                    None,
                )?;
                savepoint.commit()?;
                self.committed += 1;
                Ok(UnitCommit::Committed)
            }
            Err(e) => {
                drop(savepoint);
                let error = format!("{e:#}");
                warn!(
                    run_id = %self.run_id,
                    step = self.step,
                    unit = unit_key,
                    error = %error,
                    "Unit write rolled back"
                );
                record_unit_in(
                    &self.tx,
                    self.run_id,
                    self.step,
                    unit_key,
                    UnitOutcome::HardFailure,
                    attempts,
                    Some(&error),
                )?;
                self.rolled_back += 1;
                Ok(UnitCommit::RolledBack { error })
            }
        }
    }

    /// Record a unit outcome that carries no output (failures, pending).
    pub fn record_outcome(
        &self,
        unit_key: &str,
        outcome: UnitOutcome,
        attempts: u32,
        error: Option<&str>,
    ) -> Result<()> {
        record_unit_in(
            &self.tx,
            self.run_id,
            self.step,
            unit_key,
            outcome,
            attempts,
            error,
        )
    }

    /// Move the step cursor inside this batch.
    pub fn advance_checkpoint(&self, cursor: &Cursor, rows_delta: u64) -> Result<()> {
        advance_in(&self.tx, self.run_id, self.step, cursor, rows_delta)
    }
}
