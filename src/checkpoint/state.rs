//! Checkpoint store: durable step progress per run.
//!
//! Epistemic foundation:
//! - K_i: A step is `done` iff every one of its units is durably terminal
//! - K_i: Cursor updates are single-statement, never read-modify-write
//! - B_i: A checkpoint may not exist yet → Option
//! - I^B: `running` found at startup → previous attempt crashed mid-step

use super::database::{Database, from_db_time_opt, now_db, parse_column};
use crate::models::{
    Cursor, HarvestError, Result, RunId, StepCheckpoint, StepStatus, UnitOutcome,
};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

const CHECKPOINT_COLUMNS: &str =
    "run_id, step, name, status, cursor, rows_processed, started_at, finished_at, last_error";

/// Per-outcome unit counts of one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnitCounts {
    pub pending: u64,
    pub soft_failure: u64,
    pub success: u64,
    pub hard_failure: u64,
}

impl UnitCounts {
    /// Units not yet terminal.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.soft_failure
    }
}

/// Durable record of step progress, keyed by (run, step).
#[derive(Clone)]
pub struct CheckpointStore {
    db: Arc<Database>,
}

impl CheckpointStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn get(&self, run_id: &RunId, step: u32) -> Result<Option<StepCheckpoint>> {
        self.db.with_conn(|conn| read_checkpoint(conn, run_id, step))
    }

    /// All checkpoints of a run, ordered by step number.
    pub fn list(&self, run_id: &RunId) -> Result<Vec<StepCheckpoint>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM step_checkpoints WHERE run_id = ?1 ORDER BY step"
            ))?;
            let rows = stmt.query_map([run_id.as_str()], raw_checkpoint)?;
            rows.map(|row| row?.into_checkpoint()).collect()
        })
    }

    /// Mark a step `running` and return the cursor to resume from.
    ///
    /// Idempotent: a `running` or `done` checkpoint keeps its cursor, and a
    /// `failed` one is restarted from its cursor rather than from scratch.
    pub fn begin_step(&self, run_id: &RunId, step: u32, name: &str) -> Result<Cursor> {
        self.db.with_transaction(|tx| {
            let existing = read_checkpoint(tx, run_id, step)?;
            match existing {
                None => {
                    tx.execute(
                        "INSERT INTO step_checkpoints \
                         (run_id, step, name, status, cursor, rows_processed, started_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
                        params![
                            run_id.as_str(),
                            step,
                            name,
                            StepStatus::Running.as_str(),
                            serde_json::to_string(&Cursor::Start)?,
                            now_db(),
                        ],
                    )?;
                    debug!(run_id = %run_id, step, name, "Step started");
                    Ok(Cursor::Start)
                }
                Some(cp) => match cp.status {
                    StepStatus::Running | StepStatus::Done => {
                        if cp.status == StepStatus::Running {
                            info!(
                                run_id = %run_id,
                                step,
                                rows = cp.rows_processed,
                                cursor = ?cp.cursor,
                                "Resuming interrupted step from cursor"
                            );
                        }
                        Ok(cp.cursor)
                    }
                    StepStatus::Pending | StepStatus::Failed => {
                        tx.execute(
                            "UPDATE step_checkpoints SET status = ?1, finished_at = NULL, \
                             started_at = COALESCE(started_at, ?2) WHERE run_id = ?3 AND step = ?4",
                            params![StepStatus::Running.as_str(), now_db(), run_id.as_str(), step],
                        )?;
                        if cp.status == StepStatus::Failed {
                            info!(
                                run_id = %run_id,
                                step,
                                cursor = ?cp.cursor,
                                "Retrying failed step from cursor"
                            );
                        }
                        Ok(cp.cursor)
                    }
                },
            }
        })
    }

    /// Move the cursor and add to the rows counter of a running step.
    pub fn advance(
        &self,
        run_id: &RunId,
        step: u32,
        cursor: &Cursor,
        rows_delta: u64,
    ) -> Result<()> {
        self.db
            .with_conn(|conn| advance_in(conn, run_id, step, cursor, rows_delta))
    }

    /// Mark a step `done`.
    ///
    /// Fails with [`HarvestError::Precondition`] if the step is not running
    /// or any of its units is still pending or awaiting a retry.
    pub fn complete_step(&self, run_id: &RunId, step: u32) -> Result<()> {
        self.db.with_transaction(|tx| {
            let cp = read_checkpoint(tx, run_id, step)?.ok_or_else(|| {
                HarvestError::precondition(format!("step {step} of run {run_id} was never begun"))
            })?;
            match cp.status {
                StepStatus::Done => return Ok(()),
                StepStatus::Running => {}
                other => {
                    return Err(HarvestError::precondition(format!(
                        "cannot complete step {step} of run {run_id} in status {other}"
                    )));
                }
            }

            let counts = unit_counts_in(tx, run_id, step)?;
            if counts.outstanding() > 0 {
                return Err(HarvestError::precondition(format!(
                    "cannot complete step {step} of run {run_id}: {} units pending, {} awaiting retry",
                    counts.pending, counts.soft_failure
                )));
            }

            tx.execute(
                "UPDATE step_checkpoints SET status = ?1, finished_at = ?2, last_error = NULL \
                 WHERE run_id = ?3 AND step = ?4",
                params![StepStatus::Done.as_str(), now_db(), run_id.as_str(), step],
            )?;
            info!(run_id = %run_id, step, rows = cp.rows_processed, "Step checkpoint done");
            Ok(())
        })
    }

    /// Mark a step `failed` with an error summary.
    pub fn fail_step(&self, run_id: &RunId, step: u32, error_summary: &str) -> Result<()> {
        self.db.with_transaction(|tx| {
            let cp = read_checkpoint(tx, run_id, step)?.ok_or_else(|| {
                HarvestError::precondition(format!("step {step} of run {run_id} was never begun"))
            })?;
            if cp.status == StepStatus::Done {
                return Err(HarvestError::precondition(format!(
                    "step {step} of run {run_id} is already done"
                )));
            }
            tx.execute(
                "UPDATE step_checkpoints SET status = ?1, finished_at = ?2, last_error = ?3 \
                 WHERE run_id = ?4 AND step = ?5",
                params![
                    StepStatus::Failed.as_str(),
                    now_db(),
                    error_summary,
                    run_id.as_str(),
                    step
                ],
            )?;
            Ok(())
        })
    }

    /// Keys of units already terminal for a step; resume skips these.
    pub fn terminal_units(&self, run_id: &RunId, step: u32) -> Result<HashSet<String>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT unit_key FROM unit_outcomes \
                 WHERE run_id = ?1 AND step = ?2 AND outcome IN (?3, ?4)",
            )?;
            let keys = stmt.query_map(
                params![
                    run_id.as_str(),
                    step,
                    UnitOutcome::Success.as_str(),
                    UnitOutcome::HardFailure.as_str()
                ],
                |row| row.get::<_, String>(0),
            )?;
            Ok(keys.collect::<rusqlite::Result<HashSet<_>>>()?)
        })
    }

    /// Failed attempts already spent on units awaiting a retry.
    pub fn retry_counts(&self, run_id: &RunId, step: u32) -> Result<HashMap<String, u32>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT unit_key, attempts FROM unit_outcomes \
                 WHERE run_id = ?1 AND step = ?2 AND outcome = ?3",
            )?;
            let rows = stmt.query_map(
                params![run_id.as_str(), step, UnitOutcome::SoftFailure.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)),
            )?;
            Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
        })
    }

    pub fn unit_counts(&self, run_id: &RunId, step: u32) -> Result<UnitCounts> {
        self.db.with_conn(|conn| unit_counts_in(conn, run_id, step))
    }

    /// Recorded outcome and attempt count of one unit.
    pub fn unit_outcome(
        &self,
        run_id: &RunId,
        step: u32,
        unit_key: &str,
    ) -> Result<Option<(UnitOutcome, u32)>> {
        self.db
            .with_conn(|conn| unit_outcome_in(conn, run_id, step, unit_key))
    }
}

pub(crate) fn unit_outcome_in(
    conn: &Connection,
    run_id: &RunId,
    step: u32,
    unit_key: &str,
) -> Result<Option<(UnitOutcome, u32)>> {
    let row = conn
        .query_row(
            "SELECT outcome, attempts FROM unit_outcomes \
             WHERE run_id = ?1 AND step = ?2 AND unit_key = ?3",
            params![run_id.as_str(), step, unit_key],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)),
        )
        .optional()?;
    row.map(|(outcome, attempts)| Ok((parse_column(&outcome)?, attempts)))
        .transpose()
}

/// Cursor/counter update against an already-locked connection.
///
/// Used directly by the unit writer so the advance commits in the same
/// transaction as the units it covers.
pub(crate) fn advance_in(
    conn: &Connection,
    run_id: &RunId,
    step: u32,
    cursor: &Cursor,
    rows_delta: u64,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE step_checkpoints SET cursor = ?1, rows_processed = rows_processed + ?2 \
         WHERE run_id = ?3 AND step = ?4 AND status = ?5",
        params![
            serde_json::to_string(cursor)?,
            rows_delta as i64,
            run_id.as_str(),
            step,
            StepStatus::Running.as_str()
        ],
    )?;
    if updated == 0 {
        return Err(HarvestError::precondition(format!(
            "cannot advance step {step} of run {run_id}: step is not running"
        )));
    }
    Ok(())
}

/// Upsert a unit's outcome, keyed by its natural key.
pub(crate) fn record_unit_in(
    conn: &Connection,
    run_id: &RunId,
    step: u32,
    unit_key: &str,
    outcome: UnitOutcome,
    attempts: u32,
    error: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO unit_outcomes (run_id, step, unit_key, outcome, attempts, last_error, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT(run_id, step, unit_key) DO UPDATE SET \
         outcome = ?4, attempts = MAX(attempts, ?5), last_error = ?6, updated_at = ?7",
        params![
            run_id.as_str(),
            step,
            unit_key,
            outcome.as_str(),
            attempts,
            error,
            now_db()
        ],
    )?;
    Ok(())
}

fn unit_counts_in(conn: &Connection, run_id: &RunId, step: u32) -> Result<UnitCounts> {
    let mut stmt = conn.prepare(
        "SELECT outcome, COUNT(*) FROM unit_outcomes \
         WHERE run_id = ?1 AND step = ?2 GROUP BY outcome",
    )?;
    let rows = stmt.query_map(params![run_id.as_str(), step], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut counts = UnitCounts::default();
    for row in rows {
        let (outcome, count) = row?;
        let count = count.max(0) as u64;
        match parse_column::<UnitOutcome>(&outcome)? {
            UnitOutcome::Pending => counts.pending = count,
            UnitOutcome::SoftFailure => counts.soft_failure = count,
            UnitOutcome::Success => counts.success = count,
            UnitOutcome::HardFailure => counts.hard_failure = count,
        }
    }
    Ok(counts)
}

struct RawCheckpoint {
    run_id: String,
    step: u32,
    name: String,
    status: String,
    cursor: String,
    rows_processed: i64,
    started_at: Option<String>,
    finished_at: Option<String>,
    last_error: Option<String>,
}

impl RawCheckpoint {
    fn into_checkpoint(self) -> Result<StepCheckpoint> {
        Ok(StepCheckpoint {
            run_id: RunId::from(self.run_id),
            step: self.step,
            name: self.name,
            status: parse_column(&self.status)?,
            cursor: serde_json::from_str(&self.cursor)?,
            rows_processed: self.rows_processed.max(0) as u64,
            started_at: from_db_time_opt(self.started_at)?,
            finished_at: from_db_time_opt(self.finished_at)?,
            last_error: self.last_error,
        })
    }
}

fn raw_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCheckpoint> {
    Ok(RawCheckpoint {
        run_id: row.get(0)?,
        step: row.get(1)?,
        name: row.get(2)?,
        status: row.get(3)?,
        cursor: row.get(4)?,
        rows_processed: row.get(5)?,
        started_at: row.get(6)?,
        finished_at: row.get(7)?,
        last_error: row.get(8)?,
    })
}

fn read_checkpoint(conn: &Connection, run_id: &RunId, step: u32) -> Result<Option<StepCheckpoint>> {
    conn.query_row(
        &format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM step_checkpoints WHERE run_id = ?1 AND step = ?2"
        ),
        params![run_id.as_str(), step],
        raw_checkpoint,
    )
    .optional()?
    .map(RawCheckpoint::into_checkpoint)
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::testing::seed_run;

    fn store() -> (CheckpointStore, RunId) {
        let db = Arc::new(Database::in_memory().unwrap());
        let run_id = seed_run(&db, "listings");
        (CheckpointStore::new(db), run_id)
    }

    #[test]
    fn begin_step_starts_fresh_at_start_cursor() {
        let (store, run) = store();
        assert!(store.get(&run, 1).unwrap().is_none());

        let cursor = store.begin_step(&run, 1, "fetch ids").unwrap();
        assert_eq!(cursor, Cursor::Start);

        let cp = store.get(&run, 1).unwrap().unwrap();
        assert_eq!(cp.status, StepStatus::Running);
        assert_eq!(cp.name, "fetch ids");
        assert!(cp.started_at.is_some());
    }

    #[test]
    fn begin_step_on_running_step_returns_saved_cursor() {
        let (store, run) = store();
        store.begin_step(&run, 2, "details").unwrap();
        store.advance(&run, 2, &Cursor::Offset(40), 40).unwrap();

        // Simulated crash: begin again without completing.
        let cursor = store.begin_step(&run, 2, "details").unwrap();
        assert_eq!(cursor, Cursor::Offset(40));
        assert_eq!(store.get(&run, 2).unwrap().unwrap().rows_processed, 40);
    }

    #[test]
    fn begin_step_on_done_step_does_not_restart_it() {
        let (store, run) = store();
        store.begin_step(&run, 1, "fetch").unwrap();
        store.advance(&run, 1, &Cursor::Key("z".into()), 3).unwrap();
        store.complete_step(&run, 1).unwrap();

        let cursor = store.begin_step(&run, 1, "fetch").unwrap();
        assert_eq!(cursor, Cursor::Key("z".into()));
        assert_eq!(store.get(&run, 1).unwrap().unwrap().status, StepStatus::Done);
    }

    #[test]
    fn failed_step_resumes_from_cursor() {
        let (store, run) = store();
        store.begin_step(&run, 1, "fetch").unwrap();
        store.advance(&run, 1, &Cursor::Token("page-7".into()), 70).unwrap();
        store.fail_step(&run, 1, "breaker open for 900s").unwrap();

        let cp = store.get(&run, 1).unwrap().unwrap();
        assert_eq!(cp.status, StepStatus::Failed);
        assert_eq!(cp.last_error.as_deref(), Some("breaker open for 900s"));

        let cursor = store.begin_step(&run, 1, "fetch").unwrap();
        assert_eq!(cursor, Cursor::Token("page-7".into()));
        let cp = store.get(&run, 1).unwrap().unwrap();
        assert_eq!(cp.status, StepStatus::Running);
        assert!(cp.finished_at.is_none());
    }

    #[test]
    fn advance_accumulates_rows() {
        let (store, run) = store();
        store.begin_step(&run, 1, "fetch").unwrap();
        for i in 1..=5 {
            store.advance(&run, 1, &Cursor::Offset(i), 1).unwrap();
        }
        let cp = store.get(&run, 1).unwrap().unwrap();
        assert_eq!(cp.rows_processed, 5);
        assert_eq!(cp.cursor, Cursor::Offset(5));
    }

    #[test]
    fn advance_requires_running_step() {
        let (store, run) = store();
        let err = store.advance(&run, 1, &Cursor::Offset(1), 1).unwrap_err();
        assert!(err.is_precondition());
    }

    #[test]
    fn concurrent_advances_are_not_lost() {
        let (store, run) = store();
        store.begin_step(&run, 1, "fetch").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let run = run.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        store.advance(&run, 1, &Cursor::Offset(i), 1).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get(&run, 1).unwrap().unwrap().rows_processed, 200);
    }

    #[test]
    fn complete_step_rejects_outstanding_units() {
        let (store, run) = store();
        store.begin_step(&run, 1, "fetch").unwrap();
        store
            .db
            .with_conn(|conn| {
                record_unit_in(conn, &run, 1, "a", UnitOutcome::Success, 1, None)?;
                record_unit_in(conn, &run, 1, "b", UnitOutcome::SoftFailure, 1, Some("timeout"))
            })
            .unwrap();

        let err = store.complete_step(&run, 1).unwrap_err();
        assert!(err.is_precondition(), "got {err:?}");
        assert!(err.to_string().contains("1 awaiting retry"));

        store
            .db
            .with_conn(|conn| {
                record_unit_in(conn, &run, 1, "b", UnitOutcome::HardFailure, 3, Some("gave up"))
            })
            .unwrap();
        store.complete_step(&run, 1).unwrap();
        store.complete_step(&run, 1).unwrap();
    }

    #[test]
    fn complete_step_requires_begin() {
        let (store, run) = store();
        assert!(store.complete_step(&run, 3).unwrap_err().is_precondition());
    }

    #[test]
    fn failing_a_done_step_is_rejected() {
        let (store, run) = store();
        store.begin_step(&run, 1, "fetch").unwrap();
        store.complete_step(&run, 1).unwrap();
        assert!(store.fail_step(&run, 1, "late").unwrap_err().is_precondition());
    }

    #[test]
    fn unit_outcomes_upsert_by_key() {
        let (store, run) = store();
        store
            .db
            .with_conn(|conn| {
                record_unit_in(conn, &run, 2, "item-4", UnitOutcome::SoftFailure, 1, Some("t/o"))?;
                record_unit_in(conn, &run, 2, "item-4", UnitOutcome::SoftFailure, 2, Some("t/o"))?;
                record_unit_in(conn, &run, 2, "item-4", UnitOutcome::Success, 3, None)?;
                record_unit_in(conn, &run, 2, "item-5", UnitOutcome::HardFailure, 1, Some("404"))
            })
            .unwrap();

        assert_eq!(
            store.unit_outcome(&run, 2, "item-4").unwrap(),
            Some((UnitOutcome::Success, 3))
        );
        let counts = store.unit_counts(&run, 2).unwrap();
        assert_eq!(counts.success, 1);
        assert_eq!(counts.hard_failure, 1);
        assert_eq!(counts.outstanding(), 0);

        let terminal = store.terminal_units(&run, 2).unwrap();
        assert!(terminal.contains("item-4") && terminal.contains("item-5"));
    }

    #[test]
    fn retry_counts_cover_only_soft_failures() {
        let (store, run) = store();
        store
            .db
            .with_conn(|conn| {
                record_unit_in(conn, &run, 1, "a", UnitOutcome::SoftFailure, 2, Some("t/o"))?;
                record_unit_in(conn, &run, 1, "b", UnitOutcome::Success, 1, None)
            })
            .unwrap();
        let counts = store.retry_counts(&run, 1).unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts["a"], 2);
    }

    #[test]
    fn list_orders_by_step() {
        let (store, run) = store();
        store.begin_step(&run, 2, "details").unwrap();
        store.begin_step(&run, 1, "fetch").unwrap();
        let steps: Vec<u32> = store.list(&run).unwrap().iter().map(|cp| cp.step).collect();
        assert_eq!(steps, vec![1, 2]);
    }
}
