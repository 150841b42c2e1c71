//! Run ledger: durable registry of run identities and their lifecycle.
//!
//! Epistemic foundation:
//! - K_i: At most one run per job type holds the lease at a time
//! - K_i: A run row is committed before anything references its id
//! - B_i: A lease holder may have died → owner liveness + expiry decide
//! - B_i: A restarted process may reuse the dead holder's pid → compare owner tokens
//! - K_i: A superseded run's batches fail the lease fence and commit nothing
//! - I^B: Marking calls may be retried after a crash → transitions are idempotent

use super::database::{Database, from_db_time, now_db, parse_column, to_db_time};
use crate::client::{ProcessOwner, ProcessProbe};
use crate::models::{HarvestError, Result, Run, RunId, RunMode, RunStatus};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Advisory lock row for a job type.
#[derive(Debug, Clone, Serialize)]
pub struct RunLease {
    pub job_type: String,
    pub run_id: RunId,
    pub owner_pid: u32,
    pub owner_token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Durable registry of runs, guarded per job type by a lease.
pub struct RunLedger {
    db: Arc<Database>,
    probe: Arc<dyn ProcessProbe>,
    lease_ttl: Duration,
    owner: ProcessOwner,
}

const RUN_COLUMNS: &str =
    "id, job_type, mode, status, created_at, updated_at, failure_reason";

impl RunLedger {
    /// Create a ledger owned by the current process.
    pub fn new(db: Arc<Database>, probe: Arc<dyn ProcessProbe>, lease_ttl: Duration) -> Self {
        Self {
            db,
            probe,
            lease_ttl,
            owner: ProcessOwner::current(),
        }
    }

    /// Take leases as `owner` instead of the current process.
    pub fn with_owner(mut self, owner: ProcessOwner) -> Self {
        self.owner = owner;
        self
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Register a run for `job_type` and take its lease.
    ///
    /// `Fresh` always mints a new run; `Resume` attaches to the latest
    /// unfinished run so its checkpoints carry over. Fails with
    /// [`HarvestError::Conflict`] while a live process holds an unexpired
    /// lease for the job type.
    pub fn register(&self, job_type: &str, mode: RunMode) -> Result<RunId> {
        let run_id = self.db.with_transaction(|tx| {
            let now = Utc::now();
            self.check_lease(tx, job_type, now)?;

            let latest = latest_run(tx, job_type)?;
            let run_id = match (mode, latest) {
                (RunMode::Resume, Some(run)) if run.status.is_resumable() => {
                    tx.execute(
                        "UPDATE runs SET mode = ?1, updated_at = ?2 WHERE id = ?3",
                        params![RunMode::Resume.as_str(), to_db_time(now), run.id.as_str()],
                    )?;
                    info!(job_type, run_id = %run.id, status = %run.status, "Resuming run");
                    run.id
                }
                (_, latest) => {
                    if let Some(stale) = latest.filter(|r| r.status == RunStatus::Running) {
                        warn!(job_type, run_id = %stale.id, "Superseding stale running run");
                        tx.execute(
                            "UPDATE runs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                            params![
                                RunStatus::Aborted.as_str(),
                                to_db_time(now),
                                stale.id.as_str()
                            ],
                        )?;
                    }
                    let run_id = RunId::generate();
                    tx.execute(
                        "INSERT INTO runs (id, job_type, mode, status, created_at, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                        params![
                            run_id.as_str(),
                            job_type,
                            mode.as_str(),
                            RunStatus::Pending.as_str(),
                            to_db_time(now),
                        ],
                    )?;
                    info!(job_type, run_id = %run_id, mode = %mode, "Registered run");
                    run_id
                }
            };

            tx.execute(
                "INSERT INTO run_leases \
                 (job_type, run_id, owner_pid, owner_token, acquired_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(job_type) DO UPDATE SET run_id = ?2, owner_pid = ?3, \
                 owner_token = ?4, acquired_at = ?5, expires_at = ?6",
                params![
                    job_type,
                    run_id.as_str(),
                    self.owner.pid,
                    self.owner.token,
                    to_db_time(now),
                    to_db_time(lease_expiry(self.lease_ttl, now)),
                ],
            )?;
            Ok(run_id)
        })?;
        Ok(run_id)
    }

    /// Reject registration while a live owner holds an unexpired lease.
    fn check_lease(&self, conn: &Connection, job_type: &str, now: DateTime<Utc>) -> Result<()> {
        let Some(lease) = read_lease(conn, job_type)? else {
            return Ok(());
        };
        let expired = lease.expires_at <= now;
        let owner_alive = self
            .owner
            .sees_alive(self.probe.as_ref(), lease.owner_pid, &lease.owner_token);
        if !expired && owner_alive {
            return Err(HarvestError::Conflict {
                job_type: job_type.to_string(),
                active_run: lease.run_id,
            });
        }
        warn!(
            job_type,
            run_id = %lease.run_id,
            owner_pid = lease.owner_pid,
            expired,
            owner_alive,
            "Taking over stale run lease"
        );
        Ok(())
    }

    pub fn mark_running(&self, run_id: &RunId) -> Result<()> {
        self.transition(run_id, RunStatus::Running, None)
    }

    pub fn mark_completed(&self, run_id: &RunId) -> Result<()> {
        self.transition(run_id, RunStatus::Completed, None)
    }

    pub fn mark_failed(&self, run_id: &RunId, reason: &str) -> Result<()> {
        self.transition(run_id, RunStatus::Failed, Some(reason))
    }

    pub fn mark_aborted(&self, run_id: &RunId) -> Result<()> {
        self.transition(run_id, RunStatus::Aborted, None)
    }

    /// Single-row status transition; re-applying the current status is a no-op.
    fn transition(&self, run_id: &RunId, to: RunStatus, reason: Option<&str>) -> Result<()> {
        self.db.with_transaction(|tx| {
            let current: Option<String> = tx
                .query_row(
                    "SELECT status FROM runs WHERE id = ?1",
                    [run_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let current: RunStatus = match current {
                Some(raw) => parse_column(&raw)?,
                None => return Err(HarvestError::RunNotFound(run_id.clone())),
            };

            if current == to {
                debug!(run_id = %run_id, status = %to, "Run already in status");
                return Ok(());
            }
            if current == RunStatus::Completed {
                return Err(HarvestError::precondition(format!(
                    "run {run_id} is completed and cannot become {to}"
                )));
            }

            tx.execute(
                "UPDATE runs SET status = ?1, updated_at = ?2, \
                 failure_reason = COALESCE(?3, failure_reason) WHERE id = ?4",
                params![to.as_str(), now_db(), reason, run_id.as_str()],
            )?;

            if matches!(
                to,
                RunStatus::Completed | RunStatus::Failed | RunStatus::Aborted
            ) {
                tx.execute("DELETE FROM run_leases WHERE run_id = ?1", [run_id.as_str()])?;
            }
            debug!(run_id = %run_id, from = %current, to = %to, "Run status changed");
            Ok(())
        })
    }

    /// Extend the lease `run_id` holds on `job_type` as this owner.
    ///
    /// Returns `false` once the lease was released, force-unlocked or taken
    /// over by another process.
    pub fn renew_lease(&self, job_type: &str, run_id: &RunId) -> Result<bool> {
        self.db.with_conn(|conn| self.fence(job_type).renew_in(conn, run_id))
    }

    /// Fence that unit batches of a run on `job_type` must pass to commit.
    pub fn fence(&self, job_type: &str) -> LeaseFence {
        LeaseFence {
            job_type: job_type.to_string(),
            owner_token: self.owner.token.clone(),
            ttl: self.lease_ttl,
        }
    }

    /// Drop a job type's lease regardless of its holder.
    pub fn force_unlock(&self, job_type: &str) -> Result<bool> {
        let deleted = self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM run_leases WHERE job_type = ?1", [job_type])?)
        })?;
        if deleted > 0 {
            warn!(job_type, "Run lease force-released");
        }
        Ok(deleted > 0)
    }

    /// Current lease of a job type, if any.
    pub fn lease(&self, job_type: &str) -> Result<Option<RunLease>> {
        self.db.with_conn(|conn| read_lease(conn, job_type))
    }

    /// Most recent run of a job type.
    pub fn latest(&self, job_type: &str) -> Result<Option<Run>> {
        self.db.with_conn(|conn| latest_run(conn, job_type))
    }

    pub fn get(&self, run_id: &RunId) -> Result<Option<Run>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                [run_id.as_str()],
                raw_run,
            )
            .optional()?
            .map(RawRun::into_run)
            .transpose()
        })
    }

    /// Run history of a job type, newest first.
    pub fn list(&self, job_type: &str, limit: usize) -> Result<Vec<Run>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs WHERE job_type = ?1 \
                 ORDER BY created_at DESC, id DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![job_type, limit as i64], raw_run)?;
            rows.map(|row| row?.into_run()).collect()
        })
    }
}

/// Lease ownership a run must still have for its writes to commit.
#[derive(Debug, Clone)]
pub struct LeaseFence {
    job_type: String,
    owner_token: String,
    ttl: Duration,
}

impl LeaseFence {
    /// Extend the lease on `conn`. Returns `false` if `run_id` no longer holds it.
    pub(crate) fn renew_in(&self, conn: &Connection, run_id: &RunId) -> Result<bool> {
        let updated = conn.execute(
            "UPDATE run_leases SET expires_at = ?1 \
             WHERE job_type = ?2 AND run_id = ?3 AND owner_token = ?4",
            params![
                to_db_time(lease_expiry(self.ttl, Utc::now())),
                self.job_type,
                run_id.as_str(),
                self.owner_token
            ],
        )?;
        Ok(updated > 0)
    }

    /// Like [`renew_in`](Self::renew_in), failing with [`HarvestError::LeaseLost`].
    pub(crate) fn hold_in(&self, conn: &Connection, run_id: &RunId) -> Result<()> {
        if self.renew_in(conn, run_id)? {
            return Ok(());
        }
        warn!(job_type = %self.job_type, run_id = %run_id, "Run lease lost");
        Err(HarvestError::LeaseLost {
            job_type: self.job_type.clone(),
            run_id: run_id.clone(),
        })
    }
}

fn lease_expiry(ttl: Duration, from: DateTime<Utc>) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| from.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Row as stored, before enum/timestamp parsing.
struct RawRun {
    id: String,
    job_type: String,
    mode: String,
    status: String,
    created_at: String,
    updated_at: String,
    failure_reason: Option<String>,
}

impl RawRun {
    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: RunId::from(self.id),
            job_type: self.job_type,
            mode: parse_column(&self.mode)?,
            status: parse_column(&self.status)?,
            created_at: from_db_time(&self.created_at)?,
            updated_at: from_db_time(&self.updated_at)?,
            failure_reason: self.failure_reason,
        })
    }
}

fn raw_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        id: row.get(0)?,
        job_type: row.get(1)?,
        mode: row.get(2)?,
        status: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        failure_reason: row.get(6)?,
    })
}

fn latest_run(conn: &Connection, job_type: &str) -> Result<Option<Run>> {
    conn.query_row(
        &format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE job_type = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ),
        [job_type],
        raw_run,
    )
    .optional()?
    .map(RawRun::into_run)
    .transpose()
}

fn read_lease(conn: &Connection, job_type: &str) -> Result<Option<RunLease>> {
    let row = conn
        .query_row(
            "SELECT run_id, owner_pid, owner_token, acquired_at, expires_at \
             FROM run_leases WHERE job_type = ?1",
            [job_type],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    row.map(|(run_id, owner_pid, owner_token, acquired_at, expires_at)| {
        Ok(RunLease {
            job_type: job_type.to_string(),
            run_id: RunId::from(run_id),
            owner_pid,
            owner_token,
            acquired_at: from_db_time(&acquired_at)?,
            expires_at: from_db_time(&expires_at)?,
        })
    })
    .transpose()
}
