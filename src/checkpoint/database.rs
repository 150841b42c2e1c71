//! SQLite state database shared by the ledger, checkpoint store, resource
//! tracker and unit writer.
//!
//! Epistemic foundation:
//! - K_i: One connection behind one mutex serializes every state write
//! - K_i: DDL is idempotent, so opening an existing database is safe
//! - I^B: Crash mid-transaction → SQLite rolls back on next open

use crate::models::{HarvestError, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    job_type TEXT NOT NULL,
    mode TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    failure_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_job_type ON runs (job_type, created_at);

CREATE TABLE IF NOT EXISTS run_leases (
    job_type TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(id),
    owner_pid INTEGER NOT NULL,
    owner_token TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS step_checkpoints (
    run_id TEXT NOT NULL REFERENCES runs(id),
    step INTEGER NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    cursor TEXT NOT NULL,
    rows_processed INTEGER NOT NULL DEFAULT 0,
    started_at TEXT,
    finished_at TEXT,
    last_error TEXT,
    PRIMARY KEY (run_id, step)
);

CREATE TABLE IF NOT EXISTS unit_outcomes (
    run_id TEXT NOT NULL REFERENCES runs(id),
    step INTEGER NOT NULL,
    unit_key TEXT NOT NULL,
    outcome TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (run_id, step, unit_key)
);

CREATE TABLE IF NOT EXISTS tracked_resources (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(id),
    step INTEGER NOT NULL,
    worker_slot INTEGER NOT NULL,
    owner_pid INTEGER NOT NULL,
    owner_token TEXT NOT NULL,
    session_pid INTEGER,
    created_at TEXT NOT NULL,
    terminated_at TEXT,
    termination_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_resources_live ON tracked_resources (terminated_at);
";

/// SQLite-backed state storage.
///
/// Create with [`Database::open`] for file-backed persistence
/// or [`Database::in_memory`] for tests.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a state database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| HarvestError::io("creating state database directory", e))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(CREATE_TABLES)?;
        debug!("State database ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    ///
    /// Never hold the guard across an `.await`.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| HarvestError::LockPoisoned)
    }

    /// Run `f` with the connection held.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside an immediate transaction, committing on `Ok`.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Format a timestamp for storage.
pub(crate) fn to_db_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Current UTC time in storage format.
pub(crate) fn now_db() -> String {
    to_db_time(Utc::now())
}

/// Parse a stored timestamp.
pub(crate) fn from_db_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HarvestError::Internal(format!("invalid stored timestamp '{raw}': {e}")))
}

/// Parse an optional stored timestamp.
pub(crate) fn from_db_time_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(from_db_time).transpose()
}

/// Parse a stored status string into its enum.
pub(crate) fn parse_column<T>(raw: &str) -> Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse::<T>().map_err(HarvestError::Internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStatus;
    use tempfile::TempDir;

    #[test]
    fn open_creates_parent_dirs_and_is_reopenable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.db");

        {
            let db = Database::open(&path).unwrap();
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO runs (id, job_type, mode, status, created_at, updated_at) \
                     VALUES ('r1', 'jobs', 'fresh', 'pending', ?1, ?1)",
                    [now_db()],
                )?;
                Ok(())
            })
            .unwrap();
        }

        let db = Database::open(&path).unwrap();
        let count: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM runs", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let db = Database::in_memory().unwrap();
        let result: Result<()> = db.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO runs (id, job_type, mode, status, created_at, updated_at) \
                 VALUES ('r1', 'jobs', 'fresh', 'pending', ?1, ?1)",
                [now_db()],
            )?;
            Err(HarvestError::Internal("boom".into()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM runs", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let db = Database::in_memory().unwrap();
        let err = db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO step_checkpoints (run_id, step, name, status, cursor) \
                     VALUES ('missing', 1, 'fetch', 'running', '{}')",
                    [],
                )?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, HarvestError::Database(_)));
    }

    #[test]
    fn timestamps_roundtrip() {
        let now = Utc::now();
        let parsed = from_db_time(&to_db_time(now)).unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
        assert!(from_db_time("yesterday").is_err());
        assert_eq!(parse_column::<RunStatus>("failed").unwrap(), RunStatus::Failed);
    }
}
