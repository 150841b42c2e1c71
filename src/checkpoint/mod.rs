//! Durable run state for resumable pipeline execution.
//!
//! Provides:
//! - `Database`: SQLite connection shared by all state components
//! - `RunLedger`: Run lifecycle and the single-active-run lease
//! - `CheckpointStore`: Per-step cursor, counters and unit outcomes
//! - `UnitWriter`: Atomic per-unit commits with savepoint isolation

mod database;
mod ledger;
mod state;
mod transaction;

pub use database::Database;
pub(crate) use database::{from_db_time, from_db_time_opt, now_db, parse_column};
pub use ledger::*;
pub use state::{CheckpointStore, UnitCounts};
pub use transaction::*;
