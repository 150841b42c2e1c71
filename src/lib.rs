//! harvester - Resumable step pipelines for per-source data collection jobs.
//!
//! ## Architecture
//!
//! A job is a [`Pipeline`] of ordered steps. Each step turns its input into
//! units of work; a bounded [`WorkerPool`] processes the units, each worker
//! holding at most one automation session, and commits every unit atomically
//! together with the step's checkpoint.
//!
//! - **Run Ledger**: one active run per job type, guarded by a lease
//! - **Checkpoint Store**: per-step cursor, row counter and unit outcomes
//! - **Resource Tracker**: every session recorded from launch to release
//! - **Circuit Breakers**: pause a step while its dependency is down
//!
//! ## Resume
//!
//! Restarting a job in [`RunMode::Resume`] skips `done` steps and continues
//! the `running` one from its cursor; units already terminal are never
//! re-executed.
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): Operator-configurable parameters
//! - I^B (Bounded): Flaky dependencies and dead processes (retry, breaker, sweep)

pub mod checkpoint;
pub mod client;
pub mod models;
pub mod pipeline;
pub mod pool;

// Re-exports for convenience
pub use checkpoint::{CheckpointStore, Database, RunLedger, UnitWriter};
pub use client::{BreakerRegistry, ResourceTracker, Session, SessionProvider};
pub use models::{Config, Cursor, HarvestError, Result, RunId, RunMode, Unit, UnitError};
pub use pipeline::{Pipeline, PipelineExecutor, RunReport, Step, StepHook};
pub use pool::WorkerPool;
