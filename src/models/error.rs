//! Error types for harvester.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected rejections (conflicting run, API misuse)
//! - I^B materialized: Infrastructure failures (database, filesystem)
//! - K_i violated: Internal invariant violations (bugs)
//!
//! Unit-level failures are deliberately absent: they are outcomes recorded
//! by the worker pool (see [`UnitError`](super::UnitError)), never errors
//! that cross the pool boundary.

use super::RunId;
use thiserror::Error;

/// Top-level error type for harvester.
#[derive(Debug, Error)]
pub enum HarvestError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED — Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Run conflict: job type '{job_type}' already has active run {active_run}")]
    Conflict { job_type: String, active_run: RunId },

    #[error("Run lease lost: run {run_id} no longer holds job type '{job_type}'")]
    LeaseLost { job_type: String, run_id: RunId },

    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Resource limit reached: {live} live sessions (max {max})")]
    ResourceExhausted { live: usize, max: usize },

    #[error("Step {step} ({name}) failed: {reason}")]
    StepFailure {
        step: u32,
        name: String,
        reason: String,
    },

    #[error("Unit source error: {0}")]
    Source(#[source] anyhow::Error),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED — Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED — Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("State database lock poisoned")]
    LockPoisoned,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HarvestError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a precondition error.
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// Whether this error is a programming error in the caller.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_))
    }

    /// Whether this error means another run holds the job type.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether this run was superseded and must stop writing.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Self::LeaseLost { .. })
    }
}

/// Result type alias for harvester.
pub type Result<T> = std::result::Result<T, HarvestError>;
