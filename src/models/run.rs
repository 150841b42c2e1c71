//! Run, checkpoint and unit-of-work data models.
//!
//! Epistemic mapping:
//! - K_i: Status enums make every lifecycle state explicit
//! - K_i: Unit keys are stable across resume (natural keys)
//! - B_i: A unit attempt may fail → UnitError, classified soft or hard

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Opaque run identifier (time-ordered UUIDv7).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Mint a new time-derived run id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Implements `as_str` / `FromStr` / `Display` for a lowercase status enum.
macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($ty), other)),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }
    };
}

/// How a pipeline invocation treats earlier runs of the same job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Always start a new run from step 1
    Fresh,
    /// Continue the latest unfinished run from its checkpoints
    Resume,
}

string_enum!(RunMode { Fresh => "fresh", Resume => "resume" });

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Stopped by an operator signal; resumable like a crash
    Aborted,
}

string_enum!(RunStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Aborted => "aborted",
});

impl RunStatus {
    /// Whether a resume may attach to a run in this status.
    pub fn is_resumable(&self) -> bool {
        !matches!(self, Self::Completed)
    }
}

/// One execution attempt of a job type's ordered step sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub job_type: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Reason recorded with the last failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Status of a step checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed,
}

string_enum!(StepStatus {
    Pending => "pending",
    Running => "running",
    Done => "done",
    Failed => "failed",
});

/// Step-defined position marker.
///
/// Each step picks the encoding that matches its input: a row offset, the
/// last processed key, or a page token handed out by the target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Cursor {
    #[default]
    Start,
    Offset(u64),
    Key(String),
    Token(String),
}

impl Cursor {
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start)
    }
}

/// Durable progress record of one (run, step) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCheckpoint {
    pub run_id: RunId,
    pub step: u32,
    pub name: String,
    pub status: StepStatus,
    pub cursor: Cursor,
    pub rows_processed: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Outcome of a unit of work as recorded in the checkpoint store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    /// Seen but not attempted to completion
    Pending,
    /// Transient failure, retry outstanding
    SoftFailure,
    Success,
    /// Terminal failure, recorded and skipped
    HardFailure,
}

string_enum!(UnitOutcome {
    Pending => "pending",
    SoftFailure => "soft_failure",
    Success => "success",
    HardFailure => "hard_failure",
});

impl UnitOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::HardFailure)
    }
}

/// Smallest resumable piece of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Natural key, stable across resume
    pub key: String,
    /// Step-defined input (e.g. the input record)
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Unit {
    pub fn new(key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }

    /// A unit identified by key only.
    pub fn keyed(key: impl Into<String>) -> Self {
        Self::new(key, serde_json::Value::Null)
    }
}

/// Failure of a single unit attempt, as classified by the step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitError {
    /// Transient: retried with backoff up to the attempt bound
    #[error("soft failure: {0}")]
    Soft(String),

    /// Terminal: recorded, the batch continues
    #[error("hard failure: {0}")]
    Hard(String),

    /// The automation session died; reopen and retry
    #[error("session lost: {0}")]
    SessionLost(String),
}

impl UnitError {
    pub fn soft(message: impl Into<String>) -> Self {
        Self::Soft(message.into())
    }

    pub fn hard(message: impl Into<String>) -> Self {
        Self::Hard(message.into())
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Hard(_))
    }
}

/// Identifier of a tracked automation session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Why a tracked resource was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// Worker finished its units
    Completed,
    /// Worker stopped on an operator signal or breaker outage
    Stopped,
    /// The session died under the worker
    Crashed,
    /// Guard dropped without an explicit release (panic, early return)
    Dropped,
    /// Left live by a dead process, cleaned up by a sweep
    Orphaned,
}

string_enum!(ReleaseReason {
    Completed => "completed",
    Stopped => "stopped",
    Crashed => "crashed",
    Dropped => "dropped",
    Orphaned => "orphaned",
});

/// One live or terminated automation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedResource {
    pub id: ResourceId,
    pub run_id: RunId,
    pub step: u32,
    pub worker_slot: u32,
    /// Orchestrating process that acquired the session
    pub owner_pid: u32,
    /// Startup token of that process, distinguishing reuses of its pid
    pub owner_token: String,
    /// Process of the session itself, once known
    pub session_pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub termination_reason: Option<ReleaseReason>,
}

impl TrackedResource {
    pub fn is_live(&self) -> bool {
        self.terminated_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_unique_and_ordered() {
        let a = RunId::generate();
        let b = RunId::generate();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Aborted,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("exploded".parse::<StepStatus>().is_err());
        assert_eq!(UnitOutcome::SoftFailure.to_string(), "soft_failure");
    }

    #[test]
    fn cursor_json_encoding() {
        let json = serde_json::to_string(&Cursor::Offset(42)).unwrap();
        assert_eq!(json, r#"{"kind":"offset","value":42}"#);
        let start: Cursor = serde_json::from_str(r#"{"kind":"start"}"#).unwrap();
        assert!(start.is_start());
        let token: Cursor = serde_json::from_str(r#"{"kind":"token","value":"abc"}"#).unwrap();
        assert_eq!(token, Cursor::Token("abc".into()));
    }

    #[test]
    fn only_success_and_hard_failure_are_terminal() {
        assert!(UnitOutcome::Success.is_terminal());
        assert!(UnitOutcome::HardFailure.is_terminal());
        assert!(!UnitOutcome::SoftFailure.is_terminal());
        assert!(!UnitOutcome::Pending.is_terminal());
    }

    #[test]
    fn unit_error_retryability() {
        assert!(UnitError::soft("timeout").is_retryable());
        assert!(UnitError::SessionLost("browser gone".into()).is_retryable());
        assert!(!UnitError::hard("404").is_retryable());
    }
}
