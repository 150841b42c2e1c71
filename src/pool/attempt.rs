//! Per-unit retry state machine.
//!
//! Epistemic foundation:
//! - K_i: fresh → retrying(n) → terminal, never backwards
//! - K_i: A hard failure is terminal on the first occurrence
//! - I^R: The attempt bound is configuration

use crate::models::{UnitError, UnitOutcome};

/// Where a unit stands in its bounded retry sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitAttempt {
    /// Not attempted yet
    Fresh,
    /// `n` attempts failed softly so far
    Retrying(u32),
    /// Done; `attempts` counts every call made
    Terminal { outcome: UnitOutcome, attempts: u32 },
}

impl UnitAttempt {
    /// State of a unit that already spent `failures` soft attempts in an earlier run attempt.
    pub fn resume(failures: u32) -> Self {
        if failures == 0 {
            Self::Fresh
        } else {
            Self::Retrying(failures)
        }
    }

    /// Calls made so far.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Fresh => 0,
            Self::Retrying(n) => *n,
            Self::Terminal { attempts, .. } => *attempts,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }

    /// Apply the result of one more call.
    ///
    /// Soft failures (including lost sessions) escalate to a hard failure once
    /// `max_attempts` calls have been made.
    pub fn next(self, failure: Option<&UnitError>, max_attempts: u32) -> Self {
        if self.is_terminal() {
            return self;
        }
        let attempts = self.attempts() + 1;
        match failure {
            None => Self::Terminal {
                outcome: UnitOutcome::Success,
                attempts,
            },
            Some(UnitError::Hard(_)) => Self::Terminal {
                outcome: UnitOutcome::HardFailure,
                attempts,
            },
            Some(UnitError::Soft(_) | UnitError::SessionLost(_)) if attempts >= max_attempts => {
                Self::Terminal {
                    outcome: UnitOutcome::HardFailure,
                    attempts,
                }
            }
            Some(_) => Self::Retrying(attempts),
        }
    }
}
