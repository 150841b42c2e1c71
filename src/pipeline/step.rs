//! Step contract implemented by each job type's stages.
//!
//! Epistemic foundation:
//! - K_i: Steps of a pipeline run strictly in declaration order
//! - K_i: Unit keys are natural keys, stable across resume
//! - B_i: Processing a unit may fail → UnitError, classified by the step
//! - I^R: Cursor encoding and concurrency are per-step choices

use crate::client::Session;
use crate::models::{Cursor, Unit, UnitError};
use async_trait::async_trait;
use rusqlite::Connection;
use std::fmt;
use std::sync::Arc;

/// One ordered stage of a job.
///
/// `units` is the input collaborator, `process` the external interaction and
/// `persist` the output collaborator. `persist` runs inside a per-unit
/// savepoint and must upsert by the unit's key.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Name of the external target guarded by a circuit breaker.
    fn dependency(&self) -> &str {
        self.name()
    }

    /// Units still to enumerate from `cursor`, in input order.
    fn units(&self, cursor: &Cursor) -> anyhow::Result<Vec<Unit>>;

    async fn process(
        &self,
        unit: &Unit,
        session: Option<&Session>,
    ) -> Result<serde_json::Value, UnitError>;

    fn persist(
        &self,
        conn: &Connection,
        unit: &Unit,
        output: &serde_json::Value,
    ) -> anyhow::Result<()>;

    /// Cursor after the first `consumed` units listed from `from` are terminal.
    ///
    /// `last` is the final unit of that prefix. The default counts offsets,
    /// or records the last key for key cursors. Token-paged steps override it.
    fn advance_cursor(&self, from: &Cursor, last: &Unit, consumed: u64) -> Cursor {
        match from {
            Cursor::Start => Cursor::Offset(consumed),
            Cursor::Offset(n) => Cursor::Offset(n + consumed),
            Cursor::Key(_) => Cursor::Key(last.key.clone()),
            Cursor::Token(token) => Cursor::Token(token.clone()),
        }
    }

    /// Whether workers need an automation session to process units.
    fn needs_session(&self) -> bool {
        true
    }

    /// Worker count for this step, overriding the pool default.
    fn concurrency(&self) -> Option<usize> {
        None
    }
}

/// A job type's fixed, ordered list of steps.
#[derive(Clone)]
pub struct Pipeline {
    job_type: String,
    steps: Vec<Arc<dyn Step>>,
}

impl Pipeline {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step; steps are numbered from 1 in insertion order.
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.steps.iter().map(|s| s.name()).collect();
        f.debug_struct("Pipeline")
            .field("job_type", &self.job_type)
            .field("steps", &names)
            .finish()
    }
}
