//! Shared fixtures for pipeline integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use harvester::client::testing::{FakeProbe, FakeSessions};
use harvester::client::{ProcessOwner, Session};
use harvester::models::{RunId, StepStatus};
use harvester::pipeline::{StepHook, StepOutcome};
use harvester::{CheckpointStore, Config, Cursor, Database, PipelineExecutor, Step, Unit, UnitError};
use rusqlite::Connection;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub const JOB: &str = "registry_listings";

/// Call counts per unit key, shared with the test after the step moves into a pipeline.
#[derive(Clone, Default)]
pub struct Calls(Arc<Mutex<HashMap<String, u32>>>);

impl Calls {
    pub fn get(&self, key: &str) -> u32 {
        self.0.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    fn hit(&self, key: &str) {
        *self.0.lock().unwrap().entry(key.to_string()).or_default() += 1;
    }
}

/// Step over a fixed key list whose per-unit behaviour is scripted.
pub struct ListStep {
    name: &'static str,
    keys: Vec<String>,
    script: Mutex<HashMap<String, VecDeque<UnitError>>>,
    always_soft: bool,
    sessions: bool,
    fail_persist: HashSet<String>,
    block_once: Mutex<Option<(String, Arc<Notify>)>>,
    hold_at: Mutex<Option<(String, Arc<Notify>, Arc<Notify>)>>,
    stop_at: Option<(String, CancellationToken)>,
    calls: Calls,
}

impl ListStep {
    pub fn new(name: &'static str, keys: &[&str]) -> Self {
        Self {
            name,
            keys: keys.iter().map(|k| k.to_string()).collect(),
            script: Mutex::new(HashMap::new()),
            always_soft: false,
            sessions: false,
            fail_persist: HashSet::new(),
            block_once: Mutex::new(None),
            hold_at: Mutex::new(None),
            stop_at: None,
            calls: Calls::default(),
        }
    }

    /// Fail `key` with `errors`, in order, before it succeeds.
    pub fn script(self, key: &str, errors: Vec<UnitError>) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(key.to_string(), errors.into());
        self
    }

    /// Every call fails softly, as during a target outage.
    pub fn always_soft(mut self) -> Self {
        self.always_soft = true;
        self
    }

    pub fn with_sessions(mut self) -> Self {
        self.sessions = true;
        self
    }

    pub fn fail_persist(mut self, key: &str) -> Self {
        self.fail_persist.insert(key.to_string());
        self
    }

    /// Hang forever the first time `key` is processed, after notifying `reached`.
    pub fn block_once(self, key: &str, reached: Arc<Notify>) -> Self {
        *self.block_once.lock().unwrap() = Some((key.to_string(), reached));
        self
    }

    /// The first time `key` is processed, notify `reached` and wait for `release`.
    pub fn hold_at(self, key: &str, reached: Arc<Notify>, release: Arc<Notify>) -> Self {
        *self.hold_at.lock().unwrap() = Some((key.to_string(), reached, release));
        self
    }

    /// Cancel `stop` while `key` is in flight.
    pub fn stop_at(mut self, key: &str, stop: CancellationToken) -> Self {
        self.stop_at = Some((key.to_string(), stop));
        self
    }

    pub fn calls(&self) -> Calls {
        self.calls.clone()
    }
}

#[async_trait]
impl Step for ListStep {
    fn name(&self) -> &str {
        self.name
    }

    fn units(&self, cursor: &Cursor) -> anyhow::Result<Vec<Unit>> {
        let skip = match cursor {
            Cursor::Start => 0,
            Cursor::Offset(n) => *n as usize,
            other => anyhow::bail!("unexpected cursor {other:?}"),
        };
        Ok(self.keys.iter().skip(skip).map(Unit::keyed).collect())
    }

    async fn process(
        &self,
        unit: &Unit,
        session: Option<&Session>,
    ) -> Result<serde_json::Value, UnitError> {
        self.calls.hit(&unit.key);
        assert_eq!(session.is_some(), self.sessions);

        let blocker = {
            let mut slot = self.block_once.lock().unwrap();
            match slot.as_ref() {
                Some((key, _)) if *key == unit.key => slot.take(),
                _ => None,
            }
        };
        if let Some((_, reached)) = blocker {
            reached.notify_one();
            std::future::pending::<()>().await;
        }

        let hold = {
            let mut slot = self.hold_at.lock().unwrap();
            match slot.as_ref() {
                Some((key, _, _)) if *key == unit.key => slot.take(),
                _ => None,
            }
        };
        if let Some((_, reached, release)) = hold {
            reached.notify_one();
            release.notified().await;
        }

        if let Some((key, stop)) = &self.stop_at {
            if *key == unit.key {
                stop.cancel();
            }
        }
        if self.always_soft {
            return Err(UnitError::soft("503 service unavailable"));
        }
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&unit.key)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(error) => Err(error),
            None => Ok(serde_json::json!({ "key": unit.key, "step": self.name })),
        }
    }

    fn persist(&self, conn: &Connection, unit: &Unit, output: &serde_json::Value) -> anyhow::Result<()> {
        conn.execute(
            "INSERT INTO outputs (step, key, body) VALUES (?1, ?2, ?3) \
             ON CONFLICT(step, key) DO UPDATE SET body = excluded.body",
            rusqlite::params![self.name, unit.key, output.to_string()],
        )?;
        conn.execute(
            "INSERT INTO effects (step, key) VALUES (?1, ?2)",
            rusqlite::params![self.name, unit.key],
        )?;
        anyhow::ensure!(
            !self.fail_persist.contains(&unit.key),
            "constraint violated for {}",
            unit.key
        );
        Ok(())
    }

    fn needs_session(&self) -> bool {
        self.sessions
    }
}

/// Hook that records events and checks step ordering against the store.
pub struct OrderingHook {
    store: CheckpointStore,
    pub events: Mutex<Vec<String>>,
    pub violations: Mutex<Vec<String>>,
}

impl OrderingHook {
    pub fn new(db: &Arc<Database>) -> Arc<Self> {
        Arc::new(Self {
            store: CheckpointStore::new(Arc::clone(db)),
            events: Mutex::new(Vec::new()),
            violations: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl StepHook for OrderingHook {
    fn name(&self) -> &str {
        "ordering"
    }

    fn on_step_start(
        &self,
        run_id: &RunId,
        step: u32,
        _ts: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(format!("start {step}"));
        if step > 1 {
            let previous = self.store.get(run_id, step - 1)?.map(|cp| cp.status);
            if previous != Some(StepStatus::Done) {
                self.violations
                    .lock()
                    .unwrap()
                    .push(format!("step {step} started after {previous:?}"));
            }
        }
        Ok(())
    }

    fn on_step_end(
        &self,
        _run_id: &RunId,
        step: u32,
        _ts: chrono::DateTime<chrono::Utc>,
        _rows: u64,
        outcome: StepOutcome,
    ) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("end {step} {outcome}"));
        Ok(())
    }
}

/// State database on disk plus fake process table.
pub struct Harness {
    pub dir: TempDir,
    pub db: Arc<Database>,
    pub probe: Arc<FakeProbe>,
    pub sessions: Arc<FakeSessions>,
    pub config: Config,
    owners: Mutex<HashMap<u32, ProcessOwner>>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.pool.backoff_base_ms = 1;
        config.pool.backoff_max_ms = 5;
        config.pool.batch_size = 2;
        let db = open(&dir.path().join("state.db"));
        let probe = Arc::new(FakeProbe::alive(&[]));
        Self {
            sessions: Arc::new(FakeSessions::new(Arc::clone(&probe))),
            dir,
            db,
            probe,
            config,
            owners: Mutex::new(HashMap::new()),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("state.db")
    }

    /// Reopen the database as a restarted process would.
    pub fn reopen(&mut self) {
        self.db = open(&self.db_path());
    }

    /// The running incarnation of process `pid`.
    pub fn owner(&self, pid: u32) -> ProcessOwner {
        self.owners
            .lock()
            .unwrap()
            .entry(pid)
            .or_insert_with(|| ProcessOwner::new(pid))
            .clone()
    }

    /// Start a new process that reuses `pid`.
    pub fn restart(&self, pid: u32) -> ProcessOwner {
        let owner = ProcessOwner::new(pid);
        self.owners.lock().unwrap().insert(pid, owner.clone());
        owner
    }

    /// Executor acting as live process `pid`.
    pub fn executor(&self, pid: u32) -> PipelineExecutor {
        self.probe.spawn(pid);
        PipelineExecutor::new(Arc::clone(&self.db), self.config.clone(), self.sessions.clone())
            .with_probe(self.probe.clone())
            .with_owner(self.owner(pid))
    }

    pub fn store(&self) -> CheckpointStore {
        CheckpointStore::new(Arc::clone(&self.db))
    }

    /// Keys persisted for `step`, sorted.
    pub fn outputs(&self, step: &str) -> Vec<String> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT key FROM outputs WHERE step = ?1 ORDER BY key")?;
                let keys = stmt
                    .query_map([step], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(keys)
            })
            .unwrap()
    }

    /// Number of times each key's effect was written for `step`.
    pub fn effects(&self, step: &str) -> HashMap<String, u32> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT key, COUNT(*) FROM effects WHERE step = ?1 GROUP BY key")?;
                let counts = stmt
                    .query_map([step], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<HashMap<String, u32>>>()?;
                Ok(counts)
            })
            .unwrap()
    }
}

fn open(path: &std::path::Path) -> Arc<Database> {
    let db = Database::open(path).unwrap();
    db.with_conn(|conn| {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS outputs (
                step TEXT NOT NULL,
                key TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (step, key)
            );
            CREATE TABLE IF NOT EXISTS effects (step TEXT NOT NULL, key TEXT NOT NULL);",
        )?;
        Ok(())
    })
    .unwrap();
    Arc::new(db)
}
