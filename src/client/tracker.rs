//! Registry of live automation sessions for leak detection and cleanup.
//!
//! Epistemic foundation:
//! - K_i: A row is written before its session is used, so no session is untracked
//! - K_i: The table, not worker memory, is the source of truth for live sessions
//! - B_i: The owning process may have died without releasing → sweep
//! - B_i: Its pid may now belong to us → owner token, not pid, decides
//! - I^B: A crashed worker never unwinds → the guard's Drop is best effort

use super::{ProcessOwner, ProcessProbe, SessionProvider};
use crate::checkpoint::{Database, from_db_time, from_db_time_opt, now_db, parse_column};
use crate::models::{
    HarvestError, ReleaseReason, ResourceId, Result, RunId, TrackedResource,
};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

const RESOURCE_COLUMNS: &str = "id, run_id, step, worker_slot, owner_pid, owner_token, \
                                session_pid, created_at, terminated_at, termination_reason";

/// Non-fatal report of one orphaned session cleaned up by a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanResourceWarning {
    pub resource_id: ResourceId,
    pub run_id: RunId,
    pub step: u32,
    pub worker_slot: u32,
    pub owner_pid: u32,
    pub session_pid: Option<u32>,
    /// Whether the session process was still running and got terminated
    pub session_terminated: bool,
}

/// Tracks every automation session from acquisition to release.
pub struct ResourceTracker {
    db: Arc<Database>,
    probe: Arc<dyn ProcessProbe>,
    owner: ProcessOwner,
    max_live: Option<usize>,
}

impl ResourceTracker {
    pub fn new(db: Arc<Database>, probe: Arc<dyn ProcessProbe>, max_live: Option<usize>) -> Self {
        Self {
            db,
            probe,
            owner: ProcessOwner::current(),
            max_live,
        }
    }

    /// Record resources as owned by `owner` instead of this process.
    pub fn with_owner(mut self, owner: ProcessOwner) -> Self {
        self.owner = owner;
        self
    }

    /// Cap on live sessions across all runs, if any.
    pub fn max_live(&self) -> Option<usize> {
        self.max_live
    }

    /// Register a new live resource before its session is opened.
    ///
    /// Fails with [`HarvestError::ResourceExhausted`] when `max_live` sessions
    /// are already live.
    pub fn acquire(&self, run_id: &RunId, step: u32, worker_slot: u32) -> Result<ResourceId> {
        let id = ResourceId::generate();
        self.db.with_transaction(|tx| {
            if let Some(max) = self.max_live {
                let live = count_live(tx)?;
                if live >= max {
                    return Err(HarvestError::ResourceExhausted { live, max });
                }
            }
            tx.execute(
                "INSERT INTO tracked_resources \
                 (id, run_id, step, worker_slot, owner_pid, owner_token, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.as_str(),
                    run_id.as_str(),
                    step,
                    worker_slot,
                    self.owner.pid,
                    self.owner.token,
                    now_db()
                ],
            )?;
            Ok(())
        })?;
        debug!(resource_id = %id, run_id = %run_id, step, slot = worker_slot, "Resource acquired");
        Ok(id)
    }

    /// Acquire a resource released automatically when the guard drops.
    pub fn guard(
        self: &Arc<Self>,
        run_id: &RunId,
        step: u32,
        worker_slot: u32,
    ) -> Result<ResourceGuard> {
        let id = self.acquire(run_id, step, worker_slot)?;
        Ok(ResourceGuard {
            tracker: Arc::clone(self),
            id,
            released: false,
        })
    }

    /// Record the session's own process once it is known.
    pub fn attach_pid(&self, id: &ResourceId, pid: u32) -> Result<()> {
        let updated = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE tracked_resources SET session_pid = ?1 WHERE id = ?2",
                params![pid, id.as_str()],
            )?)
        })?;
        if updated == 0 {
            return Err(HarvestError::ResourceNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Mark a resource terminated. Returns `false` if it already was.
    pub fn release(&self, id: &ResourceId, reason: ReleaseReason) -> Result<bool> {
        let updated = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE tracked_resources SET terminated_at = ?1, termination_reason = ?2 \
                 WHERE id = ?3 AND terminated_at IS NULL",
                params![now_db(), reason.as_str(), id.as_str()],
            )?)
        })?;
        if updated > 0 {
            debug!(resource_id = %id, reason = %reason, "Resource released");
        }
        Ok(updated > 0)
    }

    pub fn get(&self, id: &ResourceId) -> Result<Option<TrackedResource>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {RESOURCE_COLUMNS} FROM tracked_resources WHERE id = ?1"),
                [id.as_str()],
                raw_resource,
            )
            .optional()?
            .map(RawResource::into_resource)
            .transpose()
        })
    }

    /// Live resources, for one run or across all runs.
    pub fn live(&self, run_id: Option<&RunId>) -> Result<Vec<TrackedResource>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RESOURCE_COLUMNS} FROM tracked_resources \
                 WHERE terminated_at IS NULL AND (?1 IS NULL OR run_id = ?1) \
                 ORDER BY created_at, id"
            ))?;
            let rows = stmt.query_map([run_id.map(RunId::as_str)], raw_resource)?;
            rows.map(|row| row?.into_resource()).collect()
        })
    }

    /// Clean up sessions left live by dead processes, ahead of `run_id` starting.
    pub fn sweep_orphans(
        &self,
        run_id: &RunId,
        sessions: &dyn SessionProvider,
    ) -> Result<Vec<OrphanResourceWarning>> {
        let warnings = self.sweep(sessions)?;
        if !warnings.is_empty() {
            warn!(run_id = %run_id, orphans = warnings.len(), "Orphaned sessions cleaned up at run start");
        }
        Ok(warnings)
    }

    /// Terminate and mark `orphaned` every live resource whose owner process is gone.
    pub fn sweep(&self, sessions: &dyn SessionProvider) -> Result<Vec<OrphanResourceWarning>> {
        let mut warnings = Vec::new();
        for resource in self.live(None)? {
            if self.owner.sees_alive(
                self.probe.as_ref(),
                resource.owner_pid,
                &resource.owner_token,
            ) {
                continue;
            }

            let session_terminated = match resource.session_pid {
                Some(pid) if self.probe.is_alive(pid) => match sessions.terminate(pid) {
                    Ok(terminated) => terminated,
                    Err(e) => {
                        warn!(
                            resource_id = %resource.id,
                            session_pid = pid,
                            error = %e,
                            "Failed to terminate orphaned session"
                        );
                        false
                    }
                },
                _ => false,
            };

            if !self.release(&resource.id, ReleaseReason::Orphaned)? {
                continue;
            }

            warn!(
                resource_id = %resource.id,
                run_id = %resource.run_id,
                step = resource.step,
                slot = resource.worker_slot,
                owner_pid = resource.owner_pid,
                session_pid = ?resource.session_pid,
                session_terminated,
                "Orphaned resource"
            );
            warnings.push(OrphanResourceWarning {
                resource_id: resource.id,
                run_id: resource.run_id,
                step: resource.step,
                worker_slot: resource.worker_slot,
                owner_pid: resource.owner_pid,
                session_pid: resource.session_pid,
                session_terminated,
            });
        }
        Ok(warnings)
    }
}

/// Scoped tracked resource; released with reason `dropped` unless released explicitly.
pub struct ResourceGuard {
    tracker: Arc<ResourceTracker>,
    id: ResourceId,
    released: bool,
}

impl ResourceGuard {
    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn attach_pid(&self, pid: u32) -> Result<()> {
        self.tracker.attach_pid(&self.id, pid)
    }

    pub fn release(mut self, reason: ReleaseReason) -> Result<()> {
        self.tracker.release(&self.id, reason)?;
        self.released = true;
        Ok(())
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.tracker.release(&self.id, ReleaseReason::Dropped) {
            Ok(true) => warn!(resource_id = %self.id, "Resource guard dropped without release"),
            Ok(false) => {}
            Err(e) => warn!(resource_id = %self.id, error = %e, "Failed to release dropped resource"),
        }
    }
}

fn count_live(conn: &Connection) -> Result<usize> {
    let live: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tracked_resources WHERE terminated_at IS NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(live.max(0) as usize)
}

struct RawResource {
    id: String,
    run_id: String,
    step: u32,
    worker_slot: u32,
    owner_pid: u32,
    owner_token: String,
    session_pid: Option<u32>,
    created_at: String,
    terminated_at: Option<String>,
    termination_reason: Option<String>,
}

impl RawResource {
    fn into_resource(self) -> Result<TrackedResource> {
        Ok(TrackedResource {
            id: ResourceId::from(self.id),
            run_id: RunId::from(self.run_id),
            step: self.step,
            worker_slot: self.worker_slot,
            owner_pid: self.owner_pid,
            owner_token: self.owner_token,
            session_pid: self.session_pid,
            created_at: from_db_time(&self.created_at)?,
            terminated_at: from_db_time_opt(self.terminated_at)?,
            termination_reason: self
                .termination_reason
                .as_deref()
                .map(parse_column)
                .transpose()?,
        })
    }
}

fn raw_resource(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawResource> {
    Ok(RawResource {
        id: row.get(0)?,
        run_id: row.get(1)?,
        step: row.get(2)?,
        worker_slot: row.get(3)?,
        owner_pid: row.get(4)?,
        owner_token: row.get(5)?,
        session_pid: row.get(6)?,
        created_at: row.get(7)?,
        terminated_at: row.get(8)?,
        termination_reason: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::testing::seed_run;
    use crate::client::testing::{FakeProbe, FakeSessions};

    const ME: u32 = 4_000;
    const DEAD: u32 = 4_001;

    struct Fixture {
        db: Arc<Database>,
        probe: Arc<FakeProbe>,
        sessions: FakeSessions,
        run: RunId,
        me: ProcessOwner,
        dead: ProcessOwner,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        let run = seed_run(&db, "listings");
        let probe = Arc::new(FakeProbe::alive(&[ME, DEAD]));
        let sessions = FakeSessions::new(Arc::clone(&probe));
        Fixture {
            db,
            probe,
            sessions,
            run,
            me: ProcessOwner::new(ME),
            dead: ProcessOwner::new(DEAD),
        }
    }

    fn tracker(
        f: &Fixture,
        owner: &ProcessOwner,
        max_live: Option<usize>,
    ) -> Arc<ResourceTracker> {
        let probe: Arc<dyn ProcessProbe> = f.probe.clone();
        Arc::new(
            ResourceTracker::new(Arc::clone(&f.db), probe, max_live).with_owner(owner.clone()),
        )
    }

    #[test]
    fn acquire_attach_release() {
        let f = fixture();
        let tracker = tracker(&f, &f.me, None);

        let id = tracker.acquire(&f.run, 2, 0).unwrap();
        tracker.attach_pid(&id, 777).unwrap();
        let live = tracker.live(Some(&f.run)).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].session_pid, Some(777));
        assert_eq!(live[0].owner_pid, ME);

        assert!(tracker.release(&id, ReleaseReason::Completed).unwrap());
        assert!(!tracker.release(&id, ReleaseReason::Crashed).unwrap());

        let resource = tracker.get(&id).unwrap().unwrap();
        assert!(!resource.is_live());
        assert_eq!(resource.termination_reason, Some(ReleaseReason::Completed));
    }

    #[test]
    fn attach_pid_to_unknown_resource_fails() {
        let f = fixture();
        let err = tracker(&f, &f.me, None)
            .attach_pid(&ResourceId::from("nope"), 1)
            .unwrap_err();
        assert!(matches!(err, HarvestError::ResourceNotFound(_)));
    }

    #[test]
    fn dropped_guard_releases_resource() {
        let f = fixture();
        let tracker = tracker(&f, &f.me, None);

        let id = {
            let guard = tracker.guard(&f.run, 1, 3).unwrap();
            guard.id().clone()
        };
        let resource = tracker.get(&id).unwrap().unwrap();
        assert_eq!(resource.termination_reason, Some(ReleaseReason::Dropped));

        let guard = tracker.guard(&f.run, 1, 3).unwrap();
        let id = guard.id().clone();
        guard.release(ReleaseReason::Stopped).unwrap();
        assert_eq!(
            tracker.get(&id).unwrap().unwrap().termination_reason,
            Some(ReleaseReason::Stopped)
        );
    }

    #[test]
    fn max_live_is_enforced() {
        let f = fixture();
        let tracker = tracker(&f, &f.me, Some(2));
        let a = tracker.acquire(&f.run, 1, 0).unwrap();
        tracker.acquire(&f.run, 1, 1).unwrap();

        let err = tracker.acquire(&f.run, 1, 2).unwrap_err();
        assert!(matches!(err, HarvestError::ResourceExhausted { live: 2, max: 2 }));

        tracker.release(&a, ReleaseReason::Completed).unwrap();
        tracker.acquire(&f.run, 1, 2).unwrap();
    }

    #[test]
    fn sweep_orphans_of_dead_owner_and_frees_capacity() {
        let f = fixture();
        let previous = tracker(&f, &f.dead, Some(1));
        let id = previous.acquire(&f.run, 2, 0).unwrap();
        f.probe.spawn(9_001);
        previous.attach_pid(&id, 9_001).unwrap();
        f.probe.kill(DEAD);

        let current = tracker(&f, &f.me, Some(1));
        assert!(current.acquire(&f.run, 2, 0).is_err());

        let warnings = current.sweep_orphans(&f.run, &f.sessions).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].resource_id, id);
        assert_eq!(warnings[0].owner_pid, DEAD);
        assert!(warnings[0].session_terminated);
        assert_eq!(*f.sessions.terminated.lock().unwrap(), vec![9_001]);
        assert!(!f.probe.is_alive(9_001));

        let resource = current.get(&id).unwrap().unwrap();
        assert!(resource.terminated_at.is_some());
        assert_eq!(resource.termination_reason, Some(ReleaseReason::Orphaned));

        current.acquire(&f.run, 2, 0).unwrap();
    }

    #[test]
    fn sweep_leaves_live_owners_alone() {
        let f = fixture();
        let other = tracker(&f, &f.dead, None);
        other.acquire(&f.run, 1, 0).unwrap();
        let current = tracker(&f, &f.me, None);
        current.acquire(&f.run, 1, 1).unwrap();

        assert!(current.sweep(&f.sessions).unwrap().is_empty());
        assert_eq!(current.live(None).unwrap().len(), 2);
    }

    #[test]
    fn sweep_reclaims_sessions_of_an_earlier_process_with_our_pid() {
        let f = fixture();
        let crashed = ProcessOwner::new(ME);
        let id = tracker(&f, &crashed, Some(1)).acquire(&f.run, 2, 0).unwrap();

        let current = tracker(&f, &f.me, Some(1));
        let own = {
            let warnings = current.sweep(&f.sessions).unwrap();
            assert_eq!(warnings.len(), 1);
            assert_eq!(warnings[0].resource_id, id);
            current.acquire(&f.run, 2, 0).unwrap()
        };

        // Our own live resource is never swept.
        assert!(current.sweep(&f.sessions).unwrap().is_empty());
        assert!(current.get(&own).unwrap().unwrap().is_live());
    }

    #[test]
    fn orphan_without_session_pid_is_still_marked() {
        let f = fixture();
        tracker(&f, &f.dead, None).acquire(&f.run, 3, 1).unwrap();
        f.probe.kill(DEAD);

        let warnings = tracker(&f, &f.me, None).sweep(&f.sessions).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(!warnings[0].session_terminated);
        assert!(f.sessions.terminated.lock().unwrap().is_empty());
    }
}
