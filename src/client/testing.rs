//! In-memory process table and session provider for tests.

use super::{ProcessProbe, Session, SessionProvider};
use crate::models::SessionProfile;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Probe over an explicit set of live pids.
#[derive(Debug, Default)]
pub struct FakeProbe {
    alive: Mutex<HashSet<u32>>,
}

impl FakeProbe {
    pub fn alive(pids: &[u32]) -> Self {
        Self {
            alive: Mutex::new(pids.iter().copied().collect()),
        }
    }

    pub fn spawn(&self, pid: u32) {
        lock(&self.alive).insert(pid);
    }

    pub fn kill(&self, pid: u32) {
        lock(&self.alive).remove(&pid);
    }
}

impl ProcessProbe for FakeProbe {
    fn is_alive(&self, pid: u32) -> bool {
        lock(&self.alive).contains(&pid)
    }
}

/// Session provider that hands out fake pids registered with a [`FakeProbe`].
pub struct FakeSessions {
    probe: Arc<FakeProbe>,
    next_pid: AtomicU32,
    pub opened: Mutex<Vec<Session>>,
    pub closed: Mutex<Vec<String>>,
    pub terminated: Mutex<Vec<u32>>,
}

impl FakeSessions {
    pub fn new(probe: Arc<FakeProbe>) -> Self {
        Self {
            probe,
            next_pid: AtomicU32::new(50_000),
            opened: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
        }
    }

    pub fn open_count(&self) -> usize {
        lock(&self.opened).len()
    }
}

#[async_trait]
impl SessionProvider for FakeSessions {
    async fn open(&self, _profile: &SessionProfile) -> anyhow::Result<Session> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.probe.spawn(pid);
        let session = Session {
            id: format!("session-{pid}"),
            pid: Some(pid),
            endpoint: None,
        };
        lock(&self.opened).push(session.clone());
        Ok(session)
    }

    async fn close(&self, session: Session) -> anyhow::Result<()> {
        if let Some(pid) = session.pid {
            self.probe.kill(pid);
        }
        lock(&self.closed).push(session.id);
        Ok(())
    }

    fn terminate(&self, pid: u32) -> anyhow::Result<bool> {
        let alive = self.probe.is_alive(pid);
        self.probe.kill(pid);
        lock(&self.terminated).push(pid);
        Ok(alive)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
