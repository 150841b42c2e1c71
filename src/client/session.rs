//! Automation-session collaborator and process liveness probing.
//!
//! Epistemic foundation:
//! - K_i: The core tracks session lifecycle only, never the session protocol
//! - B_i: A recorded process may have exited since → probe before trusting it
//! - I^B: pid reuse is possible; liveness is a belief, not knowledge

use crate::models::SessionProfile;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::OnceLock;
use uuid::Uuid;

/// Answers whether an operating-system process still exists.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the host operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: signal 0 performs permission and existence checks only.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

/// Identity of an orchestrating process: its pid plus a token minted at startup.
///
/// Pids repeat across restarts (a container entrypoint is pid 1 every time),
/// so rows stamped by a process carry both and are compared on the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessOwner {
    pub pid: u32,
    pub token: String,
}

impl ProcessOwner {
    /// The current process, with one token for its whole lifetime.
    pub fn current() -> Self {
        static CURRENT: OnceLock<ProcessOwner> = OnceLock::new();
        CURRENT
            .get_or_init(|| Self::new(std::process::id()))
            .clone()
    }

    /// A new incarnation of process `pid`.
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            token: Uuid::new_v4().to_string(),
        }
    }

    /// Whether the process that stamped a row with `pid` and `token` still runs.
    ///
    /// A row carrying our own pid but another token was written by an earlier
    /// process that held this pid, which is necessarily gone.
    pub fn sees_alive(&self, probe: &dyn ProcessProbe, pid: u32, token: &str) -> bool {
        if pid == self.pid {
            token == self.token
        } else {
            probe.is_alive(pid)
        }
    }
}

/// Ask a process to exit. Returns `false` if it no longer exists.
#[cfg(unix)]
pub fn terminate_process(pid: u32) -> anyhow::Result<bool> {
    let pid = libc::pid_t::try_from(pid)?;
    anyhow::ensure!(pid > 0, "refusing to signal pid {pid}");
    // SAFETY: plain kill(2) on a single positive pid.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err.into())
    }
}

#[cfg(not(unix))]
pub fn terminate_process(pid: u32) -> anyhow::Result<bool> {
    anyhow::bail!("terminating pid {pid} is not supported on this platform")
}

/// A live automation session handed to a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: String,
    /// Process backing the session, when the provider knows it
    pub pid: Option<u32>,
    /// Provider-defined address (e.g. a debugging websocket)
    pub endpoint: Option<String>,
}

/// Opens and closes automation sessions for workers.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn open(&self, profile: &SessionProfile) -> anyhow::Result<Session>;

    async fn close(&self, session: Session) -> anyhow::Result<()>;

    /// Force-terminate a session process left behind by a dead owner.
    ///
    /// Returns `false` if the process was already gone.
    fn terminate(&self, pid: u32) -> anyhow::Result<bool> {
        terminate_process(pid)
    }
}

/// Provider for processes that only clean up sessions and never open them.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedSessions;

#[async_trait]
impl SessionProvider for DetachedSessions {
    async fn open(&self, profile: &SessionProfile) -> anyhow::Result<Session> {
        anyhow::bail!(
            "no session backend attached, cannot open profile '{}'",
            profile.name
        )
    }

    async fn close(&self, _session: Session) -> anyhow::Result<()> {
        Ok(())
    }
}
