//! Circuit breaker guarding calls to an external target.
//!
//! Epistemic foundation:
//! - K_i: Sustained soft failures within a window mean the target is unhealthy
//! - K_i: Half-open admits exactly one trial call at a time
//! - K_i: Only the trial's own result resolves half-open; late results are ignored
//! - B_i: The target may recover at any time → probe after the cooldown
//! - I^B: Outage length is unknowable → bounded by a max pause

use crate::models::BreakerConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Poll interval while a half-open trial is in flight.
const TRIAL_POLL: Duration = Duration::from_millis(250);

/// Current mode of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitMode {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Point-in-time view of a breaker, reported with failed runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitState {
    pub dependency: String,
    pub mode: CircuitMode,
    /// Failures inside the current sliding window
    pub failures_in_window: u32,
    /// When the breaker last opened
    pub opened_at: Option<DateTime<Utc>>,
    /// Time since the first opening after the last close
    pub outage: Option<Duration>,
}

impl CircuitState {
    /// A closed breaker with no recorded failures.
    pub fn closed(dependency: &str) -> Self {
        Self {
            dependency: dependency.to_string(),
            mode: CircuitMode::Closed,
            failures_in_window: 0,
            opened_at: None,
            outage: None,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({} failures in window",
            self.dependency, self.mode, self.failures_in_window
        )?;
        if let Some(outage) = self.outage {
            write!(f, ", outage {}s", outage.as_secs())?;
        }
        f.write_str(")")
    }
}

/// Admission of one call. Its result is recorded against the permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    /// Breaker epoch the call was admitted in
    epoch: u64,
    /// Whether this call is the half-open trial
    trial: bool,
}

impl Permit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

/// Result of waiting for the breaker to admit a call.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerWait {
    /// The caller may attempt the call and must record its result
    Permitted(Permit),
    /// The breaker stayed open past the max pause
    Outage(CircuitState),
    /// The stop signal fired while waiting
    Stopped,
}

#[derive(Debug)]
struct BreakerInner {
    mode: CircuitMode,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    opened_wall: Option<DateTime<Utc>>,
    outage_started: Option<Instant>,
    trial_in_flight: bool,
    /// Bumped on every open and close
    epoch: u64,
}

impl BreakerInner {
    fn prune(&mut self, window: Duration, now: Instant) {
        while self
            .failures
            .front()
            .is_some_and(|&t| now.duration_since(t) >= window)
        {
            self.failures.pop_front();
        }
    }

    fn open(&mut self, now: Instant) {
        self.mode = CircuitMode::Open;
        self.opened_at = Some(now);
        self.opened_wall = Some(Utc::now());
        self.outage_started.get_or_insert(now);
        self.trial_in_flight = false;
        self.epoch += 1;
    }

    /// Whether `permit` is the trial admitted since the last open.
    fn is_current_trial(&self, permit: Permit) -> bool {
        self.mode == CircuitMode::HalfOpen && permit.trial && permit.epoch == self.epoch
    }

    fn close(&mut self) {
        self.mode = CircuitMode::Closed;
        self.failures.clear();
        self.opened_at = None;
        self.opened_wall = None;
        self.outage_started = None;
        self.trial_in_flight = false;
        self.epoch += 1;
    }
}

/// Sliding-window failure tracker for one guarded dependency.
///
/// State lives in memory only; a restarted process starts closed.
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    threshold: u32,
    window: Duration,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            dependency: dependency.into(),
            threshold: config.failure_threshold.max(1),
            window: config.window(),
            cooldown: config.cooldown(),
            inner: Mutex::new(BreakerInner {
                mode: CircuitMode::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                opened_wall: None,
                outage_started: None,
                trial_in_flight: false,
                epoch: 0,
            }),
        }
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a call now, if the breaker allows one.
    ///
    /// An open breaker whose cooldown elapsed moves to half-open and admits
    /// this caller as the single trial.
    pub fn allow(&self) -> Option<Permit> {
        let mut inner = self.lock();
        let trial = match inner.mode {
            CircuitMode::Closed => false,
            CircuitMode::Open => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|t| t.elapsed() >= self.cooldown);
                if !cooled {
                    return None;
                }
                inner.mode = CircuitMode::HalfOpen;
                info!(dependency = %self.dependency, "Circuit half-open, admitting trial call");
                true
            }
            CircuitMode::HalfOpen if inner.trial_in_flight => return None,
            CircuitMode::HalfOpen => true,
        };
        if trial {
            inner.trial_in_flight = true;
        }
        Some(Permit {
            epoch: inner.epoch,
            trial,
        })
    }

    pub fn record_success(&self, permit: Permit) {
        let mut inner = self.lock();
        match inner.mode {
            CircuitMode::HalfOpen if inner.is_current_trial(permit) => {
                inner.close();
                info!(dependency = %self.dependency, "Circuit closed after successful trial");
            }
            CircuitMode::Closed => {
                let now = Instant::now();
                inner.prune(self.window, now);
                inner.failures.pop_front();
            }
            // Late result of a call admitted before the breaker opened.
            CircuitMode::HalfOpen | CircuitMode::Open => {
                debug!(dependency = %self.dependency, "Ignoring late success");
            }
        }
    }

    pub fn record_failure(&self, permit: Permit) {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.mode {
            CircuitMode::HalfOpen if inner.is_current_trial(permit) => {
                inner.open(now);
                warn!(
                    dependency = %self.dependency,
                    cooldown_secs = self.cooldown.as_secs(),
                    "Trial call failed, circuit reopened"
                );
            }
            CircuitMode::Closed if permit.epoch == inner.epoch => {
                inner.prune(self.window, now);
                inner.failures.push_back(now);
                let failures = inner.failures.len();
                if failures >= self.threshold as usize {
                    inner.open(now);
                    warn!(
                        dependency = %self.dependency,
                        failures,
                        window_secs = self.window.as_secs(),
                        cooldown_secs = self.cooldown.as_secs(),
                        "Failure threshold reached, circuit opened"
                    );
                } else {
                    debug!(dependency = %self.dependency, failures, "Failure recorded");
                }
            }
            CircuitMode::Closed | CircuitMode::HalfOpen | CircuitMode::Open => {
                debug!(dependency = %self.dependency, "Ignoring late failure");
            }
        }
    }

    /// Give back a half-open trial that ended without a verdict on the target.
    pub fn cancel_trial(&self, permit: Permit) {
        let mut inner = self.lock();
        if inner.is_current_trial(permit) {
            inner.trial_in_flight = false;
        }
    }

    pub fn snapshot(&self) -> CircuitState {
        let now = Instant::now();
        let mut inner = self.lock();
        if inner.mode == CircuitMode::Closed {
            inner.prune(self.window, now);
        }
        CircuitState {
            dependency: self.dependency.clone(),
            mode: inner.mode,
            failures_in_window: inner.failures.len() as u32,
            opened_at: inner.opened_wall,
            outage: inner.outage_started.map(|t| now.duration_since(t)),
        }
    }

    /// Time until the breaker may admit a call, if it is blocking now.
    fn retry_in(&self) -> Option<Duration> {
        let inner = self.lock();
        match inner.mode {
            CircuitMode::Closed => None,
            CircuitMode::Open => Some(
                inner
                    .opened_at
                    .map_or(Duration::ZERO, |t| self.cooldown.saturating_sub(t.elapsed())),
            ),
            CircuitMode::HalfOpen => inner.trial_in_flight.then_some(TRIAL_POLL),
        }
    }

    /// Wait until a call is permitted, the outage exceeds `max_pause`, or `stop` fires.
    pub async fn wait_for_permit(
        &self,
        max_pause: Duration,
        stop: &CancellationToken,
    ) -> BreakerWait {
        let mut logged = false;
        loop {
            if stop.is_cancelled() {
                return BreakerWait::Stopped;
            }
            if let Some(permit) = self.allow() {
                return BreakerWait::Permitted(permit);
            }

            let state = self.snapshot();
            let outage = state.outage.unwrap_or_default();
            if outage >= max_pause {
                warn!(
                    dependency = %self.dependency,
                    outage_secs = outage.as_secs(),
                    max_pause_secs = max_pause.as_secs(),
                    "Circuit open past max pause"
                );
                return BreakerWait::Outage(state);
            }
            if !logged {
                info!(dependency = %self.dependency, state = %state, "Waiting for circuit breaker");
                logged = true;
            }

            let pause = self
                .retry_in()
                .unwrap_or(Duration::ZERO)
                .min(max_pause - outage)
                .max(Duration::from_millis(1));
            tokio::select! {
                _ = stop.cancelled() => return BreakerWait::Stopped,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}

/// One breaker per guarded dependency, shared by every worker of a run.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `dependency`, created closed on first use.
    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(dependency, &self.config)))
            .clone()
    }

    pub fn max_pause(&self) -> Duration {
        self.config.max_pause()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, window_secs: u64, cooldown_secs: u64) -> CircuitBreaker {
        let config = BreakerConfig {
            failure_threshold: threshold,
            window_secs,
            cooldown_secs,
            max_pause_secs: 600,
        };
        CircuitBreaker::new("listings.example", &config)
    }

    /// Admit a call and record it as failed.
    fn fail(cb: &CircuitBreaker) {
        let permit = cb.allow().expect("breaker admits a call");
        cb.record_failure(permit);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_failures_within_window_open_the_breaker() {
        let cb = breaker(3, 60, 30);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(10)).await;
        fail(&cb);
        assert!(cb.allow().is_some());
        fail(&cb);

        assert_eq!(cb.snapshot().mode, CircuitMode::Open);
        assert!(cb.allow().is_none());
        assert!(cb.snapshot().opened_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_outside_window_do_not_accumulate() {
        let cb = breaker(3, 60, 30);
        fail(&cb);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(61)).await;
        fail(&cb);

        let state = cb.snapshot();
        assert_eq!(state.mode, CircuitMode::Closed);
        assert_eq!(state.failures_in_window, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_in_closed_mode_decays_window() {
        let cb = breaker(3, 60, 30);
        fail(&cb);
        fail(&cb);
        let permit = cb.allow().unwrap();
        cb.record_success(permit);
        fail(&cb);
        assert_eq!(cb.snapshot().mode, CircuitMode::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_half_open_closed_after_cooldown_success() {
        let cb = breaker(3, 60, 30);
        for _ in 0..3 {
            fail(&cb);
        }
        assert!(cb.allow().is_none());

        tokio::time::advance(Duration::from_secs(30)).await;
        let trial = cb.allow().unwrap();
        assert!(trial.is_trial());
        assert_eq!(cb.snapshot().mode, CircuitMode::HalfOpen);
        // Only one trial while it is in flight.
        assert!(cb.allow().is_none());

        cb.record_success(trial);
        let state = cb.snapshot();
        assert_eq!(state.mode, CircuitMode::Closed);
        assert_eq!(state.failures_in_window, 0);
        assert!(state.outage.is_none());
        assert!(cb.allow().is_some_and(|p| !p.is_trial()));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_and_restarts_cooldown() {
        let cb = breaker(3, 60, 30);
        for _ in 0..3 {
            fail(&cb);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        let trial = cb.allow().unwrap();

        cb.record_failure(trial);
        assert_eq!(cb.snapshot().mode, CircuitMode::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cb.allow().is_none());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.allow().is_some());

        // Outage is measured from the first opening.
        assert_eq!(cb.snapshot().outage, Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn late_results_do_not_resolve_half_open() {
        let cb = breaker(1, 60, 5);
        let early_ok = cb.allow().unwrap();
        let early_err = cb.allow().unwrap();
        fail(&cb);
        tokio::time::advance(Duration::from_secs(5)).await;
        let trial = cb.allow().unwrap();

        cb.record_success(early_ok);
        assert_eq!(cb.snapshot().mode, CircuitMode::HalfOpen);
        cb.record_failure(early_err);
        assert_eq!(cb.snapshot().mode, CircuitMode::HalfOpen);
        cb.cancel_trial(early_ok);
        assert!(cb.allow().is_none(), "trial still in flight");

        cb.record_success(trial);
        assert_eq!(cb.snapshot().mode, CircuitMode::Closed);

        // A failure admitted before the outage does not count after recovery.
        cb.record_failure(early_err);
        assert_eq!(cb.snapshot().failures_in_window, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_trial_admits_another() {
        let cb = breaker(1, 60, 5);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(5)).await;
        let trial = cb.allow().unwrap();
        assert!(cb.allow().is_none());
        cb.cancel_trial(trial);
        assert!(cb.allow().is_some_and(|p| p.is_trial()));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_permit_sleeps_through_cooldown() {
        let cb = breaker(1, 60, 30);
        fail(&cb);

        let stop = CancellationToken::new();
        let start = Instant::now();
        let wait = cb.wait_for_permit(Duration::from_secs(600), &stop).await;
        assert!(matches!(wait, BreakerWait::Permitted(p) if p.is_trial()));
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_permit_reports_outage_past_max_pause() {
        let cb = breaker(1, 60, 30);
        fail(&cb);

        let stop = CancellationToken::new();
        let mut trials = 0;
        let outcome = loop {
            match cb.wait_for_permit(Duration::from_secs(100), &stop).await {
                BreakerWait::Permitted(permit) => {
                    trials += 1;
                    cb.record_failure(permit);
                }
                other => break other,
            }
        };

        assert_eq!(trials, 3);
        match outcome {
            BreakerWait::Outage(state) => {
                assert_eq!(state.mode, CircuitMode::Open);
                assert!(state.outage.unwrap() >= Duration::from_secs(100));
            }
            other => panic!("expected outage, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_permit_honours_stop() {
        let cb = breaker(1, 60, 30);
        fail(&cb);
        let stop = CancellationToken::new();
        stop.cancel();
        assert_eq!(
            cb.wait_for_permit(Duration::from_secs(600), &stop).await,
            BreakerWait::Stopped
        );
    }

    #[test]
    fn registry_shares_breakers_by_dependency() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        });
        fail(&registry.get("a"));
        assert_eq!(registry.get("a").snapshot().mode, CircuitMode::Open);
        assert_eq!(registry.get("b").snapshot().mode, CircuitMode::Closed);
        assert!(Arc::ptr_eq(&registry.get("a"), &registry.get("a")));
    }
}
