//! Configuration models for harvester.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The operator resolves these unknowns at runtime via config file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for harvester.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// State database settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Advisory run lock settings
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Worker pool defaults
    #[serde(default)]
    pub pool: PoolConfig,

    /// Circuit breaker defaults
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Automation session settings
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Per-job-type overrides, keyed by job type name
    #[serde(default)]
    pub jobs: HashMap<String, JobOverrides>,
}

/// State database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path. `${VAR}` placeholders are expanded.
    #[serde(default = "default_database_path")]
    pub path: String,
}

fn default_database_path() -> String {
    "state/harvester.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl DatabaseConfig {
    /// Path with environment variables expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(expand_env_vars(&self.path))
    }
}

/// Advisory lock (lease) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lease lifetime; renewed at step boundaries, with every batch commit,
    /// and every third of its lifetime while a step runs
    #[serde(default = "default_lease_ttl")]
    pub ttl_secs: u64,
}

fn default_lease_ttl() -> u64 {
    6 * 60 * 60
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lease_ttl(),
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of concurrent workers (each holds one session)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Attempts per unit before a soft failure becomes terminal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound for the exponential retry delay
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Units committed per outer transaction
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Show a progress bar while a step runs
    #[serde(default)]
    pub progress: bool,
}

fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_batch_size() -> usize {
    25
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            batch_size: default_batch_size(),
            progress: false,
        }
    }
}

impl PoolConfig {
    /// Delay before retry number `retry` (1-based), doubling up to the cap.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(20);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

/// Circuit breaker configuration.
///
/// K_i: Thresholds are operator decisions, never hardcoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within the window that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Sliding window length
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Time the breaker stays open before a trial call
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Continuous outage after which the step is failed
    #[serde(default = "default_max_pause_secs")]
    pub max_pause_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_window_secs() -> u64 {
    60
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_max_pause_secs() -> u64 {
    15 * 60
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
            max_pause_secs: default_max_pause_secs(),
        }
    }
}

impl BreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn max_pause(&self) -> Duration {
        Duration::from_secs(self.max_pause_secs)
    }
}

/// Automation session configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Cap on concurrently live sessions across all runs (unset = unlimited)
    #[serde(default)]
    pub max_live: Option<usize>,

    /// Profile handed to the session provider on open
    #[serde(default)]
    pub profile: SessionProfile,
}

/// Opaque launch profile for an automation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProfile {
    #[serde(default = "default_profile_name")]
    pub name: String,

    #[serde(default = "default_true")]
    pub headless: bool,

    /// Extra launch arguments, passed through untouched
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_profile_name() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for SessionProfile {
    fn default() -> Self {
        Self {
            name: default_profile_name(),
            headless: true,
            args: Vec::new(),
        }
    }
}

/// Per-job-type overrides of pool and breaker settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOverrides {
    #[serde(default)]
    pub concurrency: Option<usize>,

    #[serde(default)]
    pub max_attempts: Option<u32>,

    #[serde(default)]
    pub failure_threshold: Option<u32>,

    #[serde(default)]
    pub window_secs: Option<u64>,

    #[serde(default)]
    pub cooldown_secs: Option<u64>,

    #[serde(default)]
    pub max_pause_secs: Option<u64>,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or spin the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sessions.max_live == Some(0) {
            return Err(ConfigError::Invalid(
                "sessions: max_live must be >= 1 when set".to_string(),
            ));
        }
        let pools = std::iter::once(("pool".to_string(), self.pool.clone()))
            .chain(self.jobs.keys().map(|job| (format!("jobs.{job}"), self.pool_for(job))));
        for (scope, pool) in pools {
            if pool.concurrency == 0 {
                return Err(ConfigError::Invalid(format!("{scope}: concurrency must be >= 1")));
            }
            if pool.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!("{scope}: max_attempts must be >= 1")));
            }
            if let Some(max) = self.sessions.max_live {
                if pool.concurrency > max {
                    return Err(ConfigError::Invalid(format!(
                        "{scope}: concurrency {} exceeds sessions.max_live {max}",
                        pool.concurrency
                    )));
                }
            }
        }
        if self.pool.batch_size == 0 {
            return Err(ConfigError::Invalid("pool: batch_size must be >= 1".to_string()));
        }
        let breakers = std::iter::once(("breaker".to_string(), self.breaker.clone())).chain(
            self.jobs
                .keys()
                .map(|job| (format!("jobs.{job}"), self.breaker_for(job))),
        );
        for (scope, breaker) in breakers {
            if breaker.failure_threshold == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{scope}: failure_threshold must be >= 1"
                )));
            }
            if breaker.window_secs == 0 {
                return Err(ConfigError::Invalid(format!("{scope}: window_secs must be >= 1")));
            }
        }
        Ok(())
    }

    /// Pool settings for a job type, with its overrides applied.
    pub fn pool_for(&self, job_type: &str) -> PoolConfig {
        let mut pool = self.pool.clone();
        if let Some(job) = self.jobs.get(job_type) {
            if let Some(concurrency) = job.concurrency {
                pool.concurrency = concurrency;
            }
            if let Some(max_attempts) = job.max_attempts {
                pool.max_attempts = max_attempts;
            }
        }
        pool
    }

    /// Breaker settings for a job type, with its overrides applied.
    pub fn breaker_for(&self, job_type: &str) -> BreakerConfig {
        let mut breaker = self.breaker.clone();
        if let Some(job) = self.jobs.get(job_type) {
            if let Some(v) = job.failure_threshold {
                breaker.failure_threshold = v;
            }
            if let Some(v) = job.window_secs {
                breaker.window_secs = v;
            }
            if let Some(v) = job.cooldown_secs {
                breaker.cooldown_secs = v;
            }
            if let Some(v) = job.max_pause_secs {
                breaker.max_pause_secs = v;
            }
        }
        breaker
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return result;
    };

    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.pool.concurrency, 4);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.lease.ttl(), Duration::from_secs(21_600));
        assert!(config.sessions.max_live.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn job_overrides_apply_per_job_type() {
        let config: Config = toml::from_str(
            r#"
            [pool]
            concurrency = 2

            [breaker]
            failure_threshold = 3

            [jobs.listings]
            concurrency = 8
            cooldown_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.pool_for("listings").concurrency, 8);
        assert_eq!(config.pool_for("other").concurrency, 2);
        assert_eq!(config.breaker_for("listings").cooldown_secs, 5);
        assert_eq!(config.breaker_for("listings").failure_threshold, 3);
    }

    #[test]
    fn zero_concurrency_override_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            [jobs.listings]
            concurrency = 0
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("jobs.listings"), "got: {err}");
    }

    #[test]
    fn concurrency_above_live_session_cap_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            [pool]
            concurrency = 2

            [sessions]
            max_live = 2

            [jobs.listings]
            concurrency = 3
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("jobs.listings"), "got: {err}");
        assert!(err.to_string().contains("max_live"), "got: {err}");

        let mut config = config;
        config.jobs.clear();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let pool = PoolConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 350,
            ..Default::default()
        };
        assert_eq!(pool.backoff(1), Duration::from_millis(100));
        assert_eq!(pool.backoff(2), Duration::from_millis(200));
        assert_eq!(pool.backoff(3), Duration::from_millis(350));
        assert_eq!(pool.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn from_file_reports_parse_errors_with_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool]\nconcurrency = \"many\"").unwrap();
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn unset_env_placeholder_is_left_alone() {
        let expanded = expand_env_vars("${HARVESTER_SURELY_UNSET_VAR}/state.db");
        assert_eq!(expanded, "${HARVESTER_SURELY_UNSET_VAR}/state.db");
    }
}
