//! harvester CLI - operator surface for resumable collection runs.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harvester::client::{DetachedSessions, SystemProbe};
use harvester::{CheckpointStore, Config, Database, ResourceTracker, RunLedger};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "harvester")]
#[command(version)]
#[command(about = "Inspect and maintain resumable data collection runs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the latest run of a job type with its checkpoints and live sessions
    Status {
        /// Job type name
        #[arg(short, long)]
        job: String,
    },

    /// List recent runs of a job type
    Runs {
        /// Job type name
        #[arg(short, long)]
        job: String,

        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Terminate sessions left behind by dead processes
    Sweep,

    /// Force-release the run lease of a job type
    Unlock {
        /// Job type name
        #[arg(short, long)]
        job: String,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn print_example_config() {
    let example = r#"# harvester configuration file

[database]
# SQLite state database (supports ${VAR} expansion)
path = "${HOME}/.local/state/harvester/state.db"

[lease]
ttl_secs = 21600

[pool]
concurrency = 4
max_attempts = 3
backoff_base_ms = 500
backoff_max_ms = 30000
batch_size = 25
progress = true

[breaker]
failure_threshold = 5
window_secs = 60
cooldown_secs = 30
max_pause_secs = 900

[sessions]
max_live = 8

[sessions.profile]
name = "default"
headless = true
args = ["--disable-gpu"]

# Per-job-type overrides
[jobs.registry_listings]
concurrency = 2
max_pause_secs = 1800
"#;
    println!("{example}");
}

fn load_config(path: &Path) -> Result<Config> {
    let config =
        Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn open_database(config: &Config) -> Result<Arc<Database>> {
    let path = config.database.resolved_path();
    let db = Database::open(&path)
        .with_context(|| format!("Failed to open state database {path:?}"))?;
    Ok(Arc::new(db))
}

fn ledger(db: &Arc<Database>, config: &Config) -> RunLedger {
    RunLedger::new(Arc::clone(db), Arc::new(SystemProbe), config.lease.ttl())
}

fn tracker(db: &Arc<Database>, config: &Config) -> ResourceTracker {
    ResourceTracker::new(Arc::clone(db), Arc::new(SystemProbe), config.sessions.max_live)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            info!("Configuration is valid");
            info!("  Database: {:?}", config.database.resolved_path());
            info!(
                "  Pool: {} workers, {} attempts per unit",
                config.pool.concurrency, config.pool.max_attempts
            );
            info!(
                "  Breaker: opens at {} failures in {}s, max pause {}s",
                config.breaker.failure_threshold,
                config.breaker.window_secs,
                config.breaker.max_pause_secs
            );
            info!("  Job overrides: {}", config.jobs.len());
        }

        Commands::Status { job } => {
            let config = load_config(&cli.config)?;
            let db = open_database(&config)?;
            let ledger = ledger(&db, &config);

            let Some(run) = ledger.latest(&job)? else {
                println!("No runs recorded for job type '{job}'");
                return Ok(());
            };

            println!("\n=== {job} ===");
            println!("Run:      {}", run.id);
            println!("Mode:     {}", run.mode);
            println!("Status:   {}", run.status);
            println!("Created:  {}", run.created_at);
            println!("Updated:  {}", run.updated_at);
            if let Some(reason) = &run.failure_reason {
                println!("Failure:  {reason}");
            }
            if let Some(lease) = ledger.lease(&job)? {
                println!(
                    "Lease:    pid {} until {}",
                    lease.owner_pid, lease.expires_at
                );
            }

            let checkpoints = CheckpointStore::new(Arc::clone(&db)).list(&run.id)?;
            println!("\nSteps:");
            for cp in &checkpoints {
                println!(
                    "  {:>2}. {:<24} {:<8} rows={:<8} cursor={}",
                    cp.step,
                    cp.name,
                    cp.status,
                    cp.rows_processed,
                    serde_json::to_string(&cp.cursor)?
                );
                if let Some(error) = &cp.last_error {
                    println!("      last error: {error}");
                }
            }

            let live = tracker(&db, &config).live(Some(&run.id))?;
            println!("\nLive sessions: {}", live.len());
            for resource in &live {
                println!(
                    "  {} step={} slot={} owner={} session={:?}",
                    resource.id,
                    resource.step,
                    resource.worker_slot,
                    resource.owner_pid,
                    resource.session_pid
                );
            }
        }

        Commands::Runs { job, limit } => {
            let config = load_config(&cli.config)?;
            let db = open_database(&config)?;
            let runs = ledger(&db, &config).list(&job, limit)?;
            if runs.is_empty() {
                println!("No runs recorded for job type '{job}'");
            }
            for run in runs {
                println!(
                    "{}  {:<9} {:<6} {}",
                    run.id, run.status, run.mode, run.created_at
                );
            }
        }

        Commands::Sweep => {
            let config = load_config(&cli.config)?;
            let db = open_database(&config)?;
            let warnings = tracker(&db, &config)
                .sweep(&DetachedSessions)
                .context("Orphan sweep failed")?;
            for warning in &warnings {
                warn!(
                    resource_id = %warning.resource_id,
                    run_id = %warning.run_id,
                    owner_pid = warning.owner_pid,
                    session_terminated = warning.session_terminated,
                    "Orphaned session"
                );
            }
            println!("Swept {} orphaned sessions", warnings.len());
        }

        Commands::Unlock { job } => {
            let config = load_config(&cli.config)?;
            let db = open_database(&config)?;
            if ledger(&db, &config).force_unlock(&job)? {
                println!("Released lease for '{job}'");
            } else {
                println!("No lease held for '{job}'");
            }
        }
    }

    Ok(())
}
