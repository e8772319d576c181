//! # Timekeeper
//!
//! Activity time-tracking daemon. Reads line commands from stdin and keeps
//! per-project and global time accounting in the XDG data directory.
//!
//! ## Usage
//!
//! ```bash
//! printf 'heartbeat my-project terminal\ntimes my-project\nquit\n' | timekeeper
//! ```

use clap::{Parser, Subcommand};
use log::{info, warn};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use timekeeper::common::month_key;
use timekeeper::config::{self, Config};
use timekeeper::error::Result;
use timekeeper::persistence::PersistenceManager;
use timekeeper::recovery::{AnyProject, ProjectIdProvider};
use timekeeper::session_store::SessionStore;
use timekeeper::state::TrackerState;
use timekeeper::{HeartbeatOutcome, TimeTracker};

/// Timekeeper - crash-safe activity time tracking
#[derive(Parser)]
#[command(name = "timekeeper")]
#[command(version)]
#[command(about = "Crash-safe activity time tracking", long_about = None)]
#[command(
    after_help = "Commands on stdin (run mode):\n  heartbeat <project> [source]\n  stop <project>\n  times <project>\n  global\n  flush\n  quit"
)]
struct Cli {
    /// Path to a config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data file location
    #[arg(long, global = true)]
    data_file: Option<PathBuf>,

    /// Override the tick interval in seconds
    #[arg(long, global = true)]
    tick_secs: Option<u64>,

    /// Known project ids; checkpoints of other projects are not recovered
    #[arg(long = "project", global = true)]
    projects: Vec<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Track activity from stdin commands (default)
    Run,

    /// Generate example config file
    GenerateConfig,

    /// Print persisted totals as JSON
    Report,
}

fn main() -> Result<()> {
    // Initialize logging with WARN level by default (can be overridden with RUST_LOG env var)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        env::set_var("TIMEKEEPER_CONFIG_PATH", path);
    }

    let mut config = config::get_config().clone();
    if let Some(path) = &cli.data_file {
        config.persistence.data_file = path.to_string_lossy().into_owned();
    }
    if let Some(secs) = cli.tick_secs {
        config.tracking.tick_interval_secs = secs;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::GenerateConfig => generate_config(),
        Commands::Report => report(&config),
        Commands::Run => {
            let known: HashSet<String> = cli.projects.into_iter().collect();
            if known.is_empty() {
                run(config, &AnyProject)
            } else {
                run(config, &known)
            }
        }
    }
}

fn generate_config() -> Result<()> {
    let config_path = Config::default_config_path()?;
    println!("Generating example config file at: {:?}", config_path);

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(&config_path, Config::example_toml())?;
    println!("Config file generated successfully!");
    println!("Edit {} to customize settings", config_path.display());
    Ok(())
}

fn run(config: Config, provider: &dyn ProjectIdProvider) -> Result<()> {
    let tracker = TimeTracker::builder(config).build()?;
    let recovery = tracker.initialize(provider)?;
    if recovery.sessions_dropped > 0 || recovery.checkpoint_recovered > 0 {
        eprintln!(
            "Recovered {} checkpoint entries, dropped {} invalid sessions",
            recovery.checkpoint_recovered, recovery.sessions_dropped
        );
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to read command: {}", e);
                break;
            }
        };

        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            continue;
        };

        let response = match (command, parts.next()) {
            ("heartbeat", Some(project)) => match tracker.heartbeat(project, parts.next()) {
                HeartbeatOutcome::Rejected => "error: empty project id".to_string(),
                outcome => format!("{:?}", outcome).to_lowercase(),
            },
            ("stop", Some(project)) => {
                if tracker.stop_project(project) {
                    "stopped".to_string()
                } else {
                    "not active".to_string()
                }
            }
            ("times", Some(project)) => serde_json::to_string(&tracker.project_times(project))?,
            ("global", _) => serde_json::to_string(&tracker.global_times())?,
            ("flush", _) => match tracker.flush() {
                Ok(()) => "flushed".to_string(),
                Err(e) => format!("error: {}", e),
            },
            ("quit", _) => break,
            _ => format!("error: unknown command '{}'", line.trim()),
        };

        writeln!(stdout, "{}", response)?;
        stdout.flush()?;
    }

    info!("Input closed, shutting down");
    tracker.shutdown()
}

/// Totals from the data file alone; open sessions of a running daemon are not included.
/// Reading never writes: a corrupt file is left for the daemon to preserve.
fn report(config: &Config) -> Result<()> {
    let persistence = PersistenceManager::from_config(config);
    let loaded = persistence.peek();
    let (store, _) = SessionStore::from_raw(&loaded.data, config.tracking.merge_gap());

    let now = chrono::Utc::now();
    let month = loaded.data.month.clone().unwrap_or_else(|| month_key(now));
    let state = TrackerState::new(store, config.tracking.clone(), month, now);

    let projects: BTreeMap<&str, _> = state
        .store()
        .project_ids()
        .map(|id| (id, state.project_times(id, now)))
        .collect();

    let output = json!({
        "dataFile": persistence.path().display().to_string(),
        "month": state.month(),
        "global": state.global_times(now),
        "projects": projects,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
