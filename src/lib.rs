//! # Timekeeper Library
//!
//! Crash-safe activity time tracking. Sparse "project P is active" heartbeats
//! become per-project and global sessions with today/week/month/total totals
//! that are recomputed from the sessions on every read.
//!
//! ## Features
//!
//! - **Idle and sleep detection**: silent projects are closed at their last
//!   heartbeat and suspended time is never counted
//! - **Midnight splitting**: every session belongs to exactly one local day
//! - **Session merging**: frequent checkpoints collapse into one session
//! - **Atomic persistence**: debounced, backup-guarded JSON writes
//! - **Crash recovery**: open sessions are credited conservatively on restart
//! - **Monthly archive**: past months roll into SQLite
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use timekeeper::{AnyProject, Config, TimeTracker};
//!
//! let tracker = TimeTracker::builder(Config::default()).build()?;
//! tracker.initialize(&AnyProject)?;
//!
//! tracker.heartbeat("my-project", Some("terminal"));
//! let times = tracker.project_times("my-project");
//! println!("today: {}ms, total: {}ms", times.today, times.total);
//!
//! tracker.shutdown()?;
//! # Ok::<(), timekeeper::TrackerError>(())
//! ```

/// Period totals computed from session intervals
pub mod aggregator;
/// Monthly archive gateway and its SQLite backend
pub mod archive;
pub mod clock;
pub mod common;
/// Configuration management module for loading and saving settings
pub mod config;
pub mod error;
pub mod models;
pub mod persistence;
pub mod recorder;
pub mod recovery;
/// Retry logic with exponential backoff for transient failures
pub mod retry;
pub mod session_store;
pub mod state;
pub mod ticker;
pub mod tracker;
pub mod writer;

pub use archive::{ArchiveGateway, MemoryArchive, NoArchive, SqliteArchive};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Result, TrackerError};
pub use models::{PeriodTimes, Session};
pub use persistence::{LoadSource, PersistenceManager};
pub use recorder::HeartbeatOutcome;
pub use recovery::{AnyProject, FnProvider, ProjectIdProvider};
pub use ticker::TickReport;
pub use tracker::{RecoveryReport, TimeTracker, TrackerBuilder};
