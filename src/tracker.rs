//! `TimeTracker`: the public engine façade.
//!
//! Composes the runtime state, the debounced writer, the ticker thread and
//! the archive gateway. All state transitions go through one mutex; disk
//! writes happen on the writer thread from snapshots taken under it.
//!
//! ```rust,no_run
//! use timekeeper::{AnyProject, Config, TimeTracker};
//!
//! let tracker = TimeTracker::builder(Config::default()).build().unwrap();
//! tracker.initialize(&AnyProject).unwrap();
//! tracker.heartbeat("my-project", Some("terminal"));
//! println!("{:?}", tracker.project_times("my-project"));
//! tracker.shutdown().unwrap();
//! ```

use crate::archive::{ArchiveGateway, NoArchive, SqliteArchive};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{Result, TrackerError};
use crate::models::{DataFile, PeriodTimes};
use crate::persistence::{LoadSource, PersistenceManager};
use crate::recorder::HeartbeatOutcome;
use crate::recovery::{parse_checkpoint, plan_recovery, ProjectIdProvider};
use crate::session_store::SessionStore;
use crate::state::TrackerState;
use crate::ticker::{TickReport, Ticker};
use crate::writer::{DebouncedWriter, SnapshotSource};
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// What `initialize` found and repaired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub load_source: LoadSource,
    /// Invalid sessions removed while loading
    pub sessions_dropped: usize,
    /// Checkpoint entries credited
    pub checkpoint_recovered: usize,
    /// Checkpoint entries that were stale, unknown or unreadable
    pub checkpoint_discarded: usize,
    /// Months rolled into the archive during startup
    pub archived_months: Vec<(i32, u32)>,
}

/// Hands state snapshots to the writer thread.
struct StateSnapshots {
    state: Arc<Mutex<TrackerState>>,
}

impl SnapshotSource for StateSnapshots {
    fn snapshot(&self) -> DataFile {
        lock_state(&self.state).snapshot()
    }

    fn write_finished(&self, result: &Result<()>) {
        if result.is_err() {
            lock_state(&self.state).mark_dirty();
        }
    }
}

fn lock_state(state: &Mutex<TrackerState>) -> MutexGuard<'_, TrackerState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

struct Inner {
    config: Config,
    state: Arc<Mutex<TrackerState>>,
    clock: Arc<dyn Clock>,
    persistence: Arc<PersistenceManager>,
    archive: Arc<dyn ArchiveGateway>,
    writer: Mutex<Option<DebouncedWriter>>,
    ticker: Mutex<Option<Ticker>>,
    manual_ticks: bool,
    initialized: AtomicBool,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, TrackerState> {
        lock_state(&self.state)
    }

    fn schedule_save(&self) {
        if let Some(writer) = self.writer.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            writer.schedule();
        }
    }

    fn run_tick(&self) -> TickReport {
        let now = self.clock.now();
        let report = self.state().tick(now, self.archive.as_ref());
        if report.needs_save {
            self.schedule_save();
        }
        report
    }

    fn save_now(&self) -> Result<()> {
        let document = self.state().snapshot();
        let result = self.persistence.save_immediate(&document);
        if result.is_err() {
            self.state().mark_dirty();
        }
        result
    }
}

pub struct TrackerBuilder {
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    persistence: Option<PersistenceManager>,
    archive: Option<Arc<dyn ArchiveGateway>>,
    manual_ticks: bool,
}

impl TrackerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn persistence(mut self, persistence: PersistenceManager) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn archive(mut self, archive: Arc<dyn ArchiveGateway>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Skip the ticker thread; the caller drives `tick()` itself
    pub fn manual_ticks(mut self, manual: bool) -> Self {
        self.manual_ticks = manual;
        self
    }

    pub fn build(self) -> Result<TimeTracker> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let persistence = self
            .persistence
            .unwrap_or_else(|| PersistenceManager::from_config(&self.config));
        let archive: Arc<dyn ArchiveGateway> = match self.archive {
            Some(archive) => archive,
            None if self.config.archive.enabled => Arc::new(SqliteArchive::from_config(&self.config)?),
            None => Arc::new(NoArchive),
        };

        let state = TrackerState::empty(self.config.tracking.clone(), clock.now());
        Ok(TimeTracker {
            inner: Arc::new(Inner {
                config: self.config,
                state: Arc::new(Mutex::new(state)),
                clock,
                persistence: Arc::new(persistence),
                archive,
                writer: Mutex::new(None),
                ticker: Mutex::new(None),
                manual_ticks: self.manual_ticks,
                initialized: AtomicBool::new(false),
            }),
        })
    }
}

/// Crash-safe activity time tracker.
#[derive(Clone)]
pub struct TimeTracker {
    inner: Arc<Inner>,
}

impl TimeTracker {
    pub fn builder(config: Config) -> TrackerBuilder {
        TrackerBuilder {
            config,
            clock: None,
            persistence: None,
            archive: None,
            manual_ticks: false,
        }
    }

    /// Load persisted data, recover from a crash and start the background threads.
    ///
    /// An unreadable data file never fails this call; the tracker starts empty.
    pub fn initialize(&self, provider: &dyn ProjectIdProvider) -> Result<RecoveryReport> {
        let inner = &self.inner;
        if inner.initialized.swap(true, Ordering::SeqCst) {
            return Err(TrackerError::other("tracker already initialized"));
        }

        let now = inner.clock.now();
        let tracking = inner.config.tracking.clone();
        let loaded = inner.persistence.load();
        let (store, sessions_dropped) = SessionStore::from_raw(&loaded.data, tracking.merge_gap());

        if let Some(version) = loaded.data.version.as_deref() {
            if version != crate::models::DATA_VERSION {
                warn!("Activity data version {} read best-effort", version);
            }
        }

        let (checkpoint, unreadable) = match &loaded.data.checkpoint {
            Some(value) => parse_checkpoint(value),
            None => Default::default(),
        };
        let plan = plan_recovery(&checkpoint, now, &tracking, provider);

        let mut report = RecoveryReport {
            load_source: loaded.source,
            sessions_dropped,
            checkpoint_recovered: plan.recovered_projects(),
            checkpoint_discarded: plan.discarded + unreadable,
            archived_months: Vec::new(),
        };

        {
            let mut state = inner.state();
            let month = loaded.data.month.clone().unwrap_or_default();
            *state = TrackerState::new(store, tracking, month, now);
            state.apply_recovery(&plan);

            if state.month() != crate::common::month_key(now) {
                report.archived_months = match state.archive_past_months(now, inner.archive.as_ref()) {
                    Ok(months) | Err(months) => months,
                };
            }
        }

        // The consumed checkpoint is cleared by this save
        if let Err(e) = inner.save_now() {
            error!("Failed to save recovered state: {}", e);
        }

        let source: Arc<dyn SnapshotSource> = Arc::new(StateSnapshots {
            state: Arc::clone(&inner.state),
        });
        let writer = DebouncedWriter::spawn(
            Arc::clone(&inner.persistence),
            source,
            inner.config.persistence.debounce(),
        )?;
        *inner.writer.lock().unwrap_or_else(|e| e.into_inner()) = Some(writer);

        if !inner.manual_ticks {
            let weak = Arc::downgrade(&self.inner);
            let ticker = Ticker::spawn(inner.config.tracking.tick_interval(), move || match weak.upgrade() {
                Some(inner) => {
                    inner.run_tick();
                    true
                }
                None => false,
            })?;
            *inner.ticker.lock().unwrap_or_else(|e| e.into_inner()) = Some(ticker);
        }

        info!(
            "Tracker initialized from {:?}: {} sessions dropped, {} checkpoint entries recovered, {} discarded",
            report.load_source,
            report.sessions_dropped,
            report.checkpoint_recovered,
            report.checkpoint_discarded
        );
        Ok(report)
    }

    /// Record activity on `project_id`.
    pub fn heartbeat(&self, project_id: &str, source: Option<&str>) -> HeartbeatOutcome {
        let now = self.inner.clock.now();
        let outcome = self.inner.state().heartbeat(project_id, source, now);
        if outcome == HeartbeatOutcome::Started {
            self.inner.schedule_save();
        }
        outcome
    }

    /// Close `project_id`'s open session now. Returns false if none was open.
    pub fn stop_project(&self, project_id: &str) -> bool {
        let now = self.inner.clock.now();
        let stopped = self.inner.state().stop_project(project_id, now);
        self.inner.schedule_save();
        stopped
    }

    /// Run one tick immediately
    pub fn tick(&self) -> TickReport {
        self.inner.run_tick()
    }

    pub fn project_times(&self, project_id: &str) -> PeriodTimes {
        let now = self.inner.clock.now();
        self.inner.state().project_times(project_id, now)
    }

    pub fn global_times(&self) -> PeriodTimes {
        let now = self.inner.clock.now();
        self.inner.state().global_times(now)
    }

    /// Write the current state now and wait for it.
    pub fn flush(&self) -> Result<()> {
        let writer = self.inner.writer.lock().unwrap_or_else(|e| e.into_inner());
        match writer.as_ref() {
            Some(writer) => writer.flush(),
            None => self.inner.save_now(),
        }
    }

    /// Finalize everything, stop the background threads and save.
    pub fn shutdown(&self) -> Result<()> {
        let now = self.inner.clock.now();
        self.inner.state().finalize_all(now);

        let ticker = self.inner.ticker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut ticker) = ticker {
            ticker.stop();
        }
        let writer = self.inner.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut writer) = writer {
            writer.stop();
        }

        let result = self.inner.save_now();
        match &result {
            Ok(()) => info!("Tracker shut down cleanly"),
            Err(e) => error!("Final save failed: {}", e),
        }
        result
    }

    /// Read-only access to the runtime state
    pub fn with_state<R>(&self, f: impl FnOnce(&TrackerState) -> R) -> R {
        f(&self.inner.state())
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn persistence(&self) -> &PersistenceManager {
        &self.inner.persistence
    }
}
