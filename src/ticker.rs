//! The periodic state machine and the thread that drives it.
//!
//! Each tick runs, in order: sleep/wake detection, per-project idle eviction,
//! global idle eviction, midnight splitting with month rollover, and finally
//! decides whether a checkpoint save is due. The ticker is the only place a
//! session is finalized without a caller asking for it.

use crate::archive::ArchiveGateway;
use crate::common::{day_start, local_date, month_key, month_start};
use crate::models::{GlobalActiveSession, Scope};
use crate::state::TrackerState;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Length of a detected suspension
    pub slept: Option<Duration>,
    /// Projects closed for inactivity
    pub idle_finalized: Vec<String>,
    pub global_finalized: bool,
    /// The local day changed since the previous tick
    pub day_changed: bool,
    /// Months handed to the archive
    pub archived: Vec<(i32, u32)>,
    pub archive_failed: bool,
    /// Open sessions or unsaved changes; a save should be scheduled
    pub needs_save: bool,
}

impl TrackerState {
    pub fn tick(&mut self, now: DateTime<Utc>, archive: &dyn ArchiveGateway) -> TickReport {
        let mut report = TickReport::default();

        let elapsed = now - self.last_tick;
        if elapsed > self.tracking.sleep_gap() {
            let sleep_start = now - elapsed;
            info!(
                "Detected {}s without a tick, treating it as system sleep",
                elapsed.num_seconds()
            );
            self.handle_sleep(sleep_start, now);
            report.slept = Some(elapsed);
        }

        let idle_timeout = self.tracking.idle_timeout();
        let idle: Vec<(String, DateTime<Utc>)> = self
            .active
            .iter()
            .filter(|(_, s)| now - s.last_heartbeat > idle_timeout)
            .map(|(id, s)| (id.clone(), s.last_heartbeat))
            .collect();
        for (project_id, last_heartbeat) in idle {
            debug!("Project {} idle since {}", project_id, last_heartbeat);
            self.finalize_project(&project_id, last_heartbeat);
            report.idle_finalized.push(project_id);
        }

        if self.active.is_empty() {
            if let Some(global) = self.global {
                self.finalize_global(global.last_heartbeat);
                report.global_finalized = true;
            }
        }

        if local_date(now) != local_date(self.last_tick) {
            report.day_changed = true;
            self.split_at_midnight(day_start(now));
        }

        if self.month != month_key(now) {
            match self.archive_past_months(now, archive) {
                Ok(months) => report.archived = months,
                Err(months) => {
                    report.archived = months;
                    report.archive_failed = true;
                }
            }
        }

        report.needs_save = self.has_open_sessions() || self.dirty;
        self.last_tick = now;
        report
    }

    /// Close everything at `sleep_start` and reopen it at `now`.
    fn handle_sleep(&mut self, sleep_start: DateTime<Utc>, now: DateTime<Utc>) {
        let idle_timeout = self.tracking.idle_timeout();

        let ids: Vec<String> = self.active.keys().cloned().collect();
        for project_id in ids {
            let Some(session) = self.active.get(&project_id).cloned() else {
                continue;
            };
            if session.started_at > sleep_start {
                continue;
            }

            if sleep_start - session.last_heartbeat > idle_timeout {
                // Already idle before the machine went to sleep
                self.finalize_project(&project_id, session.last_heartbeat);
                continue;
            }

            self.finalize_span(
                Scope::Project(&project_id),
                session.started_at,
                sleep_start,
                session.source.as_deref(),
            );
            if let Some(open) = self.active.get_mut(&project_id) {
                open.started_at = now;
                open.last_heartbeat = now;
            }
            self.dirty = true;
        }

        let Some(global) = self.global else {
            return;
        };
        if global.started_at > sleep_start {
            return;
        }

        let end = if sleep_start - global.last_heartbeat > idle_timeout {
            global.last_heartbeat
        } else {
            sleep_start
        };
        self.finalize_global(end);

        let started_at = self.active.values().map(|s| s.started_at).min();
        let last_heartbeat = self.active.values().map(|s| s.last_heartbeat).max();
        if let (Some(started_at), Some(last_heartbeat)) = (started_at, last_heartbeat) {
            self.global = Some(GlobalActiveSession {
                started_at,
                last_heartbeat,
            });
        }
    }

    /// Persist the part of every open session before `midnight`.
    fn split_at_midnight(&mut self, midnight: DateTime<Utc>) {
        let ids: Vec<String> = self.active.keys().cloned().collect();
        for project_id in ids {
            let Some(session) = self.active.get(&project_id).cloned() else {
                continue;
            };
            if session.started_at >= midnight {
                continue;
            }
            self.finalize_span(
                Scope::Project(&project_id),
                session.started_at,
                midnight,
                session.source.as_deref(),
            );
            if let Some(open) = self.active.get_mut(&project_id) {
                open.started_at = midnight;
            }
        }

        if let Some(global) = self.global {
            if global.started_at < midnight {
                self.finalize_span(Scope::Global, global.started_at, midnight, None);
                if let Some(open) = self.global.as_mut() {
                    open.started_at = midnight;
                }
            }
        }
        self.dirty = true;
    }

    /// Hand every session from a past month to the archive.
    ///
    /// The live month advances only when every batch was accepted; refused
    /// batches go back into the store and are retried on the next tick.
    /// Returns the archived months, as `Err` if any batch was refused.
    pub fn archive_past_months(
        &mut self,
        now: DateTime<Utc>,
        archive: &dyn ArchiveGateway,
    ) -> std::result::Result<Vec<(i32, u32)>, Vec<(i32, u32)>> {
        let current = month_key(now);
        if !archive.is_enabled() {
            self.month = current;
            self.dirty = true;
            return Ok(Vec::new());
        }

        let batches = self.store.drain_before(month_start(now));
        let mut archived = Vec::new();
        let mut failed = false;

        for ((year, month), batch) in batches {
            match archive.append_to_archive(year, month, &batch.global, &batch.projects) {
                Ok(()) => {
                    info!(
                        "Rolled {} sessions from {:04}-{:02} into the archive",
                        batch.session_count(),
                        year,
                        month
                    );
                    archived.push((year, month));
                }
                Err(e) => {
                    warn!("Archiving {:04}-{:02} failed, keeping it live: {}", year, month, e);
                    self.store.restore(batch);
                    failed = true;
                }
            }
        }

        self.dirty = true;
        if failed {
            Err(archived)
        } else {
            self.month = current;
            Ok(archived)
        }
    }
}

/// Background thread calling `on_tick` every interval until stopped.
pub struct Ticker {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// `on_tick` returning false ends the loop.
    pub fn spawn<F>(interval: std::time::Duration, mut on_tick: F) -> std::io::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("timekeeper-ticker".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if !on_tick() {
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Ticker {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the loop and wait for a running tick to finish.
    pub fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Ticker thread panicked");
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        // Disconnecting the channel ends the loop; joining is left to `stop`
        self.stop_tx.take();
    }
}
