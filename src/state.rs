//! Runtime state shared by the recorder, the ticker and the read path.
//!
//! One `TrackerState` owns the open sessions and the session store. The
//! tracker keeps it behind a single mutex so a heartbeat and a tick are
//! always strictly ordered. The state transitions themselves live in
//! `recorder`, `ticker` and `recovery` as further `impl` blocks.

use crate::aggregator::{period_times, PeriodWindows};
use crate::config::TrackingConfig;
use crate::models::{
    ActiveSession, Checkpoint, CheckpointEntry, DataFile, GlobalActiveSession, GlobalCheckpoint,
    PeriodTimes, Scope,
};
use crate::session_store::SessionStore;
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct TrackerState {
    pub(crate) active: BTreeMap<String, ActiveSession>,
    pub(crate) global: Option<GlobalActiveSession>,
    pub(crate) store: SessionStore,
    /// When the ticker last ran (or the state was created)
    pub(crate) last_tick: DateTime<Utc>,
    /// Month (YYYY-MM) the live store has been rolled up to
    pub(crate) month: String,
    /// Changes not yet handed to the writer
    pub(crate) dirty: bool,
    pub(crate) tracking: TrackingConfig,
}

impl TrackerState {
    pub fn new(
        store: SessionStore,
        tracking: TrackingConfig,
        month: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        TrackerState {
            active: BTreeMap::new(),
            global: None,
            store,
            last_tick: now,
            month: month.into(),
            dirty: false,
            tracking,
        }
    }

    pub fn empty(tracking: TrackingConfig, now: DateTime<Utc>) -> Self {
        let store = SessionStore::new(tracking.merge_gap());
        TrackerState::new(store, tracking, crate::common::month_key(now), now)
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn tracking(&self) -> &TrackingConfig {
        &self.tracking
    }

    pub fn month(&self) -> &str {
        &self.month
    }

    pub fn last_tick(&self) -> DateTime<Utc> {
        self.last_tick
    }

    pub fn active_session(&self, project_id: &str) -> Option<&ActiveSession> {
        self.active.get(project_id)
    }

    pub fn active_project_ids(&self) -> impl Iterator<Item = &str> {
        self.active.keys().map(String::as_str)
    }

    pub fn global_session(&self) -> Option<&GlobalActiveSession> {
        self.global.as_ref()
    }

    pub fn has_open_sessions(&self) -> bool {
        !self.active.is_empty() || self.global.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Persist `[start, end)` for `scope` unless it is shorter than the noise floor.
    ///
    /// Returns the milliseconds recorded.
    pub(crate) fn finalize_span(
        &mut self,
        scope: Scope<'_>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        source: Option<&str>,
    ) -> i64 {
        if end - start < self.tracking.min_session() {
            debug!("Discarding {:?} span of {}ms", scope, (end - start).num_milliseconds());
            return 0;
        }
        self.dirty = true;
        self.store.record_span(scope, start, end, source)
    }

    /// Close a project's open session at `end` and forget it.
    pub(crate) fn finalize_project(&mut self, project_id: &str, end: DateTime<Utc>) -> i64 {
        match self.active.remove(project_id) {
            Some(session) => {
                self.dirty = true;
                self.finalize_span(
                    Scope::Project(project_id),
                    session.started_at,
                    end,
                    session.source.as_deref(),
                )
            }
            None => 0,
        }
    }

    /// Close the global session at `end` and clear it.
    pub(crate) fn finalize_global(&mut self, end: DateTime<Utc>) -> i64 {
        match self.global.take() {
            Some(global) => {
                self.dirty = true;
                self.finalize_span(Scope::Global, global.started_at, end, None)
            }
            None => 0,
        }
    }

    /// Finalize every open session at `now`, as on shutdown.
    pub fn finalize_all(&mut self, now: DateTime<Utc>) {
        let ids: Vec<String> = self.active.keys().cloned().collect();
        for id in ids {
            self.finalize_project(&id, now);
        }
        self.finalize_global(now);
    }

    /// Start instants of the open sessions, or `None` when nothing is open.
    pub fn checkpoint(&self) -> Option<Checkpoint> {
        if !self.has_open_sessions() {
            return None;
        }
        Some(Checkpoint {
            global: self.global.map(|g| GlobalCheckpoint {
                started_at: g.started_at,
            }),
            projects: self
                .active
                .iter()
                .map(|(id, session)| {
                    (
                        id.clone(),
                        CheckpointEntry {
                            started_at: session.started_at,
                            source: session.source.clone(),
                        },
                    )
                })
                .collect(),
        })
    }

    /// Document to write; taking it clears the dirty flag.
    pub fn snapshot(&mut self) -> DataFile {
        self.dirty = false;
        self.store.to_data_file(&self.month, self.checkpoint())
    }

    pub fn project_times(&self, project_id: &str, now: DateTime<Utc>) -> PeriodTimes {
        let windows = PeriodWindows::at(now, self.tracking.week_start_day());
        period_times(
            self.store.project_sessions(project_id),
            self.active.get(project_id).map(|s| s.started_at),
            &windows,
        )
    }

    pub fn global_times(&self, now: DateTime<Utc>) -> PeriodTimes {
        let windows = PeriodWindows::at(now, self.tracking.week_start_day());
        period_times(
            self.store.global_sessions(),
            self.global.map(|g| g.started_at),
            &windows,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Local, TimeZone};

    fn t(ms: i64) -> DateTime<Utc> {
        Local
            .with_ymd_and_hms(2025, 6, 10, 9, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
            + Duration::milliseconds(ms)
    }

    #[test]
    fn test_short_spans_are_discarded() {
        let mut state = TrackerState::empty(TrackingConfig::default(), t(0));
        assert_eq!(state.finalize_span(Scope::Project("P1"), t(0), t(999), None), 0);
        assert!(state.store().project_sessions("P1").is_empty());
        assert!(!state.is_dirty());

        assert_eq!(state.finalize_span(Scope::Project("P1"), t(0), t(1000), None), 1000);
        assert!(state.is_dirty());
    }

    #[test]
    fn test_checkpoint_reflects_open_sessions() {
        let mut state = TrackerState::empty(TrackingConfig::default(), t(0));
        assert!(state.checkpoint().is_none());

        state
            .active
            .insert("P1".to_string(), ActiveSession::start(t(0), Some("terminal".into())));
        state.global = Some(GlobalActiveSession::start(t(0)));

        let checkpoint = state.checkpoint().unwrap();
        assert_eq!(checkpoint.global.unwrap().started_at, t(0));
        assert_eq!(checkpoint.projects["P1"].source.as_deref(), Some("terminal"));

        let document = state.snapshot();
        assert!(document.checkpoint.is_some());
        assert!(!state.is_dirty());
    }

    #[test]
    fn test_finalize_all_clears_runtime_state() {
        let mut state = TrackerState::empty(TrackingConfig::default(), t(0));
        state.active.insert("P1".to_string(), ActiveSession::start(t(0), None));
        state.global = Some(GlobalActiveSession::start(t(0)));

        state.finalize_all(t(30_000));
        assert!(!state.has_open_sessions());
        assert_eq!(state.project_times("P1", t(30_000)).total, 30_000);
        assert_eq!(state.global_times(t(30_000)).total, 30_000);
        assert!(state.snapshot().checkpoint.is_none());
    }
}
