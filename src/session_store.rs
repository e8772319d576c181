//! Persisted session lists and the merge-or-append algorithm.
//!
//! Every finalized span of activity ends up here. The store keeps one ordered
//! list for the global "any project active" record and one per project. Lists
//! stay sorted by start time and non-overlapping; frequent checkpoint flushes
//! of the same continuous activity collapse into a single session instead of
//! growing the list.

use crate::common::{end_date, local_date, next_midnight, year_month};
use crate::models::{Checkpoint, DataFile, RawDataFile, Scope, Session, SessionList, DATA_VERSION};
use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use std::collections::BTreeMap;

/// Sessions longer than this are rejected on load. A calendar day lasts
/// 25 hours when clocks fall back.
const MAX_SESSION_MS: i64 = 25 * 60 * 60 * 1000;

/// Sessions of one calendar month, as handed to the archive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonthBatch {
    pub global: Vec<Session>,
    pub projects: BTreeMap<String, Vec<Session>>,
}

impl MonthBatch {
    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.projects.values().all(|s| s.is_empty())
    }

    pub fn session_count(&self) -> usize {
        self.global.len() + self.projects.values().map(|s| s.len()).sum::<usize>()
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    global: Vec<Session>,
    projects: BTreeMap<String, Vec<Session>>,
    merge_gap: Duration,
}

impl SessionStore {
    pub fn new(merge_gap: Duration) -> Self {
        SessionStore {
            global: Vec::new(),
            projects: BTreeMap::new(),
            merge_gap,
        }
    }

    /// Build a store from a freshly read document, dropping invalid sessions.
    ///
    /// Returns the store and the number of sessions that were discarded.
    pub fn from_raw(raw: &RawDataFile, merge_gap: Duration) -> (Self, usize) {
        let mut store = SessionStore::new(merge_gap);
        let mut dropped = 0;

        let (global, bad) = sanitize_list(Scope::Global, &raw.global.sessions, merge_gap);
        store.global = global;
        dropped += bad;

        for (project_id, list) in &raw.projects {
            let (sessions, bad) = sanitize_list(Scope::Project(project_id), &list.sessions, merge_gap);
            dropped += bad;
            store.projects.insert(project_id.clone(), sessions);
        }

        if dropped > 0 {
            warn!("Dropped {} invalid sessions while loading activity data", dropped);
        }

        (store, dropped)
    }

    /// Merge-or-append a single span into the list for `scope`.
    ///
    /// - `0 <= gap < merge_gap` on the same calendar day: the last session is
    ///   extended and `duration` is added to it.
    /// - `gap < 0`: the spans overlap; the end becomes the later of the two
    ///   and the duration is recomputed from the wall-clock bounds, capped at
    ///   the sum of both durations.
    /// - otherwise a new session is appended.
    pub fn add_session(
        &mut self,
        scope: Scope<'_>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        duration: i64,
        source: Option<String>,
    ) {
        if end_time <= start_time || duration <= 0 {
            debug!("Ignoring empty span {} .. {} for {:?}", start_time, end_time, scope);
            return;
        }

        let merge_gap = self.merge_gap;
        let list = self.list_mut(scope);

        match list.last_mut() {
            Some(last) if start_time >= last.start_time => {
                if try_merge(last, start_time, end_time, duration, merge_gap) {
                    return;
                }
                list.push(new_session(scope, start_time, end_time, duration, source));
            }
            Some(_) => {
                // Arrived out of order: insert in place and re-coalesce
                let at = list.partition_point(|s| s.start_time <= start_time);
                list.insert(at, new_session(scope, start_time, end_time, duration, source));
                coalesce(list, merge_gap);
            }
            None => list.push(new_session(scope, start_time, end_time, duration, source)),
        }
    }

    /// Record `[start, end)` for `scope`, split at every local midnight it spans.
    ///
    /// Returns the milliseconds handed to the store.
    pub fn record_span(
        &mut self,
        scope: Scope<'_>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        source: Option<&str>,
    ) -> i64 {
        let mut recorded = 0;
        let mut piece_start = start;
        while piece_start < end {
            let piece_end = next_midnight(piece_start).min(end);
            let duration = (piece_end - piece_start).num_milliseconds();
            self.add_session(scope, piece_start, piece_end, duration, source.map(str::to_string));
            recorded += duration;
            piece_start = piece_end;
        }
        recorded
    }

    pub fn global_sessions(&self) -> &[Session] {
        &self.global
    }

    pub fn project_sessions(&self, project_id: &str) -> &[Session] {
        self.projects.get(project_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn project_ids(&self) -> impl Iterator<Item = &str> {
        self.projects.keys().map(String::as_str)
    }

    pub fn session_count(&self) -> usize {
        self.global.len() + self.projects.values().map(Vec::len).sum::<usize>()
    }

    /// Remove every session that starts before `cutoff`, grouped by local (year, month).
    pub fn drain_before(&mut self, cutoff: DateTime<Utc>) -> BTreeMap<(i32, u32), MonthBatch> {
        let mut batches: BTreeMap<(i32, u32), MonthBatch> = BTreeMap::new();

        let split = self.global.partition_point(|s| s.start_time < cutoff);
        for session in self.global.drain(..split) {
            batches.entry(year_month(session.start_time)).or_default().global.push(session);
        }

        for (project_id, list) in self.projects.iter_mut() {
            let split = list.partition_point(|s| s.start_time < cutoff);
            for session in list.drain(..split) {
                batches
                    .entry(year_month(session.start_time))
                    .or_default()
                    .projects
                    .entry(project_id.clone())
                    .or_default()
                    .push(session);
            }
        }
        self.projects.retain(|_, list| !list.is_empty());

        batches.retain(|_, batch| !batch.is_empty());
        batches
    }

    /// Put a batch back after the archive refused it.
    pub fn restore(&mut self, batch: MonthBatch) {
        let merge_gap = self.merge_gap;
        self.global.extend(batch.global);
        self.global.sort_by_key(|s| s.start_time);
        coalesce(&mut self.global, merge_gap);

        for (project_id, sessions) in batch.projects {
            let list = self.projects.entry(project_id).or_default();
            list.extend(sessions);
            list.sort_by_key(|s| s.start_time);
            coalesce(list, merge_gap);
        }
    }

    /// Serialize the store into the on-disk document.
    pub fn to_data_file(&self, month: &str, checkpoint: Option<Checkpoint>) -> DataFile {
        DataFile {
            version: DATA_VERSION.to_string(),
            month: month.to_string(),
            global: SessionList {
                sessions: self.global.clone(),
            },
            projects: self
                .projects
                .iter()
                .map(|(id, sessions)| {
                    (
                        id.clone(),
                        SessionList {
                            sessions: sessions.clone(),
                        },
                    )
                })
                .collect(),
            checkpoint: checkpoint.filter(|c| !c.is_empty()),
        }
    }

    fn list_mut(&mut self, scope: Scope<'_>) -> &mut Vec<Session> {
        match scope {
            Scope::Global => &mut self.global,
            Scope::Project(id) => self.projects.entry(id.to_string()).or_default(),
        }
    }
}

fn new_session(
    scope: Scope<'_>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    duration: i64,
    source: Option<String>,
) -> Session {
    let mut session = Session::new(scope, start_time, end_time, source);
    session.duration = duration;
    session
}

/// Apply the merge rules of `add_session` to `last`; false means "append instead".
fn try_merge(
    last: &mut Session,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    duration: i64,
    merge_gap: Duration,
) -> bool {
    let gap = start_time - last.end_time;

    if gap < Duration::zero() {
        let start = last.start_time.min(start_time);
        let end = last.end_time.max(end_time);
        last.start_time = start;
        last.end_time = end;
        // Bounds of a gap-merged session include unobserved time
        last.duration = (end - start).num_milliseconds().min(last.duration + duration);
        return true;
    }

    if gap < merge_gap && end_date(last.end_time) == local_date(start_time) {
        last.end_time = end_time;
        last.duration += duration;
        return true;
    }

    false
}

/// Merge neighbours of a sorted list in place.
fn coalesce(list: &mut Vec<Session>, merge_gap: Duration) {
    let mut merged: Vec<Session> = Vec::with_capacity(list.len());
    for session in list.drain(..) {
        if let Some(last) = merged.last_mut() {
            if try_merge(last, session.start_time, session.end_time, session.duration, merge_gap) {
                continue;
            }
        }
        merged.push(session);
    }
    *list = merged;
}

fn sanitize_list(
    scope: Scope<'_>,
    raw: &[serde_json::Value],
    merge_gap: Duration,
) -> (Vec<Session>, usize) {
    let mut sessions = Vec::with_capacity(raw.len());
    let mut dropped = 0;

    for value in raw {
        let mut session: Session = match serde_json::from_value(value.clone()) {
            Ok(s) => s,
            Err(e) => {
                debug!("Dropping unreadable session in {:?}: {}", scope, e);
                dropped += 1;
                continue;
            }
        };

        if session.duration <= 0
            || session.duration > MAX_SESSION_MS
            || session.end_time < session.start_time
        {
            debug!(
                "Dropping invalid session {} in {:?} (duration {}ms)",
                session.id, scope, session.duration
            );
            dropped += 1;
            continue;
        }

        if session.duration > session.span_ms() {
            debug!("Clamping session {} duration to its span", session.id);
            session.duration = session.span_ms();
        }
        if session.id.is_empty() {
            session.id = crate::models::session_id(scope, session.start_time);
        }
        sessions.push(session);
    }

    sessions.sort_by_key(|s| s.start_time);
    coalesce(&mut sessions, merge_gap);
    (sessions, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};
    use serde_json::json;

    fn t(ms: i64) -> DateTime<Utc> {
        // Mid-morning local time so test spans never touch midnight
        Local
            .with_ymd_and_hms(2025, 6, 10, 9, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
            + Duration::milliseconds(ms)
    }

    fn store() -> SessionStore {
        SessionStore::new(Duration::minutes(5))
    }

    const MIN: i64 = 60_000;

    #[test]
    fn test_merge_within_gap() {
        let mut store = store();
        store.add_session(Scope::Project("P1"), t(0), t(10 * MIN), 10 * MIN, None);
        store.add_session(Scope::Project("P1"), t(11 * MIN), t(15 * MIN), 4 * MIN, None);

        let sessions = store.project_sessions("P1");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].duration, 14 * MIN);
        assert_eq!(sessions[0].end_time, t(15 * MIN));
        assert_eq!(sessions[0].start_time, t(0));
    }

    #[test]
    fn test_append_beyond_gap() {
        let mut store = store();
        store.add_session(Scope::Global, t(0), t(MIN), MIN, None);
        store.add_session(Scope::Global, t(6 * MIN), t(7 * MIN), MIN, None);
        assert_eq!(store.global_sessions().len(), 2);
    }

    #[test]
    fn test_gap_equal_to_merge_gap_appends() {
        let mut store = store();
        store.add_session(Scope::Global, t(0), t(MIN), MIN, None);
        store.add_session(Scope::Global, t(6 * MIN), t(7 * MIN), MIN, None);
        store.add_session(Scope::Global, t(12 * MIN), t(13 * MIN), MIN, None);
        assert_eq!(store.global_sessions().len(), 3);
    }

    #[test]
    fn test_overlap_recomputes_from_bounds() {
        let mut store = store();
        store.add_session(Scope::Global, t(0), t(10 * MIN), 10 * MIN, None);
        // Overlaps the last five minutes and runs two minutes further
        store.add_session(Scope::Global, t(5 * MIN), t(12 * MIN), 7 * MIN, None);

        let sessions = store.global_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].end_time, t(12 * MIN));
        // Not 17 minutes: the overlapped five minutes count once
        assert_eq!(sessions[0].duration, 12 * MIN);
    }

    #[test]
    fn test_contained_overlap_changes_nothing() {
        let mut store = store();
        store.add_session(Scope::Global, t(0), t(10 * MIN), 10 * MIN, None);
        store.add_session(Scope::Global, t(2 * MIN), t(3 * MIN), MIN, None);

        let sessions = store.global_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].duration, 10 * MIN);
        assert_eq!(sessions[0].end_time, t(10 * MIN));
    }

    #[test]
    fn test_overlap_does_not_credit_merged_gap() {
        let mut store = store();
        store.add_session(Scope::Global, t(0), t(1_000), 1_000, None);
        store.add_session(Scope::Global, t(4 * MIN), t(4 * MIN + 1_000), 1_000, None);
        // Lands inside the unobserved gap of the merged session
        store.add_session(Scope::Global, t(2 * MIN), t(2 * MIN + 1_000), 1_000, None);

        let sessions = store.global_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].duration, 3_000);
    }

    #[test]
    fn test_out_of_order_span_is_inserted_and_coalesced() {
        let mut store = store();
        store.add_session(Scope::Global, t(30 * MIN), t(40 * MIN), 10 * MIN, None);
        store.add_session(Scope::Global, t(0), t(5 * MIN), 5 * MIN, None);
        store.add_session(Scope::Global, t(20 * MIN), t(31 * MIN), 11 * MIN, None);

        let sessions = store.global_sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].start_time, t(0));
        assert_eq!(sessions[1].start_time, t(20 * MIN));
        assert_eq!(sessions[1].end_time, t(40 * MIN));
        assert_eq!(sessions[1].duration, 20 * MIN);
    }

    #[test]
    fn test_frequent_flushes_do_not_grow_list() {
        let mut store = store();
        for i in 0..120 {
            let start = t(i * MIN);
            store.add_session(Scope::Project("P1"), start, start + Duration::seconds(50), 50_000, None);
        }
        assert_eq!(store.project_sessions("P1").len(), 1);
        assert_eq!(store.project_sessions("P1")[0].duration, 120 * 50_000);
    }

    #[test]
    fn test_record_span_splits_at_midnight() {
        let start = Local.with_ymd_and_hms(2025, 6, 10, 23, 55, 0).unwrap().with_timezone(&Utc);
        let end = Local.with_ymd_and_hms(2025, 6, 11, 0, 10, 0).unwrap().with_timezone(&Utc);

        let mut store = store();
        let recorded = store.record_span(Scope::Project("P1"), start, end, Some("terminal"));
        assert_eq!(recorded, 15 * MIN);

        let sessions = store.project_sessions("P1");
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].duration, 5 * MIN);
        assert_eq!(sessions[1].duration, 10 * MIN);
        assert_eq!(sessions[0].source.as_deref(), Some("terminal"));
    }

    #[test]
    fn test_no_merge_across_midnight() {
        let before = Local.with_ymd_and_hms(2025, 6, 10, 23, 58, 0).unwrap().with_timezone(&Utc);
        let after = Local.with_ymd_and_hms(2025, 6, 11, 0, 1, 0).unwrap().with_timezone(&Utc);

        let mut store = store();
        store.add_session(Scope::Global, before, before + Duration::minutes(1), MIN, None);
        store.add_session(Scope::Global, after, after + Duration::minutes(1), MIN, None);
        assert_eq!(store.global_sessions().len(), 2);
    }

    #[test]
    fn test_sanitize_drops_invalid_sessions() {
        let good = Session::new(Scope::Project("P1"), t(0), t(MIN), None);
        let raw: RawDataFile = serde_json::from_value(json!({
            "version": "2",
            "month": "2025-06",
            "global": { "sessions": [
                { "id": "a", "startTime": "not a date", "endTime": "2025-06-10T09:00:00Z", "duration": 5 },
                { "id": "b", "endTime": "2025-06-10T09:00:00Z", "duration": 5 }
            ]},
            "projects": {
                "P1": { "sessions": [
                    serde_json::to_value(&good).unwrap(),
                    { "id": "zero", "startTime": "2025-06-10T09:00:00Z", "endTime": "2025-06-10T09:00:00Z", "duration": 0 },
                    { "id": "huge", "startTime": "2025-06-08T09:00:00Z", "endTime": "2025-06-10T09:00:00Z", "duration": 172800000 },
                    { "id": "backwards", "startTime": "2025-06-10T10:00:00Z", "endTime": "2025-06-10T09:00:00Z", "duration": 1000 }
                ]}
            }
        }))
        .unwrap();

        let (store, dropped) = SessionStore::from_raw(&raw, Duration::minutes(5));
        assert_eq!(dropped, 5);
        assert!(store.global_sessions().is_empty());
        assert_eq!(store.project_sessions("P1"), &[good]);
    }

    #[test]
    fn test_sanitize_keeps_fall_back_day() {
        let raw: RawDataFile = serde_json::from_value(json!({
            "version": "2",
            "month": "2025-10",
            "global": { "sessions": [] },
            "projects": {
                "P1": { "sessions": [
                    { "id": "long-day", "startTime": "2025-10-25T22:00:00Z", "endTime": "2025-10-26T23:00:00Z", "duration": 90000000 },
                    { "id": "too-long", "startTime": "2025-10-28T00:00:00Z", "endTime": "2025-10-29T01:00:00.001Z", "duration": 90000001 }
                ]}
            }
        }))
        .unwrap();

        let (store, dropped) = SessionStore::from_raw(&raw, Duration::minutes(5));
        assert_eq!(dropped, 1);
        let kept = store.project_sessions("P1");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "long-day");
        assert_eq!(kept[0].duration, 25 * 60 * MIN);
    }

    #[test]
    fn test_drain_before_groups_by_month() {
        let may = Local.with_ymd_and_hms(2025, 5, 20, 10, 0, 0).unwrap().with_timezone(&Utc);
        let april = Local.with_ymd_and_hms(2025, 4, 2, 10, 0, 0).unwrap().with_timezone(&Utc);
        let june_start = Local.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap().with_timezone(&Utc);

        let mut store = store();
        store.record_span(Scope::Global, april, april + Duration::minutes(30), None);
        store.record_span(Scope::Global, may, may + Duration::minutes(30), None);
        store.record_span(Scope::Project("P1"), may, may + Duration::minutes(30), None);
        store.record_span(Scope::Project("P1"), t(0), t(MIN), None);

        let batches = store.drain_before(june_start);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[&(2025, 4)].global.len(), 1);
        assert!(batches[&(2025, 4)].projects.is_empty());
        assert_eq!(batches[&(2025, 5)].session_count(), 2);

        assert!(store.global_sessions().is_empty());
        assert_eq!(store.project_sessions("P1").len(), 1);

        let may_batch = batches[&(2025, 5)].clone();
        store.restore(may_batch);
        assert_eq!(store.global_sessions().len(), 1);
        assert_eq!(store.project_sessions("P1").len(), 2);
        assert_eq!(store.project_sessions("P1")[0].start_time, may);
    }
}
