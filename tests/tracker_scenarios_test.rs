//! End-to-end accounting scenarios driven through `TimeTracker` with a manual clock.


use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use std::sync::Arc;
use tempfile::TempDir;
use timekeeper::{
    AnyProject, Clock, Config, HeartbeatOutcome, ManualClock, MemoryArchive, PersistenceManager,
    TimeTracker,
};

const SEC: i64 = 1_000;
const MIN: i64 = 60 * SEC;

fn local(month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Local
        .with_ymd_and_hms(2025, month, day, hour, minute, 0)
        .unwrap()
        .with_timezone(&Utc)
}

struct Harness {
    _dir: TempDir,
    tracker: TimeTracker,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn start_at(now: DateTime<Utc>) -> Self {
        let _guard = test_support::init();
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(now));
        let tracker = TimeTracker::builder(Config::default())
            .clock(clock.clone())
            .persistence(PersistenceManager::new(dir.path().join("activity.json")))
            .archive(Arc::new(MemoryArchive::new()))
            .manual_ticks(true)
            .build()
            .unwrap();
        tracker.initialize(&AnyProject).unwrap();
        Harness {
            _dir: dir,
            tracker,
            clock,
        }
    }

    fn at(&self, instant: DateTime<Utc>) {
        self.clock.set(instant);
    }

    fn advance_ms(&self, ms: i64) {
        self.clock.advance(Duration::milliseconds(ms));
    }

    fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[test]
fn test_heartbeat_throttle_window() {
    let h = Harness::start_at(local(6, 10, 9, 0));

    assert_eq!(h.tracker.heartbeat("P1", Some("terminal")), HeartbeatOutcome::Started);
    h.advance_ms(200);
    assert_eq!(h.tracker.heartbeat("P1", None), HeartbeatOutcome::Throttled);
    h.tracker.with_state(|s| {
        assert_eq!(s.active_session("P1").unwrap().last_heartbeat, local(6, 10, 9, 0));
    });

    h.advance_ms(1_000);
    assert_eq!(h.tracker.heartbeat("P1", None), HeartbeatOutcome::Extended);
    h.tracker.with_state(|s| {
        assert_eq!(
            s.active_session("P1").unwrap().last_heartbeat,
            local(6, 10, 9, 0) + Duration::milliseconds(1_200)
        );
    });
    h.tracker.shutdown().unwrap();
}

#[test]
fn test_global_time_counts_overlap_once() {
    let h = Harness::start_at(local(6, 10, 9, 0));

    h.tracker.heartbeat("P1", None);
    h.advance_ms(10 * SEC);
    h.tracker.heartbeat("P2", None);
    h.advance_ms(10 * SEC);
    h.tracker.stop_project("P1");
    h.advance_ms(10 * SEC);
    h.tracker.stop_project("P2");

    assert_eq!(h.tracker.project_times("P1").total, 20_000);
    assert_eq!(h.tracker.project_times("P2").total, 20_000);
    assert_eq!(h.tracker.global_times().total, 30_000);
    h.tracker.shutdown().unwrap();
}

#[test]
fn test_idle_eviction_credits_only_observed_time() {
    let start = local(6, 10, 9, 0);
    let h = Harness::start_at(start);

    h.tracker.heartbeat("P1", None);

    let mut t = 5_000;
    while t <= 905_000 {
        if t == 305_000 {
            h.at(start + Duration::milliseconds(300_000));
            h.tracker.heartbeat("P1", None);
        }
        h.at(start + Duration::milliseconds(t));
        h.tracker.tick();
        t += 60_000;
    }

    h.tracker.with_state(|s| {
        assert!(s.active_session("P1").is_none());
        let sessions = s.store().project_sessions("P1");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].start_time, start);
        assert_eq!(sessions[0].end_time, start + Duration::milliseconds(300_000));
        assert_eq!(sessions[0].duration, 300_000);
    });
    h.tracker.shutdown().unwrap();
}

#[test]
fn test_sleep_is_not_double_counted() {
    let start = local(6, 10, 9, 0);
    let h = Harness::start_at(start);

    h.tracker.heartbeat("P1", None);
    for minute in 1..=5 {
        h.at(start + Duration::minutes(minute));
        h.tracker.heartbeat("P1", None);
        h.tracker.tick();
    }

    // Suspended for three hours
    let wake = start + Duration::minutes(5) + Duration::hours(3);
    h.at(wake);
    let report = h.tracker.tick();
    assert!(report.slept.is_some());

    h.at(wake + Duration::minutes(2));
    h.tracker.heartbeat("P1", None);
    h.tracker.stop_project("P1");

    let times = h.tracker.project_times("P1");
    assert_eq!(times.total, (7 * MIN) as u64);
    assert_eq!(h.tracker.global_times().total, (7 * MIN) as u64);
    h.tracker.shutdown().unwrap();
}

#[test]
fn test_close_sessions_merge() {
    let start = local(6, 10, 9, 0);
    let h = Harness::start_at(start);

    h.tracker.heartbeat("P1", None);
    h.at(start + Duration::minutes(10));
    h.tracker.stop_project("P1");

    h.at(start + Duration::minutes(11));
    h.tracker.heartbeat("P1", None);
    h.at(start + Duration::minutes(15));
    h.tracker.stop_project("P1");

    h.tracker.with_state(|s| {
        let sessions = s.store().project_sessions("P1");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].duration, 14 * MIN);
        assert_eq!(sessions[0].end_time, start + Duration::minutes(15));
    });
    h.tracker.shutdown().unwrap();
}

#[test]
fn test_midnight_split_preserves_total() {
    let start = local(6, 10, 23, 55);
    let h = Harness::start_at(start);

    h.tracker.heartbeat("P1", None);
    for minute in 1..=15 {
        h.at(start + Duration::minutes(minute));
        h.tracker.tick();
        if minute < 15 {
            h.tracker.heartbeat("P1", None);
        }
    }
    h.tracker.stop_project("P1");

    h.tracker.with_state(|s| {
        let sessions = s.store().project_sessions("P1");
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].duration, 5 * MIN);
        assert_eq!(sessions[1].duration, 10 * MIN);
        assert_eq!(sessions[0].end_time, local(6, 11, 0, 0));
        assert_eq!(sessions[1].start_time, local(6, 11, 0, 0));
    });

    let times = h.tracker.project_times("P1");
    assert_eq!(times.total, (15 * MIN) as u64);
    assert_eq!(times.today, (10 * MIN) as u64);
    h.tracker.shutdown().unwrap();
}

#[test]
fn test_checkpoint_flushes_do_not_inflate_sessions() {
    let start = local(6, 10, 9, 0);
    let h = Harness::start_at(start);

    for i in 0..60 {
        h.at(start + Duration::minutes(i));
        h.tracker.heartbeat("P1", None);
        h.tracker.tick();
        h.at(start + Duration::minutes(i) + Duration::seconds(50));
        h.tracker.stop_project("P1");
        if i % 10 == 0 {
            h.tracker.flush().unwrap();
        }
    }
    h.tracker.shutdown().unwrap();

    let loaded = h.tracker.persistence().load();
    assert_eq!(loaded.data.projects["P1"].sessions.len(), 1);
    assert_eq!(loaded.data.global.sessions.len(), 1);
    assert_eq!(h.tracker.project_times("P1").total, 60 * 50_000);
}

#[test]
fn test_accounting_never_exceeds_wall_clock() {
    let start = local(6, 10, 22, 0);
    let h = Harness::start_at(start);

    let projects = ["P1", "P2", "P3"];
    for step in 0..400i64 {
        h.advance_ms((step * 7_919) % 97_000);
        let project = projects[(step % 3) as usize];
        match step % 5 {
            0 | 1 => {
                h.tracker.heartbeat(project, None);
            }
            2 => {
                h.tracker.stop_project(project);
            }
            _ => {
                h.tracker.tick();
            }
        }
    }

    let elapsed = (h.clock_now() - start).num_milliseconds() as u64;
    let global = h.tracker.global_times();
    assert!(global.total <= elapsed);
    for project in projects {
        assert!(h.tracker.project_times(project).total <= elapsed);
    }
    h.tracker.shutdown().unwrap();
}
