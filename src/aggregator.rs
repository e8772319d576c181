//! Read path: period totals computed from session intervals on every call.
//!
//! Nothing here is cached. Totals are always the sum of each persisted
//! session's overlap with the period window, plus the overlap of whatever
//! session is still open in memory.

use crate::common::{day_start, month_start, week_start};
use crate::models::{PeriodTimes, Session};
use chrono::{DateTime, Utc, Weekday};

/// Start instants of the reporting windows that end at `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodWindows {
    pub now: DateTime<Utc>,
    pub today: DateTime<Utc>,
    pub week: DateTime<Utc>,
    pub month: DateTime<Utc>,
}

impl PeriodWindows {
    pub fn at(now: DateTime<Utc>, first_weekday: Weekday) -> Self {
        PeriodWindows {
            now,
            today: day_start(now),
            week: week_start(now, first_weekday),
            month: month_start(now),
        }
    }
}

/// Milliseconds of `[start, end)` that fall inside `[window_start, window_end)`.
fn overlap_ms(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> i64 {
    let from = start.max(window_start);
    let to = end.min(window_end);
    if to > from {
        (to - from).num_milliseconds()
    } else {
        0
    }
}

fn to_u64(ms: i64) -> u64 {
    u64::try_from(ms).unwrap_or(0)
}

/// Add one interval's share of each window to the totals.
///
/// `credited` caps each share; for merged sessions it is the recorded
/// duration, which may be less than the wall-clock span.
fn add_windows(
    times: &mut PeriodTimes,
    windows: &PeriodWindows,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    credited: i64,
) {
    let end = end.min(windows.now);
    let share = |from| to_u64(overlap_ms(start, end, from, windows.now).min(credited));

    times.today += share(windows.today);
    times.week += share(windows.week);
    times.month += share(windows.month);
}

/// Totals for a list of persisted sessions plus an optional still-open start.
pub fn period_times(
    sessions: &[Session],
    open_since: Option<DateTime<Utc>>,
    windows: &PeriodWindows,
) -> PeriodTimes {
    let mut times = PeriodTimes::default();

    for session in sessions {
        add_windows(&mut times, windows, session.start_time, session.end_time, session.duration);
        times.total += to_u64(session.duration);
    }

    if let Some(started_at) = open_since {
        let open = (windows.now - started_at).num_milliseconds();
        if open > 0 {
            add_windows(&mut times, windows, started_at, windows.now, open);
            times.total += to_u64(open);
        }
    }

    times
}
