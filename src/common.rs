//! Common utilities shared across modules.
//!
//! Data directory lookup plus the calendar arithmetic the ticker, the session
//! store and the aggregator all need. Instants are kept in UTC; calendar
//! boundaries (days, weeks, months) are computed in the local timezone.

use chrono::{DateTime, Datelike, Duration, Local, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use std::path::PathBuf;

/// Gets the application data directory using XDG Base Directory specification.
///
/// Returns `~/.local/share/timekeeper/` on Unix-like systems.
///
/// # Example
///
/// ```rust,no_run
/// use timekeeper::common::get_data_dir;
///
/// let data_dir = get_data_dir();
/// let data_file = data_dir.join("activity.json");
/// ```
pub fn get_data_dir() -> PathBuf {
    let base_dir = dirs::data_dir().unwrap_or_else(|| {
        // Fallback if dirs crate fails
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".local").join("share")
    });

    base_dir.join("timekeeper")
}

/// Local calendar date of an instant.
pub fn local_date(instant: DateTime<Utc>) -> NaiveDate {
    instant.with_timezone(&Local).date_naive()
}

/// Calendar date a half-open span ending at `end` belongs to.
///
/// A span ending exactly at midnight belongs to the day before.
pub fn end_date(end: DateTime<Utc>) -> NaiveDate {
    local_date(end - Duration::milliseconds(1))
}

/// First instant of a local calendar date.
pub fn local_midnight(date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        // Midnight skipped by a DST jump; the day starts at the first valid hour
        LocalResult::None => Local
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive)),
    }
}

/// Start of the local day containing `instant`.
pub fn day_start(instant: DateTime<Utc>) -> DateTime<Utc> {
    local_midnight(local_date(instant))
}

/// First local midnight strictly after `instant`.
pub fn next_midnight(instant: DateTime<Utc>) -> DateTime<Utc> {
    let date = local_date(instant);
    match date.succ_opt() {
        Some(next) => local_midnight(next),
        None => DateTime::<Utc>::MAX_UTC,
    }
}

/// Start of the local week containing `instant`.
pub fn week_start(instant: DateTime<Utc>, first_day: Weekday) -> DateTime<Utc> {
    let date = local_date(instant);
    let offset = (date.weekday().num_days_from_monday() + 7 - first_day.num_days_from_monday()) % 7;
    local_midnight(date - Duration::days(offset as i64))
}

/// Start of the local month containing `instant`.
pub fn month_start(instant: DateTime<Utc>) -> DateTime<Utc> {
    let date = local_date(instant);
    let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date);
    local_midnight(first)
}

/// Local (year, month) of an instant.
pub fn year_month(instant: DateTime<Utc>) -> (i32, u32) {
    let date = local_date(instant);
    (date.year(), date.month())
}

/// Month key in YYYY-MM format.
///
/// # Example
///
/// ```rust
/// use chrono::Utc;
/// use timekeeper::common::month_key;
///
/// let key = month_key(Utc::now());
/// assert_eq!(key.len(), 7); // YYYY-MM
/// ```
pub fn month_key(instant: DateTime<Utc>) -> String {
    instant.with_timezone(&Local).format("%Y-%m").to_string()
}
