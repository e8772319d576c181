//! Monthly archive of sessions rolled out of the live data file.
//!
//! When the month changes, every session that starts in a past month leaves
//! the live store through an [`ArchiveGateway`], one call per (year, month).
//! The SQLite implementation is idempotent: appending the same month twice
//! replaces rows instead of duplicating them.

use crate::common::get_data_dir;
use crate::config::{ArchiveConfig, Config};
use crate::error::{Result, TrackerError};
use crate::models::Session;
use crate::retry::{retry_if_retryable, RetryPolicy};
use crate::session_store::MonthBatch;
use chrono::{DateTime, Utc};
use log::{debug, info};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Receiver of sessions from months that have ended.
pub trait ArchiveGateway: Send + Sync {
    fn append_to_archive(
        &self,
        year: i32,
        month: u32,
        global: &[Session],
        projects: &BTreeMap<String, Vec<Session>>,
    ) -> Result<()>;

    /// False keeps every session in the live file
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Rollover disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoArchive;

impl ArchiveGateway for NoArchive {
    fn append_to_archive(
        &self,
        _year: i32,
        _month: u32,
        _global: &[Session],
        _projects: &BTreeMap<String, Vec<Session>>,
    ) -> Result<()> {
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// In-process archive, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    months: Mutex<BTreeMap<(i32, u32), MonthBatch>>,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryArchive {
    pub fn new() -> Self {
        MemoryArchive::default()
    }

    /// Make every following append fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of append attempts, failed ones included
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn months(&self) -> Vec<(i32, u32)> {
        self.lock().keys().copied().collect()
    }

    pub fn batch(&self, year: i32, month: u32) -> Option<MonthBatch> {
        self.lock().get(&(year, month)).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(i32, u32), MonthBatch>> {
        self.months.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ArchiveGateway for MemoryArchive {
    fn append_to_archive(
        &self,
        year: i32,
        month: u32,
        global: &[Session],
        projects: &BTreeMap<String, Vec<Session>>,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TrackerError::archive("archive unavailable"));
        }

        let mut months = self.lock();
        let batch = months.entry((year, month)).or_default();
        merge_by_id(&mut batch.global, global);
        for (project_id, sessions) in projects {
            merge_by_id(batch.projects.entry(project_id.clone()).or_default(), sessions);
        }
        Ok(())
    }
}

fn merge_by_id(target: &mut Vec<Session>, incoming: &[Session]) {
    for session in incoming {
        match target.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session.clone(),
            None => target.push(session.clone()),
        }
    }
    target.sort_by_key(|s| s.start_time);
}

pub const SCHEMA: &str = r#"
-- One row per archived (year, month)
CREATE TABLE IF NOT EXISTS archived_months (
    year INTEGER NOT NULL,
    month INTEGER NOT NULL,
    archived_at TEXT NOT NULL,
    session_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (year, month)
);

-- Sessions; project_id is '' for the global list
CREATE TABLE IF NOT EXISTS archived_sessions (
    scope TEXT NOT NULL,
    project_id TEXT NOT NULL DEFAULT '',
    id TEXT NOT NULL,
    year INTEGER NOT NULL,
    month INTEGER NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    duration INTEGER NOT NULL,
    source TEXT,
    PRIMARY KEY (scope, project_id, id)
);

CREATE INDEX IF NOT EXISTS idx_archived_sessions_month ON archived_sessions(year, month);
"#;

const SCOPE_GLOBAL: &str = "global";
const SCOPE_PROJECT: &str = "project";

type DbConnection = PooledConnection<SqliteConnectionManager>;

/// SQLite archive behind an r2d2 pool.
pub struct SqliteArchive {
    path: PathBuf,
    pool: Pool<SqliteConnectionManager>,
    retry: RetryPolicy,
}

impl SqliteArchive {
    pub fn open(db_path: &Path, settings: &ArchiveConfig, retry: RetryPolicy) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let busy_timeout = settings.busy_timeout_ms;
        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            // WAL so a reader never blocks the rollover
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "busy_timeout", busy_timeout)?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(settings.max_connections.max(1))
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(SCHEMA)?;
        drop(conn);

        debug!("Opened archive at {}", db_path.display());
        Ok(SqliteArchive {
            path: db_path.to_path_buf(),
            pool,
            retry,
        })
    }

    /// Archive database from configuration, relative paths resolved against the data directory
    pub fn from_config(config: &Config) -> Result<Self> {
        let configured = PathBuf::from(&config.archive.path);
        let path = if configured.is_absolute() {
            configured
        } else {
            get_data_dir().join(configured)
        };
        SqliteArchive::open(&path, &config.archive, RetryPolicy::from(&config.retry.db_ops))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn get_connection(&self) -> Result<DbConnection> {
        Ok(self.pool.get()?)
    }

    /// Months present in the archive, oldest first
    pub fn archived_months(&self) -> Result<Vec<(i32, u32)>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare("SELECT year, month FROM archived_months ORDER BY year, month")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i32>(0)?, row.get::<_, u32>(1)?)))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Sessions of one month; `None` selects the global list
    pub fn sessions_for(&self, year: i32, month: u32, project: Option<&str>) -> Result<Vec<Session>> {
        let (scope, project_id) = scope_columns(project);
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, start_time, end_time, duration, source FROM archived_sessions
             WHERE year = ?1 AND month = ?2 AND scope = ?3 AND project_id = ?4
             ORDER BY start_time",
        )?;
        let rows = stmt.query_map(params![year, month, scope, project_id], |row| {
            Ok(Session {
                id: row.get(0)?,
                start_time: row.get::<_, DateTime<Utc>>(1)?,
                end_time: row.get::<_, DateTime<Utc>>(2)?,
                duration: row.get(3)?,
                source: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Archived milliseconds for one month; `None` selects the global list
    pub fn month_total(&self, year: i32, month: u32, project: Option<&str>) -> Result<i64> {
        let (scope, project_id) = scope_columns(project);
        let conn = self.get_connection()?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(duration), 0) FROM archived_sessions
             WHERE year = ?1 AND month = ?2 AND scope = ?3 AND project_id = ?4",
            params![year, month, scope, project_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }
}

fn scope_columns(project: Option<&str>) -> (&'static str, &str) {
    match project {
        Some(id) => (SCOPE_PROJECT, id),
        None => (SCOPE_GLOBAL, ""),
    }
}

impl ArchiveGateway for SqliteArchive {
    fn append_to_archive(
        &self,
        year: i32,
        month: u32,
        global: &[Session],
        projects: &BTreeMap<String, Vec<Session>>,
    ) -> Result<()> {
        retry_if_retryable(&self.retry, || {
            let mut conn = self.get_connection()?;
            let tx = conn.transaction()?;
            {
                let mut insert = tx.prepare(
                    "INSERT OR REPLACE INTO archived_sessions
                     (scope, project_id, id, year, month, start_time, end_time, duration, source)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;

                let all = global
                    .iter()
                    .map(|s| (SCOPE_GLOBAL, "", s))
                    .chain(projects.iter().flat_map(|(id, sessions)| {
                        sessions.iter().map(move |s| (SCOPE_PROJECT, id.as_str(), s))
                    }));

                for (scope, project_id, session) in all {
                    insert.execute(params![
                        scope,
                        project_id,
                        session.id,
                        year,
                        month,
                        session.start_time,
                        session.end_time,
                        session.duration,
                        session.source,
                    ])?;
                }
            }

            tx.execute(
                "INSERT OR REPLACE INTO archived_months (year, month, archived_at, session_count)
                 VALUES (?1, ?2, ?3,
                         (SELECT COUNT(*) FROM archived_sessions WHERE year = ?1 AND month = ?2))",
                params![year, month, Utc::now()],
            )?;
            tx.commit()?;
            Ok(())
        })?;

        info!("Archived {:04}-{:02} to {}", year, month, self.path.display());
        Ok(())
    }
}
