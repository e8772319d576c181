//! Data models for Timekeeper.
//!
//! This module defines the runtime session records, the persisted session
//! shape and the on-disk document layout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Current on-disk document version
pub const DATA_VERSION: &str = "2";

/// Which ordered session list an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    /// The "any project active" list
    Global,
    /// One project's list
    Project(&'a str),
}

impl Scope<'_> {
    /// Key mixed into session ids so identical spans in different lists differ
    pub fn id_key(&self) -> String {
        match self {
            Scope::Global => "global".to_string(),
            Scope::Project(id) => format!("project:{}", id),
        }
    }
}

/// A finalized span of activity.
///
/// `duration` equals `end_time - start_time` at creation. Only the merge
/// algorithm in the session store changes it afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Milliseconds
    pub duration: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Session {
    pub fn new(
        scope: Scope<'_>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        source: Option<String>,
    ) -> Self {
        Session {
            id: session_id(scope, start_time),
            start_time,
            end_time,
            duration: (end_time - start_time).num_milliseconds(),
            source,
        }
    }

    /// Wall-clock span covered, which may exceed `duration` after gap merges
    pub fn span_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds()
    }
}

/// Stable 16-hex-digit id derived from the owning list and the start instant.
pub fn session_id(scope: Scope<'_>, start_time: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.id_key().as_bytes());
    hasher.update(b":");
    hasher.update(start_time.timestamp_millis().to_be_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// In-memory record of ongoing activity for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub source: Option<String>,
}

impl ActiveSession {
    pub fn start(now: DateTime<Utc>, source: Option<String>) -> Self {
        ActiveSession {
            started_at: now,
            last_heartbeat: now,
            source,
        }
    }
}

/// In-memory "any project active" record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalActiveSession {
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl GlobalActiveSession {
    pub fn start(now: DateTime<Utc>) -> Self {
        GlobalActiveSession {
            started_at: now,
            last_heartbeat: now,
        }
    }
}

/// Checkpointed start of one open project session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointEntry {
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Checkpointed start of the open global session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalCheckpoint {
    pub started_at: DateTime<Utc>,
}

/// Snapshot of open sessions, present on disk only while sessions are open.
///
/// Project entries sit at the top level of the object next to `global`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<GlobalCheckpoint>,
    #[serde(flatten)]
    pub projects: BTreeMap<String, CheckpointEntry>,
}

impl Checkpoint {
    pub fn is_empty(&self) -> bool {
        self.global.is_none() && self.projects.is_empty()
    }
}

/// A list of sessions as laid out on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionList<S> {
    #[serde(default = "Vec::new")]
    pub sessions: Vec<S>,
}

impl<S> Default for SessionList<S> {
    fn default() -> Self {
        SessionList {
            sessions: Vec::new(),
        }
    }
}

/// The persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFile {
    pub version: String,
    /// Month (YYYY-MM) the live data belongs to
    pub month: String,
    pub global: SessionList<Session>,
    pub projects: BTreeMap<String, SessionList<Session>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
}

/// The persisted document as read back, before sanitation.
///
/// Sessions and the checkpoint stay untyped so one bad record cannot make
/// the whole file unreadable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDataFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub month: Option<String>,
    #[serde(default)]
    pub global: SessionList<serde_json::Value>,
    #[serde(default)]
    pub projects: BTreeMap<String, SessionList<serde_json::Value>>,
    #[serde(default)]
    pub checkpoint: Option<serde_json::Value>,
}

/// Accumulated milliseconds per reporting period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodTimes {
    pub today: u64,
    pub week: u64,
    pub month: u64,
    pub total: u64,
}
