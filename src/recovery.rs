//! Crash recovery from the checkpoint left by an ungraceful shutdown.
//!
//! A checkpoint only records when each open session started. On the next
//! start a recent entry is credited from its start for at most one idle
//! timeout, since nothing proves activity beyond that. Entries older than the
//! maximum checkpoint age are dropped.

use crate::config::TrackingConfig;
use crate::models::{Checkpoint, CheckpointEntry, GlobalCheckpoint, Scope};
use crate::state::TrackerState;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashSet;

/// Decides which checkpointed projects still exist.
pub trait ProjectIdProvider {
    fn is_known(&self, project_id: &str) -> bool;
}

/// Accepts every project id.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnyProject;

impl ProjectIdProvider for AnyProject {
    fn is_known(&self, _project_id: &str) -> bool {
        true
    }
}

impl ProjectIdProvider for HashSet<String> {
    fn is_known(&self, project_id: &str) -> bool {
        self.contains(project_id)
    }
}

impl<T: AsRef<str>> ProjectIdProvider for [T] {
    fn is_known(&self, project_id: &str) -> bool {
        self.iter().any(|id| id.as_ref() == project_id)
    }
}

impl<T: AsRef<str>> ProjectIdProvider for Vec<T> {
    fn is_known(&self, project_id: &str) -> bool {
        self.as_slice().is_known(project_id)
    }
}

/// Adapts a closure into a provider.
pub struct FnProvider<F>(pub F);

impl<F: Fn(&str) -> bool> ProjectIdProvider for FnProvider<F> {
    fn is_known(&self, project_id: &str) -> bool {
        (self.0)(project_id)
    }
}

/// One span credited from the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredSpan {
    /// `None` for the global session
    pub project_id: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryPlan {
    pub spans: Vec<RecoveredSpan>,
    /// Project entries that were too old or unknown
    pub discarded: usize,
}

impl RecoveryPlan {
    pub fn recovered_projects(&self) -> usize {
        self.spans.iter().filter(|s| s.project_id.is_some()).count()
    }
}

/// Read a checkpoint entry by entry so one bad record does not lose the rest.
///
/// Returns the checkpoint and the number of unreadable entries.
pub fn parse_checkpoint(value: &serde_json::Value) -> (Checkpoint, usize) {
    let mut checkpoint = Checkpoint::default();
    let mut unreadable = 0;

    let Some(entries) = value.as_object() else {
        if !value.is_null() {
            warn!("Ignoring checkpoint that is not an object");
            unreadable += 1;
        }
        return (checkpoint, unreadable);
    };

    for (key, entry) in entries {
        if key == "global" {
            match serde_json::from_value::<GlobalCheckpoint>(entry.clone()) {
                Ok(global) => checkpoint.global = Some(global),
                Err(e) => {
                    debug!("Unreadable global checkpoint: {}", e);
                    unreadable += 1;
                }
            }
            continue;
        }
        match serde_json::from_value::<CheckpointEntry>(entry.clone()) {
            Ok(parsed) => {
                checkpoint.projects.insert(key.clone(), parsed);
            }
            Err(e) => {
                debug!("Unreadable checkpoint entry for {}: {}", key, e);
                unreadable += 1;
            }
        }
    }

    (checkpoint, unreadable)
}

/// Work out what a checkpoint may credit at `now`.
///
/// Every fresh entry recovers `[startedAt, startedAt + min(age, idleTimeout)]`.
/// Global spans are the union of the recovered project spans and the global
/// entry's own span; nothing global is credited when no project recovered.
pub fn plan_recovery(
    checkpoint: &Checkpoint,
    now: DateTime<Utc>,
    tracking: &TrackingConfig,
    provider: &dyn ProjectIdProvider,
) -> RecoveryPlan {
    let mut plan = RecoveryPlan::default();
    let max_age = tracking.max_checkpoint_age();
    let idle_timeout = tracking.idle_timeout();

    for (project_id, entry) in &checkpoint.projects {
        let age = now - entry.started_at;
        if age >= max_age {
            info!(
                "Discarding stale checkpoint for {} ({} minutes old)",
                project_id,
                age.num_minutes()
            );
            plan.discarded += 1;
            continue;
        }
        if !provider.is_known(project_id) {
            info!("Discarding checkpoint for unknown project {}", project_id);
            plan.discarded += 1;
            continue;
        }
        if age <= chrono::Duration::zero() {
            debug!("Checkpoint for {} starts in the future, skipping", project_id);
            plan.discarded += 1;
            continue;
        }

        plan.spans.push(RecoveredSpan {
            project_id: Some(project_id.clone()),
            start: entry.started_at,
            end: entry.started_at + age.min(idle_timeout),
            source: entry.source.clone(),
        });
    }

    if plan.spans.is_empty() {
        return plan;
    }

    let mut intervals: Vec<(DateTime<Utc>, DateTime<Utc>)> =
        plan.spans.iter().map(|s| (s.start, s.end)).collect();
    if let Some(global) = checkpoint.global {
        let age = now - global.started_at;
        if age < max_age && age > chrono::Duration::zero() {
            intervals.push((global.started_at, global.started_at + age.min(idle_timeout)));
        }
    }
    intervals.sort();

    // Global time is the union of everything recovered, never a sum
    let mut merged: Vec<(DateTime<Utc>, DateTime<Utc>)> = Vec::new();
    for (start, end) in intervals {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    plan.spans.extend(merged.into_iter().map(|(start, end)| RecoveredSpan {
        project_id: None,
        start,
        end,
        source: None,
    }));

    plan
}

impl TrackerState {
    /// Record the spans of a recovery plan.
    pub fn apply_recovery(&mut self, plan: &RecoveryPlan) {
        for span in &plan.spans {
            let scope = match &span.project_id {
                Some(id) => Scope::Project(id),
                None => Scope::Global,
            };
            let recorded = self.finalize_span(scope, span.start, span.end, span.source.as_deref());
            debug!("Recovered {}ms for {:?}", recorded, scope);
        }
        self.dirty = true;
    }
}
