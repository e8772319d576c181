//! Heartbeat and explicit-stop transitions.

use crate::models::{ActiveSession, GlobalActiveSession};
use crate::state::TrackerState;
use chrono::{DateTime, Utc};
use log::{debug, warn};

/// What a heartbeat did to the runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// A new session was opened for the project
    Started,
    /// The open session's last heartbeat moved forward
    Extended,
    /// Inside the throttle window; nothing changed
    Throttled,
    /// Empty project id
    Rejected,
}

impl TrackerState {
    /// Record that `project_id` is active at `now`.
    pub fn heartbeat(
        &mut self,
        project_id: &str,
        source: Option<&str>,
        now: DateTime<Utc>,
    ) -> HeartbeatOutcome {
        if project_id.trim().is_empty() {
            warn!("Ignoring heartbeat with an empty project id");
            return HeartbeatOutcome::Rejected;
        }

        let throttle = self.tracking.throttle_window();
        let outcome = match self.active.get_mut(project_id) {
            Some(session) => {
                if now - session.last_heartbeat < throttle {
                    return HeartbeatOutcome::Throttled;
                }
                session.last_heartbeat = now;
                if session.source.is_none() {
                    session.source = source.map(str::to_string);
                }
                HeartbeatOutcome::Extended
            }
            None => {
                debug!("Starting session for {} at {}", project_id, now);
                self.active.insert(
                    project_id.to_string(),
                    ActiveSession::start(now, source.map(str::to_string)),
                );
                self.dirty = true;
                HeartbeatOutcome::Started
            }
        };

        match self.global.as_mut() {
            Some(global) => {
                if now > global.last_heartbeat {
                    global.last_heartbeat = now;
                }
            }
            None => self.global = Some(GlobalActiveSession::start(now)),
        }

        outcome
    }

    /// Close `project_id`'s open session at `now`.
    ///
    /// Returns false when the project had no open session. The global session
    /// is closed too once no project is left open; otherwise it is extended to
    /// `now` so it still covers the span just closed.
    pub fn stop_project(&mut self, project_id: &str, now: DateTime<Utc>) -> bool {
        if !self.active.contains_key(project_id) {
            debug!("Stop for {} without an open session", project_id);
            return false;
        }

        self.finalize_project(project_id, now);
        if self.active.is_empty() {
            self.finalize_global(now);
        } else if let Some(global) = self.global.as_mut() {
            if now > global.last_heartbeat {
                global.last_heartbeat = now;
            }
        }
        true
    }
}
