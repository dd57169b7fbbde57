//! Session state machine: one physical event from first motion through a
//! finalized, stitched output.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Recording,
    Cooldown,
    Finalizing,
    Completed,
}

/// One event, from first motion through finalization.
///
/// Exclusively owned and mutated by the [`crate::session_manager::SessionManager`].
/// Its clip list is appended to by the recorder fan-out, but only through the
/// manager's registry; nothing else writes to a `Session`.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub start_time: f64,
    pub last_activity_time: f64,
    pub cooldown_start_time: Option<f64>,
    pub clips: Vec<PathBuf>,
}

fn new_session_id() -> String {
    let full = Uuid::new_v4().simple().to_string();
    full[..8].to_string()
}

impl Session {
    pub fn new(start_time: f64) -> Self {
        Session {
            id: new_session_id(),
            state: SessionState::Recording,
            start_time,
            last_activity_time: start_time,
            cooldown_start_time: None,
            clips: Vec::new(),
        }
    }

    pub fn enter_cooldown(&mut self, now: f64) {
        if self.state == SessionState::Recording {
            self.state = SessionState::Cooldown;
            self.cooldown_start_time = Some(now);
        }
    }

    pub fn extend_recording(&mut self, now: f64) {
        match self.state {
            SessionState::Cooldown => {
                self.state = SessionState::Recording;
                self.cooldown_start_time = None;
                self.last_activity_time = now;
            }
            SessionState::Recording => {
                self.last_activity_time = now;
            }
            _ => {}
        }
    }

    pub fn should_finalize(&self, now: f64, cooldown_seconds: f64) -> bool {
        match (self.state, self.cooldown_start_time) {
            (SessionState::Cooldown, Some(start)) => now - start >= cooldown_seconds,
            _ => false,
        }
    }

    pub fn enter_finalizing(&mut self) {
        if self.state == SessionState::Cooldown {
            self.state = SessionState::Finalizing;
        }
    }

    pub fn complete(&mut self) {
        if self.state == SessionState::Finalizing {
            self.state = SessionState::Completed;
        }
    }

    pub fn add_clip(&mut self, clip: PathBuf) {
        if self.state != SessionState::Completed {
            self.clips.push(clip);
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            SessionState::Recording | SessionState::Cooldown | SessionState::Finalizing
        )
    }

    pub fn is_recording(&self) -> bool {
        self.state == SessionState::Recording
    }

    pub fn is_in_cooldown(&self) -> bool {
        self.state == SessionState::Cooldown
    }
}
