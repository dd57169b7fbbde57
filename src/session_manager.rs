//! Coordinates many concurrent [`Session`]s, translating motion/no-motion/tick
//! events into session lifecycle transitions and the overlap policy described
//! in the component design.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;

use log::debug;

use crate::session::{Session, SessionState};

/// Notifications fired by the manager on session lifecycle edges.
///
/// Modeled as a trait object rather than raw function pointers so the
/// manager never exposes a bare callback signature; the fan-out is the
/// concrete implementer wired in by the supervisor.
pub trait SessionEvents: Send {
    fn on_session_start(&self, session: &Session);
    fn on_session_finalize(&self, session: &Session);
}

#[derive(Debug, Clone, Copy)]
pub struct SessionManagerConfig {
    pub cooldown_seconds: f64,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        SessionManagerConfig {
            cooldown_seconds: 3.0,
        }
    }
}

pub struct SessionManager {
    config: SessionManagerConfig,
    active_sessions: HashMap<String, Session>,
    completed_sessions: Vec<Session>,
    events: Box<dyn SessionEvents>,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig, events: Box<dyn SessionEvents>) -> Self {
        SessionManager {
            config,
            active_sessions: HashMap::new(),
            completed_sessions: Vec::new(),
            events,
        }
    }

    /// Routes a motion observation. If any session is active, every active
    /// session is extended (cooldown sessions return to recording). Otherwise
    /// a new session is started and `on_session_start` fires.
    pub fn on_motion_detected(&mut self, now: f64) {
        if self.active_sessions.is_empty() {
            let session = Session::new(now);
            debug!("session {}: started at {now}", session.id);
            self.events.on_session_start(&session);
            self.active_sessions.insert(session.id.clone(), session);
        } else {
            for session in self.active_sessions.values_mut() {
                session.extend_recording(now);
            }
        }
    }

    /// Every recording session enters cooldown. Sessions already cooling
    /// down are left untouched -- their cooldown clock is not reset.
    pub fn on_no_motion(&mut self, now: f64) {
        for session in self.active_sessions.values_mut() {
            if session.is_recording() {
                session.enter_cooldown(now);
            }
        }
    }

    /// Finalizes every active session whose cooldown has expired.
    pub fn tick(&mut self, now: f64) {
        let due: Vec<String> = self
            .active_sessions
            .values()
            .filter(|s| s.should_finalize(now, self.config.cooldown_seconds))
            .map(|s| s.id.clone())
            .collect();

        for id in due {
            if let Some(mut session) = self.active_sessions.remove(&id) {
                session.enter_finalizing();
                self.events.on_session_finalize(&session);
                session.complete();
                debug!("session {}: finalized at {now}", session.id);
                self.completed_sessions.push(session);
            }
        }
    }

    pub fn get_active_session_count(&self) -> usize {
        self.active_sessions.len()
    }

    pub fn get_recording_sessions(&self) -> Vec<&Session> {
        self.active_sessions
            .values()
            .filter(|s| s.is_recording())
            .collect()
    }

    pub fn get_cooldown_sessions(&self) -> Vec<&Session> {
        self.active_sessions
            .values()
            .filter(|s| s.is_in_cooldown())
            .collect()
    }

    pub fn completed_sessions(&self) -> &[Session] {
        &self.completed_sessions
    }

    /// Finalizes every still-active session regardless of cooldown state.
    /// Used during graceful shutdown so no event is left dangling.
    pub fn finalize_all(&mut self) {
        let ids: Vec<String> = self.active_sessions.keys().cloned().collect();
        for id in ids {
            if let Some(mut session) = self.active_sessions.remove(&id) {
                if session.state == SessionState::Recording {
                    session.enter_cooldown(session.last_activity_time);
                }
                session.enter_finalizing();
                self.events.on_session_finalize(&session);
                session.complete();
                self.completed_sessions.push(session);
            }
        }
    }
}
