//! Process supervision and reconnection: the detector-side decoder fails
//! independently of the transcoder-side rolling buffer. This module owns
//! the failure-counting, exponential-backoff, and force-restart policy
//! described for that relationship; the rolling buffer's own
//! start/stop/SIGTERM-then-SIGKILL supervision lives in [`crate::buffer`].
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::time::{Duration, Instant};

use log::warn;

/// Pluggable boundary for the decoder. Producing real `(ok, frame)` pulls
/// from an RTSP stream is out of scope here; callers supply any
/// implementation (a real decoder, or a test double).
pub trait FrameSource: Send {
    /// Pulls the next frame. `Ok(None)` means no frame was ready right now;
    /// `Err(())` is a hard read failure that counts against the reconnect
    /// policy.
    fn read_frame(&mut self) -> Result<Option<crate::frame::Frame>, ()>;

    /// Tears down and re-establishes the underlying stream.
    fn reconnect(&mut self) -> bool;

    fn release(&mut self);
}

pub struct ReconnectPolicy {
    pub max_consecutive_failures: u32,
    pub max_reconnect_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            max_consecutive_failures: 10,
            max_reconnect_delay: Duration::from_secs(60),
        }
    }
}

/// Tracks one disconnection episode: consecutive failure count, the next
/// backoff delay, and whether the single-shot force-restart for this
/// episode has already fired.
pub struct ReconnectState {
    policy: ReconnectPolicy,
    consecutive_failures: u32,
    next_delay: Duration,
    episode_start: Option<Instant>,
    force_restart_used: bool,
}

const OUTAGE_FORCE_RESTART_AFTER: Duration = Duration::from_secs(120);

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        ReconnectState {
            policy,
            consecutive_failures: 0,
            next_delay: Duration::from_secs(1),
            episode_start: None,
            force_restart_used: false,
        }
    }

    /// Action the caller should take after a single failed frame read.
    pub fn record_failure(&mut self) -> FailureAction {
        self.consecutive_failures += 1;
        if self.episode_start.is_none() {
            self.episode_start = Some(Instant::now());
        }
        warn!(
            "decoder: frame read failed ({} consecutive)",
            self.consecutive_failures
        );

        if self.consecutive_failures >= self.policy.max_consecutive_failures {
            self.consecutive_failures = 0;
            return FailureAction::RestartBuffer;
        }

        if !self.force_restart_used {
            if let Some(start) = self.episode_start {
                if start.elapsed() >= OUTAGE_FORCE_RESTART_AFTER {
                    self.force_restart_used = true;
                    return FailureAction::RestartBuffer;
                }
            }
        }

        FailureAction::Backoff(self.next_backoff())
    }

    fn next_backoff(&mut self) -> Duration {
        let delay = self.next_delay;
        let doubled = self.next_delay * 2;
        self.next_delay = doubled.min(self.policy.max_reconnect_delay);
        delay.min(self.policy.max_reconnect_delay)
    }

    /// Resets all episode state on a successful reconnect.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.next_delay = Duration::from_secs(1);
        self.episode_start = None;
        self.force_restart_used = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Backoff(Duration),
    RestartBuffer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_configured_max() {
        let mut state = ReconnectState::new(ReconnectPolicy {
            max_consecutive_failures: 1000,
            max_reconnect_delay: Duration::from_secs(8),
        });

        let delays: Vec<Duration> = (0..5)
            .map(|_| match state.record_failure() {
                FailureAction::Backoff(d) => d,
                FailureAction::RestartBuffer => panic!("unexpected restart"),
            })
            .collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(8),
            ]
        );
    }

    #[test]
    fn restarts_buffer_after_max_consecutive_failures() {
        let mut state = ReconnectState::new(ReconnectPolicy {
            max_consecutive_failures: 3,
            max_reconnect_delay: Duration::from_secs(60),
        });

        assert!(matches!(state.record_failure(), FailureAction::Backoff(_)));
        assert!(matches!(state.record_failure(), FailureAction::Backoff(_)));
        assert!(matches!(state.record_failure(), FailureAction::RestartBuffer));
    }

    #[test]
    fn success_resets_backoff_and_failure_count() {
        let mut state = ReconnectState::new(ReconnectPolicy {
            max_consecutive_failures: 1000,
            max_reconnect_delay: Duration::from_secs(60),
        });

        state.record_failure();
        state.record_failure();
        state.record_success();

        match state.record_failure() {
            FailureAction::Backoff(d) => assert_eq!(d, Duration::from_secs(1)),
            FailureAction::RestartBuffer => panic!("unexpected restart"),
        }
    }
}
