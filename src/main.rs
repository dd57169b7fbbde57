//! Motion sentry: watches a live camera stream and produces a durable video
//! artifact for every burst of motion or sudden illumination change.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

#[macro_use]
extern crate log;

#[macro_use]
extern crate serde_derive;

use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use docopt::Docopt;
use nix::sys::signal::{self, SigHandler, Signal};

mod buffer;
mod config;
mod decoder;
mod detector;
mod frame;
mod platform;
mod process;
mod recorder;
mod session;
mod session_manager;
mod watcher;

use buffer::RollingBuffer;
use config::{Args, SentryConfig};
use detector::Detector;
use frame::Frame;
use process::{FailureAction, FrameSource, ReconnectPolicy, ReconnectState};
use recorder::RecorderManager;
use session::Session;
use session_manager::{SessionEvents, SessionManager, SessionManagerConfig};

const DEFAULT_MAX_SEGMENTS: u32 = 20;
const FRAME_PACING: Duration = Duration::from_millis(33);
const TICK_INTERVAL: f64 = 1.0;
const FRAME_WIDTH: usize = 640;
const FRAME_HEIGHT: usize = 480;

const USAGE: &str = "
Motion sentry.

Usage:
  motion-sentry [options]
  motion-sentry (-h | --help)

Options:
  -h --help                       Show this help.
  --pre-roll=<seconds>            Seconds of pre-roll to include at session start.
  --cooldown=<seconds>            No-motion duration before finalization.
  --segment-duration=<seconds>    Nominal transcoder segment length.
  --motion-threshold=<n>          Fractional-pixel motion threshold.
  --light-threshold=<n>           Absolute brightness jump threshold.
  --buffer-dir=<path>             Rolling segment buffer directory.
  --sessions-dir=<path>           Session working directory.
  --evidence-dir=<path>           Output directory for finalized events.
  --rtsp-main=<url>               RTSP URL for the transcoder (full resolution).
  --rtsp-sub=<url>                RTSP URL for the detection substream.
  --max-reconnect-delay=<s>       Cap for exponential reconnect backoff.
  --startup-delay=<s>             Warm-up before detections reach the session manager.
  --min-motion=<s>                Minimum sustained motion before it is forwarded.
  -v --verbose                    Enable debug-level logging.
";

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_signum: i32) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        let handler = SigHandler::Handler(handle_shutdown_signal);
        let _ = signal::signal(Signal::SIGINT, handler);
        let _ = signal::signal(Signal::SIGTERM, handler);
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Wires the session manager's lifecycle notifications into the recorder
/// fan-out. The manager passes sessions by value; this never holds a
/// reference back into the manager.
struct FanOutEvents {
    buffer: Arc<RollingBuffer>,
    recorder_manager: Arc<RecorderManager>,
    pre_roll_seconds: f64,
}

impl SessionEvents for FanOutEvents {
    fn on_session_start(&self, session: &Session) {
        let preroll = self.buffer.get_preroll_clips(self.pre_roll_seconds);
        self.recorder_manager
            .start_session(&session.id, &preroll, session.start_time);
    }

    fn on_session_finalize(&self, session: &Session) {
        self.recorder_manager.finalize_session(&session.id);
    }
}

struct Supervisor {
    config: SentryConfig,
    buffer: Arc<RollingBuffer>,
    recorder_manager: Arc<RecorderManager>,
    session_manager: Mutex<SessionManager>,
    stopped: AtomicBool,
}

impl Supervisor {
    fn new(config: SentryConfig) -> anyhow::Result<Arc<Self>> {
        config.ensure_directories()?;

        let buffer = Arc::new(RollingBuffer::new(
            config.rtsp_url_main.clone(),
            config.buffer_dir.clone(),
            config.segment_duration,
            DEFAULT_MAX_SEGMENTS,
        ));

        let recorder_manager = RecorderManager::new(
            config.buffer_dir.clone(),
            config.sessions_dir.clone(),
            config.evidence_dir.clone(),
        );

        let events = Box::new(FanOutEvents {
            buffer: buffer.clone(),
            recorder_manager: recorder_manager.clone(),
            pre_roll_seconds: config.pre_roll_seconds,
        });

        let session_manager = SessionManager::new(
            SessionManagerConfig {
                cooldown_seconds: config.cooldown_seconds,
            },
            events,
        );

        Ok(Arc::new(Supervisor {
            config,
            buffer,
            recorder_manager,
            session_manager: Mutex::new(session_manager),
            stopped: AtomicBool::new(false),
        }))
    }

    fn start(&self) -> bool {
        if !self.buffer.start() {
            error!("failed to start the rolling segment buffer");
            return false;
        }
        self.recorder_manager.start_buffer_watcher();
        true
    }

    /// Idempotent. Stops fan-out's watcher first so no new clips race,
    /// finalizes any still-active sessions, then stops the buffer.
    fn shutdown(&self, decoder: &mut dyn FrameSource) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down");
        self.recorder_manager.stop_buffer_watcher();
        self.session_manager.lock().unwrap().finalize_all();
        decoder.release();
        self.buffer.stop();
        self.recorder_manager.cleanup();
    }

    fn run(&self, decoder: &mut dyn FrameSource) {
        let mut fdetector = Detector::new(self.config.motion_threshold, self.config.light_jump_threshold);
        let mut reconnect = ReconnectState::new(ReconnectPolicy {
            max_consecutive_failures: self.config.max_consecutive_failures,
            max_reconnect_delay: Duration::from_secs_f64(self.config.max_reconnect_delay),
        });

        let started_at = now_secs();
        let mut last_tick = now_secs();
        let mut motion_since: Option<f64> = None;

        loop {
            if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
                break;
            }

            match decoder.read_frame() {
                Ok(Some(frame)) => {
                    reconnect.record_success();
                    self.process_frame(
                        &frame,
                        &mut fdetector,
                        &mut motion_since,
                        started_at,
                    );
                }
                Ok(None) => {}
                Err(()) => match reconnect.record_failure() {
                    FailureAction::Backoff(delay) => {
                        thread::sleep(delay);
                        if decoder.reconnect() {
                            info!("decoder: reconnected");
                            fdetector.reset();
                            reconnect.record_success();
                        }
                    }
                    FailureAction::RestartBuffer => {
                        warn!("restarting rolling buffer after repeated decoder failures");
                        self.buffer.stop();
                        self.buffer.start();
                        decoder.reconnect();
                        fdetector.reset();
                    }
                },
            }

            let now = now_secs();
            if now - last_tick >= TICK_INTERVAL {
                self.session_manager.lock().unwrap().tick(now);
                last_tick = now;
            }

            thread::sleep(FRAME_PACING);
        }
    }

    fn process_frame(
        &self,
        frame: &Frame,
        fdetector: &mut Detector,
        motion_since: &mut Option<f64>,
        started_at: f64,
    ) {
        let now = now_secs();
        let result = fdetector.analyze_frame(frame);

        if now - started_at < self.config.startup_delay_seconds {
            return;
        }

        // A brightness jump is forwarded immediately: a single frame can
        // never satisfy the sustained-motion gate below, so a light event
        // routes around it rather than through it.
        if result.light_event_detected {
            self.session_manager.lock().unwrap().on_motion_detected(now);
        }

        if result.motion_detected {
            let since = motion_since.get_or_insert(now);
            if now - *since >= self.config.min_motion_seconds {
                self.session_manager.lock().unwrap().on_motion_detected(now);
            }
        } else {
            *motion_since = None;
            if !result.light_event_detected {
                self.session_manager.lock().unwrap().on_no_motion(now);
            }
        }
    }
}

fn init_logging(verbose: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var("RUST_LOG").is_err() {
        builder.filter_level(if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        });
    }
    builder.init();
}

fn main() {
    let args: Args = Docopt::new(USAGE)
        .map(|d| d.help(true))
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    let mut config = SentryConfig::from_env(None);
    args.apply_to(&mut config);

    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("{e}");
        exit(1);
    }

    install_signal_handlers();

    let supervisor = match Supervisor::new(config.clone()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to initialize: {e}");
            exit(1);
        }
    };

    if !supervisor.start() {
        exit(1);
    }

    let mut decoder = decoder::FfmpegFrameSource::new(
        config.rtsp_url_sub.clone(),
        FRAME_WIDTH,
        FRAME_HEIGHT,
    );
    decoder.reconnect();

    supervisor.run(&mut decoder);
    supervisor.shutdown(&mut decoder);
}
