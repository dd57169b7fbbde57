//! Configuration: compiled-in defaults, layered with an optional `.env`
//! file, the process environment, and command-line flags (highest
//! priority), matching the precedence documented for the system.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required configuration `{which}` is missing or empty")]
    MissingRtspUrl { which: &'static str },
}

#[derive(Debug, Clone)]
pub struct SentryConfig {
    pub pre_roll_seconds: f64,
    pub cooldown_seconds: f64,
    pub segment_duration: f64,
    pub motion_threshold: f32,
    pub light_jump_threshold: f32,

    pub buffer_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub evidence_dir: PathBuf,

    pub rtsp_url_main: String,
    pub rtsp_url_sub: String,

    pub verbose: bool,

    pub max_reconnect_delay: f64,
    pub startup_delay_seconds: f64,
    pub min_motion_seconds: f64,
    pub max_consecutive_failures: u32,
}

fn default_buffer_dir() -> PathBuf {
    let ramdisk = PathBuf::from("/mnt/ramdisk");
    if cfg!(target_os = "linux") && ramdisk.exists() {
        return ramdisk.join("motion-sentry").join("buffer");
    }
    std::env::temp_dir().join("motion-sentry").join("buffer")
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

fn default_sessions_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        home_dir().join("motion-sentry").join("sessions")
    } else {
        std::env::temp_dir().join("motion-sentry").join("sessions")
    }
}

fn default_evidence_dir() -> PathBuf {
    home_dir().join("motion-sentry-recordings")
}

impl Default for SentryConfig {
    fn default() -> Self {
        SentryConfig {
            pre_roll_seconds: 3.0,
            cooldown_seconds: 3.0,
            segment_duration: 5.0,
            motion_threshold: 0.02,
            light_jump_threshold: 30.0,

            buffer_dir: default_buffer_dir(),
            sessions_dir: default_sessions_dir(),
            evidence_dir: default_evidence_dir(),

            rtsp_url_main: String::new(),
            rtsp_url_sub: String::new(),

            verbose: false,

            max_reconnect_delay: 60.0,
            startup_delay_seconds: 5.0,
            min_motion_seconds: 0.5,
            max_consecutive_failures: 10,
        }
    }
}

impl SentryConfig {
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.buffer_dir)?;
        std::fs::create_dir_all(&self.sessions_dir)?;
        std::fs::create_dir_all(&self.evidence_dir)?;
        Ok(())
    }

    /// Loads an optional `.env` file, then overlays `SENTRY_*`/`RTSP_URL_*`
    /// environment variables onto the compiled-in defaults.
    pub fn from_env(env_file: Option<&Path>) -> Self {
        match env_file {
            Some(path) => {
                let _ = dotenvy::from_path(path);
            }
            None => {
                let _ = dotenvy::dotenv();
            }
        }

        let mut config = SentryConfig::default();

        if let Some(v) = env_f64("SENTRY_PRE_ROLL_SECONDS") {
            config.pre_roll_seconds = v;
        }
        if let Some(v) = env_f64("SENTRY_COOLDOWN_SECONDS") {
            config.cooldown_seconds = v;
        }
        if let Some(v) = env_f64("SENTRY_SEGMENT_DURATION") {
            config.segment_duration = v;
        }
        if let Some(v) = env_f32("SENTRY_MOTION_THRESHOLD") {
            config.motion_threshold = v;
        }
        if let Some(v) = env_f32("SENTRY_LIGHT_JUMP_THRESHOLD") {
            config.light_jump_threshold = v;
        }
        if let Ok(v) = std::env::var("SENTRY_BUFFER_DIR") {
            config.buffer_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SENTRY_SESSIONS_DIR") {
            config.sessions_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SENTRY_EVIDENCE_DIR") {
            config.evidence_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("RTSP_URL_MAIN") {
            config.rtsp_url_main = v;
        }
        if let Ok(v) = std::env::var("RTSP_URL_SUB") {
            config.rtsp_url_sub = v;
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rtsp_url_main.trim().is_empty() {
            return Err(ConfigError::MissingRtspUrl { which: "rtsp_url_main" });
        }
        if self.rtsp_url_sub.trim().is_empty() {
            return Err(ConfigError::MissingRtspUrl { which: "rtsp_url_sub" });
        }
        Ok(())
    }
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_f32(key: &str) -> Option<f32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Command-line flags, mirroring every [`SentryConfig`] field. Parsed by
/// `docopt` and applied last (highest priority).
#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
pub struct Args {
    pub flag_pre_roll: Option<f64>,
    pub flag_cooldown: Option<f64>,
    pub flag_segment_duration: Option<f64>,
    pub flag_motion_threshold: Option<f32>,
    pub flag_light_threshold: Option<f32>,
    pub flag_buffer_dir: Option<String>,
    pub flag_sessions_dir: Option<String>,
    pub flag_evidence_dir: Option<String>,
    pub flag_rtsp_main: Option<String>,
    pub flag_rtsp_sub: Option<String>,
    pub flag_max_reconnect_delay: Option<f64>,
    pub flag_startup_delay: Option<f64>,
    pub flag_min_motion: Option<f64>,
    pub flag_verbose: bool,
}

impl Args {
    pub fn apply_to(&self, config: &mut SentryConfig) {
        if let Some(v) = self.flag_pre_roll {
            config.pre_roll_seconds = v;
        }
        if let Some(v) = self.flag_cooldown {
            config.cooldown_seconds = v;
        }
        if let Some(v) = self.flag_segment_duration {
            config.segment_duration = v;
        }
        if let Some(v) = self.flag_motion_threshold {
            config.motion_threshold = v;
        }
        if let Some(v) = self.flag_light_threshold {
            config.light_jump_threshold = v;
        }
        if let Some(v) = &self.flag_buffer_dir {
            config.buffer_dir = PathBuf::from(v);
        }
        if let Some(v) = &self.flag_sessions_dir {
            config.sessions_dir = PathBuf::from(v);
        }
        if let Some(v) = &self.flag_evidence_dir {
            config.evidence_dir = PathBuf::from(v);
        }
        if let Some(v) = &self.flag_rtsp_main {
            config.rtsp_url_main = v.clone();
        }
        if let Some(v) = &self.flag_rtsp_sub {
            config.rtsp_url_sub = v.clone();
        }
        if let Some(v) = self.flag_max_reconnect_delay {
            config.max_reconnect_delay = v;
        }
        if let Some(v) = self.flag_startup_delay {
            config.startup_delay_seconds = v;
        }
        if let Some(v) = self.flag_min_motion {
            config.min_motion_seconds = v;
        }
        if self.flag_verbose {
            config.verbose = true;
        }
    }
}
