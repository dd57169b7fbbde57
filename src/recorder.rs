//! Recorder fan-out: materializes every active session as a working
//! directory of clip copies, and on finalization drives the concatenator to
//! produce one stitched output per session.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{Local, TimeZone};
use log::{debug, error, info, warn};

use crate::buffer::Segment;
use crate::platform::safe_rmtree;
use crate::watcher::BufferWatcher;

const CONCAT_TIMEOUT: Duration = Duration::from_secs(60);

/// One per active session. The clip list carries its own lock (per the
/// re-architecture note on embedding the per-session mutex here rather than
/// beside the state machine) because it is appended to concurrently by both
/// watcher sources.
pub struct SessionRecorder {
    pub session_id: String,
    pub session_dir: PathBuf,
    pub evidence_dir: PathBuf,
    pub start_time: f64,
    clips: Mutex<Vec<PathBuf>>,
}

impl SessionRecorder {
    fn new(session_id: String, session_dir: PathBuf, evidence_dir: PathBuf, start_time: f64) -> Self {
        SessionRecorder {
            session_id,
            session_dir,
            evidence_dir,
            start_time,
            clips: Mutex::new(Vec::new()),
        }
    }

    /// Copies `clip_path` into this session's working directory. Dedup by
    /// destination filename, so a duplicate notification is a no-op.
    pub fn add_clip(&self, clip_path: &Path) {
        let Some(name) = clip_path.file_name() else { return };
        let dest = self.session_dir.join(name);

        let mut clips = self.clips.lock().unwrap();
        if dest.exists() {
            return;
        }
        if let Err(e) = fs::copy(clip_path, &dest) {
            warn!("session {}: failed copying {}: {e}", self.session_id, clip_path.display());
            return;
        }
        clips.push(dest);
        debug!("session {}: added clip {}", self.session_id, name.to_string_lossy());
    }

    pub fn clip_count(&self) -> usize {
        self.clips.lock().unwrap().len()
    }

    /// Sorts clips lexicographically (== temporal order for zero-padded
    /// indices), writes a concat manifest, and drives the concatenator.
    pub fn finalize(&self) -> Option<PathBuf> {
        let mut clips = self.clips.lock().unwrap();
        if clips.is_empty() {
            warn!("session {}: no clips to finalize", self.session_id);
            return None;
        }
        clips.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let concat_file = self.session_dir.join("concat.txt");
        let manifest = clips
            .iter()
            .map(|p| format!("file '{}'\n", p.display()))
            .collect::<String>();
        if let Err(e) = fs::write(&concat_file, manifest) {
            error!("session {}: failed writing concat manifest: {e}", self.session_id);
            return None;
        }

        if let Err(e) = fs::create_dir_all(&self.evidence_dir) {
            error!("session {}: failed creating evidence dir: {e}", self.session_id);
            return None;
        }

        let timestamp = Local
            .timestamp_opt(self.start_time as i64, 0)
            .single()
            .unwrap_or_else(Local::now);
        let output_path = self.evidence_dir.join(format!(
            "event_{}_{}.mp4",
            timestamp.format("%Y%m%d_%H%M%S"),
            self.session_id
        ));

        match run_concat(&concat_file, &output_path) {
            Ok(true) => {
                info!("session {}: created {}", self.session_id, output_path.display());
                Some(output_path)
            }
            Ok(false) => {
                error!("session {}: concatenator exited non-zero", self.session_id);
                None
            }
            Err(e) => {
                error!("session {}: finalize error: {e}", self.session_id);
                None
            }
        }
    }

    /// Only removes the session working directory if the safety rail agrees.
    pub fn cleanup(&self) {
        safe_rmtree(&self.session_dir);
    }
}

fn run_concat(concat_file: &Path, output_path: &Path) -> std::io::Result<bool> {
    let mut child = Command::new("ffmpeg")
        .arg("-y")
        .arg("-f")
        .arg("concat")
        .arg("-safe")
        .arg("0")
        .arg("-i")
        .arg(concat_file)
        .arg("-c")
        .arg("copy")
        .arg(output_path)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    let deadline = Instant::now() + CONCAT_TIMEOUT;
    loop {
        match child.try_wait()? {
            Some(status) => return Ok(status.success()),
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    warn!("concatenator timed out after {:?}", CONCAT_TIMEOUT);
                    return Ok(false);
                }
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// Owns every active [`SessionRecorder`] and the buffer watcher that feeds
/// them new clips.
pub struct RecorderManager {
    buffer_dir: PathBuf,
    sessions_dir: PathBuf,
    evidence_dir: PathBuf,
    recorders: Mutex<HashMap<String, Arc<SessionRecorder>>>,
    watcher: Mutex<Option<BufferWatcher>>,
    watching: AtomicBool,
}

impl RecorderManager {
    pub fn new(buffer_dir: PathBuf, sessions_dir: PathBuf, evidence_dir: PathBuf) -> Arc<Self> {
        Arc::new(RecorderManager {
            buffer_dir,
            sessions_dir,
            evidence_dir,
            recorders: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
            watching: AtomicBool::new(false),
        })
    }

    /// Creates the session working directory and seeds it with pre-roll.
    pub fn start_session(&self, session_id: &str, preroll_clips: &[Segment], start_time: f64) -> Arc<SessionRecorder> {
        let session_dir = self.sessions_dir.join(session_id);
        let _ = fs::create_dir_all(&session_dir);

        let recorder = Arc::new(SessionRecorder::new(
            session_id.to_string(),
            session_dir,
            self.evidence_dir.clone(),
            start_time,
        ));

        for segment in preroll_clips {
            recorder.add_clip(&segment.path);
        }

        info!(
            "session {session_id}: started with {} pre-roll clip(s)",
            preroll_clips.len()
        );
        self.recorders
            .lock()
            .unwrap()
            .insert(session_id.to_string(), recorder.clone());
        recorder
    }

    /// Fans a newly observed clip out to every currently active session.
    /// The active set is a snapshot at distribution time -- a session that
    /// starts after this snapshot may legitimately miss this one clip.
    pub fn add_clip_to_sessions(&self, clip_path: &Path) {
        let recorders: Vec<_> = self.recorders.lock().unwrap().values().cloned().collect();
        for recorder in recorders {
            recorder.add_clip(clip_path);
        }
    }

    /// Starts the dual-sourced buffer watcher. Requires `self` behind an
    /// `Arc` so the watcher's callback can fan clips out without the
    /// manager holding a reference back into itself.
    pub fn start_buffer_watcher(self: &Arc<Self>) {
        if self.watching.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        let watcher = BufferWatcher::start(self.buffer_dir.clone(), move |path| {
            manager.add_clip_to_sessions(&path);
        });
        *self.watcher.lock().unwrap() = Some(watcher);
    }

    pub fn stop_buffer_watcher(&self) {
        if !self.watching.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(mut watcher) = self.watcher.lock().unwrap().take() {
            watcher.stop();
        }
    }

    /// Finalizes a session. On success the working directory is cleaned up
    /// and the recorder is dropped; on failure it is preserved for
    /// post-mortem and stays registered.
    pub fn finalize_session(&self, session_id: &str) -> Option<PathBuf> {
        let recorder = self.recorders.lock().unwrap().get(session_id).cloned();
        let recorder = match recorder {
            Some(r) => r,
            None => {
                warn!("session {session_id}: not found for finalize");
                return None;
            }
        };

        let output = recorder.finalize();
        if output.is_some() {
            recorder.cleanup();
            self.recorders.lock().unwrap().remove(session_id);
        }
        output
    }

    /// Stops the watcher and cleans up every remaining recorder. Called on
    /// shutdown; does not touch the evidence directory.
    pub fn cleanup(&self) {
        self.stop_buffer_watcher();
        let recorders: Vec<_> = self.recorders.lock().unwrap().drain().map(|(_, v)| v).collect();
        for recorder in recorders {
            recorder.cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn segment_at(dir: &Path, name: &str) -> Segment {
        let path = dir.join(name);
        fs::write(&path, b"segment").unwrap();
        Segment {
            path,
            index: 0,
            mtime: std::time::SystemTime::now(),
        }
    }

    #[test]
    fn start_session_copies_preroll_clips() {
        let root = tempdir().unwrap();
        let buffer_dir = root.path().join("buffer");
        fs::create_dir_all(&buffer_dir).unwrap();
        let sessions_dir = root.path().join("sessions");
        let evidence_dir = root.path().join("evidence");

        let manager = RecorderManager::new(buffer_dir.clone(), sessions_dir, evidence_dir);
        let preroll = vec![
            segment_at(&buffer_dir, "clip_0000.ts"),
            segment_at(&buffer_dir, "clip_0001.ts"),
        ];

        let recorder = manager.start_session("abcd1234", &preroll, 100.0);
        assert_eq!(recorder.clip_count(), 2);
    }

    #[test]
    fn duplicate_clip_notification_is_idempotent() {
        let root = tempdir().unwrap();
        let buffer_dir = root.path().join("buffer");
        fs::create_dir_all(&buffer_dir).unwrap();
        let sessions_dir = root.path().join("sessions");
        let evidence_dir = root.path().join("evidence");

        let manager = RecorderManager::new(buffer_dir.clone(), sessions_dir, evidence_dir);
        let recorder = manager.start_session("abcd1234", &[], 100.0);

        let clip = segment_at(&buffer_dir, "clip_0005.ts");
        manager.add_clip_to_sessions(&clip.path);
        manager.add_clip_to_sessions(&clip.path);

        assert_eq!(recorder.clip_count(), 1);
    }

    #[test]
    fn finalize_with_no_clips_returns_none_and_preserves_dir() {
        let root = tempdir().unwrap();
        let buffer_dir = root.path().join("buffer");
        fs::create_dir_all(&buffer_dir).unwrap();
        let sessions_dir = root.path().join("sessions");
        let evidence_dir = root.path().join("evidence");

        let manager = RecorderManager::new(buffer_dir, sessions_dir, evidence_dir);
        let recorder = manager.start_session("abcd1234", &[], 100.0);

        assert!(recorder.finalize().is_none());
        assert!(recorder.session_dir.exists());
    }
}
