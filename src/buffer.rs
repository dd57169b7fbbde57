//! Rolling segment buffer: supervises the external transcoder that emits
//! HLS-style MPEG-TS segments into a buffer directory, and provides ordered
//! reads, pre-roll slicing, and overflow reclamation over what it produces.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use log::{error, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use regex::Regex;

const SEGMENT_OVERFLOW_MARGIN: u32 = 5;
const STARTUP_WARMUP: Duration = Duration::from_secs(2);
const STOP_GRACE: Duration = Duration::from_secs(5);
const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct Segment {
    pub path: PathBuf,
    pub index: u32,
    pub mtime: SystemTime,
}

pub struct RollingBuffer {
    rtsp_url: String,
    buffer_dir: PathBuf,
    segment_duration: f64,
    max_segments: u32,
    overflow_margin: u32,

    child: Mutex<Option<Child>>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    overflow_warned: AtomicBool,
}

fn segment_regex() -> Regex {
    Regex::new(r"^clip_(\d+)\.ts$").expect("static regex is valid")
}

impl RollingBuffer {
    pub fn new(
        rtsp_url: impl Into<String>,
        buffer_dir: impl Into<PathBuf>,
        segment_duration: f64,
        max_segments: u32,
    ) -> Self {
        RollingBuffer {
            rtsp_url: rtsp_url.into(),
            buffer_dir: buffer_dir.into(),
            segment_duration,
            max_segments,
            overflow_margin: SEGMENT_OVERFLOW_MARGIN,
            child: Mutex::new(None),
            monitor_handle: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            overflow_warned: AtomicBool::new(false),
        }
    }

    pub fn buffer_dir(&self) -> &Path {
        &self.buffer_dir
    }

    /// Removes any `clip_*.ts` and `stream.m3u8` left from a prior run. The
    /// only automatic deletion the buffer performs, and only on startup.
    fn clear_old_clips(&self) -> std::io::Result<()> {
        let entries = match fs::read_dir(&self.buffer_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(&self.buffer_dir)?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let re = segment_regex();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if re.is_match(&name) || name == "stream.m3u8" {
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    /// Spawns the transcoder, waits a 2 s warm-up, returns whether it is
    /// still alive.
    pub fn start(&self) -> bool {
        if let Err(e) = self.clear_old_clips() {
            error!("buffer: failed clearing old clips: {e}");
            return false;
        }

        let m3u8 = self.buffer_dir.join("stream.m3u8");
        let segment_pattern = self.buffer_dir.join("clip_%04d.ts");

        let child = Command::new("ffmpeg")
            .arg("-rtsp_transport")
            .arg("tcp")
            .arg("-i")
            .arg(&self.rtsp_url)
            .arg("-c:v")
            .arg("copy")
            .arg("-c:a")
            .arg("copy")
            .arg("-f")
            .arg("hls")
            .arg("-hls_time")
            .arg(self.segment_duration.to_string())
            .arg("-hls_list_size")
            .arg(self.max_segments.to_string())
            .arg("-hls_flags")
            .arg("delete_segments")
            .arg("-hls_segment_filename")
            .arg(&segment_pattern)
            .arg(&m3u8)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match child {
            Ok(c) => c,
            Err(e) => {
                error!("buffer: failed to launch transcoder: {e}");
                return false;
            }
        };

        self.running.store(true, Ordering::SeqCst);

        if let Some(stderr) = child.stderr.take() {
            let running = self.running.clone();
            let handle = thread::spawn(move || monitor_stderr(stderr, running));
            *self.monitor_handle.lock().unwrap() = Some(handle);
        }

        *self.child.lock().unwrap() = Some(child);

        thread::sleep(STARTUP_WARMUP);
        self.is_running()
    }

    /// Idempotent. Sends SIGTERM, waits up to 5 s, SIGKILLs if still alive.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let mut guard = self.child.lock().unwrap();
        if let Some(mut child) = guard.take() {
            terminate_gracefully(&mut child);
        }
        drop(guard);

        if let Some(handle) = self.monitor_handle.lock().unwrap().take() {
            let _ = join_with_timeout(handle, MONITOR_JOIN_TIMEOUT);
        }
    }

    pub fn is_running(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        let mut guard = self.child.lock().unwrap();
        match guard.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(_)) | Err(_) => {
                    self.running.store(false, Ordering::SeqCst);
                    false
                }
            },
            None => false,
        }
    }

    /// Ordered list of segments currently on disk, after reclaiming overflow.
    pub fn get_clips(&self) -> Vec<Segment> {
        let re = segment_regex();
        let mut segments = Vec::new();

        if let Ok(entries) = fs::read_dir(&self.buffer_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy().to_string();
                if let Some(caps) = re.captures(&name) {
                    if let Ok(index) = caps[1].parse::<u32>() {
                        let mtime = entry
                            .metadata()
                            .and_then(|m| m.modified())
                            .unwrap_or(SystemTime::UNIX_EPOCH);
                        segments.push(Segment {
                            path: entry.path(),
                            index,
                            mtime,
                        });
                    }
                }
            }
        }

        segments.sort_by_key(|s| s.index);
        self.reclaim_overflow(&mut segments);
        segments
    }

    fn reclaim_overflow(&self, segments: &mut Vec<Segment>) {
        let count = segments.len() as u32;
        let threshold = self.max_segments + self.overflow_margin;

        if count > threshold {
            let to_remove = (count - self.max_segments) as usize;
            for segment in segments.drain(..to_remove) {
                let _ = fs::remove_file(&segment.path);
            }
            if !self.overflow_warned.swap(true, Ordering::SeqCst) {
                warn!(
                    "buffer: overflow reclaimed, {} segments over cap",
                    count - self.max_segments
                );
            }
        } else if count <= self.max_segments {
            self.overflow_warned.store(false, Ordering::SeqCst);
        }
    }

    /// Tail slice of size `ceil(seconds / segment_duration) + 1`, capped at
    /// the list length.
    pub fn get_preroll_clips(&self, seconds: f64) -> Vec<Segment> {
        let clips = self.get_clips();
        if clips.is_empty() {
            return Vec::new();
        }

        let num_clips = (seconds / self.segment_duration).ceil() as usize + 1;
        let num_clips = num_clips.min(clips.len());
        clips[clips.len() - num_clips..].to_vec()
    }

    pub fn get_latest_clip(&self) -> Option<Segment> {
        self.get_clips().into_iter().last()
    }
}

fn monitor_stderr(stderr: impl std::io::Read, running: Arc<AtomicBool>) {
    let reader = BufReader::new(stderr);
    for line in reader.lines() {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        match line {
            Ok(line) => {
                if line.to_lowercase().contains("error") {
                    error!("transcoder: {line}");
                }
            }
            Err(_) => break,
        }
    }
}

fn terminate_gracefully(child: &mut Child) {
    let pid = Pid::from_raw(child.id() as i32);
    if signal::kill(pid, Signal::SIGTERM).is_err() {
        // Process is already gone.
        let _ = child.wait();
        return;
    }

    let deadline = Instant::now() + STOP_GRACE;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {
                if Instant::now() >= deadline {
                    break;
                }
                thread::sleep(Duration::from_millis(100));
            }
            Err(_) => return,
        }
    }

    let _ = signal::kill(pid, Signal::SIGKILL);
    let _ = child.wait();
}

fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> Result<(), JoinHandle<()>> {
    // std::thread has no native joins-with-timeout; stderr monitor threads
    // exit promptly once `running` is cleared and the pipe closes on
    // process exit, so a short sleep-and-check loop is sufficient here.
    let deadline = Instant::now() + timeout;
    if handle.is_finished() {
        let _ = handle.join();
        return Ok(());
    }
    while Instant::now() < deadline {
        if handle.is_finished() {
            let _ = handle.join();
            return Ok(());
        }
        thread::sleep(Duration::from_millis(50));
    }
    Err(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"data").unwrap();
    }

    #[test]
    fn get_clips_orders_by_index_not_name_length() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "clip_0002.ts");
        touch(dir.path(), "clip_0001.ts");
        touch(dir.path(), "clip_0010.ts");

        let buffer = RollingBuffer::new("rtsp://x", dir.path(), 5.0, 100);
        let clips = buffer.get_clips();

        let indices: Vec<u32> = clips.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![1, 2, 10]);
    }

    #[test]
    fn overflow_reclaims_oldest_segments() {
        let dir = tempdir().unwrap();
        for i in 0..20 {
            touch(dir.path(), &format!("clip_{:04}.ts", i));
        }

        // max_segments=10, margin=5 (default) => threshold 15, 20 present.
        let buffer = RollingBuffer::new("rtsp://x", dir.path(), 5.0, 10);
        let clips = buffer.get_clips();

        assert_eq!(clips.len(), 10);
        assert_eq!(clips.first().unwrap().index, 10);
        assert_eq!(clips.last().unwrap().index, 19);
    }

    #[test]
    fn no_overflow_below_threshold() {
        let dir = tempdir().unwrap();
        for i in 0..12 {
            touch(dir.path(), &format!("clip_{:04}.ts", i));
        }

        let buffer = RollingBuffer::new("rtsp://x", dir.path(), 5.0, 10);
        let clips = buffer.get_clips();
        assert_eq!(clips.len(), 12);
    }

    #[test]
    fn preroll_uses_ceiling_plus_one() {
        let dir = tempdir().unwrap();
        for i in 0..20 {
            touch(dir.path(), &format!("clip_{:04}.ts", i));
        }

        let buffer = RollingBuffer::new("rtsp://x", dir.path(), 5.0, 100);
        // 10s / 5s = 2.0 -> ceil 2 + 1 = 3 clips.
        let preroll = buffer.get_preroll_clips(10.0);
        assert_eq!(preroll.len(), 3);
        assert_eq!(preroll.last().unwrap().index, 19);

        // 11s / 5s = 2.2 -> ceil 3 + 1 = 4 clips.
        let preroll = buffer.get_preroll_clips(11.0);
        assert_eq!(preroll.len(), 4);
    }

    #[test]
    fn preroll_on_empty_buffer_is_empty() {
        let dir = tempdir().unwrap();
        let buffer = RollingBuffer::new("rtsp://x", dir.path(), 5.0, 100);
        assert!(buffer.get_preroll_clips(10.0).is_empty());
    }

    #[test]
    fn preroll_caps_at_list_length() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "clip_0000.ts");
        touch(dir.path(), "clip_0001.ts");

        let buffer = RollingBuffer::new("rtsp://x", dir.path(), 5.0, 100);
        let preroll = buffer.get_preroll_clips(1000.0);
        assert_eq!(preroll.len(), 2);
    }

    #[test]
    fn clear_old_clips_only_removes_recognized_patterns() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "clip_0001.ts");
        touch(dir.path(), "stream.m3u8");
        touch(dir.path(), "keep_me.txt");

        let buffer = RollingBuffer::new("rtsp://x", dir.path(), 5.0, 10);
        buffer.clear_old_clips().unwrap();

        assert!(!dir.path().join("clip_0001.ts").exists());
        assert!(!dir.path().join("stream.m3u8").exists());
        assert!(dir.path().join("keep_me.txt").exists());
    }

    #[test]
    fn overflow_warning_reset_is_asymmetric() {
        let dir = tempdir().unwrap();
        for i in 0..20 {
            touch(dir.path(), &format!("clip_{:04}.ts", i));
        }

        let buffer = RollingBuffer::new("rtsp://x", dir.path(), 5.0, 10);
        buffer.get_clips(); // triggers overflow, warns once
        assert!(buffer.overflow_warned.load(Ordering::SeqCst));

        // Now at exactly 10 (== max_segments): reset must fire even though
        // 10 is still > (max_segments - margin); the comparison point is
        // max_segments itself, not the overflow threshold.
        let clips = buffer.get_clips();
        assert_eq!(clips.len(), 10);
        assert!(!buffer.overflow_warned.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_without_start_is_a_harmless_no_op() {
        let dir = tempdir().unwrap();
        let buffer = RollingBuffer::new("rtsp://x", dir.path(), 5.0, 10);
        buffer.stop();
        buffer.stop();
        assert!(!buffer.is_running());
    }
}
