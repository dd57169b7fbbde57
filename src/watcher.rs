//! Dual-sourced directory watcher: a native filesystem-event source
//! (primary) and a 1 s polling scan (fallback), both feeding one
//! deduplicating sink. The sink -- not either source -- decides whether a
//! clip notification is novel.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::warn;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const STABILITY_PAUSE: Duration = Duration::from_millis(100);
const POLL_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

fn segment_regex() -> Regex {
    Regex::new(r"^clip_\d+\.ts$").expect("static regex is valid")
}

type ClipCallback = dyn Fn(PathBuf) + Send + Sync;

struct Sink {
    seen: Mutex<HashSet<String>>,
    callback: Box<ClipCallback>,
}

impl Sink {
    fn notify(&self, path: PathBuf) {
        let name = match path.file_name() {
            Some(n) => n.to_string_lossy().to_string(),
            None => return,
        };
        let mut seen = self.seen.lock().unwrap();
        if seen.contains(&name) {
            return;
        }
        seen.insert(name);
        drop(seen);
        (self.callback)(path);
    }

    fn has_seen(&self, name: &str) -> bool {
        self.seen.lock().unwrap().contains(name)
    }
}

pub struct BufferWatcher {
    running: Arc<AtomicBool>,
    native: Option<RecommendedWatcher>,
    poll_handle: Option<JoinHandle<()>>,
}

impl BufferWatcher {
    pub fn start(
        buffer_dir: impl Into<PathBuf>,
        on_new_clip: impl Fn(PathBuf) + Send + Sync + 'static,
    ) -> Self {
        let buffer_dir = buffer_dir.into();
        let sink = Arc::new(Sink {
            seen: Mutex::new(HashSet::new()),
            callback: Box::new(on_new_clip),
        });
        let running = Arc::new(AtomicBool::new(true));

        let native = {
            let sink = sink.clone();
            let re = segment_regex();
            let mut watcher = match notify::recommended_watcher(move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("buffer watcher: native source error: {e}");
                        return;
                    }
                };
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    return;
                }
                for path in event.paths {
                    if let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) {
                        if re.is_match(&name) {
                            sink.notify(path);
                        }
                    }
                }
            }) {
                Ok(w) => w,
                Err(e) => {
                    warn!("buffer watcher: failed to start native source: {e}");
                    return BufferWatcher::poll_only(buffer_dir, sink, running);
                }
            };

            if let Err(e) = watcher.watch(&buffer_dir, RecursiveMode::NonRecursive) {
                warn!("buffer watcher: failed to watch {}: {e}", buffer_dir.display());
            }
            Some(watcher)
        };

        let poll_handle = spawn_poller(buffer_dir, sink, running.clone());

        BufferWatcher {
            running,
            native,
            poll_handle: Some(poll_handle),
        }
    }

    fn poll_only(buffer_dir: PathBuf, sink: Arc<Sink>, running: Arc<AtomicBool>) -> Self {
        let poll_handle = spawn_poller(buffer_dir, sink, running.clone());
        BufferWatcher {
            running,
            native: None,
            poll_handle: Some(poll_handle),
        }
    }

    /// Idempotent. Stops the native source, then bounds the poller join.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.native = None; // dropping the watcher unregisters it

        if let Some(handle) = self.poll_handle.take() {
            let deadline = Instant::now() + POLL_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(50));
            }
            let _ = handle.join();
        }
    }
}

impl Drop for BufferWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_poller(buffer_dir: PathBuf, sink: Arc<Sink>, running: Arc<AtomicBool>) -> JoinHandle<()> {
    thread::spawn(move || {
        let re = segment_regex();
        while running.load(Ordering::SeqCst) {
            if let Ok(entries) = fs::read_dir(&buffer_dir) {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if !re.is_match(&name) || sink.has_seen(&name) {
                        continue;
                    }
                    if is_stable(&entry.path()) {
                        sink.notify(entry.path());
                    }
                }
            }

            let step = Duration::from_millis(100);
            let mut waited = Duration::ZERO;
            while waited < POLL_INTERVAL && running.load(Ordering::SeqCst) {
                thread::sleep(step);
                waited += step;
            }
        }
    })
}

/// Reads the file size twice, 100 ms apart; accepts only if both readings
/// agree and are positive. Guards against copying a segment mid-flush.
fn is_stable(path: &Path) -> bool {
    let first = match fs::metadata(path) {
        Ok(m) => m.len(),
        Err(_) => return false,
    };
    if first == 0 {
        return false;
    }
    thread::sleep(STABILITY_PAUSE);
    let second = match fs::metadata(path) {
        Ok(m) => m.len(),
        Err(_) => return false,
    };
    first == second && second > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::tempdir;

    #[test]
    fn polling_source_skips_zero_byte_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("clip_0000.ts"), b"").unwrap();
        assert!(!is_stable(&dir.path().join("clip_0000.ts")));
    }

    #[test]
    fn polling_source_accepts_stable_nonempty_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("clip_0000.ts"), b"data").unwrap();
        assert!(is_stable(&dir.path().join("clip_0000.ts")));
    }

    #[test]
    fn sink_dedups_same_name_notified_twice() {
        let (tx, rx) = mpsc::channel();
        let sink = Sink {
            seen: Mutex::new(HashSet::new()),
            callback: Box::new(move |p: PathBuf| {
                tx.send(p).unwrap();
            }),
        };

        sink.notify(PathBuf::from("/tmp/clip_0001.ts"));
        sink.notify(PathBuf::from("/tmp/clip_0001.ts"));

        let received: Vec<_> = rx.try_iter().collect();
        assert_eq!(received.len(), 1);
    }

    #[test]
    fn watcher_picks_up_files_written_after_start_via_polling() {
        let dir = tempdir().unwrap();
        let (tx, rx) = mpsc::channel();

        let mut watcher = BufferWatcher::start(dir.path().to_path_buf(), move |p| {
            tx.send(p).unwrap();
        });

        fs::write(dir.path().join("clip_0000.ts"), b"segment-data").unwrap();

        let received = rx.recv_timeout(Duration::from_secs(3));
        watcher.stop();

        assert!(received.is_ok(), "expected a clip notification within 3s");
    }

    #[test]
    fn stop_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut watcher = BufferWatcher::start(dir.path().to_path_buf(), |_| {});
        watcher.stop();
        watcher.stop();
    }
}
