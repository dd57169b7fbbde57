//! Default [`FrameSource`] implementation: decodes the detection substream
//! by piping it through ffmpeg into raw BGR frames. The decode itself is
//! outside the specified core (only the `(ok, frame)` pull contract is); this
//! is the thinnest concrete thing that satisfies that contract so the
//! supervisor has something to run against.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::io::Read;
use std::process::{Child, Command, Stdio};

use log::warn;

use crate::frame::Frame;
use crate::process::FrameSource;

pub struct FfmpegFrameSource {
    rtsp_url: String,
    width: usize,
    height: usize,
    child: Option<Child>,
}

impl FfmpegFrameSource {
    pub fn new(rtsp_url: impl Into<String>, width: usize, height: usize) -> Self {
        FfmpegFrameSource {
            rtsp_url: rtsp_url.into(),
            width,
            height,
            child: None,
        }
    }

    fn spawn(&mut self) -> bool {
        let size = format!("{}x{}", self.width, self.height);
        let child = Command::new("ffmpeg")
            .arg("-rtsp_transport")
            .arg("tcp")
            .arg("-i")
            .arg(&self.rtsp_url)
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-s")
            .arg(size)
            .arg("-")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();

        match child {
            Ok(c) => {
                self.child = Some(c);
                true
            }
            Err(e) => {
                warn!("decoder: failed to launch: {e}");
                false
            }
        }
    }
}

impl FrameSource for FfmpegFrameSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, ()> {
        let child = match self.child.as_mut() {
            Some(c) => c,
            None => return Err(()),
        };
        let stdout = match child.stdout.as_mut() {
            Some(s) => s,
            None => return Err(()),
        };

        let mut buf = vec![0u8; self.width * self.height * 3];
        match stdout.read_exact(&mut buf) {
            Ok(()) => Ok(Some(Frame::new(self.width, self.height, buf))),
            Err(_) => Err(()),
        }
    }

    fn reconnect(&mut self) -> bool {
        self.release();
        self.spawn()
    }

    fn release(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for FfmpegFrameSource {
    fn drop(&mut self) {
        self.release();
    }
}
