//! Turns a stream of BGR frames into a stable sequence of [`DetectionResult`]s:
//! background-subtraction motion detection with smoothing and hysteresis,
//! plus a brightness-jump detector.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::VecDeque;

use ndarray::parallel::prelude::*;
use ndarray::{Array2, Zip};

use crate::frame::Frame;

pub const SMOOTHING_WINDOW: usize = 15;
pub const HYSTERESIS_FRAMES: u32 = 30;

const BACKGROUND_HISTORY: f32 = 500.0;
const VARIANCE_THRESHOLD: f32 = 16.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionResult {
    pub motion_detected: bool,
    pub light_event_detected: bool,
    pub motion_score: f32,
    pub smoothed_motion_score: f32,
    pub brightness: f32,
    pub brightness_delta: f32,
}

/// Per-pixel adaptive Gaussian background model. No bound computer-vision
/// library exists for this; the update is a plain ndarray/rayon pass
/// (history-derived learning rate, Mahalanobis-style classification against
/// the per-pixel adaptive `variance` scaled by `VARIANCE_THRESHOLD`),
/// mirroring what OpenCV's MOG2 exposes as knobs.
struct BackgroundModel {
    mean: Option<Array2<f32>>,
    variance: Array2<f32>,
    alpha: f32,
}

/// Floor on the per-pixel variance so a pixel that has been motionless for
/// a long time can't decay toward zero and become pathologically sensitive
/// to the next frame's rounding noise.
const VARIANCE_FLOOR: f32 = 4.0;

impl BackgroundModel {
    fn new(height: usize, width: usize) -> Self {
        BackgroundModel {
            mean: None,
            variance: Array2::from_elem((height, width), VARIANCE_THRESHOLD),
            alpha: 1.0 / BACKGROUND_HISTORY,
        }
    }

    /// Returns the foreground mask for this frame and updates the model.
    fn apply(&mut self, gray: &Array2<f32>) -> Array2<bool> {
        let mean = self
            .mean
            .get_or_insert_with(|| gray.clone());

        let mut foreground = Array2::from_elem(gray.raw_dim(), false);
        let alpha = self.alpha;

        Zip::from(mean)
            .and(&mut self.variance)
            .and(gray)
            .and(&mut foreground)
            .par_for_each(|m, v, &g, f| {
                let diff = g - *m;
                let dist2 = diff * diff;
                *f = dist2 > VARIANCE_THRESHOLD * *v;
                *m += alpha * diff;
                *v = (*v + alpha * (dist2 - *v)).max(VARIANCE_FLOOR);
            });

        foreground
    }

    fn reset(&mut self, height: usize, width: usize) {
        self.mean = None;
        self.variance = Array2::from_elem((height, width), VARIANCE_THRESHOLD);
    }
}

pub struct Detector {
    pub motion_threshold: f32,
    pub light_jump_threshold: f32,

    background: BackgroundModel,
    smoothing: VecDeque<f32>,
    motion_state: bool,
    low_count: u32,
    last_brightness: Option<f32>,
    dims: (usize, usize),
}

impl Detector {
    pub fn new(motion_threshold: f32, light_jump_threshold: f32) -> Self {
        Detector {
            motion_threshold,
            light_jump_threshold,
            background: BackgroundModel::new(1, 1),
            smoothing: VecDeque::with_capacity(SMOOTHING_WINDOW),
            motion_state: false,
            low_count: 0,
            last_brightness: None,
            dims: (1, 1),
        }
    }

    pub fn default_thresholds() -> Self {
        Detector::new(0.02, 30.0)
    }

    pub fn analyze_frame(&mut self, frame: &Frame) -> DetectionResult {
        if self.dims != (frame.height, frame.width) {
            self.dims = (frame.height, frame.width);
            self.background = BackgroundModel::new(frame.height, frame.width);
        }

        let gray = to_luminance(frame);

        let foreground = self.background.apply(&gray);
        let total_pixels = (frame.width * frame.height) as f32;
        let nonzero = foreground.iter().filter(|&&f| f).count() as f32;
        let raw_motion_score = nonzero / total_pixels;

        if self.smoothing.len() == SMOOTHING_WINDOW {
            self.smoothing.pop_front();
        }
        self.smoothing.push_back(raw_motion_score);
        let smoothed_motion_score =
            self.smoothing.iter().sum::<f32>() / self.smoothing.len() as f32;

        if smoothed_motion_score > self.motion_threshold {
            self.motion_state = true;
            self.low_count = 0;
        } else if self.motion_state {
            self.low_count += 1;
            if self.low_count >= HYSTERESIS_FRAMES {
                self.motion_state = false;
            }
        }

        let brightness = gray.mean().unwrap_or(0.0);
        let brightness_delta = match self.last_brightness {
            Some(last) => (brightness - last).abs(),
            None => 0.0,
        };
        let light_event_detected = brightness_delta > self.light_jump_threshold;
        self.last_brightness = Some(brightness);

        DetectionResult {
            motion_detected: self.motion_state,
            light_event_detected,
            motion_score: raw_motion_score,
            smoothed_motion_score,
            brightness,
            brightness_delta,
        }
    }

    /// Recreates the background model and clears all derived state. Needed
    /// after a stream reconnect so the first post-reconnect frame can't look
    /// like a motion spike against a stale model.
    pub fn reset(&mut self) {
        self.background.reset(self.dims.0, self.dims.1);
        self.smoothing.clear();
        self.motion_state = false;
        self.low_count = 0;
        self.last_brightness = None;
    }
}

fn to_luminance(frame: &Frame) -> Array2<f32> {
    let mut gray = Array2::<f32>::zeros((frame.height, frame.width));
    for y in 0..frame.height {
        for x in 0..frame.width {
            let idx = (y * frame.width + x) * 3;
            let b = frame.bgr[idx] as f32;
            let g = frame.bgr[idx + 1] as f32;
            let r = frame.bgr[idx + 2] as f32;
            gray[[y, x]] = 0.114 * b + 0.587 * g + 0.299 * r;
        }
    }
    gray
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: usize = 640;
    const H: usize = 480;

    fn sample_frame() -> Frame {
        Frame::solid(W, H, 50, 100, 150)
    }

    fn motion_frame() -> Frame {
        let mut f = sample_frame();
        for y in 100..300 {
            for x in 200..400 {
                let idx = (y * W + x) * 3;
                f.bgr[idx] = 255;
                f.bgr[idx + 1] = 255;
                f.bgr[idx + 2] = 255;
            }
        }
        f
    }

    fn varied_motion_frame() -> Frame {
        let mut f = motion_frame();
        for y in 100..200 {
            for x in 100..200 {
                let idx = (y * W + x) * 3;
                f.bgr[idx] = 128;
                f.bgr[idx + 1] = 128;
                f.bgr[idx + 2] = 128;
            }
        }
        f
    }

    fn dark_frame() -> Frame {
        Frame::solid(W, H, 30, 30, 30)
    }

    fn bright_frame() -> Frame {
        Frame::solid(W, H, 200, 200, 200)
    }

    #[test]
    fn no_motion_on_static_frames() {
        let mut detector = Detector::default_thresholds();
        let frame = sample_frame();
        for _ in 0..30 {
            detector.analyze_frame(&frame);
        }
        let result = detector.analyze_frame(&frame);
        assert!(result.motion_score <= detector.motion_threshold);
        assert!(!result.motion_detected);
    }

    #[test]
    fn s5_single_differing_frame_does_not_flip_motion_detected() {
        let mut detector = Detector::default_thresholds();
        let base = sample_frame();
        for _ in 0..30 {
            detector.analyze_frame(&base);
        }

        let spike = motion_frame();
        let result = detector.analyze_frame(&spike);
        assert!(result.motion_score > 0.0);
        assert!(!result.motion_detected);

        let result = detector.analyze_frame(&base);
        assert!(!result.motion_detected);
    }

    #[test]
    fn motion_detected_on_sustained_changed_frames() {
        let mut detector = Detector::default_thresholds();
        let base = sample_frame();
        for _ in 0..30 {
            detector.analyze_frame(&base);
        }

        let a = motion_frame();
        let b = varied_motion_frame();

        let mut detected = false;
        for i in 0..(SMOOTHING_WINDOW * 2) {
            let frame = if i % 2 == 0 { &a } else { &b };
            let result = detector.analyze_frame(frame);
            if result.motion_detected {
                detected = true;
            }
        }
        assert!(detected);
    }

    #[test]
    fn motion_threshold_boundary_high_vs_low() {
        let base = Frame::solid(W, H, 50, 100, 150);
        let mut small_motion = base.clone();
        for y in 100..148 {
            for x in 100..164 {
                let idx = (y * W + x) * 3;
                small_motion.bgr[idx] = 255;
                small_motion.bgr[idx + 1] = 255;
                small_motion.bgr[idx + 2] = 255;
            }
        }
        let mut small_motion_alt = base.clone();
        for y in 100..148 {
            for x in 100..164 {
                let idx = (y * W + x) * 3;
                small_motion_alt.bgr[idx] = 200;
                small_motion_alt.bgr[idx + 1] = 200;
                small_motion_alt.bgr[idx + 2] = 200;
            }
        }

        let mut high = Detector::new(0.05, 30.0);
        for _ in 0..30 {
            high.analyze_frame(&base);
        }
        let mut result = DetectionResult {
            motion_detected: false,
            light_event_detected: false,
            motion_score: 0.0,
            smoothed_motion_score: 0.0,
            brightness: 0.0,
            brightness_delta: 0.0,
        };
        for i in 0..(SMOOTHING_WINDOW * 2) {
            let frame = if i % 2 == 0 { &small_motion } else { &small_motion_alt };
            result = high.analyze_frame(frame);
        }
        assert!(result.smoothed_motion_score < 0.05);

        let mut low = Detector::new(0.005, 30.0);
        for _ in 0..30 {
            low.analyze_frame(&base);
        }
        let mut detected_low = false;
        for i in 0..(SMOOTHING_WINDOW * 2) {
            let frame = if i % 2 == 0 { &small_motion } else { &small_motion_alt };
            let result = low.analyze_frame(frame);
            if result.motion_detected {
                detected_low = true;
            }
        }
        assert!(detected_low);
    }

    #[test]
    fn hysteresis_holds_motion_for_configured_frame_count() {
        let mut detector = Detector::new(0.01, 30.0);
        let base = sample_frame();
        for _ in 0..30 {
            detector.analyze_frame(&base);
        }
        let motion = motion_frame();
        for _ in 0..(SMOOTHING_WINDOW + 5) {
            detector.analyze_frame(&motion);
        }
        assert!(detector.analyze_frame(&motion).motion_detected);

        for i in 0..(HYSTERESIS_FRAMES - 1) {
            let result = detector.analyze_frame(&base);
            assert!(result.motion_detected, "motion cleared too early at frame {i}");
        }

        let mut result = detector.analyze_frame(&base);
        for _ in 0..SMOOTHING_WINDOW {
            result = detector.analyze_frame(&base);
        }
        assert!(!result.motion_detected);
    }

    #[test]
    fn s6_light_event_on_brightness_jump_then_clears() {
        let mut detector = Detector::new(0.02, 30.0);
        detector.analyze_frame(&dark_frame());
        let result = detector.analyze_frame(&bright_frame());
        assert!(result.light_event_detected);
        assert!((result.brightness_delta - 170.0).abs() < 1.0);

        let result = detector.analyze_frame(&bright_frame());
        assert!(!result.light_event_detected);
        assert_eq!(result.brightness_delta, 0.0);
    }

    #[test]
    fn gradual_brightness_ramp_never_triggers_light_event() {
        let mut detector = Detector::new(0.02, 30.0);
        let mut brightness = 0u8;
        loop {
            let frame = Frame::solid(W, H, brightness, brightness, brightness);
            let result = detector.analyze_frame(&frame);
            assert!(!result.light_event_detected);
            if brightness >= 250 {
                break;
            }
            brightness = brightness.saturating_add(5);
        }
    }

    #[test]
    fn reset_clears_brightness_memory_and_background() {
        let mut detector = Detector::default_thresholds();
        let base = sample_frame();
        for _ in 0..30 {
            detector.analyze_frame(&base);
        }
        detector.reset();

        let result = detector.analyze_frame(&base);
        assert_eq!(result.brightness_delta, 0.0);
    }
}
