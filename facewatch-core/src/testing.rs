//! Scripted stand-ins for the camera and the face extractor.

use crate::backend::Backend;
use crate::capture::{CaptureError, CaptureSource, Frame};
use crate::embedding::from_vec;
use crate::extract::{BoundingBox, Detection, ExtractError, FaceExtractor};
use crate::recognition::LoopSettings;
use crate::track::TrackerSettings;
use crate::Error;
use image::{Rgb, RgbImage};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A detection with the given (normalized) embedding and a 20x20 box
pub fn face(values: Vec<f32>) -> Detection {
    Detection {
        bbox: BoundingBox::new(20, 20, 40, 40),
        embedding: from_vec(values),
        confidence: 0.95,
        frame: blank_frame(),
    }
}

pub fn blank_frame() -> Frame {
    Arc::new(RgbImage::from_pixel(64, 64, Rgb([128, 128, 128])))
}

/// Loop settings with no pacing, every frame processed and no crops saved
pub fn loop_settings(dir: &Path) -> LoopSettings {
    LoopSettings {
        tracker: TrackerSettings::default(),
        match_threshold: 0.5,
        frame_stride: 1,
        retry_delay: Duration::from_millis(1),
        idle_sleep: Duration::from_millis(1),
        gallery_path: dir.join("faces.bin"),
        faces_dir: None,
    }
}

/// Source that follows a script of successful (`true`) and failed reads,
/// then keeps succeeding once the script runs out
pub struct FakeSource {
    script: VecDeque<bool>,
    delay: Duration,
    reads: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
    /// Count of sources currently open, dropped by one on release
    live: Option<Arc<AtomicUsize>>,
}

impl FakeSource {
    pub fn reads(script: Vec<bool>) -> Self {
        Self {
            script: script.into(),
            delay: Duration::ZERO,
            reads: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicBool::new(false)),
            live: None,
        }
    }

    pub fn frames(count: usize) -> Self {
        Self::reads(vec![true; count])
    }

    pub fn read_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.reads)
    }

    pub fn release_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.released)
    }
}

impl CaptureSource for FakeSource {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        match self.script.pop_front() {
            Some(false) => Err(CaptureError::Read("scripted failure".to_string())),
            _ => Ok(blank_frame()),
        }
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
        if let Some(live) = self.live.take() {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn describe(&self) -> String {
        "fake source".to_string()
    }
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// Extractor returning scripted detections, re-homed onto the given frame
pub struct FakeExtractor {
    script: VecDeque<Vec<Detection>>,
    fallback: Vec<Detection>,
    calls: Arc<AtomicUsize>,
}

impl FakeExtractor {
    /// Same detections on every call
    pub fn repeat(detections: Vec<Detection>) -> Self {
        Self {
            script: VecDeque::new(),
            fallback: detections,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// One entry per call, then no faces
    pub fn script(frames: Vec<Vec<Detection>>) -> Self {
        Self {
            script: frames.into(),
            fallback: Vec::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl FaceExtractor for FakeExtractor {
    fn extract(&mut self, frame: &Frame) -> Result<Vec<Detection>, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let detections = self
            .script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Ok(detections
            .into_iter()
            .map(|mut d| {
                d.frame = frame.clone();
                d
            })
            .collect())
    }
}

/// Backend handing out endless fake sources and a repeating fake extractor.
/// Every source it opens shares the same read counter and release flag.
pub struct FakeBackend {
    detections: Vec<Detection>,
    source_fails: bool,
    read_delay: Duration,
    reads: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
    opened: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    peak_live: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            source_fails: false,
            read_delay: Duration::ZERO,
            reads: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicBool::new(false)),
            opened: Arc::new(AtomicUsize::new(0)),
            live: Arc::new(AtomicUsize::new(0)),
            peak_live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sources that block for `delay` on every read
    pub fn slow(detections: Vec<Detection>, delay: Duration) -> Self {
        Self {
            read_delay: delay,
            ..Self::new(detections)
        }
    }

    /// A backend whose source never opens
    pub fn unavailable() -> Self {
        Self {
            source_fails: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn read_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.reads)
    }

    pub fn release_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.released)
    }

    pub fn open_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.opened)
    }

    /// Most sources ever open at the same time
    pub fn peak_open_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.peak_live)
    }
}

impl Backend for FakeBackend {
    fn open_source(&self) -> Result<Box<dyn CaptureSource>, Error> {
        if self.source_fails {
            return Err(CaptureError::Open("fake device".to_string()).into());
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_live.fetch_max(live, Ordering::SeqCst);
        self.released.store(false, Ordering::SeqCst);
        Ok(Box::new(FakeSource {
            script: VecDeque::new(),
            delay: self.read_delay,
            reads: Arc::clone(&self.reads),
            released: Arc::clone(&self.released),
            live: Some(Arc::clone(&self.live)),
        }))
    }

    fn load_extractor(&self) -> Result<Box<dyn FaceExtractor>, Error> {
        Ok(Box::new(FakeExtractor::repeat(self.detections.clone())))
    }
}
