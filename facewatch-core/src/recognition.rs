//! The capture -> extract -> track -> match -> publish cycle.

use crate::capture::{CaptureSource, Frame};
use crate::config::Config;
use crate::extract::{Detection, FaceExtractor};
use crate::gallery::{identity_key, Gallery};
use crate::matcher::{MatchOutcome, Matcher};
use crate::results::{MatchResult, ResultChannel};
use crate::track::{TrackId, TrackTable, TrackerSettings};
use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub tracker: TrackerSettings,
    pub match_threshold: f32,
    /// Process every Nth frame read
    pub frame_stride: u32,
    pub retry_delay: Duration,
    pub idle_sleep: Duration,
    pub gallery_path: PathBuf,
    /// Where to write crops of published faces, if anywhere
    pub faces_dir: Option<PathBuf>,
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tracker: TrackerSettings::live(&config.tracking),
            match_threshold: config.matching.threshold,
            frame_stride: config.recognition.frame_stride.max(1),
            retry_delay: Duration::from_millis(config.camera.retry_delay_ms),
            idle_sleep: Duration::from_millis(config.recognition.idle_sleep_ms),
            gallery_path: config.storage.gallery_path.clone(),
            faces_dir: config
                .results
                .save_faces
                .then(|| config.storage.detected_dir.clone()),
        }
    }
}

/// Match outcome for one live track in one frame
#[derive(Debug, Clone)]
pub struct TrackMatch {
    pub track_id: TrackId,
    pub age: u32,
    pub outcome: MatchOutcome,
    pub detection: Detection,
}

/// Processed-frame rate, reported every 10 frames
struct FpsMeter {
    frames: u32,
    since: Instant,
}

impl FpsMeter {
    fn new() -> Self {
        Self {
            frames: 0,
            since: Instant::now(),
        }
    }

    fn tick(&mut self) -> Option<f32> {
        self.frames += 1;
        if self.frames < 10 {
            return None;
        }
        let elapsed = self.since.elapsed().as_secs_f32();
        let fps = if elapsed > 0.0 {
            self.frames as f32 / elapsed
        } else {
            0.0
        };
        *self = Self::new();
        Some(fps)
    }
}

pub struct RecognitionLoop {
    source: Box<dyn CaptureSource>,
    extractor: Box<dyn FaceExtractor>,
    gallery: Gallery,
    tracker: TrackTable,
    matcher: Matcher,
    settings: LoopSettings,
}

impl RecognitionLoop {
    pub fn new(
        source: Box<dyn CaptureSource>,
        extractor: Box<dyn FaceExtractor>,
        gallery: Gallery,
        settings: LoopSettings,
    ) -> Self {
        Self {
            source,
            extractor,
            gallery,
            tracker: TrackTable::new(settings.tracker),
            matcher: Matcher::new(settings.match_threshold),
            settings,
        }
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    /// Read one frame. Failures are logged, followed by the retry delay.
    pub fn next_frame(&mut self) -> Option<Frame> {
        match self.source.read() {
            Ok(frame) => Some(frame),
            Err(e) => {
                log::error!("Failed to grab frame from {}: {}", self.source.describe(), e);
                std::thread::sleep(self.settings.retry_delay);
                None
            }
        }
    }

    /// Run detection, tracking and matching on one frame. Returns one entry
    /// per live track, including tracks not seen in this frame.
    pub fn process(&mut self, frame: &Frame) -> Vec<TrackMatch> {
        let detections = match self.extractor.extract(frame) {
            Ok(detections) => detections,
            Err(e) => {
                log::warn!("Face extraction failed: {}", e);
                Vec::new()
            }
        };

        let tracks = self.tracker.update(detections);
        tracks
            .values()
            .map(|track| TrackMatch {
                track_id: track.id(),
                age: track.age(),
                outcome: self.matcher.best_match(track.embedding(), &self.gallery),
                detection: track.detection().clone(),
            })
            .collect()
    }

    /// Loop until `keep_running` returns false. The flag is polled before
    /// each read and again before publishing, so a stop request lets the
    /// current frame finish but publishes nothing from it. The source is
    /// released on exit.
    pub fn run<F>(mut self, results: &ResultChannel, keep_running: F)
    where
        F: Fn() -> bool,
    {
        log::info!("Recognition loop started on {}", self.source.describe());
        self.gallery.log_summary();

        let stride = u64::from(self.settings.frame_stride.max(1));
        let mut frames_read: u64 = 0;
        let mut fps = FpsMeter::new();

        while keep_running() {
            let Some(frame) = self.next_frame() else {
                continue;
            };

            frames_read += 1;
            if frames_read % stride != 0 {
                continue;
            }

            if let Some(rate) = fps.tick() {
                log::debug!("Processing {:.1} frames/s", rate);
            }

            let matches = self.process(&frame);
            if !keep_running() {
                break;
            }
            for track_match in matches {
                if track_match.outcome.label.is_known() {
                    self.publish(results, track_match);
                }
            }

            if !self.settings.idle_sleep.is_zero() {
                std::thread::sleep(self.settings.idle_sleep);
            }
        }

        self.source.release();
        log::info!("Recognition loop stopped");
    }

    fn publish(&self, results: &ResultChannel, track_match: TrackMatch) {
        let name = track_match.outcome.label.name().to_string();
        if results.is_repeat(&name) {
            return;
        }

        let timestamp = Utc::now();
        let image_path = self.settings.faces_dir.as_ref().and_then(|dir| {
            let crop = track_match.detection.face_image()?;
            let path = dir.join(format!(
                "{}_{}.jpg",
                identity_key(&name),
                timestamp.format("%Y%m%d_%H%M%S%3f")
            ));
            let saved = fs::create_dir_all(dir)
                .map_err(|e| e.to_string())
                .and_then(|_| crop.save(&path).map_err(|e| e.to_string()));
            match saved {
                Ok(()) => Some(path),
                Err(e) => {
                    log::warn!("Failed to save face crop {}: {}", path.display(), e);
                    None
                }
            }
        });

        results.publish(MatchResult {
            name,
            score: track_match.outcome.score,
            timestamp,
            track_id: track_match.track_id,
            detection: track_match.detection,
            image_path,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::Sample;
    use crate::matcher::Label;
    use crate::testing::{face, loop_settings as settings, FakeExtractor, FakeSource};
    use std::cell::Cell;
    use std::sync::atomic::Ordering;

    fn alice_gallery() -> Gallery {
        let mut gallery = Gallery::new();
        gallery
            .enroll(
                "Alice",
                vec![Sample {
                    embedding: crate::embedding::from_vec(vec![1.0, 0.0, 0.0]),
                    captured_at: Utc::now(),
                }],
                vec![],
            )
            .unwrap();
        gallery
    }

    /// keep_running that allows exactly `n` iterations
    fn iterations(n: usize) -> impl Fn() -> bool {
        let left = Cell::new(n);
        move || {
            let n = left.get();
            left.set(n.saturating_sub(1));
            n > 0
        }
    }

    #[test]
    fn test_process_labels_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let mut recognition = RecognitionLoop::new(
            Box::new(FakeSource::frames(1)),
            Box::new(FakeExtractor::repeat(vec![
                face(vec![1.0, 0.05, 0.0]),
                face(vec![0.0, 0.0, 1.0]),
            ])),
            alice_gallery(),
            settings(dir.path()),
        );

        let frame = recognition.next_frame().unwrap();
        let matches = recognition.process(&frame);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].outcome.label, Label::Known("Alice".to_string()));
        assert_eq!(matches[1].outcome.label, Label::Unknown);
    }

    #[test]
    fn test_run_publishes_known_faces_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::frames(0);
        let released = source.release_flag();
        let recognition = RecognitionLoop::new(
            Box::new(source),
            Box::new(FakeExtractor::repeat(vec![
                face(vec![1.0, 0.0, 0.0]),
                face(vec![0.0, 1.0, 0.0]),
            ])),
            alice_gallery(),
            settings(dir.path()),
        );

        let results = ResultChannel::new(10);
        recognition.run(&results, iterations(20));

        assert!(released.load(Ordering::SeqCst));
        assert_eq!(results.len(), 1);
        let result = results.try_take().unwrap();
        assert_eq!(result.name, "Alice");
        assert!((result.score - 1.0).abs() < 1e-5);
        assert!(result.image_path.is_none());
    }

    #[test]
    fn test_run_skips_failed_reads_and_strided_frames() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::reads(vec![false, true, false, true, true, true]);
        let reads = source.read_counter();
        let extractor = FakeExtractor::repeat(vec![]);
        let calls = extractor.call_counter();

        let mut s = settings(dir.path());
        s.frame_stride = 2;
        let recognition = RecognitionLoop::new(Box::new(source), Box::new(extractor), Gallery::new(), s);
        recognition.run(&ResultChannel::new(10), iterations(6));

        // 6 reads, 4 frames, every second one processed
        assert_eq!(reads.load(Ordering::SeqCst), 6);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_run_saves_published_crops() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings(dir.path());
        s.faces_dir = Some(dir.path().join("detected"));

        let recognition = RecognitionLoop::new(
            Box::new(FakeSource::frames(0)),
            Box::new(FakeExtractor::repeat(vec![face(vec![1.0, 0.0, 0.0])])),
            alice_gallery(),
            s,
        );
        let results = ResultChannel::new(10);
        recognition.run(&results, iterations(3));

        let result = results.try_take().unwrap();
        let path = result.image_path.unwrap();
        assert!(path.exists());
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("alice_"));
    }

    #[test]
    fn test_fps_meter_reports_every_ten() {
        let mut meter = FpsMeter::new();
        for _ in 0..9 {
            assert!(meter.tick().is_none());
        }
        assert!(meter.tick().is_some());
        assert!(meter.tick().is_none());
    }
}
