//! Entry point for applications: enrollment, gallery management and the
//! recognition lifecycle behind one handle.

use crate::annotate;
use crate::backend::{Backend, OnnxBackend};
use crate::capture::{CaptureError, CaptureSource, StillImage};
use crate::config::Config;
use crate::controller::RecognitionController;
use crate::enroll::{self, Enrollment, EnrollmentResult, EnrollmentSettings};
use crate::extract::FaceExtractor;
use crate::gallery::{identity_key, Gallery, GalleryError, Identity, IdentitySummary};
use crate::recognition::{LoopSettings, RecognitionLoop};
use crate::results::MatchResult;
use crate::track::{TrackId, TrackerSettings};
use crate::Error;
use chrono::{DateTime, Utc};
use image::ImageFormat;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Consecutive failed reads after which a preview gives up
const PREVIEW_READ_ATTEMPTS: u32 = 50;

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub running: bool,
    pub identities: usize,
    pub pending_results: usize,
}

/// A recognition result ready to hand to a client
#[derive(Debug, Clone)]
pub struct RecognizedFace {
    pub name: String,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
    pub track_id: TrackId,
    /// JPEG of the face crop
    pub image: Option<Vec<u8>>,
    pub image_path: Option<PathBuf>,
}

impl From<MatchResult> for RecognizedFace {
    fn from(result: MatchResult) -> Self {
        Self {
            image: result.face_jpeg(),
            name: result.name,
            confidence: result.score,
            timestamp: result.timestamp,
            track_id: result.track_id,
            image_path: result.image_path,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreviewSummary {
    pub frames: u64,
    pub saved: Vec<PathBuf>,
    pub recognized: BTreeSet<String>,
}

pub struct FaceWatch {
    config: Config,
    backend: Arc<dyn Backend>,
    controller: RecognitionController,
    /// Held across load-modify-save of the gallery file
    gallery_lock: Mutex<()>,
}

impl FaceWatch {
    /// Camera and ONNX models as described by `config`
    pub fn new(config: Config) -> Self {
        let config = config.expanded();
        let backend = Arc::new(OnnxBackend::new(config.clone()));
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: Config, backend: Arc<dyn Backend>) -> Self {
        let config = config.expanded();
        let controller = RecognitionController::new(
            Arc::clone(&backend),
            LoopSettings::from_config(&config),
            config.results.capacity,
        );
        Self {
            config,
            backend,
            controller,
            gallery_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    pub fn status(&self) -> Result<Status, Error> {
        let gallery = Gallery::load(&self.config.storage.gallery_path)?;
        Ok(Status {
            running: self.controller.is_running(),
            identities: gallery.len(),
            pending_results: self.controller.results().len(),
        })
    }

    /// Enroll `name` from the camera. Refused while recognition is running;
    /// a `start` issued meanwhile waits for the enrollment to finish.
    pub fn enroll(&self, name: &str) -> EnrollmentResult {
        self.try_enroll(name).into()
    }

    pub fn try_enroll(&self, name: &str) -> Result<Enrollment, Error> {
        self.controller.while_idle(|| {
            check_name(name)?;
            let mut source = self.backend.open_source()?;
            let mut extractor = self.backend.load_extractor()?;
            let settings = EnrollmentSettings::from_config(&self.config);
            self.enroll_from(name, source.as_mut(), extractor.as_mut(), &settings)
        })
    }

    /// Enroll `name` from one encoded image (JPEG, PNG, ...)
    pub fn enroll_image(&self, name: &str, image: &[u8]) -> EnrollmentResult {
        self.try_enroll_image(name, image).into()
    }

    pub fn try_enroll_image(&self, name: &str, image: &[u8]) -> Result<Enrollment, Error> {
        self.controller.while_idle(|| {
            check_name(name)?;
            let mut source = StillImage::from_bytes(image)?;
            let mut extractor = self.backend.load_extractor()?;
            let settings = EnrollmentSettings {
                samples: 1,
                interval: Duration::ZERO,
                ..EnrollmentSettings::from_config(&self.config)
            };
            self.enroll_from(name, &mut source, extractor.as_mut(), &settings)
        })
    }

    fn enroll_from(
        &self,
        name: &str,
        source: &mut dyn CaptureSource,
        extractor: &mut dyn FaceExtractor,
        settings: &EnrollmentSettings,
    ) -> Result<Enrollment, Error> {
        let _guard = self.gallery_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = &self.config.storage.gallery_path;
        let mut gallery = Gallery::load(path)?;
        enroll::enroll(name, source, extractor, &mut gallery, path, settings)
    }

    pub fn list_identities(&self) -> Result<Vec<IdentitySummary>, Error> {
        Ok(Gallery::load(&self.config.storage.gallery_path)?.list())
    }

    /// Bytes of the first stored face image for `key`
    pub fn identity_image(&self, key: &str) -> Result<Vec<u8>, Error> {
        let gallery = Gallery::load(&self.config.storage.gallery_path)?;
        let path = gallery.identity_image(key)?;
        Ok(fs::read(path).map_err(GalleryError::from)?)
    }

    /// Delete an identity from the gallery. Its sample images stay on disk.
    pub fn remove_identity(&self, key: &str) -> Result<Identity, Error> {
        let _guard = self.gallery_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = &self.config.storage.gallery_path;
        let mut gallery = Gallery::load(path)?;
        let removed = gallery.remove(key)?;
        gallery.save(path)?;
        log::info!("Removed {} ({} samples)", removed.display_name, removed.samples.len());
        Ok(removed)
    }

    /// Start background recognition. The gallery is read once at start, so
    /// identities enrolled later need a restart.
    pub fn start(&self) -> Result<(), Error> {
        self.controller.start()
    }

    pub fn stop(&self) -> Result<(), Error> {
        self.controller.stop()
    }

    /// Wait for the recognition thread to wind down after `stop`
    pub fn join(&self) {
        self.controller.join()
    }

    /// Remove and return the oldest pending result
    pub fn take_result(&self) -> Option<RecognizedFace> {
        self.controller.results().try_take().map(RecognizedFace::from)
    }

    pub fn wait_result(&self, timeout: Duration) -> Option<RecognizedFace> {
        self.controller
            .results()
            .take_timeout(timeout)
            .map(RecognizedFace::from)
    }

    /// Newest pending result, without consuming it
    pub fn latest_result(&self) -> Option<RecognizedFace> {
        self.controller.results().peek_latest().map(RecognizedFace::from)
    }

    /// One JPEG frame from the capture source
    pub fn snapshot(&self) -> Result<Vec<u8>, Error> {
        let mut source = self.backend.open_source()?;
        let frame = source.read()?;
        source.release();

        let mut jpeg = Vec::new();
        frame
            .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
            .map_err(|e| Error::Other(format!("Failed to encode snapshot: {}", e)))?;
        Ok(jpeg)
    }

    /// Run `frames` recognition cycles in the foreground with long-lived
    /// tracks, saving every `every`th processed frame with track overlays
    /// into the debug directory.
    pub fn preview(&self, frames: u64, every: u64) -> Result<PreviewSummary, Error> {
        self.controller.while_idle(|| self.run_preview(frames, every))
    }

    fn run_preview(&self, frames: u64, every: u64) -> Result<PreviewSummary, Error> {
        let output_dir = &self.config.debug.output_dir;
        fs::create_dir_all(output_dir).map_err(GalleryError::from)?;

        let settings = LoopSettings {
            tracker: TrackerSettings::preview(&self.config.tracking),
            ..LoopSettings::from_config(&self.config)
        };
        let mut recognition = RecognitionLoop::new(
            self.backend.open_source()?,
            self.backend.load_extractor()?,
            Gallery::load_or_empty(&self.config.storage.gallery_path),
            settings,
        );
        recognition.gallery().log_summary();

        let every = every.max(1);
        let mut summary = PreviewSummary::default();
        let mut failed_reads = 0;
        while summary.frames < frames {
            let Some(frame) = recognition.next_frame() else {
                failed_reads += 1;
                if failed_reads >= PREVIEW_READ_ATTEMPTS {
                    return Err(CaptureError::Read(format!(
                        "{} consecutive reads failed",
                        failed_reads
                    ))
                    .into());
                }
                continue;
            };
            failed_reads = 0;
            let matches = recognition.process(&frame);
            summary.recognized.extend(
                matches
                    .iter()
                    .filter(|m| m.outcome.label.is_known())
                    .map(|m| m.outcome.label.name().to_string()),
            );

            if summary.frames % every == 0 {
                let path = annotate::save_annotated(&frame, &matches, output_dir, summary.frames)
                    .map_err(|e| Error::Other(format!("Failed to save preview frame: {}", e)))?;
                summary.saved.push(path);
            }
            summary.frames += 1;
        }

        log::info!(
            "Preview finished: {} frames, {} saved to {}",
            summary.frames,
            summary.saved.len(),
            output_dir.display()
        );
        Ok(summary)
    }
}

fn check_name(name: &str) -> Result<(), Error> {
    if identity_key(name).is_empty() {
        return Err(Error::InvalidInput("a name is required".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{face, FakeBackend};
    use crate::ErrorKind;
    use image::{Rgb, RgbImage};
    use std::path::Path;
    use std::sync::atomic::Ordering;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.storage.gallery_path = dir.join("faces.bin");
        config.storage.images_dir = dir.join("images");
        config.storage.detected_dir = dir.join("detected");
        config.debug.output_dir = dir.join("preview");
        config.enrollment.interval_ms = 0;
        config.camera.retry_delay_ms = 1;
        config.recognition.idle_sleep_ms = 1;
        config.recognition.frame_stride = 1;
        config
    }

    fn service(dir: &Path) -> FaceWatch {
        FaceWatch::with_backend(
            test_config(dir),
            Arc::new(FakeBackend::new(vec![face(vec![1.0, 0.0, 0.0])])),
        )
    }

    fn png() -> Vec<u8> {
        let image = RgbImage::from_pixel(64, 64, Rgb([90, 90, 90]));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_enroll_list_image_remove() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        let result = service.enroll("Alice Smith");
        assert!(result.success, "{}", result.message);
        assert_eq!(result.sample_count, 5);

        let identities = service.list_identities().unwrap();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].key, "alice_smith");
        assert_eq!(identities[0].sample_count, 5);

        let jpeg = service.identity_image("alice_smith").unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let removed = service.remove_identity("alice_smith").unwrap();
        assert_eq!(removed.display_name, "Alice Smith");
        assert!(service.list_identities().unwrap().is_empty());

        let err = service.identity_image("alice_smith").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[test]
    fn test_enroll_image_takes_one_sample() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        let result = service.enroll_image("Bob", &png());
        assert!(result.success, "{}", result.message);
        assert_eq!(result.sample_count, 1);

        let bad = service.enroll_image("Bob", b"not an image");
        assert!(!bad.success);
        assert_eq!(bad.kind, Some(ErrorKind::Input));
    }

    #[test]
    fn test_enroll_refused_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        service.start().unwrap();
        let result = service.enroll("Carol");
        assert!(!result.success);
        assert_eq!(result.kind, Some(ErrorKind::Concurrency));
        assert!(matches!(service.preview(1, 1), Err(Error::RecognitionActive)));

        service.stop().unwrap();
        service.join();
        assert!(service.enroll("Carol").success);
    }

    #[test]
    fn test_recognizes_enrolled_face() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        assert!(service.enroll("Alice").success);

        service.start().unwrap();
        let face = service.wait_result(Duration::from_secs(5)).unwrap();
        assert_eq!(face.name, "Alice");
        assert!(face.confidence > 0.99);
        assert!(face.image.is_some());
        assert!(face.image_path.unwrap().exists());

        let status = service.status().unwrap();
        assert!(status.running);
        assert_eq!(status.identities, 1);

        service.stop().unwrap();
        service.join();
        assert!(!service.status().unwrap().running);
        assert!(matches!(service.stop(), Err(Error::NotRunning)));
    }

    #[test]
    fn test_start_waits_for_enrollment() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::slow(vec![face(vec![1.0, 0.0, 0.0])], Duration::from_millis(40));
        let opened = backend.open_counter();
        let peak = backend.peak_open_counter();
        let service = FaceWatch::with_backend(test_config(dir.path()), Arc::new(backend));

        std::thread::scope(|s| {
            let enrolling = s.spawn(|| service.enroll("Dana"));
            while opened.load(Ordering::SeqCst) == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
            service.start().unwrap();
            // The gallery is written before the enrollment lets go of the camera
            assert_eq!(service.list_identities().unwrap().len(), 1);
            assert!(enrolling.join().unwrap().success);
        });

        service.stop().unwrap();
        service.join();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_latest_result_does_not_consume() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        assert!(service.enroll("Alice").success);
        assert!(service.latest_result().is_none());

        service.start().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while service.latest_result().is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(service.latest_result().unwrap().name, "Alice");
        assert_eq!(service.take_result().unwrap().name, "Alice");
        assert!(service.latest_result().is_none());

        service.stop().unwrap();
        service.join();
    }

    #[test]
    fn test_snapshot_is_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let jpeg = service(dir.path()).snapshot().unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_snapshot_source_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let service = FaceWatch::with_backend(
            test_config(dir.path()),
            Arc::new(FakeBackend::unavailable()),
        );
        assert_eq!(service.snapshot().unwrap_err().kind(), ErrorKind::Source);
    }

    #[test]
    fn test_preview_saves_annotated_frames() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        assert!(service.enroll("Alice").success);

        let summary = service.preview(6, 2).unwrap();
        assert_eq!(summary.frames, 6);
        assert_eq!(summary.saved.len(), 3);
        assert!(summary.saved.iter().all(|p| p.exists()));
        assert!(summary.recognized.contains("Alice"));
    }
}
