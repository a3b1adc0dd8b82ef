use crate::capture::CaptureSource;
use crate::config::Config;
use crate::extract::{self, FaceExtractor};
use crate::gallery::{identity_key, Gallery, GalleryError, Sample};
use crate::{Error, ErrorKind};
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EnrollmentSettings {
    pub samples: u32,
    /// Pause before each capture attempt
    pub interval: Duration,
    pub images_dir: PathBuf,
}

impl EnrollmentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            samples: config.enrollment.samples,
            interval: Duration::from_millis(config.enrollment.interval_ms),
            images_dir: config.storage.images_dir.clone(),
        }
    }
}

/// A completed enrollment
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub key: String,
    pub display_name: String,
    pub sample_count: usize,
    pub image_paths: Vec<PathBuf>,
}

/// Flat outcome for callers that report rather than propagate
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentResult {
    pub success: bool,
    pub sample_count: usize,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl From<Result<Enrollment, Error>> for EnrollmentResult {
    fn from(outcome: Result<Enrollment, Error>) -> Self {
        match outcome {
            Ok(enrollment) => Self {
                success: true,
                sample_count: enrollment.sample_count,
                message: format!(
                    "Added {} face samples for {}",
                    enrollment.sample_count, enrollment.display_name
                ),
                kind: None,
            },
            Err(e) => Self {
                success: false,
                sample_count: 0,
                message: e.to_string(),
                kind: Some(e.kind()),
            },
        }
    }
}

/// Capture up to `settings.samples` faces from `source` and append them to
/// the identity `name`, then persist the gallery.
///
/// Attempts that yield no face are skipped, not retried. When several faces
/// are in view the largest one is taken. A sample counts only once its face
/// crop has been written; nothing is persisted if no sample succeeded, and
/// `gallery` is left untouched if persisting fails.
pub fn enroll(
    name: &str,
    source: &mut dyn CaptureSource,
    extractor: &mut dyn FaceExtractor,
    gallery: &mut Gallery,
    gallery_path: &Path,
    settings: &EnrollmentSettings,
) -> Result<Enrollment, Error> {
    let key = identity_key(name);
    if key.is_empty() {
        return Err(Error::InvalidInput("a name is required".to_string()));
    }

    fs::create_dir_all(&settings.images_dir).map_err(GalleryError::from)?;

    log::info!(
        "Enrolling {} from {}: {} samples",
        name.trim(),
        source.describe(),
        settings.samples
    );

    let mut samples = Vec::new();
    let mut image_paths = Vec::new();

    for attempt in 1..=settings.samples {
        if !settings.interval.is_zero() {
            std::thread::sleep(settings.interval);
        }

        let frame = match source.read() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Capture {} failed: {}", attempt, e);
                continue;
            }
        };

        let detections = match extractor.extract(&frame) {
            Ok(detections) => detections,
            Err(e) => {
                log::warn!("Face extraction failed on capture {}: {}", attempt, e);
                continue;
            }
        };

        let Some(face) = extract::largest(&detections) else {
            log::debug!("No face in capture {}", attempt);
            continue;
        };
        if detections.len() > 1 {
            log::debug!(
                "{} faces in capture {}, keeping the largest",
                detections.len(),
                attempt
            );
        }

        let Some(crop) = face.face_image() else {
            log::warn!("Face box {:?} lies outside the frame, skipping", face.bbox);
            continue;
        };

        let captured_at = Utc::now();
        let path = settings.images_dir.join(format!(
            "{}_{}_{}.jpg",
            key,
            captured_at.format("%Y%m%d_%H%M%S%3f"),
            attempt
        ));
        if let Err(e) = crop.save(&path) {
            log::warn!("Failed to write sample image {}: {}", path.display(), e);
            continue;
        }

        log::debug!("Captured sample {} (confidence {:.2})", attempt, face.confidence);
        samples.push(Sample {
            embedding: face.embedding.clone(),
            captured_at,
        });
        image_paths.push(path);
    }

    if samples.is_empty() {
        return Err(Error::NoFaceCaptured);
    }

    let sample_count = samples.len();
    let mut updated = gallery.clone();
    let key = updated.enroll(name, samples, image_paths.clone())?;
    updated.save(gallery_path)?;

    let display_name = updated
        .get(&key)
        .map(|identity| identity.display_name.clone())
        .unwrap_or_else(|| name.trim().to_string());
    *gallery = updated;

    log::info!("Enrolled {} samples for {}", sample_count, display_name);
    Ok(Enrollment {
        key,
        display_name,
        sample_count,
        image_paths,
    })
}
