//! Face extraction: everything between a captured frame and a list of
//! embedded detections.
//!
//! The core only depends on the [`FaceExtractor`] trait. [`OnnxExtractor`]
//! is the production implementation (SCRFD detection, five-point alignment,
//! ArcFace embedding).

use crate::align;
use crate::arcface::ArcFace;
use crate::capture::Frame;
use crate::config::Config;
use crate::detect::{FaceCandidate, Scrfd};
use crate::embedding::Embedding;
use crate::runtime::RuntimeError;
use image::RgbImage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Failed to load model: {0}")]
    ModelLoad(#[from] RuntimeError),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Unexpected model output: {0}")]
    Output(String),
}

/// Pixel-space face box, `(x1, y1)` inclusive top-left to `(x2, y2)` bottom-right
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        (self.x2 - self.x1).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.y2 - self.y1).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }

    /// Clip to an image of the given size, returning `(x, y, w, h)` for
    /// cropping, or `None` if nothing of the box remains.
    pub fn clip(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x1 = self.x1.clamp(0, width as i32);
        let y1 = self.y1.clamp(0, height as i32);
        let x2 = self.x2.clamp(0, width as i32);
        let y2 = self.y2.clamp(0, height as i32);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32))
    }
}

/// One face found in one frame
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Unit-normalized embedding
    pub embedding: Embedding,
    pub confidence: f32,
    /// Frame the face was found in
    pub frame: Frame,
}

impl Detection {
    /// Crop the face out of its source frame
    pub fn face_image(&self) -> Option<RgbImage> {
        let (x, y, w, h) = self.bbox.clip(self.frame.width(), self.frame.height())?;
        Some(image::imageops::crop_imm(self.frame.as_ref(), x, y, w, h).to_image())
    }
}

/// Turns a frame into zero or more embedded face detections
pub trait FaceExtractor: Send {
    fn extract(&mut self, frame: &Frame) -> Result<Vec<Detection>, ExtractError>;
}

/// Pick the detection with the largest box; the first one wins a tie
pub fn largest(detections: &[Detection]) -> Option<&Detection> {
    detections.iter().fold(None, |best: Option<&Detection>, det| match best {
        Some(b) if b.bbox.area() >= det.bbox.area() => Some(b),
        _ => Some(det),
    })
}

/// SCRFD + ArcFace extractor backed by ONNX Runtime
pub struct OnnxExtractor {
    detector: Scrfd,
    embedder: ArcFace,
}

impl OnnxExtractor {
    pub fn new(config: &Config) -> Result<Self, ExtractError> {
        log::info!("Loading face detection model...");
        let detector = Scrfd::new(&config.detection, &config.runtime)?;
        log::info!("Loading face embedding model...");
        let embedder = ArcFace::new(&config.embedding.model_path, &config.runtime)?;
        Ok(Self { detector, embedder })
    }

    fn embed_candidate(
        &mut self,
        frame: &Frame,
        candidate: &FaceCandidate,
    ) -> Result<Option<Detection>, ExtractError> {
        let Some(aligned) = align::align_face(frame, &candidate.landmarks) else {
            log::debug!("Skipping face with degenerate landmarks");
            return Ok(None);
        };
        let embedding = self.embedder.embed(&aligned)?;

        Ok(Some(Detection {
            bbox: candidate.pixel_box(),
            embedding,
            confidence: candidate.score,
            frame: frame.clone(),
        }))
    }
}

impl FaceExtractor for OnnxExtractor {
    fn extract(&mut self, frame: &Frame) -> Result<Vec<Detection>, ExtractError> {
        let candidates = self.detector.detect(frame)?;
        log::debug!("{} face candidates after NMS", candidates.len());

        let mut detections = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            if let Some(detection) = self.embed_candidate(frame, candidate)? {
                detections.push(detection);
            }
        }
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::from_vec;
    use std::sync::Arc;

    fn detection(bbox: BoundingBox) -> Detection {
        Detection {
            bbox,
            embedding: from_vec(vec![1.0, 0.0]),
            confidence: 0.9,
            frame: Arc::new(RgbImage::new(100, 100)),
        }
    }

    #[test]
    fn test_bbox_area() {
        assert_eq!(BoundingBox::new(10, 10, 30, 20).area(), 200);
        assert_eq!(BoundingBox::new(30, 10, 10, 20).area(), 0);
    }

    #[test]
    fn test_bbox_clip() {
        let bbox = BoundingBox::new(-10, 20, 50, 200);
        assert_eq!(bbox.clip(100, 100), Some((0, 20, 50, 80)));
        assert_eq!(BoundingBox::new(120, 0, 150, 10).clip(100, 100), None);
    }

    #[test]
    fn test_largest_prefers_area_then_first() {
        let dets = vec![
            detection(BoundingBox::new(0, 0, 10, 10)),
            detection(BoundingBox::new(0, 0, 20, 20)),
            detection(BoundingBox::new(50, 50, 70, 70)),
        ];
        let best = largest(&dets).unwrap();
        assert_eq!(best.bbox, BoundingBox::new(0, 0, 20, 20));

        assert!(largest(&[]).is_none());
    }

    #[test]
    fn test_face_image_crop() {
        let det = detection(BoundingBox::new(10, 20, 40, 60));
        let crop = det.face_image().unwrap();
        assert_eq!(crop.dimensions(), (30, 40));
    }

    #[test]
    #[ignore] // Requires model files
    fn test_onnx_extractor() {
        let mut extractor = OnnxExtractor::new(&Config::default()).unwrap();
        let frame = Arc::new(RgbImage::new(640, 480));
        let detections = extractor.extract(&frame).unwrap();
        assert!(detections.is_empty());
    }
}
