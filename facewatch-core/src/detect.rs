use crate::config::{DetectionConfig, RuntimeConfig};
use crate::extract::{BoundingBox, ExtractError};
use crate::runtime;
use image::{imageops, RgbImage};
use ort::session::Session;
use ort::value::Value;

/// SCRFD predicts on three feature pyramid levels
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Five facial keypoints: eyes, nose tip, mouth corners
pub type Landmarks = [(f32, f32); 5];

/// A raw detector hit before embedding
#[derive(Debug, Clone)]
pub struct FaceCandidate {
    /// `[x1, y1, x2, y2]` in source-image pixels
    pub corners: [f32; 4],
    pub landmarks: Landmarks,
    pub score: f32,
}

impl FaceCandidate {
    pub fn area(&self) -> f32 {
        let [x1, y1, x2, y2] = self.corners;
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    pub fn iou(&self, other: &FaceCandidate) -> f32 {
        let ix1 = self.corners[0].max(other.corners[0]);
        let iy1 = self.corners[1].max(other.corners[1]);
        let ix2 = self.corners[2].min(other.corners[2]);
        let iy2 = self.corners[3].min(other.corners[3]);

        let intersection = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    pub fn pixel_box(&self) -> BoundingBox {
        let [x1, y1, x2, y2] = self.corners;
        BoundingBox::new(
            x1.round() as i32,
            y1.round() as i32,
            x2.round() as i32,
            y2.round() as i32,
        )
    }

    fn rescale(mut self, factor: f32) -> Self {
        for c in &mut self.corners {
            *c /= factor;
        }
        for (x, y) in &mut self.landmarks {
            *x /= factor;
            *y /= factor;
        }
        self
    }
}

/// SCRFD face detector
pub struct Scrfd {
    session: Session,
    input_size: u32,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl Scrfd {
    pub fn new(config: &DetectionConfig, runtime: &RuntimeConfig) -> Result<Self, ExtractError> {
        let session = runtime::load_session(&config.model_path, runtime)?;
        Ok(Self {
            session,
            input_size: config.input_size,
            confidence_threshold: config.confidence_threshold,
            nms_threshold: config.nms_threshold,
        })
    }

    /// Detect faces, most confident first
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceCandidate>, ExtractError> {
        let (tensor, scale) = letterbox(image, self.input_size);
        let input = Value::from_array(tensor)
            .map_err(|e| ExtractError::Inference(format!("Failed to create input tensor: {}", e)))?;

        let outputs = self
            .session
            .run(ort::inputs![input])
            .map_err(|e| ExtractError::Inference(e.to_string()))?;

        // Outputs come grouped by kind: scores for every stride, then boxes, then keypoints
        if outputs.len() < STRIDES.len() * 3 {
            return Err(ExtractError::Output(format!(
                "expected {} SCRFD outputs, got {}",
                STRIDES.len() * 3,
                outputs.len()
            )));
        }

        let mut candidates = Vec::new();
        for (level, &stride) in STRIDES.iter().enumerate() {
            let (_, scores) = outputs[level]
                .try_extract_tensor::<f32>()
                .map_err(|e| ExtractError::Output(format!("scores@{}: {}", stride, e)))?;
            let (_, boxes) = outputs[level + STRIDES.len()]
                .try_extract_tensor::<f32>()
                .map_err(|e| ExtractError::Output(format!("boxes@{}: {}", stride, e)))?;
            let (_, keypoints) = outputs[level + STRIDES.len() * 2]
                .try_extract_tensor::<f32>()
                .map_err(|e| ExtractError::Output(format!("keypoints@{}: {}", stride, e)))?;

            let grid = self.input_size as usize / stride;
            let level_hits = decode_level(
                stride,
                grid,
                LevelOutputs {
                    scores,
                    boxes,
                    keypoints,
                },
                self.confidence_threshold,
            );
            log::trace!("stride {}: {} hits", stride, level_hits.len());
            candidates.extend(level_hits);
        }

        let kept = non_max_suppression(candidates, self.nms_threshold);
        Ok(kept.into_iter().map(|c| c.rescale(scale)).collect())
    }
}

struct LevelOutputs<'a> {
    scores: &'a [f32],
    boxes: &'a [f32],
    keypoints: &'a [f32],
}

/// Decode one pyramid level. Anchors sit at cell corners, row-major, with
/// `ANCHORS_PER_CELL` consecutive anchors per cell; box and keypoint offsets
/// are expressed in stride units.
fn decode_level(
    stride: usize,
    grid: usize,
    out: LevelOutputs<'_>,
    threshold: f32,
) -> Vec<FaceCandidate> {
    let stride_f = stride as f32;
    let anchor_count = grid * grid * ANCHORS_PER_CELL;
    let mut hits = Vec::new();

    for idx in 0..anchor_count.min(out.scores.len()) {
        let score = out.scores[idx];
        if score < threshold {
            continue;
        }

        let cell = idx / ANCHORS_PER_CELL;
        let cx = (cell % grid) as f32 * stride_f;
        let cy = (cell / grid) as f32 * stride_f;

        let Some(d) = out.boxes.get(idx * 4..idx * 4 + 4) else {
            break;
        };
        let Some(k) = out.keypoints.get(idx * 10..idx * 10 + 10) else {
            break;
        };

        let corners = [
            cx - d[0] * stride_f,
            cy - d[1] * stride_f,
            cx + d[2] * stride_f,
            cy + d[3] * stride_f,
        ];
        let mut landmarks = [(0.0, 0.0); 5];
        for (i, point) in landmarks.iter_mut().enumerate() {
            *point = (cx + k[i * 2] * stride_f, cy + k[i * 2 + 1] * stride_f);
        }

        hits.push(FaceCandidate {
            corners,
            landmarks,
            score,
        });
    }

    hits
}

/// Resize preserving aspect ratio into the top-left of a square canvas and
/// normalize to NCHW `(p - 127.5) / 128`. Returns the tensor and the scale
/// applied to source coordinates.
fn letterbox(image: &RgbImage, size: u32) -> (([usize; 4], Vec<f32>), f32) {
    let (width, height) = image.dimensions();
    let scale = (size as f32 / width.max(1) as f32).min(size as f32 / height.max(1) as f32);
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);

    let resized = imageops::resize(image, new_w, new_h, imageops::FilterType::Triangle);
    let mut canvas = RgbImage::new(size, size);
    imageops::replace(&mut canvas, &resized, 0, 0);

    let plane = (size * size) as usize;
    let mut data = vec![0.0f32; plane * 3];
    for (i, pixel) in canvas.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = (pixel[c] as f32 - 127.5) / 128.0;
        }
    }

    (([1, 3, size as usize, size as usize], data), scale)
}

/// Greedy NMS, highest score first
fn non_max_suppression(mut candidates: Vec<FaceCandidate>, iou_threshold: f32) -> Vec<FaceCandidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<FaceCandidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}
