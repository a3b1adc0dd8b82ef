use crate::align::ALIGNED_SIZE;
use crate::config::RuntimeConfig;
use crate::embedding::{self, Embedding};
use crate::extract::ExtractError;
use crate::runtime;
use image::RgbImage;
use ndarray::Array1;
use ort::session::Session;
use ort::value::Value;
use std::path::Path;

/// ArcFace embedding network
pub struct ArcFace {
    session: Session,
}

impl ArcFace {
    pub fn new<P: AsRef<Path>>(model_path: P, runtime: &RuntimeConfig) -> Result<Self, ExtractError> {
        let session = runtime::load_session(model_path, runtime)?;
        Ok(Self { session })
    }

    /// Embed an aligned 112x112 face crop. The result is L2-normalized.
    pub fn embed(&mut self, aligned: &RgbImage) -> Result<Embedding, ExtractError> {
        if aligned.dimensions() != (ALIGNED_SIZE, ALIGNED_SIZE) {
            let (w, h) = aligned.dimensions();
            return Err(ExtractError::Inference(format!(
                "aligned face must be {0}x{0}, got {1}x{2}",
                ALIGNED_SIZE, w, h
            )));
        }

        let input = Value::from_array(to_tensor(aligned))
            .map_err(|e| ExtractError::Inference(format!("Failed to create input tensor: {}", e)))?;

        let outputs = self
            .session
            .run(ort::inputs![input])
            .map_err(|e| ExtractError::Inference(e.to_string()))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::Output(format!("Failed to extract embedding: {}", e)))?;

        let dim = shape.last().copied().unwrap_or(0).max(0) as usize;
        if dim == 0 || data.len() < dim {
            return Err(ExtractError::Output(format!(
                "embedding output has shape {:?}",
                shape
            )));
        }

        Ok(embedding::normalize(Array1::from_vec(data[..dim].to_vec())))
    }
}

/// NCHW, RGB, `(p - 127.5) / 127.5`
fn to_tensor(image: &RgbImage) -> ([usize; 4], Vec<f32>) {
    let size = ALIGNED_SIZE as usize;
    let plane = size * size;
    let mut data = vec![0.0f32; plane * 3];
    for (i, pixel) in image.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = (pixel[c] as f32 - 127.5) / 127.5;
        }
    }
    ([1, 3, size, size], data)
}
