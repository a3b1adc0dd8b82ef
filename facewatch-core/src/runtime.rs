use crate::config::RuntimeConfig;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Model file not found: {0}")]
    ModelMissing(String),
    #[error("Failed to create session: {0}")]
    SessionCreation(String),
}

/// Build a CPU inference session for an ONNX model file
pub fn load_session<P: AsRef<Path>>(
    model_path: P,
    config: &RuntimeConfig,
) -> Result<Session, RuntimeError> {
    let model_path = model_path.as_ref();
    if !model_path.exists() {
        return Err(RuntimeError::ModelMissing(model_path.display().to_string()));
    }

    let session = Session::builder()
        .map_err(|e| RuntimeError::SessionCreation(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| RuntimeError::SessionCreation(e.to_string()))?
        .with_intra_threads(config.intra_threads.max(1))
        .map_err(|e| RuntimeError::SessionCreation(e.to_string()))?
        .commit_from_file(model_path)
        .map_err(|e| {
            RuntimeError::SessionCreation(format!(
                "Failed to load model from {:?}: {}",
                model_path, e
            ))
        })?;

    log::info!(
        "Loaded ONNX model {:?} ({} intra-op threads)",
        model_path,
        config.intra_threads.max(1)
    );
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_is_reported() {
        let result = load_session("/nonexistent/model.onnx", &RuntimeConfig::default());
        assert!(matches!(result, Err(RuntimeError::ModelMissing(_))));
    }

    #[test]
    #[ignore] // Requires model file
    fn test_session_creation() {
        let session = load_session("models/det_10g.onnx", &RuntimeConfig::default());
        assert!(session.is_ok());
    }
}
