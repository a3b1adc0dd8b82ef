pub mod align;
pub mod annotate;
pub mod arcface;
pub mod backend;
pub mod capture;
pub mod config;
pub mod controller;
pub mod detect;
pub mod embedding;
pub mod enroll;
pub mod extract;
pub mod gallery;
pub mod matcher;
pub mod recognition;
pub mod results;
pub mod runtime;
pub mod service;
pub mod track;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::RecognitionController;
pub use service::FaceWatch;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Capture error: {0}")]
    Capture(#[from] capture::CaptureError),
    #[error("Face extraction error: {0}")]
    Extraction(#[from] extract::ExtractError),
    #[error("Gallery error: {0}")]
    Storage(#[from] gallery::GalleryError),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("No face detected in the captured images")]
    NoFaceCaptured,
    #[error("Recognition is already running")]
    AlreadyRunning,
    #[error("Recognition is not running")]
    NotRunning,
    #[error("Cannot enroll while recognition is running")]
    RecognitionActive,
    #[error("{0}")]
    Other(String),
}

/// Coarse classification of failures, for callers that branch on the
/// category rather than the exact error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Capture device or stream unavailable
    Source,
    /// Bad request data: missing name, undecodable image, no usable face
    Input,
    /// Start while running, stop while idle, enroll while running
    Concurrency,
    /// Gallery record unreadable or unwritable
    Persistence,
    /// Model loading, inference, configuration
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Capture(capture::CaptureError::Conversion(_)) => ErrorKind::Input,
            Error::Capture(_) => ErrorKind::Source,
            Error::Storage(gallery::GalleryError::InvalidName(_))
            | Error::Storage(gallery::GalleryError::DimensionMismatch { .. })
            | Error::Storage(gallery::GalleryError::IdentityNotFound(_)) => ErrorKind::Input,
            Error::Storage(_) => ErrorKind::Persistence,
            Error::InvalidInput(_) | Error::NoFaceCaptured => ErrorKind::Input,
            Error::AlreadyRunning | Error::NotRunning | Error::RecognitionActive => {
                ErrorKind::Concurrency
            }
            Error::Config(_) | Error::Extraction(_) | Error::Other(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::AlreadyRunning.kind(), ErrorKind::Concurrency);
        assert_eq!(Error::NotRunning.kind(), ErrorKind::Concurrency);
        assert_eq!(Error::NoFaceCaptured.kind(), ErrorKind::Input);
        assert_eq!(
            Error::from(capture::CaptureError::Open("/dev/video9".into())).kind(),
            ErrorKind::Source
        );
        assert_eq!(
            Error::from(gallery::GalleryError::Serialization("bad".into())).kind(),
            ErrorKind::Persistence
        );
        assert_eq!(
            Error::from(gallery::GalleryError::IdentityNotFound("x".into())).kind(),
            ErrorKind::Input
        );
    }
}
