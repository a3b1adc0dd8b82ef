use crate::capture::{self, CaptureSource};
use crate::config::Config;
use crate::extract::{FaceExtractor, OnnxExtractor};
use crate::Error;

/// Opens the external collaborators: the frame source and the face
/// extractor. Both are opened on the thread that will use them.
pub trait Backend: Send + Sync + 'static {
    fn open_source(&self) -> Result<Box<dyn CaptureSource>, Error>;

    fn load_extractor(&self) -> Result<Box<dyn FaceExtractor>, Error>;
}

/// Camera (or network stream) plus the ONNX models named in the config
pub struct OnnxBackend {
    config: Config,
}

impl OnnxBackend {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl Backend for OnnxBackend {
    fn open_source(&self) -> Result<Box<dyn CaptureSource>, Error> {
        Ok(capture::open(&self.config.camera)?)
    }

    fn load_extractor(&self) -> Result<Box<dyn FaceExtractor>, Error> {
        Ok(Box::new(OnnxExtractor::new(&self.config)?))
    }
}
