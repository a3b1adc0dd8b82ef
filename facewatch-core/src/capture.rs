use crate::config::CameraConfig;
use image::{ImageBuffer, RgbImage};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture as V4lCapture;
use v4l::FourCC;

/// A decoded RGB frame, shared by every detection found in it
pub type Frame = Arc<RgbImage>;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to open capture source: {0}")]
    Open(String),
    #[error("Failed to read frame: {0}")]
    Read(String),
    #[error("Frame conversion failed: {0}")]
    Conversion(String),
    #[error("Stream error: {0}")]
    Stream(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A source of frames. Implementations reconnect on their own after a
/// failed read; callers treat an `Err` as "no frame this iteration".
pub trait CaptureSource: Send {
    fn read(&mut self) -> Result<Frame, CaptureError>;

    /// Let go of the underlying device or connection
    fn release(&mut self);

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Open the source named by `camera.device`: an http(s) URL selects the
/// network stream, anything else a local V4L2 device.
pub fn open(camera: &CameraConfig) -> Result<Box<dyn CaptureSource>, CaptureError> {
    if camera.is_network_stream() {
        Ok(Box::new(NetworkStream::connect(&camera.device)?))
    } else {
        Ok(Box::new(LocalCamera::open(camera)?))
    }
}

struct OpenDevice {
    device: Device,
    width: u32,
    height: u32,
    fourcc: FourCC,
}

/// V4L2 camera
pub struct LocalCamera {
    config: CameraConfig,
    device: Option<OpenDevice>,
}

impl LocalCamera {
    pub fn open(config: &CameraConfig) -> Result<Self, CaptureError> {
        let device = Self::open_device(config)?;
        Ok(Self {
            config: config.clone(),
            device: Some(device),
        })
    }

    fn device_index(path: &str) -> usize {
        path.trim_start_matches("/dev/video").parse().unwrap_or(0)
    }

    fn open_device(config: &CameraConfig) -> Result<OpenDevice, CaptureError> {
        let device = Device::new(Self::device_index(&config.device))
            .map_err(|e| CaptureError::Open(format!("{}: {}", config.device, e)))?;

        let mut format = device
            .format()
            .map_err(|e| CaptureError::Open(format!("Failed to get format: {}", e)))?;
        format.width = config.width;
        format.height = config.height;

        for fourcc in [FourCC::new(b"MJPG"), FourCC::new(b"YUYV")] {
            format.fourcc = fourcc;
            if device.set_format(&format).is_ok() {
                break;
            }
        }

        let actual = device
            .format()
            .map_err(|e| CaptureError::Open(format!("Failed to verify format: {}", e)))?;

        log::info!(
            "Camera {} opened: {}x{} {}",
            config.device,
            actual.width,
            actual.height,
            actual.fourcc
        );

        Ok(OpenDevice {
            device,
            width: actual.width,
            height: actual.height,
            fourcc: actual.fourcc,
        })
    }

    fn grab(open: &OpenDevice) -> Result<RgbImage, CaptureError> {
        let mut stream =
            MmapStream::with_buffers(&open.device, v4l::buffer::Type::VideoCapture, 4)
                .map_err(|e| CaptureError::Read(format!("Failed to create stream: {}", e)))?;

        let (buf, _meta) = stream
            .next()
            .map_err(|e| CaptureError::Read(e.to_string()))?;

        match open.fourcc.str() {
            Ok("MJPG") => decode_jpeg(buf),
            Ok("YUYV") => yuyv_to_rgb(buf, open.width, open.height),
            _ => Err(CaptureError::Conversion(format!(
                "Unsupported pixel format: {}",
                open.fourcc
            ))),
        }
    }
}

impl CaptureSource for LocalCamera {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        if self.device.is_none() {
            log::info!("Reopening camera {}", self.config.device);
            self.device = Some(Self::open_device(&self.config)?);
        }

        let Some(open) = self.device.as_ref() else {
            return Err(CaptureError::Open(self.config.device.clone()));
        };

        match Self::grab(open) {
            Ok(frame) => Ok(Arc::new(frame)),
            Err(e) => {
                // Drop the handle so the next read reopens the device
                self.device = None;
                Err(e)
            }
        }
    }

    fn release(&mut self) {
        if self.device.take().is_some() {
            log::debug!("Released camera {}", self.config.device);
        }
    }

    fn describe(&self) -> String {
        format!("camera {}", self.config.device)
    }
}

impl Drop for LocalCamera {
    fn drop(&mut self) {
        self.release();
    }
}

/// Upper bound on buffered bytes while hunting for a complete JPEG
const MAX_STREAM_BUFFER: usize = 8 * 1024 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// MJPEG-over-HTTP stream, e.g. a phone camera app
pub struct NetworkStream {
    url: String,
    client: reqwest::blocking::Client,
    response: Option<reqwest::blocking::Response>,
    buffer: Vec<u8>,
}

impl NetworkStream {
    pub fn connect(url: &str) -> Result<Self, CaptureError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(None::<Duration>)
            .build()?;

        let mut stream = Self {
            url: url.to_string(),
            client,
            response: None,
            buffer: Vec::new(),
        };
        stream.reconnect()?;
        Ok(stream)
    }

    fn reconnect(&mut self) -> Result<(), CaptureError> {
        self.buffer.clear();
        let response = self.client.get(&self.url).send()?.error_for_status()?;
        log::info!("Connected to video stream {}", self.url);
        self.response = Some(response);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Vec<u8>, CaptureError> {
        let Some(response) = self.response.as_mut() else {
            return Err(CaptureError::Read("stream not connected".to_string()));
        };

        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some(jpeg) = take_jpeg(&mut self.buffer) {
                return Ok(jpeg);
            }

            let n = response.read(&mut chunk)?;
            if n == 0 {
                return Err(CaptureError::Read("stream closed".to_string()));
            }
            self.buffer.extend_from_slice(&chunk[..n]);

            if self.buffer.len() > MAX_STREAM_BUFFER {
                log::warn!("Discarding {} bytes without a complete frame", self.buffer.len());
                self.buffer.clear();
            }
        }
    }
}

impl CaptureSource for NetworkStream {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        if self.response.is_none() {
            self.reconnect()?;
        }

        match self.next_frame().and_then(|jpeg| decode_jpeg(&jpeg)) {
            Ok(frame) => Ok(Arc::new(frame)),
            Err(e) => {
                self.response = None;
                Err(e)
            }
        }
    }

    fn release(&mut self) {
        if self.response.take().is_some() {
            log::debug!("Closed video stream {}", self.url);
        }
        self.buffer.clear();
    }

    fn describe(&self) -> String {
        format!("stream {}", self.url)
    }
}

impl Drop for NetworkStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// A single image file served as an endless sequence of identical frames
pub struct StillImage {
    path: PathBuf,
    frame: Frame,
}

impl StillImage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        let image = image::open(&path)
            .map_err(|e| CaptureError::Open(format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            path,
            frame: Arc::new(image.to_rgb8()),
        })
    }

    /// Decode an in-memory encoded image (JPEG, PNG, ...)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CaptureError> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| CaptureError::Conversion(format!("Invalid image data: {}", e)))?;
        Ok(Self {
            path: PathBuf::from("<memory>"),
            frame: Arc::new(image.to_rgb8()),
        })
    }
}

impl CaptureSource for StillImage {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        Ok(self.frame.clone())
    }

    fn release(&mut self) {}

    fn describe(&self) -> String {
        format!("image {}", self.path.display())
    }
}

/// Pull the first complete JPEG (SOI..EOI) out of `buffer`, dropping any
/// bytes before it.
fn take_jpeg(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])
        .map(|p| start + 2 + p + 2)?;

    let jpeg = buffer[start..end].to_vec();
    buffer.drain(..end);
    Some(jpeg)
}

fn decode_jpeg(data: &[u8]) -> Result<RgbImage, CaptureError> {
    image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)
        .map(|img| img.to_rgb8())
        .map_err(|e| CaptureError::Conversion(format!("JPEG decode failed: {}", e)))
}

/// YUYV 4:2:2 (Y0 U Y1 V per pixel pair) to packed RGB
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<RgbImage, CaptureError> {
    let pixels = width as usize * height as usize;
    if data.len() < pixels * 2 {
        return Err(CaptureError::Conversion("YUYV buffer too small".to_string()));
    }

    let mut rgb = Vec::with_capacity(pixels * 3);
    for quad in data[..pixels * 2].chunks_exact(4) {
        let u = quad[1] as i32 - 128;
        let v = quad[3] as i32 - 128;
        for luma in [quad[0] as i32, quad[2] as i32] {
            rgb.push((luma + ((1436 * v) >> 10)).clamp(0, 255) as u8);
            rgb.push((luma - ((354 * u + 732 * v) >> 10)).clamp(0, 255) as u8);
            rgb.push((luma + ((1814 * u) >> 10)).clamp(0, 255) as u8);
        }
    }

    ImageBuffer::from_raw(width, height, rgb)
        .ok_or_else(|| CaptureError::Conversion("Failed to create RGB image".to_string()))
}
