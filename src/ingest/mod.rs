//! Frame capture backends.
//!
//! This module provides the interchangeable sources a `BufferedStream` can
//! drive:
//! - Synthetic frames (`stub://`, demos and tests)
//! - HTTP MJPEG/JPEG streams (`http://`, `https://`)
//! - RTSP streams (feature: rtsp-gstreamer)
//! - USB industrial cameras over V4L2 (feature: ingest-v4l2)
//!
//! Every backend implements `CaptureBackend`. `FrameSource` is the closed set
//! of backends, picked once at construction from the camera settings.
//!
//! A backend reports three outcomes from `grab()`:
//! - `Ok(Some(frame))`: a new frame
//! - `Ok(None)`: no frame within the backend timeout, session still up
//! - `Err(_)`: the session was lost; the backend is now disconnected

use anyhow::{anyhow, Result};

use crate::frame::Frame;

pub mod mjpeg;
#[cfg(feature = "rtsp-gstreamer")]
pub mod rtsp;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use mjpeg::MjpegSource;
#[cfg(feature = "rtsp-gstreamer")]
pub use rtsp::RtspSource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::IndustrialSource;

/// Minimal contract for capture backends.
pub trait CaptureBackend: Send {
    /// Human-readable device name (for status and logs).
    fn name(&self) -> String;

    /// Open (or reopen) the device. Any previous session is closed first.
    fn connect(&mut self) -> Result<()>;

    /// Capture the next frame.
    fn grab(&mut self) -> Result<Option<Frame>>;

    /// Release the device. Must be safe to call repeatedly.
    fn close(&mut self);

    fn is_connected(&self) -> bool;
}

/// Which family of capture backend a camera uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Generic stream: selected further by URL scheme.
    Stream,
    /// Vendor industrial USB camera.
    Industrial,
}

/// Settings needed to open a capture source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub kind: BackendKind,
    /// Stream URL, `stub://<name>`, or device path for industrial cameras.
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub force_mono: bool,
    pub exposure_us: Option<u32>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Stream,
            url: "stub://camera".to_string(),
            width: 640,
            height: 480,
            target_fps: 10,
            force_mono: false,
            exposure_us: Some(30_000),
        }
    }
}

/// Closed set of capture backends.
pub enum FrameSource {
    Synthetic(SyntheticSource),
    Mjpeg(MjpegSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Rtsp(RtspSource),
    #[cfg(feature = "ingest-v4l2")]
    Industrial(IndustrialSource),
}

impl FrameSource {
    pub fn open(config: &SourceConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            return Ok(Self::Synthetic(SyntheticSource::new(config.clone())));
        }
        match config.kind {
            BackendKind::Stream => open_stream(config),
            BackendKind::Industrial => open_industrial(config),
        }
    }

    fn backend(&self) -> &dyn CaptureBackend {
        match self {
            FrameSource::Synthetic(source) => source,
            FrameSource::Mjpeg(source) => source,
            #[cfg(feature = "rtsp-gstreamer")]
            FrameSource::Rtsp(source) => source,
            #[cfg(feature = "ingest-v4l2")]
            FrameSource::Industrial(source) => source,
        }
    }

    fn backend_mut(&mut self) -> &mut dyn CaptureBackend {
        match self {
            FrameSource::Synthetic(source) => source,
            FrameSource::Mjpeg(source) => source,
            #[cfg(feature = "rtsp-gstreamer")]
            FrameSource::Rtsp(source) => source,
            #[cfg(feature = "ingest-v4l2")]
            FrameSource::Industrial(source) => source,
        }
    }
}

impl CaptureBackend for FrameSource {
    fn name(&self) -> String {
        self.backend().name()
    }

    fn connect(&mut self) -> Result<()> {
        self.backend_mut().connect()
    }

    fn grab(&mut self) -> Result<Option<Frame>> {
        self.backend_mut().grab()
    }

    fn close(&mut self) {
        self.backend_mut().close()
    }

    fn is_connected(&self) -> bool {
        self.backend().is_connected()
    }
}

fn open_stream(config: &SourceConfig) -> Result<FrameSource> {
    let scheme = config
        .url
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .ok_or_else(|| anyhow!("stream url '{}' has no scheme", config.url))?;
    match scheme.as_str() {
        "http" | "https" => Ok(FrameSource::Mjpeg(MjpegSource::new(config.clone())?)),
        "rtsp" | "rtsps" => {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(FrameSource::Rtsp(RtspSource::new(config.clone())?))
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                Err(anyhow!("RTSP requires the rtsp-gstreamer feature"))
            }
        }
        other => Err(anyhow!(
            "unsupported stream scheme '{}'; expected http(s), rtsp or stub",
            other
        )),
    }
}

fn open_industrial(config: &SourceConfig) -> Result<FrameSource> {
    #[cfg(feature = "ingest-v4l2")]
    {
        Ok(FrameSource::Industrial(IndustrialSource::new(config.clone())))
    }
    #[cfg(not(feature = "ingest-v4l2"))]
    {
        Err(anyhow!(
            "industrial camera {} requires the ingest-v4l2 feature",
            config.url
        ))
    }
}
