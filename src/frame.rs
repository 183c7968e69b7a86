//! Captured frames.
//!
//! - `Frame`: one captured image plus its capture timestamp.
//! - `PixelLayout`: channel layout of the pixel buffer.
//!
//! Pixel data sits behind an `Arc<[u8]>` and is never mutated after the
//! capture backend publishes it. Cloning a `Frame` shares the buffer, so the
//! stream can hand the same frame to its consumer and keep it as the
//! "last frame" without copying or racing the producer.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use image::{codecs::jpeg::JpegEncoder, GrayImage, RgbImage};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Channel layout of a frame buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    /// Interleaved 8-bit RGB.
    Rgb8,
    /// Single 8-bit luminance channel (mono industrial sensors).
    Mono8,
}

impl PixelLayout {
    pub fn channels(self) -> usize {
        match self {
            PixelLayout::Rgb8 => 3,
            PixelLayout::Mono8 => 1,
        }
    }
}

/// One captured image. Immutable once constructed.
#[derive(Clone)]
pub struct Frame {
    data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    /// Wall-clock capture time (reported to the API).
    pub captured_at: DateTime<Utc>,
    /// Monotonic capture instant (frame age).
    capture_instant: Instant,
}

impl Frame {
    /// Wrap a pixel buffer captured just now.
    pub fn new(data: Vec<u8>, width: u32, height: u32, layout: PixelLayout) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(layout.channels()))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch: expected {} bytes for {}x{} {:?}, got {}",
                expected,
                width,
                height,
                layout,
                data.len()
            ));
        }
        Ok(Self {
            data: data.into(),
            width,
            height,
            layout,
            captured_at: Utc::now(),
            capture_instant: Instant::now(),
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn age(&self) -> Duration {
        self.capture_instant.elapsed()
    }

    /// True when both frames share the same pixel buffer.
    pub fn same_buffer(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// RGB value of one pixel (mono is replicated across channels).
    pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * self.layout.channels();
        match self.layout {
            PixelLayout::Rgb8 => [self.data[idx], self.data[idx + 1], self.data[idx + 2]],
            PixelLayout::Mono8 => [self.data[idx]; 3],
        }
    }

    /// Owned RGB copy of this frame.
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        match self.layout {
            PixelLayout::Rgb8 => RgbImage::from_raw(self.width, self.height, self.data.to_vec())
                .ok_or_else(|| anyhow!("rgb buffer does not match frame dimensions")),
            PixelLayout::Mono8 => {
                let gray = GrayImage::from_raw(self.width, self.height, self.data.to_vec())
                    .ok_or_else(|| anyhow!("mono buffer does not match frame dimensions"))?;
                Ok(image::DynamicImage::ImageLuma8(gray).into_rgb8())
            }
        }
    }

    /// Encode as JPEG with the given quality (1-100).
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        encode_rgb_jpeg(&self.to_rgb_image()?, quality)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("layout", &self.layout)
            .field("captured_at", &self.captured_at)
            .finish_non_exhaustive()
    }
}

pub(crate) fn encode_rgb_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder.encode_image(image).context("encode jpeg")?;
    Ok(out)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_length_mismatch() {
        assert!(Frame::new(vec![0u8; 10], 4, 4, PixelLayout::Rgb8).is_err());
        assert!(Frame::new(vec![0u8; 16], 4, 4, PixelLayout::Mono8).is_ok());
    }

    #[test]
    fn clones_share_the_pixel_buffer() -> Result<()> {
        let frame = Frame::new(vec![7u8; 4 * 4 * 3], 4, 4, PixelLayout::Rgb8)?;
        let handed_off = frame.clone();
        assert!(frame.same_buffer(&handed_off));
        assert_eq!(handed_off.pixels()[0], 7);
        Ok(())
    }

    #[test]
    fn mono_frames_expand_to_rgb() -> Result<()> {
        let frame = Frame::new(vec![42u8; 2 * 2], 2, 2, PixelLayout::Mono8)?;
        let rgb = frame.to_rgb_image()?;
        assert_eq!(rgb.get_pixel(1, 1).0, [42, 42, 42]);
        assert_eq!(frame.rgb_at(0, 1), [42, 42, 42]);
        Ok(())
    }

    #[test]
    fn jpeg_encoding_produces_soi_marker() -> Result<()> {
        let frame = Frame::new(vec![128u8; 8 * 8 * 3], 8, 8, PixelLayout::Rgb8)?;
        let jpeg = frame.encode_jpeg(80)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        Ok(())
    }
}
