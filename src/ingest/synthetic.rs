//! Synthetic frame source (`stub://`).
//!
//! Produces a slowly drifting gradient. Every `BLOB_PERIOD` frames a bright
//! square appears for a few frames, which is enough for the stub anomaly model
//! to fire. Synthetic sources are always able to connect.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use super::{CaptureBackend, SourceConfig};
use crate::frame::{Frame, PixelLayout};

const BLOB_PERIOD: u64 = 50;
const BLOB_FRAMES: u64 = 5;

pub struct SyntheticSource {
    config: SourceConfig,
    connected: bool,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            connected: false,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn frame_interval(&self) -> Duration {
        if self.config.target_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis((1000 / self.config.target_fps).max(1) as u64)
        }
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let channels = self.layout().channels();
        let mut pixels = vec![0u8; width * height * channels];

        let blob_on =
            self.frame_count >= BLOB_PERIOD && self.frame_count % BLOB_PERIOD < BLOB_FRAMES;
        let blob_size = (width.min(height) / 8).max(2);
        let blob_x = (self.frame_count as usize * 7) % width.saturating_sub(blob_size).max(1);
        let blob_y = (self.frame_count as usize * 3) % height.saturating_sub(blob_size).max(1);

        for y in 0..height {
            for x in 0..width {
                let base = ((x + y + self.frame_count as usize) % 96) as u8 + 16;
                let in_blob = blob_on
                    && (blob_x..blob_x + blob_size).contains(&x)
                    && (blob_y..blob_y + blob_size).contains(&y);
                let value = if in_blob { 250 } else { base };
                let idx = (y * width + x) * channels;
                pixels[idx..idx + channels].fill(value);
            }
        }
        pixels
    }

    fn layout(&self) -> PixelLayout {
        if self.config.force_mono {
            PixelLayout::Mono8
        } else {
            PixelLayout::Rgb8
        }
    }
}

impl CaptureBackend for SyntheticSource {
    fn name(&self) -> String {
        self.config.url.clone()
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("SyntheticSource: connected to {}", self.config.url);
        Ok(())
    }

    fn grab(&mut self) -> Result<Option<Frame>> {
        if !self.connected {
            return Err(anyhow!("synthetic source {} not connected", self.config.url));
        }
        // Pace to the target fps like a real camera would.
        if let Some(last) = self.last_frame_at {
            let interval = self.frame_interval();
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        let pixels = self.generate_pixels();
        let frame = Frame::new(pixels, self.config.width, self.config.height, self.layout())?;
        Ok(Some(frame))
    }

    fn close(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
