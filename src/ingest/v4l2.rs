//! Industrial USB camera source over V4L2.
//!
//! Vendor USB3 industrial cameras expose a UVC/V4L2 node. `IndustrialSource`
//! applies the camera settings on connect:
//! - resolution (falls back to whatever the device accepts)
//! - pixel format: `GREY` when `force_mono`, `RGB3` otherwise
//! - manual exposure in microseconds, when configured
//! - frame rate
//!
//! Losing the device (unplug, driver reset) surfaces as a `grab()` error; the
//! owning stream reconnects with backoff.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::{CaptureBackend, SourceConfig};
use crate::frame::{Frame, PixelLayout};

const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const EXPOSURE_MANUAL: i64 = 1;
const CAPTURE_BUFFERS: u32 = 4;

pub struct IndustrialSource {
    config: SourceConfig,
    state: Option<DeviceState>,
    frame_count: u64,
    active_width: u32,
    active_height: u32,
    layout: PixelLayout,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl IndustrialSource {
    pub fn new(config: SourceConfig) -> Self {
        let layout = if config.force_mono {
            PixelLayout::Mono8
        } else {
            PixelLayout::Rgb8
        };
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            frame_count: 0,
            layout,
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn configure(&mut self, device: &v4l::Device) -> Result<()> {
        use v4l::video::Capture;

        let fourcc = match self.layout {
            PixelLayout::Mono8 => v4l::FourCC::new(b"GREY"),
            PixelLayout::Rgb8 => v4l::FourCC::new(b"RGB3"),
        };
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = fourcc;

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "IndustrialSource: failed to set format on {}: {}",
                    self.config.url,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        if format.fourcc != fourcc {
            return Err(anyhow!(
                "device {} does not support pixel format {}",
                self.config.url,
                fourcc
            ));
        }

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "IndustrialSource: failed to set fps on {}: {}",
                    self.config.url,
                    err
                );
            }
        }

        if let Some(exposure_us) = self.config.exposure_us {
            self.apply_exposure(device, exposure_us);
        }

        self.active_width = format.width;
        self.active_height = format.height;
        Ok(())
    }

    fn apply_exposure(&self, device: &v4l::Device, exposure_us: u32) {
        use v4l::control::{Control, Value};

        // V4L2 absolute exposure is in 100 microsecond units.
        let units = (exposure_us / 100).max(1) as i64;
        let controls = [
            (CID_EXPOSURE_AUTO, EXPOSURE_MANUAL),
            (CID_EXPOSURE_ABSOLUTE, units),
        ];
        for (id, value) in controls {
            if let Err(err) = device.set_control(Control {
                id,
                value: Value::Integer(value),
            }) {
                log::warn!(
                    "IndustrialSource: failed to set control {:#x} on {}: {}",
                    id,
                    self.config.url,
                    err
                );
            }
        }
    }
}

impl CaptureBackend for IndustrialSource {
    fn name(&self) -> String {
        self.config.url.clone()
    }

    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;

        self.close();
        let device = v4l::Device::with_path(&self.config.url)
            .with_context(|| format!("open v4l2 device {}", self.config.url))?;
        self.configure(&device)?;

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, CAPTURE_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "IndustrialSource: connected to {} ({}x{} {:?})",
            self.config.url,
            self.active_width,
            self.active_height,
            self.layout
        );
        Ok(())
    }

    fn grab(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let captured = state.with_mut(|fields| {
            fields
                .stream
                .next()
                .map(|(buf, _meta)| buf.to_vec())
        });
        let mut pixels = match captured {
            Ok(pixels) => pixels,
            Err(err) => {
                self.state = None;
                return Err(anyhow::Error::new(err).context("capture v4l2 frame"));
            }
        };

        let expected =
            self.active_width as usize * self.active_height as usize * self.layout.channels();
        if pixels.len() < expected {
            log::debug!(
                "IndustrialSource: short buffer from {} ({} < {})",
                self.config.url,
                pixels.len(),
                expected
            );
            return Ok(None);
        }
        pixels.truncate(expected);

        self.frame_count += 1;
        Frame::new(pixels, self.active_width, self.active_height, self.layout).map(Some)
    }

    fn close(&mut self) {
        self.state = None;
    }

    fn is_connected(&self) -> bool {
        self.state.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::BackendKind;

    #[test]
    fn missing_device_fails_to_connect() {
        let mut source = IndustrialSource::new(SourceConfig {
            kind: BackendKind::Industrial,
            url: "/dev/does-not-exist-video99".to_string(),
            force_mono: true,
            ..SourceConfig::default()
        });
        assert!(source.connect().is_err());
        assert!(!source.is_connected());
        assert!(source.grab().is_err());
    }
}
