//! RTSP frame source backed by GStreamer.
//!
//! The pipeline is rebuilt on every `connect()` so a stalled or errored
//! session can be recovered by the stream's reconnect loop without keeping
//! any half-dead element state around.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::time::{Duration, Instant};

use super::{CaptureBackend, SourceConfig};
use crate::frame::{Frame, PixelLayout};

pub struct RtspSource {
    config: SourceConfig,
    session: Option<RtspSession>,
    frame_count: u64,
}

struct RtspSession {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    connected_at: Instant,
}

impl RtspSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self {
            config,
            session: None,
            frame_count: 0,
        })
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn build_session(&self) -> Result<RtspSession> {
        let format = if self.config.force_mono { "GRAY8" } else { "RGB" };
        let description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format={} ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            self.config.url, format
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;

        Ok(RtspSession {
            pipeline,
            appsink,
            connected_at: Instant::now(),
        })
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }
}

impl CaptureBackend for RtspSource {
    fn name(&self) -> String {
        self.config.url.clone()
    }

    fn connect(&mut self) -> Result<()> {
        self.close();
        let session = self.build_session()?;
        self.session = Some(session);
        log::info!("RtspSource: connected to {}", self.config.url);
        Ok(())
    }

    fn grab(&mut self) -> Result<Option<Frame>> {
        let timeout = self.frame_timeout();
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| anyhow!("RTSP source not connected"))?;

        if let Err(err) = session.check_bus() {
            self.close();
            return Err(err);
        }

        let clock_timeout = gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64);
        let Some(sample) = session.appsink.try_pull_sample(clock_timeout) else {
            if session.appsink.is_eos() {
                self.close();
                return Err(anyhow!("RTSP stream {} reached EOS", self.config.url));
            }
            log::debug!(
                "RtspSource: no sample from {} within {:?} (session age {:?})",
                self.config.url,
                timeout,
                session.connected_at.elapsed()
            );
            return Ok(None);
        };

        let layout = if self.config.force_mono {
            PixelLayout::Mono8
        } else {
            PixelLayout::Rgb8
        };
        let (pixels, width, height) = sample_to_pixels(&sample, layout.channels())?;
        self.frame_count += 1;
        Frame::new(pixels, width, height, layout).map(Some)
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(err) = session.pipeline.set_state(gstreamer::State::Null) {
                log::warn!("RtspSource: failed to stop pipeline {}: {}", self.config.url, err);
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        self.close();
    }
}

impl RtspSession {
    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Err(anyhow!("gstreamer reached EOS")),
                _ => {}
            }
        }
        Ok(())
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample, channels: usize) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = width as usize * channels;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data.get(..len).context("RTSP buffer shorter than frame")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("RTSP buffer row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}
