//! HTTP MJPEG/JPEG frame source.
//!
//! Generic network cameras usually expose either a `multipart/x-mixed-replace`
//! MJPEG stream or a single-JPEG snapshot endpoint. `MjpegSource` detects the
//! variant from the response content type on connect and decodes each JPEG
//! in memory.

use anyhow::{anyhow, Context, Result};
use image::GenericImageView;
use std::io::Read;
use std::time::{Duration, Instant};

use super::{CaptureBackend, SourceConfig};
use crate::frame::{Frame, PixelLayout};

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(3);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// Longest single sleep while waiting out a snapshot interval.
const SNAPSHOT_WAIT_STEP: Duration = Duration::from_millis(50);

pub struct MjpegSource {
    config: SourceConfig,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
    frame_count: u64,
}

enum HttpStream {
    Mjpeg(MjpegReader),
    SingleJpeg,
}

impl MjpegSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        url::Url::parse(&config.url).with_context(|| format!("parse stream url {}", config.url))?;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        Ok(Self {
            config,
            agent,
            stream: None,
            last_frame_at: None,
            frame_count: 0,
        })
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn next_jpeg(&mut self) -> Result<Vec<u8>> {
        match self.stream.as_mut() {
            Some(HttpStream::Mjpeg(reader)) => reader.read_next_jpeg(),
            Some(HttpStream::SingleJpeg) => fetch_single_jpeg(&self.agent, &self.config.url),
            None => Err(anyhow!("http source not connected; call connect() first")),
        }
    }

    /// Time left before the next frame is due, if any.
    fn until_next_frame(&self, now: Instant) -> Option<Duration> {
        let last = self.last_frame_at?;
        let remaining = self.frame_interval().saturating_sub(now.duration_since(last));
        (!remaining.is_zero()).then_some(remaining)
    }

    fn frame_interval(&self) -> Duration {
        if self.config.target_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis((1000 / self.config.target_fps).max(1) as u64)
        }
    }
}

impl CaptureBackend for MjpegSource {
    fn name(&self) -> String {
        self.config.url.clone()
    }

    fn connect(&mut self) -> Result<()> {
        self.close();
        let response = self
            .agent
            .get(&self.config.url)
            .call()
            .with_context(|| format!("connect to http stream {}", self.config.url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        if content_type.contains("multipart") {
            self.stream = Some(HttpStream::Mjpeg(MjpegReader::new(response.into_reader())));
        } else {
            self.stream = Some(HttpStream::SingleJpeg);
        }
        log::info!("MjpegSource: connected to {} ({})", self.config.url, content_type);
        Ok(())
    }

    fn grab(&mut self) -> Result<Option<Frame>> {
        // Snapshots are only fetched when due; a multipart stream is read
        // regardless so the socket keeps draining.
        if matches!(self.stream, Some(HttpStream::SingleJpeg)) {
            if let Some(remaining) = self.until_next_frame(Instant::now()) {
                std::thread::sleep(remaining.min(SNAPSHOT_WAIT_STEP));
                return Ok(None);
            }
        }
        let jpeg = match self.next_jpeg() {
            Ok(jpeg) => jpeg,
            Err(err) => {
                self.stream = None;
                return Err(err);
            }
        };

        let now = Instant::now();
        if self.until_next_frame(now).is_some() {
            // Decimated: the session is fine, there is just nothing new to hand out.
            return Ok(None);
        }

        let frame = decode_jpeg(&jpeg, self.config.force_mono)?;
        self.frame_count += 1;
        self.last_frame_at = Some(now);
        Ok(Some(frame))
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

struct MjpegReader {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegReader {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            let bounds = match sized_part(&self.buffer)? {
                PartBody::Complete { start, end } => Some((start, end)),
                PartBody::Pending => None,
                PartBody::Unsized => find_jpeg_bounds(&self.buffer),
            };
            if let Some((start, end)) = bounds {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

enum PartBody {
    Complete { start: usize, end: usize },
    /// Headers announce a length the buffer does not hold yet.
    Pending,
    /// No usable `Content-Length`; fall back to scanning for JPEG markers.
    Unsized,
}

/// Locate the body of the next multipart part from its `Content-Length`
/// header. Marker scanning stops at the first EOI, which cuts JPEGs that
/// carry an embedded thumbnail.
fn sized_part(buffer: &[u8]) -> Result<PartBody> {
    let skip = buffer.iter().take_while(|&&b| b == b'\r' || b == b'\n').count();
    let rest = &buffer[skip..];
    let Some(header_len) = rest.windows(4).position(|w| w == b"\r\n\r\n") else {
        return Ok(PartBody::Unsized);
    };
    let headers = String::from_utf8_lossy(&rest[..header_len]);
    let length = headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("content-length") {
            return None;
        }
        value.trim().parse::<usize>().ok()
    });
    let Some(length) = length else {
        return Ok(PartBody::Unsized);
    };
    if length > MAX_JPEG_BYTES {
        return Err(anyhow!("mjpeg part of {} bytes exceeds the {} byte limit", length, MAX_JPEG_BYTES));
    }
    let start = skip + header_len + 4;
    let end = start + length;
    if buffer.len() < end {
        return Ok(PartBody::Pending);
    }
    if !buffer[start..end].starts_with(&[0xFF, 0xD8]) {
        return Ok(PartBody::Unsized);
    }
    Ok(PartBody::Complete { start, end })
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

pub(crate) fn decode_jpeg(bytes: &[u8], force_mono: bool) -> Result<Frame> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    if force_mono {
        Frame::new(image.into_luma8().into_raw(), width, height, PixelLayout::Mono8)
    } else {
        Frame::new(image.into_rgb8().into_raw(), width, height, PixelLayout::Rgb8)
    }
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn tiny_jpeg() -> Result<Vec<u8>> {
        let frame = Frame::new(vec![90u8; 8 * 8 * 3], 8, 8, PixelLayout::Rgb8)?;
        frame.encode_jpeg(90)
    }

    #[test]
    fn finds_jpeg_bounds_inside_multipart_noise() {
        let data = [0x00, 0x11, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, 0x33];
        assert_eq!(find_jpeg_bounds(&data), Some((2, 8)));
        assert_eq!(find_jpeg_bounds(&[0xFF, 0xD8, 0x00]), None);
    }

    #[test]
    fn mjpeg_reader_splits_consecutive_frames() -> Result<()> {
        let jpeg = tiny_jpeg()?;
        let mut body = Vec::new();
        for _ in 0..2 {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(&jpeg);
            body.extend_from_slice(b"\r\n");
        }
        let mut reader = MjpegReader::new(Box::new(Cursor::new(body)));
        assert_eq!(reader.read_next_jpeg()?, jpeg);
        assert_eq!(reader.read_next_jpeg()?, jpeg);
        assert!(reader.read_next_jpeg().is_err());
        Ok(())
    }

    /// A JPEG whose APP1 segment carries a thumbnail with its own SOI/EOI.
    fn jpeg_with_thumbnail() -> Result<Vec<u8>> {
        let plain = tiny_jpeg()?;
        let mut jpeg = plain[..2].to_vec();
        jpeg.extend_from_slice(&[0xFF, 0xE1, 0x00, 0x08, 0xFF, 0xD8, 0x00, 0x00, 0xFF, 0xD9]);
        jpeg.extend_from_slice(&plain[2..]);
        Ok(jpeg)
    }

    #[test]
    fn content_length_keeps_jpegs_with_embedded_thumbnails_whole() -> Result<()> {
        let jpeg = jpeg_with_thumbnail()?;
        let (_, cut) = find_jpeg_bounds(&jpeg).expect("markers");
        assert!(cut < jpeg.len());

        let mut body = Vec::new();
        for _ in 0..2 {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\ncontent-length: ");
            body.extend_from_slice(jpeg.len().to_string().as_bytes());
            body.extend_from_slice(b"\r\n\r\n");
            body.extend_from_slice(&jpeg);
            body.extend_from_slice(b"\r\n");
        }
        let mut reader = MjpegReader::new(Box::new(Cursor::new(body)));
        let first = reader.read_next_jpeg()?;
        assert_eq!(first, jpeg);
        assert_eq!(reader.read_next_jpeg()?, jpeg);
        assert!(reader.read_next_jpeg().is_err());

        let frame = decode_jpeg(&first, false)?;
        assert_eq!((frame.width, frame.height), (8, 8));
        Ok(())
    }

    #[test]
    fn oversized_content_length_is_rejected() {
        let body = format!(
            "--frame\r\nContent-Length: {}\r\n\r\n",
            MAX_JPEG_BYTES + 1
        );
        let mut reader = MjpegReader::new(Box::new(Cursor::new(body.into_bytes())));
        assert!(reader.read_next_jpeg().is_err());
    }

    fn snapshot_source(target_fps: u32) -> Result<MjpegSource> {
        // Nothing listens on the discard port, so any fetch fails fast.
        let mut source = MjpegSource::new(SourceConfig {
            kind: crate::ingest::BackendKind::Stream,
            url: "http://127.0.0.1:9/snapshot.jpg".to_string(),
            width: 8,
            height: 8,
            target_fps,
            force_mono: false,
            exposure_us: None,
        })?;
        source.stream = Some(HttpStream::SingleJpeg);
        Ok(source)
    }

    #[test]
    fn snapshot_is_not_fetched_before_the_frame_interval() -> Result<()> {
        let mut source = snapshot_source(1)?;
        source.last_frame_at = Some(Instant::now());

        let started = Instant::now();
        assert!(source.grab()?.is_none());
        assert!(source.grab()?.is_none());
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(source.is_connected());
        Ok(())
    }

    #[test]
    fn due_snapshot_is_fetched() -> Result<()> {
        let mut source = snapshot_source(20)?;
        source.last_frame_at = Some(Instant::now() - Duration::from_millis(60));
        assert!(source.grab().is_err());
        assert!(!source.is_connected());
        Ok(())
    }

    #[test]
    fn decodes_jpeg_into_rgb_or_mono_frames() -> Result<()> {
        let jpeg = tiny_jpeg()?;
        let rgb = decode_jpeg(&jpeg, false)?;
        assert_eq!((rgb.width, rgb.height, rgb.layout), (8, 8, PixelLayout::Rgb8));
        let mono = decode_jpeg(&jpeg, true)?;
        assert_eq!(mono.layout, PixelLayout::Mono8);
        assert_eq!(mono.pixels().len(), 64);
        Ok(())
    }
}
