//! capture_frames - save frames from a capture source as JPEG files
//!
//! Opens the source through a `BufferedStream`, the same way the daemon does,
//! and writes `frame_00000.jpg`, `frame_00001.jpg`, ... into `--out`.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anomaly_sentinel::{
    BackendKind, BufferedStream, Frame, FrameSource, SourceConfig, StreamConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Stream URL (`stub://`, `http(s)://`, `rtsp://`) or device path.
    #[arg(long)]
    url: String,
    /// Use the industrial (V4L2) backend.
    #[arg(long)]
    industrial: bool,
    #[arg(long, default_value_t = 640)]
    width: u32,
    #[arg(long, default_value_t = 480)]
    height: u32,
    #[arg(long, default_value_t = 10)]
    target_fps: u32,
    #[arg(long)]
    force_mono: bool,
    #[arg(long)]
    exposure_us: Option<u32>,
    /// Output directory.
    #[arg(long, default_value = "frames")]
    out: PathBuf,
    /// Number of frames to save.
    #[arg(long, default_value_t = 100)]
    count: usize,
    /// JPEG quality (1-100).
    #[arg(long, default_value_t = 90)]
    quality: u8,
    /// Save at most this many frames per second.
    #[arg(long)]
    fps_limit: Option<f64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if !(1..=100).contains(&args.quality) {
        return Err(anyhow!("--quality must be within 1..=100"));
    }
    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;

    let source = FrameSource::open(&SourceConfig {
        kind: if args.industrial {
            BackendKind::Industrial
        } else {
            BackendKind::Stream
        },
        url: args.url.clone(),
        width: args.width,
        height: args.height,
        target_fps: args.target_fps,
        force_mono: args.force_mono,
        exposure_us: args.exposure_us,
    })?;
    let stream = BufferedStream::new(
        Box::new(source),
        StreamConfig {
            start_paused: false,
            ..StreamConfig::default()
        },
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    stream.start()?;
    let min_interval = args
        .fps_limit
        .filter(|fps| *fps > 0.0)
        .map(|fps| Duration::from_secs_f64(1.0 / fps));
    let mut last_saved: Option<Instant> = None;
    let mut previous: Option<Frame> = None;
    let mut saved = 0usize;

    while saved < args.count && running.load(Ordering::SeqCst) {
        let status = stream.status();
        if status.terminated {
            stream.stop();
            return Err(anyhow!("stream {} gave up reconnecting", status.device));
        }
        let Some(frame) = stream.read(Duration::from_millis(500)) else {
            continue;
        };
        // `read` serves the last frame again when nothing new arrived.
        if previous.as_ref().is_some_and(|p| p.same_buffer(&frame)) {
            continue;
        }
        if let (Some(interval), Some(at)) = (min_interval, last_saved) {
            if at.elapsed() < interval {
                continue;
            }
        }
        let path = args.out.join(format!("frame_{:05}.jpg", saved));
        std::fs::write(&path, frame.encode_jpeg(args.quality)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        last_saved = Some(Instant::now());
        previous = Some(frame);
        saved += 1;
        if saved % 50 == 0 {
            log::info!("saved {}/{} frames", saved, args.count);
        }
    }

    stream.stop();
    log::info!("saved {} frame(s) to {}", saved, args.out.display());
    Ok(())
}
