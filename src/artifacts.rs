//! Best-effort debug artifacts for positive detections.
//!
//! Layout: `<root>/PO_<post_id>/<YYYY-mm-dd_HH-MM-SS.mmm>/` containing
//! `frame.jpg`, `overlay.jpg` (polygon outline in red), `heatmap.jpg` (jet
//! colour map at frame resolution) and `meta.json`.

use anyhow::{Context, Result};
use chrono::Local;
use image::{Rgb, RgbImage};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::detect::DetectionCandidate;
use crate::frame::{encode_rgb_jpeg, Frame};
use crate::polygon::{HeatMap, NormalizedPolygon};

const OUTLINE: Rgb<u8> = Rgb([255, 0, 0]);

#[derive(Serialize)]
struct FrameShape {
    h: u32,
    w: u32,
}

#[derive(Serialize)]
struct ArtifactMeta<'a> {
    timestamp: &'a str,
    po: i64,
    polygon_norm: &'a NormalizedPolygon,
    anom_score: f64,
    pred_class_id: Option<i64>,
    pred_class_name: Option<&'a str>,
    pred_confidence: Option<f64>,
    frame_shape: FrameShape,
}

/// Write all artifacts for one detection and return the directory.
pub fn write_debug_artifacts(
    root: &Path,
    post_id: i64,
    frame: &Frame,
    candidate: &DetectionCandidate,
    heat_map: Option<&HeatMap>,
    jpeg_quality: u8,
) -> Result<PathBuf> {
    let stamp = candidate
        .frame_timestamp
        .with_timezone(&Local)
        .format("%Y-%m-%d_%H-%M-%S%.3f")
        .to_string();
    let dir = root.join(format!("PO_{}", post_id)).join(&stamp);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create artifact dir {}", dir.display()))?;

    let rgb = frame.to_rgb_image()?;
    write_file(&dir.join("frame.jpg"), &encode_rgb_jpeg(&rgb, jpeg_quality)?)?;

    let mut overlay = rgb;
    draw_polygon(&mut overlay, &candidate.polygon);
    write_file(&dir.join("overlay.jpg"), &encode_rgb_jpeg(&overlay, jpeg_quality)?)?;

    if let Some(map) = heat_map {
        let colored = colorize(map, frame.width, frame.height)?;
        write_file(&dir.join("heatmap.jpg"), &encode_rgb_jpeg(&colored, jpeg_quality)?)?;
    }

    let meta = ArtifactMeta {
        timestamp: &stamp,
        po: post_id,
        polygon_norm: &candidate.polygon,
        anom_score: candidate.score,
        pred_class_id: candidate.class_id,
        pred_class_name: candidate.class_name.as_deref(),
        pred_confidence: candidate.class_confidence,
        frame_shape: FrameShape {
            h: frame.height,
            w: frame.width,
        },
    };
    let json = serde_json::to_vec_pretty(&meta).context("encode meta.json")?;
    write_file(&dir.join("meta.json"), &json)?;
    Ok(dir)
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

/// Closed outline, two pixels thick.
fn draw_polygon(image: &mut RgbImage, polygon: &NormalizedPolygon) {
    let points: Vec<(i64, i64)> = polygon
        .to_pixels(image.width(), image.height())
        .into_iter()
        .map(|(x, y)| (x as i64, y as i64))
        .collect();
    if points.is_empty() {
        return;
    }
    for (i, &start) in points.iter().enumerate() {
        let end = points[(i + 1) % points.len()];
        draw_line(image, start, end);
    }
}

fn draw_line(image: &mut RgbImage, (mut x0, mut y0): (i64, i64), (x1, y1): (i64, i64)) {
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        for (ox, oy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            put_pixel(image, x0 + ox, y0 + oy);
        }
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

fn put_pixel(image: &mut RgbImage, x: i64, y: i64) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, OUTLINE);
    }
}

fn colorize(map: &HeatMap, width: u32, height: u32) -> Result<RgbImage> {
    let resized = map
        .clamped()
        .resize_bilinear(width as usize, height as usize)?;
    let mut image = RgbImage::new(width, height);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        *pixel = jet(resized.get(x as usize, y as usize));
    }
    Ok(image)
}

/// Jet colour map: blue at 0 through cyan, yellow, to red at 1.
fn jet(value: f32) -> Rgb<u8> {
    let v = value.clamp(0.0, 1.0);
    let channel = |center: f32| ((1.5 - (4.0 * v - center).abs()).clamp(0.0, 1.0) * 255.0) as u8;
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}
