use anyhow::{anyhow, Result};

use crate::detect::backend::RegionEmbedder;
use crate::frame::Frame;
use crate::polygon::NormalizedPolygon;

const BINS: usize = 8;

/// Colour-histogram region embedding.
///
/// Pools the polygon's bounding box into 8 bins per RGB channel followed by
/// the mean intensity of each channel; the whole vector is L1-normalised.
#[derive(Default)]
pub struct HistogramEmbedder;

impl HistogramEmbedder {
    pub fn new() -> Self {
        Self
    }
}

impl RegionEmbedder for HistogramEmbedder {
    fn name(&self) -> &'static str {
        "histogram"
    }

    fn dimension(&self) -> usize {
        BINS * 3 + 3
    }

    fn embed(&mut self, frame: &Frame, polygon: &NormalizedPolygon) -> Result<Vec<f32>> {
        let (x0, y0, x1, y1) = polygon
            .pixel_bounds(frame.width, frame.height)
            .ok_or_else(|| anyhow!("cannot embed an empty polygon"))?;

        let mut features = vec![0.0f32; self.dimension()];
        let mut means = [0.0f64; 3];
        let mut count = 0usize;
        for y in y0..=y1 {
            for x in x0..=x1 {
                let rgb = frame.rgb_at(x, y);
                for (channel, &value) in rgb.iter().enumerate() {
                    let bin = value as usize * BINS / 256;
                    features[channel * BINS + bin] += 1.0;
                    means[channel] += value as f64;
                }
                count += 1;
            }
        }
        for (channel, sum) in means.iter().enumerate() {
            features[BINS * 3 + channel] = (sum / count as f64 / 255.0) as f32;
        }
        let histogram_total = (count * 3) as f32;
        for value in &mut features[..BINS * 3] {
            *value /= histogram_total;
        }

        let norm: f32 = features.iter().map(|v| v.abs()).sum();
        if norm > 0.0 {
            for value in &mut features {
                *value /= norm;
            }
        }
        Ok(features)
    }
}
