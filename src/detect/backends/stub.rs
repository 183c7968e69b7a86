use anyhow::Result;

use crate::detect::backend::{AnomalyModel, AnomalyPrediction};
use crate::frame::Frame;
use crate::polygon::HeatMap;

/// Stub anomaly model: the heat map is block-averaged luminance and the score
/// is its maximum. Bright regions read as anomalies. Always available, no
/// model file needed.
pub struct StubAnomalyModel {
    grid_width: usize,
    grid_height: usize,
}

impl StubAnomalyModel {
    pub fn new(grid_width: u32, grid_height: u32) -> Self {
        Self {
            grid_width: grid_width.max(1) as usize,
            grid_height: grid_height.max(1) as usize,
        }
    }
}

impl Default for StubAnomalyModel {
    fn default() -> Self {
        Self::new(32, 32)
    }
}

impl AnomalyModel for StubAnomalyModel {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn predict(&mut self, frame: &Frame) -> Result<AnomalyPrediction> {
        let width = frame.width as usize;
        let height = frame.height as usize;
        let cols = self.grid_width.min(width);
        let rows = self.grid_height.min(height);

        let mut sums = vec![0.0f64; cols * rows];
        let mut counts = vec![0u32; cols * rows];
        for y in 0..height {
            let row = y * rows / height;
            for x in 0..width {
                let col = x * cols / width;
                let [r, g, b] = frame.rgb_at(x as u32, y as u32);
                let luma = 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
                sums[row * cols + col] += luma / 255.0;
                counts[row * cols + col] += 1;
            }
        }
        let data = sums
            .iter()
            .zip(&counts)
            .map(|(&sum, &n)| if n == 0 { 0.0 } else { (sum / n as f64) as f32 })
            .collect();
        let heat_map = HeatMap::new(cols, rows, data)?;
        let score = heat_map.max_value() as f64;
        Ok(AnomalyPrediction { score, heat_map })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelLayout;

    #[test]
    fn bright_block_drives_score_and_peak() -> Result<()> {
        let (width, height) = (64u32, 32u32);
        let mut pixels = vec![20u8; (width * height) as usize];
        for y in 8..16 {
            for x in 40..48 {
                pixels[(y * width + x) as usize] = 250;
            }
        }
        let frame = Frame::new(pixels, width, height, PixelLayout::Mono8)?;
        let mut model = StubAnomalyModel::new(8, 4);
        let prediction = model.predict(&frame)?;
        assert_eq!(prediction.heat_map.width(), 8);
        assert_eq!(prediction.heat_map.height(), 4);
        assert_eq!(prediction.heat_map.peak(), (5, 1));
        assert!((prediction.score - 250.0 / 255.0).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn grid_never_exceeds_frame_size() -> Result<()> {
        let frame = Frame::new(vec![0u8; 4 * 2 * 3], 4, 2, PixelLayout::Rgb8)?;
        let prediction = StubAnomalyModel::default().predict(&frame)?;
        assert_eq!(prediction.heat_map.width(), 4);
        assert_eq!(prediction.heat_map.height(), 2);
        assert_eq!(prediction.score, 0.0);
        Ok(())
    }
}
