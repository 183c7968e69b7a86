//! Dense anomaly score maps.

use anyhow::{anyhow, Result};

/// Row-major `f32` score map.
#[derive(Clone, Debug, PartialEq)]
pub struct HeatMap {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl HeatMap {
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("heat map dimensions must be non-zero"));
        }
        if data.len() != width * height {
            return Err(anyhow!(
                "heat map length mismatch: expected {} values for {}x{}, got {}",
                width * height,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> f32) -> Result<Self> {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self::new(width, height, data)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn values(&self) -> &[f32] {
        &self.data
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Values clamped to [0,1]; NaN becomes 0.
    pub fn clamped(&self) -> HeatMap {
        HeatMap {
            width: self.width,
            height: self.height,
            data: self
                .data
                .iter()
                .map(|&v| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) })
                .collect(),
        }
    }

    /// Largest value; 0 for a map of NaNs.
    pub fn max_value(&self) -> f32 {
        self.data
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .fold(f32::NEG_INFINITY, f32::max)
            .max(0.0)
    }

    /// Location of the maximum; the first one in row-major order on ties.
    pub fn peak(&self) -> (usize, usize) {
        let mut best = 0;
        for (idx, &value) in self.data.iter().enumerate() {
            if value > self.data[best] {
                best = idx;
            }
        }
        (best % self.width, best / self.width)
    }

    /// Bilinear resize with pixel-centre alignment:
    /// `src = (dst + 0.5) * (src_len / dst_len) - 0.5`, clamped at the edges.
    pub fn resize_bilinear(&self, width: usize, height: usize) -> Result<HeatMap> {
        if width == 0 || height == 0 {
            return Err(anyhow!("cannot resize heat map to {}x{}", width, height));
        }
        if width == self.width && height == self.height {
            return Ok(self.clone());
        }
        let xs = axis_taps(self.width, width);
        let ys = axis_taps(self.height, height);
        let mut data = Vec::with_capacity(width * height);
        for &(y0, y1, wy) in &ys {
            let row0 = &self.data[y0 * self.width..(y0 + 1) * self.width];
            let row1 = &self.data[y1 * self.width..(y1 + 1) * self.width];
            for &(x0, x1, wx) in &xs {
                let top = row0[x0] * (1.0 - wx) + row0[x1] * wx;
                let bottom = row1[x0] * (1.0 - wx) + row1[x1] * wx;
                data.push(top * (1.0 - wy) + bottom * wy);
            }
        }
        HeatMap::new(width, height, data)
    }
}

/// Source taps `(i0, i1, weight_of_i1)` for every destination index.
fn axis_taps(src_len: usize, dst_len: usize) -> Vec<(usize, usize, f32)> {
    let scale = src_len as f64 / dst_len as f64;
    let last = src_len - 1;
    (0..dst_len)
        .map(|d| {
            let pos = (d as f64 + 0.5) * scale - 0.5;
            let base = pos.floor();
            let frac = pos - base;
            if base < 0.0 {
                (0, 0, 0.0)
            } else if base as usize >= last {
                (last, last, 0.0)
            } else {
                let i0 = base as usize;
                (i0, i0 + 1, frac as f32)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_dimensions() {
        assert!(HeatMap::new(0, 2, Vec::new()).is_err());
        assert!(HeatMap::new(2, 2, vec![0.0; 3]).is_err());
    }

    #[test]
    fn peak_prefers_the_first_maximum() -> Result<()> {
        let map = HeatMap::new(3, 2, vec![0.1, 0.9, 0.2, 0.9, 0.0, 0.0])?;
        assert_eq!(map.peak(), (1, 0));
        let zeros = HeatMap::new(4, 4, vec![0.0; 16])?;
        assert_eq!(zeros.peak(), (0, 0));
        Ok(())
    }

    #[test]
    fn clamping_removes_out_of_range_values() -> Result<()> {
        let map = HeatMap::new(2, 2, vec![-1.0, 2.0, f32::NAN, 0.5])?.clamped();
        assert_eq!(map.values(), &[0.0, 1.0, 0.0, 0.5]);
        assert_eq!(map.max_value(), 1.0);
        Ok(())
    }

    #[test]
    fn upscaling_interpolates_between_centres() -> Result<()> {
        let map = HeatMap::new(2, 1, vec![0.0, 1.0])?;
        let wide = map.resize_bilinear(4, 1)?;
        // Centres of the 2-wide source land at 0.5 and 2.5 in the 4-wide grid.
        assert_eq!(wide.values(), &[0.0, 0.25, 0.75, 1.0]);
        Ok(())
    }

    #[test]
    fn constant_maps_stay_constant() -> Result<()> {
        let map = HeatMap::new(3, 3, vec![0.4; 9])?;
        let resized = map.resize_bilinear(7, 5)?;
        assert!(resized.values().iter().all(|v| (v - 0.4).abs() < 1e-6));
        Ok(())
    }
}
