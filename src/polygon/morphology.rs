//! Binary masks: threshold, erosion, dilation.
//!
//! Rectangular kernels only. Pixels outside the image never take part in a
//! min/max, so borders neither erode nor grow the mask.

use super::heatmap::HeatMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mask {
    pub width: usize,
    pub height: usize,
    data: Vec<bool>,
}

impl Mask {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![false; width * height],
        }
    }

    /// `v * 255` truncated to 8 bits, then strictly greater than
    /// `round(tau * 255)`.
    pub fn threshold(map: &HeatMap, tau: f64) -> Self {
        let level = (tau.clamp(0.0, 1.0) * 255.0).round_ties_even() as u8;
        let data = map
            .values()
            .iter()
            .map(|&v| (v.clamp(0.0, 1.0) * 255.0) as u8 > level)
            .collect();
        Self {
            width: map.width(),
            height: map.height(),
            data,
        }
    }

    pub fn get(&self, x: usize, y: usize) -> bool {
        self.data[y * self.width + x]
    }

    pub fn set(&mut self, x: usize, y: usize, value: bool) {
        self.data[y * self.width + x] = value;
    }

    pub fn is_set(&self, x: i64, y: i64) -> bool {
        x >= 0
            && y >= 0
            && (x as usize) < self.width
            && (y as usize) < self.height
            && self.data[y as usize * self.width + x as usize]
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }

    pub fn erode(&self, kernel: usize) -> Mask {
        self.rect_filter(kernel, true)
    }

    pub fn dilate(&self, kernel: usize) -> Mask {
        self.rect_filter(kernel, false)
    }

    pub fn open(&self, kernel: usize, iterations: usize) -> Mask {
        let mut out = self.clone();
        for _ in 0..iterations {
            out = out.erode(kernel);
        }
        for _ in 0..iterations {
            out = out.dilate(kernel);
        }
        out
    }

    pub fn close(&self, kernel: usize, iterations: usize) -> Mask {
        let mut out = self.clone();
        for _ in 0..iterations {
            out = out.dilate(kernel);
        }
        for _ in 0..iterations {
            out = out.erode(kernel);
        }
        out
    }

    /// Separable rectangular min (erode) or max (dilate).
    fn rect_filter(&self, kernel: usize, erode: bool) -> Mask {
        let radius = kernel / 2;
        // Erosion keeps a pixel only if no in-bounds neighbour is unset;
        // dilation sets it if any neighbour is set.
        let target = !erode;

        let mut horizontal = Mask::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let lo = x.saturating_sub(radius);
                let hi = (x + radius).min(self.width - 1);
                let hit = (lo..=hi).any(|xx| self.get(xx, y) == target);
                horizontal.set(x, y, hit == target);
            }
        }

        let mut out = Mask::new(self.width, self.height);
        for y in 0..self.height {
            let lo = y.saturating_sub(radius);
            let hi = (y + radius).min(self.height - 1);
            for x in 0..self.width {
                let hit = (lo..=hi).any(|yy| horizontal.get(x, yy) == target);
                out.set(x, y, hit == target);
            }
        }
        out
    }
}
