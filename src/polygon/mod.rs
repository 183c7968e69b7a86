//! Heat map to region-of-interest polygon.
//!
//! `extract_anomaly_polygon` is a pure function: resize the score map to the
//! frame, threshold and clean it up, pick the strongest external contour and
//! simplify it. When no contour qualifies it falls back to a square box around
//! the global peak, so every detection carries a region.

pub mod contour;
pub mod heatmap;
pub mod morphology;
pub mod simplify;

use serde::{Deserialize, Serialize};

pub use contour::{find_external_contours, BoundingBox, Contour};
pub use heatmap::HeatMap;
pub use morphology::Mask;

/// Thresholds and shape parameters for polygon extraction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolygonParams {
    /// Binarisation threshold.
    pub tau: f64,
    /// A contour must contain at least one pixel above this score.
    pub tau_strong: f64,
    /// Minimum bounding-box area as a fraction of the frame area.
    pub min_area_frac: f64,
    /// Simplification epsilon as a fraction of the contour perimeter.
    pub approx_eps_frac: f64,
    pub morph_kernel: usize,
    pub morph_iters: usize,
    pub min_box_frac: f64,
    pub min_box_px: u32,
}

impl Default for PolygonParams {
    fn default() -> Self {
        Self {
            tau: 0.6,
            tau_strong: 0.8,
            min_area_frac: 0.001,
            approx_eps_frac: 0.005,
            morph_kernel: 3,
            morph_iters: 1,
            min_box_frac: 0.06,
            min_box_px: 32,
        }
    }
}

/// Polygon with vertices normalised to `[0,1] x [0,1]`, serialised as
/// `[[x, y], ...]`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedPolygon(pub Vec<[f64; 2]>);

impl NormalizedPolygon {
    pub fn points(&self) -> &[[f64; 2]] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Vertices in pixel coordinates of a `width` x `height` image.
    pub fn to_pixels(&self, width: u32, height: u32) -> Vec<(f64, f64)> {
        self.0
            .iter()
            .map(|[x, y]| (x * width as f64, y * height as f64))
            .collect()
    }

    /// Pixel bounding box `(x0, y0, x1, y1)`, inclusive and clamped to the
    /// image. `None` for an empty polygon or image.
    pub fn pixel_bounds(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        if self.0.is_empty() || width == 0 || height == 0 {
            return None;
        }
        let pixels = self.to_pixels(width, height);
        let (mut x0, mut y0) = (f64::INFINITY, f64::INFINITY);
        let (mut x1, mut y1) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (x, y) in pixels {
            x0 = x0.min(x);
            y0 = y0.min(y);
            x1 = x1.max(x);
            y1 = y1.max(y);
        }
        let clamp = |v: f64, hi: u32| v.floor().clamp(0.0, (hi - 1) as f64) as u32;
        Some((
            clamp(x0, width),
            clamp(y0, height),
            clamp(x1, width),
            clamp(y1, height),
        ))
    }
}

/// Most salient anomalous region of `heat_map` in a `frame_width` x
/// `frame_height` frame.
pub fn extract_anomaly_polygon(
    heat_map: &HeatMap,
    frame_width: u32,
    frame_height: u32,
    params: &PolygonParams,
) -> NormalizedPolygon {
    let width = frame_width.max(1) as usize;
    let height = frame_height.max(1) as usize;
    let scores = match heat_map.clamped().resize_bilinear(width, height) {
        Ok(map) => map,
        Err(_) => return fallback_box((0, 0), width, height, params),
    };
    let peak = scores.peak();

    let mut mask = Mask::threshold(&scores, params.tau);
    let kernel = params.morph_kernel;
    if kernel >= 3 && kernel % 2 == 1 && params.morph_iters > 0 {
        mask = mask
            .open(kernel, params.morph_iters)
            .close(kernel, params.morph_iters);
    }

    let min_area = (width * height) as f64 * params.min_area_frac;
    let mut best: Option<(bool, f64, Contour)> = None;
    for contour in find_external_contours(&mask) {
        if (contour.bbox.area() as f64) < min_area {
            continue;
        }
        let (mean, local_max) = region_stats(&scores, contour.region());
        if local_max < params.tau_strong {
            continue;
        }
        let has_peak = contour.contains(peak.0, peak.1);
        let better = match &best {
            None => true,
            Some((best_peak, best_mean, _)) => (has_peak, mean) > (*best_peak, *best_mean),
        };
        if better {
            best = Some((has_peak, mean, contour));
        }
    }

    let Some((_, _, contour)) = best else {
        return fallback_box(peak, width, height, params);
    };

    let epsilon = (params.approx_eps_frac * contour.perimeter()).max(1.0);
    let simplified = simplify::simplify_closed(&contour.points, epsilon);
    let vertices: Vec<(f64, f64)> = if simplified.len() < 3 {
        let b = contour.bbox;
        let (x, y) = (b.x as f64, b.y as f64);
        let (w, h) = (b.width as f64, b.height as f64);
        vec![(x, y), (x + w, y), (x + w, y + h), (x, y + h)]
    } else {
        simplified
            .iter()
            .map(|&(x, y)| {
                (
                    (x as f64).clamp(0.0, (width - 1) as f64),
                    (y as f64).clamp(0.0, (height - 1) as f64),
                )
            })
            .collect()
    };
    normalize(&vertices, width, height)
}

fn region_stats(scores: &HeatMap, region: &[usize]) -> (f64, f64) {
    if region.is_empty() {
        return (0.0, 0.0);
    }
    let values = scores.values();
    let mut sum = 0.0f64;
    let mut max = 0.0f64;
    for &idx in region {
        let v = values[idx] as f64;
        sum += v;
        max = max.max(v);
    }
    (sum / region.len() as f64, max)
}

/// Square of side `max(min_box_px, min_box_frac * min(H, W))` around the
/// peak, shifted to stay inside the frame.
fn fallback_box(
    peak: (usize, usize),
    width: usize,
    height: usize,
    params: &PolygonParams,
) -> NormalizedPolygon {
    let scaled = (width.min(height) as f64 * params.min_box_frac).round_ties_even() as i64;
    let size = (params.min_box_px as i64).max(scaled);
    let (w, h) = (width as i64, height as i64);
    let span = |center: usize, extent: i64| {
        let start = (center as i64 - size / 2).min(extent - 1).max(0);
        let end = (start + size).min(extent).max(start + 1);
        (start as f64, end as f64)
    };
    let (x1, x2) = span(peak.0, w);
    let (y1, y2) = span(peak.1, h);
    normalize(&[(x1, y1), (x2, y1), (x2, y2), (x1, y2)], width, height)
}

fn normalize(vertices: &[(f64, f64)], width: usize, height: usize) -> NormalizedPolygon {
    let (w, h) = (width.max(1) as f64, height.max(1) as f64);
    NormalizedPolygon(
        vertices
            .iter()
            .map(|&(x, y)| [(x / w).clamp(0.0, 1.0), (y / h).clamp(0.0, 1.0)])
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn in_box(p: &[f64; 2], x0: f64, y0: f64, x1: f64, y1: f64) -> bool {
        p[0] >= x0 && p[0] <= x1 && p[1] >= y0 && p[1] <= y1
    }

    #[test]
    fn all_zero_map_falls_back_to_box_at_origin() -> Result<()> {
        let map = HeatMap::new(8, 8, vec![0.0; 64])?;
        let poly = extract_anomaly_polygon(&map, 200, 100, &PolygonParams::default());
        // min side 100 * 0.06 = 6 < 32, so the box is 32 px from the clamped origin.
        assert_eq!(
            poly.0,
            vec![[0.0, 0.0], [0.16, 0.0], [0.16, 0.32], [0.0, 0.32]]
        );
        Ok(())
    }

    #[test]
    fn fallback_box_stays_inside_near_the_far_corner() -> Result<()> {
        let map = HeatMap::from_fn(10, 10, |x, y| if x == 9 && y == 9 { 0.5 } else { 0.0 })?;
        let poly = extract_anomaly_polygon(&map, 10, 10, &PolygonParams::default());
        assert_eq!(poly.len(), 4);
        assert!(poly.points().iter().all(|p| in_box(p, 0.0, 0.0, 1.0, 1.0)));
        // x1 = min(9 - 16, 9) clamped to 0, x2 = min(0 + 32, 10).
        assert_eq!(poly.0[0], [0.0, 0.0]);
        assert_eq!(poly.0[2], [1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn region_containing_the_peak_wins_over_a_brighter_one() -> Result<()> {
        // Left block: large, uniform 0.9. Right block: small, 0.85 with a
        // single 0.95 pixel that is the global peak.
        let map = HeatMap::from_fn(100, 60, |x, y| {
            if (5..45).contains(&x) && (5..55).contains(&y) {
                0.9
            } else if (70..80).contains(&x) && (20..30).contains(&y) {
                if x == 75 && y == 25 {
                    0.95
                } else {
                    0.85
                }
            } else {
                0.0
            }
        })?;
        let poly = extract_anomaly_polygon(&map, 100, 60, &PolygonParams::default());
        assert!(poly.len() >= 3);
        for p in poly.points() {
            assert!(in_box(p, 0.69, 0.33, 0.80, 0.50), "vertex {p:?} outside right block");
        }
        Ok(())
    }

    #[test]
    fn higher_mean_wins_when_neither_contains_the_peak() -> Result<()> {
        let params = PolygonParams {
            morph_kernel: 1,
            ..PolygonParams::default()
        };
        // Both blocks are above tau_strong; the peak sits in a speck too small
        // to survive the area filter.
        let map = HeatMap::from_fn(100, 100, |x, y| {
            if x == 95 && y == 95 {
                1.0
            } else if (10..30).contains(&x) && (10..30).contains(&y) {
                0.82
            } else if (60..80).contains(&x) && (10..30).contains(&y) {
                0.9
            } else {
                0.0
            }
        })?;
        let poly = extract_anomaly_polygon(&map, 100, 100, &params);
        for p in poly.points() {
            assert!(in_box(p, 0.59, 0.09, 0.80, 0.30), "vertex {p:?} outside brighter block");
        }
        Ok(())
    }

    #[test]
    fn weak_regions_are_rejected() -> Result<()> {
        // Above tau but never above tau_strong: only the fallback remains.
        let map = HeatMap::from_fn(50, 50, |x, y| {
            if (10..40).contains(&x) && (10..40).contains(&y) {
                0.7
            } else {
                0.0
            }
        })?;
        let poly = extract_anomaly_polygon(&map, 50, 50, &PolygonParams::default());
        // Peak (10,10): x1 = 10 - 16 -> 0, x2 = 32.
        assert_eq!(poly.0[0], [0.0, 0.0]);
        assert_eq!(poly.0[1], [32.0 / 50.0, 0.0]);
        Ok(())
    }

    #[test]
    fn rectangle_simplifies_to_four_clipped_corners() -> Result<()> {
        let map = HeatMap::from_fn(40, 20, |x, y| {
            if (10..30).contains(&x) && (5..15).contains(&y) {
                1.0
            } else {
                0.0
            }
        })?;
        let poly = extract_anomaly_polygon(&map, 40, 20, &PolygonParams::default());
        assert_eq!(poly.len(), 4);
        for corner in [[10.0 / 40.0, 5.0 / 20.0], [29.0 / 40.0, 14.0 / 20.0]] {
            assert!(poly.points().contains(&corner), "missing {corner:?} in {poly:?}");
        }
        Ok(())
    }

    #[test]
    fn thin_regions_fall_back_to_their_bounding_box() -> Result<()> {
        let params = PolygonParams {
            morph_kernel: 1,
            min_area_frac: 0.0,
            ..PolygonParams::default()
        };
        // A one-pixel horizontal line traces to a two-point chain.
        let map = HeatMap::from_fn(20, 10, |x, y| {
            if y == 4 && (2..12).contains(&x) {
                1.0
            } else {
                0.0
            }
        })?;
        let poly = extract_anomaly_polygon(&map, 20, 10, &params);
        assert_eq!(
            poly.0,
            vec![[0.1, 0.4], [0.6, 0.4], [0.6, 0.5], [0.1, 0.5]]
        );
        Ok(())
    }

    #[test]
    fn serialises_as_nested_arrays() -> Result<()> {
        let poly = NormalizedPolygon(vec![[0.25, 0.5], [1.0, 0.0]]);
        assert_eq!(serde_json::to_string(&poly)?, "[[0.25,0.5],[1.0,0.0]]");
        Ok(())
    }
}
