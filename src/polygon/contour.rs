//! External contours of a binary mask.
//!
//! Foreground is 8-connected (background 4-connected). Each outermost
//! component yields one `Contour`:
//! - `points`: its boundary traced clockwise (Moore neighbourhood)
//! - `region`: the pixels enclosed by that boundary, i.e. the component plus
//!   its holes
//!
//! Components lying inside another component's hole are not external and are
//! skipped.

use super::morphology::Mask;

/// Offsets in clockwise order (y grows downwards): E, SE, S, SW, W, NW, N, NE.
const DIRS: [(i64, i64); 8] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];
const WEST: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl BoundingBox {
    pub fn area(&self) -> usize {
        self.width * self.height
    }
}

#[derive(Clone, Debug)]
pub struct Contour {
    pub points: Vec<(i64, i64)>,
    pub bbox: BoundingBox,
    /// Row-major indices of enclosed pixels.
    region: Vec<usize>,
    image_width: usize,
}

impl Contour {
    pub fn region(&self) -> &[usize] {
        &self.region
    }

    pub fn contains(&self, x: usize, y: usize) -> bool {
        let inside_box = x >= self.bbox.x
            && y >= self.bbox.y
            && x < self.bbox.x + self.bbox.width
            && y < self.bbox.y + self.bbox.height;
        inside_box && self.region.binary_search(&(y * self.image_width + x)).is_ok()
    }

    /// Closed polyline length.
    pub fn perimeter(&self) -> f64 {
        closed_length(&self.points)
    }
}

pub fn closed_length(points: &[(i64, i64)]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| (((b.0 - a.0).pow(2) + (b.1 - a.1).pow(2)) as f64).sqrt())
        .sum()
}

/// External contours in raster order of each component's first pixel.
pub fn find_external_contours(mask: &Mask) -> Vec<Contour> {
    let (labels, firsts) = label_components(mask);
    let mut enclosed = vec![false; mask.width * mask.height];
    let mut contours = Vec::new();

    for (index, &first) in firsts.iter().enumerate() {
        let label = index as u32 + 1;
        if enclosed[first] {
            continue;
        }
        let Some(contour) = build_contour(mask, &labels, label, first) else {
            continue;
        };
        for &idx in &contour.region {
            if labels[idx] != label {
                enclosed[idx] = true;
            }
        }
        contours.push(contour);
    }
    contours
}

/// 8-connected labelling. Labels start at 1 in raster order of first pixel.
fn label_components(mask: &Mask) -> (Vec<u32>, Vec<usize>) {
    let (width, height) = (mask.width, mask.height);
    let mut labels = vec![0u32; width * height];
    let mut firsts = Vec::new();
    let mut stack = Vec::new();

    for start in 0..width * height {
        if labels[start] != 0 || !mask.get(start % width, start / width) {
            continue;
        }
        let label = firsts.len() as u32 + 1;
        firsts.push(start);
        labels[start] = label;
        stack.push(start);
        while let Some(idx) = stack.pop() {
            let (x, y) = ((idx % width) as i64, (idx / width) as i64);
            for (dx, dy) in DIRS {
                let (nx, ny) = (x + dx, y + dy);
                if !mask.is_set(nx, ny) {
                    continue;
                }
                let n = ny as usize * width + nx as usize;
                if labels[n] == 0 {
                    labels[n] = label;
                    stack.push(n);
                }
            }
        }
    }
    (labels, firsts)
}

fn build_contour(mask: &Mask, labels: &[u32], label: u32, first: usize) -> Option<Contour> {
    let width = mask.width;
    let in_component = |x: i64, y: i64| {
        x >= 0
            && y >= 0
            && (x as usize) < width
            && (y as usize) < mask.height
            && labels[y as usize * width + x as usize] == label
    };

    let max_steps = 4 * width * mask.height + 16;
    let points = trace_boundary(first, width, max_steps, &in_component)?;
    let (min_x, max_x) = minmax(points.iter().map(|p| p.0))?;
    let (min_y, max_y) = minmax(points.iter().map(|p| p.1))?;
    let bbox = BoundingBox {
        x: min_x as usize,
        y: min_y as usize,
        width: (max_x - min_x + 1) as usize,
        height: (max_y - min_y + 1) as usize,
    };
    let region = enclosed_region(&bbox, width, &in_component);
    Some(Contour {
        points,
        bbox,
        region,
        image_width: width,
    })
}

/// Moore-neighbour tracing from the component's first raster pixel, whose
/// west neighbour is always background.
fn trace_boundary(
    first: usize,
    width: usize,
    max_steps: usize,
    in_component: &dyn Fn(i64, i64) -> bool,
) -> Option<Vec<(i64, i64)>> {
    let start = ((first % width) as i64, (first / width) as i64);
    if !in_component(start.0, start.1) {
        return None;
    }

    // Next boundary pixel clockwise from `back` (a background neighbour of
    // `at`), plus the background neighbour examined just before it.
    let step = |at: (i64, i64), back: usize| -> Option<((i64, i64), usize)> {
        for i in 1..=8 {
            let k = (back + i) % 8;
            let (dx, dy) = DIRS[k];
            let next = (at.0 + dx, at.1 + dy);
            if in_component(next.0, next.1) {
                let prev = (back + i - 1) % 8;
                let (bx, by) = DIRS[prev];
                let background = (at.0 + bx, at.1 + by);
                let back_from_next = direction(next, background);
                return Some((next, back_from_next));
            }
        }
        None
    };

    let mut points = vec![start];
    let Some((second, mut back)) = step(start, WEST) else {
        return Some(points);
    };
    let mut current = second;
    // Each pixel is entered at most four times.
    for _ in 0..max_steps {
        let Some((next, next_back)) = step(current, back) else {
            break;
        };
        if current == start && next == second {
            return Some(points);
        }
        points.push(current);
        current = next;
        back = next_back;
    }
    Some(points)
}

/// Direction index from `from` to an 8-neighbour `to`.
fn direction(from: (i64, i64), to: (i64, i64)) -> usize {
    let delta = (to.0 - from.0, to.1 - from.1);
    DIRS.iter().position(|&d| d == delta).unwrap_or(WEST)
}

/// Component pixels plus holes: everything in the bounding box that the
/// outside background cannot reach 4-connectedly.
fn enclosed_region(
    bbox: &BoundingBox,
    width: usize,
    in_component: &dyn Fn(i64, i64) -> bool,
) -> Vec<usize> {
    // Padded local grid so the outside is connected all around the box.
    let (pw, ph) = (bbox.width + 2, bbox.height + 2);
    let to_global = |lx: usize, ly: usize| (bbox.x as i64 + lx as i64 - 1, bbox.y as i64 + ly as i64 - 1);
    let mut outside = vec![false; pw * ph];
    let mut stack = vec![0usize];
    outside[0] = true;
    while let Some(idx) = stack.pop() {
        let (lx, ly) = (idx % pw, idx / pw);
        for (dx, dy) in [(1i64, 0i64), (-1, 0), (0, 1), (0, -1)] {
            let (nx, ny) = (lx as i64 + dx, ly as i64 + dy);
            if nx < 0 || ny < 0 || nx as usize >= pw || ny as usize >= ph {
                continue;
            }
            let n = ny as usize * pw + nx as usize;
            if outside[n] {
                continue;
            }
            let (gx, gy) = to_global(nx as usize, ny as usize);
            if in_component(gx, gy) {
                continue;
            }
            outside[n] = true;
            stack.push(n);
        }
    }

    let mut region = Vec::new();
    for ly in 1..=bbox.height {
        for lx in 1..=bbox.width {
            if !outside[ly * pw + lx] {
                let (gx, gy) = to_global(lx, ly);
                region.push(gy as usize * width + gx as usize);
            }
        }
    }
    region
}

fn minmax(values: impl Iterator<Item = i64>) -> Option<(i64, i64)> {
    values.fold(None, |acc, v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_from(rows: &[&str]) -> Mask {
        let mut mask = Mask::new(rows[0].len(), rows.len());
        for (y, row) in rows.iter().enumerate() {
            for (x, c) in row.chars().enumerate() {
                mask.set(x, y, c == '#');
            }
        }
        mask
    }

    #[test]
    fn rectangle_has_one_contour_with_its_corners() {
        let mask = mask_from(&[
            "......",
            ".####.",
            ".####.",
            ".####.",
            "......",
        ]);
        let contours = find_external_contours(&mask);
        assert_eq!(contours.len(), 1);
        let contour = &contours[0];
        assert_eq!(
            contour.bbox,
            BoundingBox { x: 1, y: 1, width: 4, height: 3 }
        );
        // Boundary pixels of a 4x3 block: everything except the 2 inner ones.
        assert_eq!(contour.points.len(), 10);
        for corner in [(1, 1), (4, 1), (4, 3), (1, 3)] {
            assert!(contour.points.contains(&corner));
        }
        assert_eq!(contour.region().len(), 12);
        assert!((contour.perimeter() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn single_pixels_and_diagonals_are_traced() {
        let mask = mask_from(&["#...", "....", "..#.", "...#"]);
        let contours = find_external_contours(&mask);
        assert_eq!(contours.len(), 2);
        assert_eq!(contours[0].points, vec![(0, 0)]);
        assert_eq!(contours[1].points, vec![(2, 2), (3, 3)]);
        assert_eq!(contours[1].bbox.area(), 4);
    }

    #[test]
    fn holes_belong_to_the_region_and_nested_blobs_are_skipped() {
        let mask = mask_from(&[
            "#######",
            "#.....#",
            "#.###.#",
            "#.#.#.#",
            "#.###.#",
            "#.....#",
            "#######",
        ]);
        let contours = find_external_contours(&mask);
        assert_eq!(contours.len(), 1);
        assert_eq!(contours[0].region().len(), 49);
        assert!(contours[0].contains(3, 3));
        assert!(!contours[0].contains(7, 7));
    }

    #[test]
    fn separate_blobs_each_get_a_contour() {
        let mask = mask_from(&["##..##", "##..##", "......", "..##.."]);
        let contours = find_external_contours(&mask);
        assert_eq!(contours.len(), 3);
        assert!(contours[0].contains(1, 1));
        assert!(!contours[0].contains(4, 0));
        assert!(contours[2].contains(3, 3));
    }
}
